// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Magnet fetches driven through the aria2 daemon.
//!
//! The task is submitted with `aria2.addUri` and then polled. The record
//! is renamed once, as soon as the daemon reports where the payload lives.
//! A scan may already have listed that payload as a local file; the rename
//! takes such a record over when the file is no older than the task.

use anyhow::{anyhow, bail, Context, Result};

use super::FetchContext;
use crate::aria2::STATUS_REMOVED;
use crate::utils::{human_size, now_epoch};

pub(crate) async fn run(ctx: &FetchContext, name: &mut String) -> Result<()> {
    let source = ctx
        .registry
        .get(name)
        .map(|record| record.source)
        .ok_or_else(|| anyhow!("record {} disappeared", name))?;

    let client = ctx.daemon.client();
    let mut gid = client
        .add_uri(&source)
        .await
        .context("aria2 rejected the magnet link")?;
    tracing::info!(name = %name, gid = %gid, "Submitted magnet link to aria2");

    let started = now_epoch();
    ctx.registry.update(name, |record| record.started_at = started)?;

    let result = poll(ctx, &mut gid, name, started).await;

    clear_result(ctx, &gid).await;
    result?;

    super::finish(ctx, name).await
}

async fn clear_result(ctx: &FetchContext, gid: &str) {
    if let Err(e) = ctx.daemon.client().remove_download_result(gid).await {
        tracing::warn!(gid = %gid, "Failed to clear aria2 download result: {:#}", e);
    }
}

/// Poll until the payload is complete. `gid` follows aria2 from the
/// metadata task to the payload task.
async fn poll(ctx: &FetchContext, gid: &mut String, name: &mut String, started: i64) -> Result<()> {
    let mut renamed = false;
    let mut poll_now = false;

    loop {
        if !poll_now {
            tokio::time::sleep(ctx.config.poll_interval()).await;
        }
        poll_now = false;

        let status = ctx
            .daemon
            .client()
            .tell_status(gid)
            .await
            .with_context(|| format!("lost track of aria2 task {}", gid))?;
        tracing::debug!(gid = %gid, status = %status.status, "Polled aria2 task");

        if let Some(message) = status.error() {
            bail!("{}", message);
        }

        if status.is_complete() {
            if let Some(next) = status.successor() {
                tracing::debug!(from = %gid, to = %next, "Following aria2 task");
                let finished = std::mem::replace(gid, next.to_string());
                clear_result(ctx, &finished).await;
                poll_now = true;
                continue;
            }
        }

        if !renamed && (!status.is_metadata() || status.is_complete()) {
            if let Some(real) = status.real_name(&ctx.config.download_dir) {
                ctx.registry.claim(name, &real, started)?;
                tracing::info!(from = %name, to = %real, "Magnet resolved");
                *name = real;
                renamed = true;
            }
        }

        let total = status.total_bytes();
        if renamed && total > 0 {
            ctx.registry.update(name, |record| record.expected_size = total)?;
        }

        if status.is_complete() {
            tracing::info!(name = %name, size = %human_size(total), "aria2 task complete");
            return Ok(());
        }
        if status.status == STATUS_REMOVED {
            bail!("download was removed from aria2");
        }
    }
}
