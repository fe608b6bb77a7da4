// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Direct HTTP(S) fetches.
//!
//! A HEAD probe supplies the content length and an optional attachment
//! filename, then an external `wget` process writes the body to disk.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_LENGTH};
use tokio::process::Command;

use super::FetchContext;
use crate::utils::{human_size, now_epoch};

static ATTACHMENT_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)attachment;\s*filename\s*=\s*"?([^";]+)"?"#)
        .expect("attachment regex is valid")
});

/// What a header probe learned about a remote resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    /// Advertised body length; 0 when absent or unparseable.
    pub content_length: u64,
    /// Filename from `Content-Disposition: attachment; filename=...`.
    pub attachment_name: Option<String>,
}

impl ProbeResult {
    /// Extract the probe fields from response headers. For repeated
    /// headers the last occurrence wins.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let content_length = headers
            .get_all(CONTENT_LENGTH)
            .iter()
            .last()
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        let attachment_name = headers
            .get_all(CONTENT_DISPOSITION)
            .iter()
            .last()
            .and_then(|v| v.to_str().ok())
            .and_then(|v| ATTACHMENT_FILENAME.captures(v))
            .map(|c| c[1].trim().to_string())
            .filter(|name| !name.is_empty());

        Self {
            content_length,
            attachment_name,
        }
    }
}

/// Learns the size and attachment name of a URL without fetching its body.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ProbeResult>;
}

/// Writes the body of a URL to a destination path.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// [`Prober`] that sends an HTTP HEAD request.
#[derive(Debug, Clone, Default)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str) -> Result<ProbeResult> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .with_context(|| format!("HEAD {} failed", url))?;

        if !response.status().is_success() {
            tracing::warn!(url = %url, status = %response.status(), "Header probe returned non-success status");
        }
        Ok(ProbeResult::from_headers(response.headers()))
    }
}

/// [`Downloader`] backed by an external `wget` process.
#[derive(Debug, Clone)]
pub struct WgetDownloader {
    binary: String,
}

impl WgetDownloader {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for WgetDownloader {
    fn default() -> Self {
        Self::new("wget")
    }
}

#[async_trait]
impl Downloader for WgetDownloader {
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let status = Command::new(&self.binary)
            .arg("-q")
            .arg("-O")
            .arg(dest)
            .arg("--")
            .arg(url)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to start {}", self.binary))?;

        if !status.success() {
            bail!("{} exited with {}", self.binary, status);
        }
        Ok(())
    }
}

/// Run a direct fetch for the record currently called `name`.
///
/// `name` is updated in place when the server supplies an attachment
/// filename, so the caller always knows which record to fail.
pub(crate) async fn run(ctx: &FetchContext, name: &mut String) -> Result<()> {
    let source = ctx
        .registry
        .get(name)
        .map(|record| record.source)
        .ok_or_else(|| anyhow!("record {} disappeared", name))?;

    let mut probe = ctx.prober.probe(&source).await?;
    if probe.content_length == 0 {
        // Some servers only report a length on the second request.
        probe = ctx.prober.probe(&source).await?;
    }
    let content_length = probe.content_length;
    ctx.registry
        .update(name, |record| record.expected_size = content_length)?;

    if let Some(attachment) = probe.attachment_name.as_deref() {
        let renamed = ctx.stamper.name_for(attachment, ctx.config.max_name_len);
        ctx.registry.rename(name, &renamed)?;
        tracing::debug!(from = %name, to = %renamed, "Renamed from Content-Disposition");
        *name = renamed;
    }

    tracing::info!(
        name = %name,
        source = %source,
        size = %human_size(content_length),
        "Starting direct download"
    );

    if content_length > ctx.config.max_file_bytes {
        bail!(
            "file size {} exceeds the limit of {}",
            human_size(content_length),
            human_size(ctx.config.max_file_bytes)
        );
    }

    let started = now_epoch();
    ctx.registry.update(name, |record| record.started_at = started)?;

    let dest = ctx.config.download_dir.join(name.as_str());
    ctx.downloader.download(&source, &dest).await?;

    super::finish(ctx, name).await
}
