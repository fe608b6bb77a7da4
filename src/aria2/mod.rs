// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! aria2 integration.
//!
//! Magnet links are handed to an `aria2c` daemon over its JSON-RPC
//! interface on a loopback port. This module holds the RPC client and the
//! supervisor that starts the daemon and tracks whether it is running.
//!
//! # Example
//!
//! ```no_run
//! use dlproxy::aria2::Aria2Client;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = Aria2Client::new("http://127.0.0.1:6900/jsonrpc");
//! let gid = client.add_uri("magnet:?xt=urn:btih:abc").await?;
//! let status = client.tell_status(&gid).await?;
//! println!("{}", status.status);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;

use crate::config::ProxyConfig;

pub const ADD_URI_METHOD: &str = "aria2.addUri";
pub const TELL_STATUS_METHOD: &str = "aria2.tellStatus";
pub const REMOVE_DOWNLOAD_RESULT_METHOD: &str = "aria2.removeDownloadResult";
pub const GET_VERSION_METHOD: &str = "aria2.getVersion";

/// Status string aria2 reports for a finished task.
pub const STATUS_COMPLETE: &str = "complete";
/// Status string for a task removed from the daemon.
pub const STATUS_REMOVED: &str = "removed";

/// Prefix aria2 puts on the placeholder path while fetching torrent metadata.
pub const METADATA_MARKER: &str = "[METADATA]";

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    jsonrpc: &'static str,
    id: String,
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    #[allow(dead_code)]
    #[serde(default)]
    id: Value,
    result: Option<T>,
    error: Option<RpcError>,
}

/// Error object of a JSON-RPC response.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Subset of `aria2.tellStatus` the proxy uses.
///
/// aria2 omits fields freely, so every field falls back to its default.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskStatus {
    pub gid: String,
    /// `active`, `waiting`, `paused`, `error`, `complete` or `removed`.
    pub status: String,
    pub total_length: String,
    pub completed_length: String,
    pub error_message: String,
    pub files: Vec<TaskFile>,
    /// Tasks aria2 started once this one finished, e.g. the payload of a
    /// magnet link after its metadata was fetched.
    pub followed_by: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskFile {
    pub path: String,
}

impl TaskStatus {
    pub fn is_complete(&self) -> bool {
        self.status == STATUS_COMPLETE
    }

    /// Non-empty error message reported by the daemon.
    pub fn error(&self) -> Option<&str> {
        let msg = self.error_message.trim();
        (!msg.is_empty()).then_some(msg)
    }

    /// The task is only fetching torrent metadata.
    pub fn is_metadata(&self) -> bool {
        self.files
            .first()
            .map_or(false, |file| file.path.contains(METADATA_MARKER))
    }

    /// Task that continues this one, if any.
    pub fn successor(&self) -> Option<&str> {
        self.followed_by.first().map(String::as_str)
    }

    /// Total length in bytes, 0 if not yet known.
    pub fn total_bytes(&self) -> u64 {
        self.total_length.parse().unwrap_or(0)
    }

    /// The real top-level name of the download inside `download_dir`.
    ///
    /// Strips the metadata marker from the first file's path. A path under
    /// the download directory yields its first component below it (the
    /// directory of a multi-file torrent); any other path yields its last
    /// component. Returns `None` while the path is still unknown.
    pub fn real_name(&self, download_dir: &Path) -> Option<String> {
        let raw = self.files.first()?.path.replacen(METADATA_MARKER, "", 1);
        if raw.is_empty() {
            return None;
        }
        let path = Path::new(&raw);

        let name = match path.strip_prefix(download_dir) {
            Ok(relative) => relative.components().next()?.as_os_str().to_str()?.to_string(),
            Err(_) => path.file_name()?.to_str()?.to_string(),
        };

        match name.as_str() {
            "" | "." | ".." => None,
            _ => Some(name),
        }
    }
}

/// Async JSON-RPC client for aria2.
#[derive(Debug)]
pub struct Aria2Client {
    endpoint: String,
    secret: Option<String>,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl Aria2Client {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            secret: None,
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Prefix every call with `token:<secret>`.
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Start a download; returns the daemon's task id (gid).
    pub async fn add_uri(&self, uri: &str) -> Result<String> {
        self.call(ADD_URI_METHOD, vec![json!([uri])]).await
    }

    pub async fn tell_status(&self, gid: &str) -> Result<TaskStatus> {
        self.call(TELL_STATUS_METHOD, vec![json!(gid)]).await
    }

    /// Drop the daemon's bookkeeping for a finished task.
    pub async fn remove_download_result(&self, gid: &str) -> Result<()> {
        let _: Value = self.call(REMOVE_DOWNLOAD_RESULT_METHOD, vec![json!(gid)]).await?;
        Ok(())
    }

    /// Version string of the daemon; used as a liveness check.
    pub async fn get_version(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct Version {
            version: String,
        }
        let version: Version = self.call(GET_VERSION_METHOD, Vec::new()).await?;
        Ok(version.version)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, mut params: Vec<Value>) -> Result<T> {
        if let Some(secret) = &self.secret {
            params.insert(0, json!(format!("token:{}", secret)));
        }
        let request = RpcRequest {
            method,
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed).to_string(),
            params,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("{} request failed", method))?;

        let body: RpcResponse<T> = response
            .json()
            .await
            .with_context(|| format!("{} returned an unreadable response", method))?;

        if let Some(error) = body.error {
            return Err(anyhow!("{} error {}: {}", method, error.code, error.message));
        }
        body.result
            .ok_or_else(|| anyhow!("{} returned neither result nor error", method))
    }
}

/// The daemon as seen by the fetch backends: a client plus a liveness flag.
#[derive(Debug)]
pub struct Daemon {
    client: Aria2Client,
    available: AtomicBool,
}

impl Daemon {
    pub fn new(client: Aria2Client, available: bool) -> Self {
        Self {
            client,
            available: AtomicBool::new(available),
        }
    }

    /// A daemon that is never available.
    pub fn disabled() -> Self {
        Self::new(Aria2Client::new("http://127.0.0.1:0/jsonrpc"), false)
    }

    pub fn client(&self) -> &Aria2Client {
        &self.client
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Bring up the daemon according to `config`.
    ///
    /// With `spawn_daemon` set, starts `aria2c` with RPC enabled on the
    /// loopback port and watches the child; the daemon is marked
    /// unavailable if it cannot start or exits. Otherwise an already running
    /// daemon is detected with `aria2.getVersion`.
    pub async fn start(config: &ProxyConfig) -> Arc<Self> {
        let client = Aria2Client::new(config.rpc_url()).with_secret(config.rpc_secret.clone());

        if !config.spawn_daemon {
            let available = match client.get_version().await {
                Ok(version) => {
                    tracing::info!(version = %version, endpoint = %client.endpoint(), "Using running aria2 daemon");
                    true
                }
                Err(e) => {
                    tracing::warn!("aria2 daemon not reachable, magnet links are disabled: {:#}", e);
                    false
                }
            };
            return Arc::new(Self::new(client, available));
        }

        let mut command = Command::new(&config.daemon_binary);
        command
            .arg(format!("--dir={}", config.download_dir.display()))
            .arg("--enable-rpc")
            .arg(format!("--rpc-listen-port={}", config.rpc_port))
            .arg("--rpc-listen-all=false")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(secret) = &config.rpc_secret {
            command.arg(format!("--rpc-secret={}", secret));
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(
                    binary = %config.daemon_binary,
                    "aria2c can not start, magnet links are disabled: {}", e
                );
                return Arc::new(Self::new(client, false));
            }
        };

        tracing::info!(port = config.rpc_port, "Started aria2c");
        let daemon = Arc::new(Self::new(client, true));
        let watcher = daemon.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::warn!(%status, "aria2c exited, magnet links are disabled"),
                Err(e) => tracing::warn!("Lost track of aria2c: {}", e),
            }
            watcher.set_available(false);
        });

        daemon
    }
}
