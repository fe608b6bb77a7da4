// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Proxy configuration.
//!
//! Loaded from a JSON file (`--config <path>` or `~/.dlproxy/config.json`)
//! with per-field defaults; command-line flags override the file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::naming::DEFAULT_MAX_STEM_LEN;

/// 3 GiB.
pub const DEFAULT_SIZE_LIMIT: u64 = 3 * 1024 * 1024 * 1024;

/// Runtime configuration for the proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    /// `addr:port` the HTTP API listens on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Flat directory that holds every download.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Aggregate usage above which new requests are refused.
    #[serde(default = "default_size_limit")]
    pub quota_bytes: u64,
    /// Per-file ceiling checked against the probed content length.
    #[serde(default = "default_size_limit")]
    pub max_file_bytes: u64,
    /// Longest stem kept by the naming service.
    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,
    /// Fetches allowed to run at once; the rest wait for a slot.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Interval between aria2 status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Start aria2c ourselves at process start.
    #[serde(default = "default_spawn_daemon")]
    pub spawn_daemon: bool,
    #[serde(default = "default_daemon_binary")]
    pub daemon_binary: String,
    /// External downloader for HTTP(S) sources.
    #[serde(default = "default_downloader_binary")]
    pub downloader_binary: String,
    /// Loopback port of the aria2 JSON-RPC endpoint.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    /// `--rpc-secret` shared with aria2c.
    #[serde(default)]
    pub rpc_secret: Option<String>,
}

fn default_bind_address() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("download")
}

fn default_size_limit() -> u64 {
    DEFAULT_SIZE_LIMIT
}

fn default_max_name_len() -> usize {
    DEFAULT_MAX_STEM_LEN
}

fn default_max_concurrent_fetches() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_spawn_daemon() -> bool {
    true
}

fn default_daemon_binary() -> String {
    "aria2c".to_string()
}

fn default_downloader_binary() -> String {
    "wget".to_string()
}

fn default_rpc_port() -> u16 {
    6900
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            download_dir: default_download_dir(),
            quota_bytes: default_size_limit(),
            max_file_bytes: default_size_limit(),
            max_name_len: default_max_name_len(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            poll_interval_ms: default_poll_interval_ms(),
            spawn_daemon: default_spawn_daemon(),
            daemon_binary: default_daemon_binary(),
            downloader_binary: default_downloader_binary(),
            rpc_port: default_rpc_port(),
            rpc_secret: None,
        }
    }
}

impl ProxyConfig {
    /// Default config file location, `~/.dlproxy/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".dlproxy").join("config.json"))
    }

    /// Load from `path`, or from the default location if it exists.
    ///
    /// An explicit path that does not exist is an error; a missing default
    /// file just yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: ProxyConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// JSON-RPC endpoint of the local aria2 daemon.
    pub fn rpc_url(&self) -> String {
        format!("http://127.0.0.1:{}/jsonrpc", self.rpc_port)
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota_bytes = bytes;
        self
    }

    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = port;
        self
    }
}
