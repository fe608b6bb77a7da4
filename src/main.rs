// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dlproxy::aria2::Daemon;
use dlproxy::config::ProxyConfig;
use dlproxy::fetch::{FetchContext, FetchEngine};
use dlproxy::server::Server;
use dlproxy::utils::human_size;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// dlproxy - fetch URLs and magnet links into a local directory.
#[derive(Parser)]
#[command(name = "dlproxy")]
#[command(version = VERSION)]
#[command(about = "Download-management proxy for HTTP(S) URLs and magnet links.")]
struct Cli {
    /// Address to listen on (addr:port)
    bind: Option<String>,

    /// Download directory
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Config file (default: ~/.dlproxy/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage quota in bytes
    #[arg(long)]
    quota: Option<u64>,

    /// Largest single file accepted, in bytes
    #[arg(long)]
    max_file_size: Option<u64>,

    /// aria2 JSON-RPC port
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Do not start aria2c; use one that is already running, if any
    #[arg(long)]
    no_daemon: bool,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "dlproxy=debug,tower_http=debug"
    } else {
        "dlproxy=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<ProxyConfig> {
    let mut config = ProxyConfig::load(cli.config.as_deref())?;
    if let Some(bind) = &cli.bind {
        config.bind_address = bind.clone();
    }
    if let Some(dir) = &cli.dir {
        config.download_dir = dir.clone();
    }
    if let Some(quota) = cli.quota {
        config = config.with_quota(quota);
    }
    if let Some(bytes) = cli.max_file_size {
        config = config.with_max_file_bytes(bytes);
    }
    if let Some(port) = cli.rpc_port {
        config = config.with_rpc_port(port);
    }
    if cli.no_daemon {
        config.spawn_daemon = false;
    }

    std::fs::create_dir_all(&config.download_dir).with_context(|| {
        format!("Failed to create download directory {:?}", config.download_dir)
    })?;
    // aria2 reports absolute paths; names are resolved against this.
    config.download_dir = config
        .download_dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {:?}", config.download_dir))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    tracing::info!(
        dir = %config.download_dir.display(),
        quota = %human_size(config.quota_bytes),
        "dlproxy {} starting",
        VERSION
    );

    let daemon = Daemon::start(&config).await;
    let engine = FetchEngine::new(FetchContext::new(config).with_daemon(daemon));

    let used = engine
        .usage()
        .await
        .context("Failed to scan download directory")?;
    tracing::info!(
        files = engine.registry().len(),
        used = %human_size(used),
        "Loaded existing downloads"
    );

    Server::new(engine).start().await
}
