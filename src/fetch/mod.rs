// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fetch orchestration.
//!
//! [`FetchEngine::submit`] checks the quota, names the download, inserts a
//! pending record and hands the rest to a background task. Direct fetches
//! share a bounded pool of permits; magnet tasks only poll the daemon, which
//! schedules its own transfers, so they run outside the pool. Every task
//! stops when the engine shuts down, and every failure ends up on the
//! record; none escape to the caller.
//!
//! Directory scans and deletes block on the filesystem and run on the
//! blocking thread pool.

pub mod daemon;
pub mod direct;

use std::io;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use direct::{Downloader, HttpProber, ProbeResult, Prober, WgetDownloader};

use crate::aria2::Daemon;
use crate::config::ProxyConfig;
use crate::naming::{is_test_file, NameStamper};
use crate::registry::reconcile::entry_size;
use crate::registry::{FileRecord, Registry, RegistryError};
use crate::utils::now_epoch;

/// Prefix of the magnet links the daemon accepts.
pub const MAGNET_PREFIX: &str = "magnet:?xt=urn:btih:";

/// Which backend handles a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Direct,
    Daemon,
}

/// Why a source was refused before any transfer started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("refused to download test file")]
    TestFile,
    #[error("aria2c is not running, cannot download magnet links")]
    DaemonUnavailable,
    #[error("unsupported protocol")]
    UnsupportedProtocol,
}

/// Pick a backend for `source`, or refuse it.
///
/// Test files are refused whatever their protocol.
pub fn classify(name: &str, source: &str, daemon_available: bool) -> Result<Backend, Rejection> {
    if is_test_file(name) {
        return Err(Rejection::TestFile);
    }
    if source.starts_with("http://") || source.starts_with("https://") {
        return Ok(Backend::Direct);
    }
    if source.starts_with(MAGNET_PREFIX) {
        return if daemon_available {
            Ok(Backend::Daemon)
        } else {
            Err(Rejection::DaemonUnavailable)
        };
    }
    Err(Rejection::UnsupportedProtocol)
}

impl Backend {
    async fn run(self, ctx: &FetchContext, name: &mut String) -> Result<()> {
        match self {
            Backend::Direct => direct::run(ctx, name).await,
            Backend::Daemon => daemon::run(ctx, name).await,
        }
    }
}

/// Why a submission was not admitted.
#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("quota exceeded: {used} bytes in use")]
    QuotaExceeded { used: u64 },
    #[error("failed to scan download directory: {0}")]
    Scan(#[from] io::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Everything a fetch task needs.
pub struct FetchContext {
    pub registry: Registry,
    pub config: ProxyConfig,
    pub stamper: NameStamper,
    pub prober: Arc<dyn Prober>,
    pub downloader: Arc<dyn Downloader>,
    pub daemon: Arc<Daemon>,
}

impl FetchContext {
    /// Context with the production prober and downloader and no daemon.
    pub fn new(config: ProxyConfig) -> Self {
        let downloader = WgetDownloader::new(config.downloader_binary.clone());
        Self {
            registry: Registry::new(),
            config,
            stamper: NameStamper::new(),
            prober: Arc::new(HttpProber::new()),
            downloader: Arc::new(downloader),
            daemon: Arc::new(Daemon::disabled()),
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn with_daemon(mut self, daemon: Arc<Daemon>) -> Self {
        self.daemon = daemon;
        self
    }
}

/// Mark `name` completed using the size of whatever landed on disk.
pub(crate) async fn finish(ctx: &FetchContext, name: &str) -> Result<()> {
    let path = ctx.config.download_dir.join(name);
    let on_disk = tokio::task::spawn_blocking(move || entry_size(&path))
        .await
        .map_err(|e| anyhow!("size task failed: {}", e))?;
    ctx.registry.complete(name, now_epoch(), on_disk)?;
    Ok(())
}

/// Run one fetch to a terminal state. Errors are recorded, not returned.
pub(crate) async fn dispatch(
    ctx: &FetchContext,
    name: String,
    permits: &Semaphore,
    cancel: &CancellationToken,
) {
    let Some(record) = ctx.registry.get(&name) else {
        return;
    };

    let backend = match classify(&name, &record.source, ctx.daemon.is_available()) {
        Ok(backend) => backend,
        Err(rejection) => {
            tracing::warn!(name = %name, source = %record.source, "Refused fetch: {}", rejection);
            ctx.registry.fail(&name, rejection.to_string());
            return;
        }
    };

    let _permit = match backend {
        Backend::Direct => tokio::select! {
            permit = permits.acquire() => match permit {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            _ = cancel.cancelled() => {
                ctx.registry.fail(&name, "fetch cancelled by shutdown");
                return;
            }
        },
        Backend::Daemon => None,
    };

    let mut name = name;
    let result = tokio::select! {
        result = backend.run(ctx, &mut name) => result,
        _ = cancel.cancelled() => Err(anyhow!("fetch cancelled by shutdown")),
    };

    match result {
        Ok(()) => tracing::info!(name = %name, "Fetch finished"),
        Err(e) => {
            let reason = format!("{:#}", e);
            tracing::warn!(name = %name, "Fetch failed: {}", reason);
            ctx.registry.fail(&name, reason);
        }
    }
}

/// Admission control plus the background fetch pool.
#[derive(Clone)]
pub struct FetchEngine {
    ctx: Arc<FetchContext>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl FetchEngine {
    pub fn new(ctx: FetchContext) -> Self {
        let permits = Arc::new(Semaphore::new(ctx.config.max_concurrent_fetches.max(1)));
        Self {
            ctx: Arc::new(ctx),
            permits,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.ctx.registry
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.ctx.config
    }

    /// Reconcile the registry with the download directory and return the
    /// aggregate usage in bytes.
    pub async fn usage(&self) -> io::Result<u64> {
        let registry = self.ctx.registry.clone();
        let dir = self.ctx.config.download_dir.clone();

        tokio::task::spawn_blocking(move || registry.reconcile(&dir))
            .await
            .map_err(|e| io::Error::other(format!("scan task failed: {}", e)))?
    }

    /// Delete a terminal record and its file (see [`Registry::delete`]).
    pub async fn delete(&self, name: &str) -> Result<FileRecord, RegistryError> {
        let registry = self.ctx.registry.clone();
        let dir = self.ctx.config.download_dir.clone();
        let owned = name.to_string();

        tokio::task::spawn_blocking(move || registry.delete(&owned, &dir))
            .await
            .map_err(|e| RegistryError::Io {
                name: name.to_string(),
                source: io::Error::other(format!("delete task failed: {}", e)),
            })?
    }

    /// Accept `source` for download and return the name it was filed under.
    ///
    /// Refused with [`AdmitError::QuotaExceeded`] when current usage is
    /// already above the quota. Anything that goes wrong afterwards is
    /// recorded on the returned name rather than reported here.
    pub async fn submit(&self, source: &str) -> Result<String, AdmitError> {
        let used = self.usage().await?;
        if used > self.ctx.config.quota_bytes {
            tracing::warn!(used = used, quota = self.ctx.config.quota_bytes, "Quota exceeded, refusing fetch");
            return Err(AdmitError::QuotaExceeded { used });
        }

        let name = self.ctx.stamper.name_for(source, self.ctx.config.max_name_len);
        self.ctx
            .registry
            .insert(FileRecord::pending(name.clone(), source, now_epoch()))?;
        tracing::info!(name = %name, source = %source, "Accepted fetch");

        let ctx = self.ctx.clone();
        let permits = self.permits.clone();
        let cancel = self.shutdown.child_token();
        let task_name = name.clone();
        self.tracker.spawn(async move {
            dispatch(&ctx, task_name, &permits, &cancel).await;
        });

        Ok(name)
    }

    /// Cancel every fetch and wait for the tasks to record their outcome.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Fetch engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FixedProber(ProbeResult);

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, _url: &str) -> Result<ProbeResult> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct WritingDownloader {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Downloader for WritingDownloader {
        async fn download(&self, _url: &str, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(dest, b"hello").await?;
            Ok(())
        }
    }

    /// Hands out queued probe results in order, then empty ones.
    struct SequencedProber {
        results: Mutex<VecDeque<Result<ProbeResult>>>,
        calls: AtomicUsize,
    }

    impl SequencedProber {
        fn new(results: Vec<Result<ProbeResult>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Prober for SequencedProber {
        async fn probe(&self, _url: &str) -> Result<ProbeResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ProbeResult::default()))
        }
    }

    struct FailingDownloader;

    #[async_trait]
    impl Downloader for FailingDownloader {
        async fn download(&self, _url: &str, _dest: &Path) -> Result<()> {
            anyhow::bail!("wget exited with exit status: 8")
        }
    }

    fn length(content_length: u64) -> ProbeResult {
        ProbeResult {
            content_length,
            attachment_name: None,
        }
    }

    fn engine_with(
        config: ProxyConfig,
        prober: Arc<dyn Prober>,
        downloader: Arc<dyn Downloader>,
    ) -> FetchEngine {
        FetchEngine::new(
            FetchContext::new(config)
                .with_prober(prober)
                .with_downloader(downloader),
        )
    }

    fn engine(dir: &TempDir, probe: ProbeResult, downloader: Arc<WritingDownloader>) -> FetchEngine {
        let config = ProxyConfig::default().with_download_dir(dir.path());
        engine_with(config, Arc::new(FixedProber(probe)), downloader)
    }

    async fn wait_terminal(engine: &FetchEngine, name: &str) -> FileRecord {
        for _ in 0..200 {
            if let Some(record) = engine.registry().get(name) {
                if record.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached a terminal state", name);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("a-1.iso", "http://h/a.iso", false), Ok(Backend::Direct));
        assert_eq!(classify("a-1.iso", "https://h/a.iso", false), Ok(Backend::Direct));
        assert_eq!(
            classify("magnet-1", "magnet:?xt=urn:btih:abc", true),
            Ok(Backend::Daemon)
        );
        assert_eq!(
            classify("magnet-1", "magnet:?xt=urn:btih:abc", false),
            Err(Rejection::DaemonUnavailable)
        );
        assert_eq!(
            classify("a-1.iso", "ftp://h/a.iso", true),
            Err(Rejection::UnsupportedProtocol)
        );
        assert_eq!(
            classify("100MB-1.bin", "http://h/100MB.bin", true),
            Err(Rejection::TestFile)
        );
    }

    #[tokio::test]
    async fn test_direct_fetch_completes() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(WritingDownloader::default());
        let probe = ProbeResult {
            content_length: 5,
            attachment_name: None,
        };
        let engine = engine(&dir, probe, downloader.clone());

        let name = engine.submit("http://example.com/hello.txt").await.unwrap();
        assert!(name.starts_with("hello-") && name.ends_with(".txt"), "{}", name);

        let record = wait_terminal(&engine, &name).await;
        assert!(record.completed);
        assert!(!record.errored);
        assert_eq!(record.observed_size, 5);
        assert_eq!(record.expected_size, 5);
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_configured_ceiling_is_enforced() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(WritingDownloader::default());
        let config = ProxyConfig::default()
            .with_download_dir(dir.path())
            .with_max_file_bytes(4);
        let engine = engine_with(config, Arc::new(FixedProber(length(5))), downloader.clone());

        let name = engine.submit("http://example.com/five.bin").await.unwrap();
        let record = wait_terminal(&engine, &name).await;

        assert!(record.errored);
        assert_eq!(
            record.error.as_deref(),
            Some("file size 5.00 B exceeds the limit of 4.00 B")
        );
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_length_probe_is_repeated_once() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(SequencedProber::new(vec![Ok(length(0)), Ok(length(5))]));
        let downloader = Arc::new(WritingDownloader::default());
        let config = ProxyConfig::default().with_download_dir(dir.path());
        let engine = engine_with(config, prober.clone(), downloader.clone());

        let name = engine.submit("http://example.com/hello.txt").await.unwrap();
        let record = wait_terminal(&engine, &name).await;

        assert!(record.completed, "{:?}", record);
        assert_eq!(record.expected_size, 5);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_nonzero_probe_is_not_repeated() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(SequencedProber::new(vec![Ok(length(5))]));
        let config = ProxyConfig::default().with_download_dir(dir.path());
        let engine = engine_with(config, prober.clone(), Arc::new(WritingDownloader::default()));

        let name = engine.submit("http://example.com/hello.txt").await.unwrap();
        wait_terminal(&engine, &name).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_probe_is_recorded() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(SequencedProber::new(vec![Err(anyhow!(
            "HEAD http://example.com/x failed"
        ))]));
        let downloader = Arc::new(WritingDownloader::default());
        let config = ProxyConfig::default().with_download_dir(dir.path());
        let engine = engine_with(config, prober, downloader.clone());

        let name = engine.submit("http://example.com/x").await.unwrap();
        let record = wait_terminal(&engine, &name).await;

        assert!(record.errored);
        assert!(!record.completed);
        assert!(record.error.unwrap().contains("HEAD http://example.com/x failed"));
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_downloader_failure_is_recorded() {
        let dir = TempDir::new().unwrap();
        let config = ProxyConfig::default().with_download_dir(dir.path());
        let engine = engine_with(
            config,
            Arc::new(FixedProber(length(5))),
            Arc::new(FailingDownloader),
        );

        let name = engine.submit("http://example.com/a.iso").await.unwrap();
        let record = wait_terminal(&engine, &name).await;

        assert!(record.errored);
        assert!(!record.completed);
        assert!(record.error.unwrap().contains("exited with"));
    }

    #[tokio::test]
    async fn test_magnet_tasks_do_not_hold_fetch_slots() {
        use wiremock::matchers::{body_partial_json, method};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"method": "aria2.addUri"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"id": "1", "jsonrpc": "2.0", "result": "gid1"}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"method": "aria2.tellStatus"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "2", "jsonrpc": "2.0",
                "result": {"gid": "gid1", "status": "active", "files": []}
            })))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let config = ProxyConfig {
            max_concurrent_fetches: 1,
            ..ProxyConfig::default()
                .with_download_dir(dir.path())
                .with_poll_interval(Duration::from_millis(10))
        };
        let daemon = Daemon::new(
            crate::aria2::Aria2Client::new(format!("{}/jsonrpc", server.uri())),
            true,
        );
        let downloader = Arc::new(WritingDownloader::default());
        let engine = FetchEngine::new(
            FetchContext::new(config)
                .with_prober(Arc::new(FixedProber(length(5))))
                .with_downloader(downloader.clone())
                .with_daemon(Arc::new(daemon)),
        );

        let magnet = engine.submit("magnet:?xt=urn:btih:abc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let direct = engine.submit("http://example.com/hello.txt").await.unwrap();

        let record = wait_terminal(&engine, &direct).await;
        assert!(record.completed, "{:?}", record);
        assert!(!engine.registry().get(&magnet).unwrap().is_terminal());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_file_is_refused_without_download() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(WritingDownloader::default());
        let probe = ProbeResult {
            content_length: 5 * 1024 * 1024 * 1024,
            attachment_name: None,
        };
        let engine = engine(&dir, probe, downloader.clone());

        let name = engine.submit("http://example.com/huge.iso").await.unwrap();
        let record = wait_terminal(&engine, &name).await;

        assert!(record.errored);
        assert!(!record.completed);
        assert_eq!(record.expected_size, 5 * 1024 * 1024 * 1024);
        assert!(record.error.unwrap().contains("exceeds the limit"));
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_attachment_name_renames_record() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(WritingDownloader::default());
        let probe = ProbeResult {
            content_length: 5,
            attachment_name: Some("report.pdf".to_string()),
        };
        let engine = engine(&dir, probe, downloader);

        let provisional = engine.submit("http://example.com/get?id=7").await.unwrap();
        for _ in 0..200 {
            if !engine.registry().contains(&provisional) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!engine.registry().contains(&provisional));

        let snapshot = engine.registry().snapshot();
        let (name, _) = snapshot
            .iter()
            .find(|(name, _)| name.starts_with("report-"))
            .expect("renamed record");
        assert!(name.ends_with(".pdf"));
        let record = wait_terminal(&engine, name).await;
        assert!(record.completed, "{:?}", record);
        assert!(dir.path().join(name).exists());
    }

    #[tokio::test]
    async fn test_rejections_are_recorded() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(WritingDownloader::default());
        let engine = engine(&dir, ProbeResult::default(), downloader.clone());

        let ftp = engine.submit("ftp://example.com/a.iso").await.unwrap();
        let magnet = engine.submit("magnet:?xt=urn:btih:abc").await.unwrap();
        let test_file = engine.submit("http://speed.example.com/100MB-test.bin").await.unwrap();

        let ftp = wait_terminal(&engine, &ftp).await;
        assert_eq!(ftp.error.as_deref(), Some("unsupported protocol"));
        let magnet = wait_terminal(&engine, &magnet).await;
        assert!(magnet.errored);
        assert!(magnet.error.unwrap().contains("aria2c is not running"));
        let test_file = wait_terminal(&engine, &test_file).await;
        assert_eq!(test_file.error.as_deref(), Some("refused to download test file"));
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("filler.bin"), vec![0u8; 2048]).unwrap();
        let config = ProxyConfig::default()
            .with_download_dir(dir.path())
            .with_quota(1024);
        let engine = FetchEngine::new(FetchContext::new(config));

        match engine.submit("http://example.com/a.iso").await {
            Err(AdmitError::QuotaExceeded { used }) => assert_eq!(used, 2048),
            other => panic!("expected quota error, got {:?}", other),
        }
        // Only the discovered local file is registered.
        assert_eq!(engine.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_engine_delete_removes_record_and_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("old.iso"), b"data").unwrap();
        let engine = engine(&dir, ProbeResult::default(), Arc::new(WritingDownloader::default()));

        assert_eq!(engine.usage().await.unwrap(), 4);
        let removed = engine.delete("old.iso").await.unwrap();
        assert_eq!(removed.name, "old.iso");
        assert!(!dir.path().join("old.iso").exists());
        assert_eq!(engine.usage().await.unwrap(), 0);
        assert!(matches!(
            engine.delete("old.iso").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_fetches() {
        struct StallingDownloader;

        #[async_trait]
        impl Downloader for StallingDownloader {
            async fn download(&self, _url: &str, _dest: &Path) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let dir = TempDir::new().unwrap();
        let config = ProxyConfig::default().with_download_dir(dir.path());
        let engine = FetchEngine::new(
            FetchContext::new(config)
                .with_prober(Arc::new(FixedProber(ProbeResult {
                    content_length: 10,
                    attachment_name: None,
                })))
                .with_downloader(Arc::new(StallingDownloader)),
        );

        let name = engine.submit("http://example.com/slow.bin").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
            .await
            .expect("shutdown should not hang");

        let record = engine.registry().get(&name).unwrap();
        assert!(record.errored);
        assert!(record.error.unwrap().contains("cancelled"));
    }
}
