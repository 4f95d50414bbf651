// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Master → slave replication of the PKI and policy directories.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────── slave ────────────┐            ┌──────── master ────────┐
//! │ run_sync_loop                 │            │ ArchiveServer::serve   │
//! │   └─ ReplicationClient        │  GET path  │   role check  → 423    │
//! │        sync_once              │ ─────────► │   token check → 403    │
//! │          ├─ certs.tar.gz ─┐   │  ?token=T  │   tar -czf live dir    │
//! │          └─ ccd.tar.gz  ──┤   │ ◄───────── │   200 + archive bytes  │
//! │       (3 attempts each)   │   │            └────────────────────────┘
//! │   tar -xzf into live dir ◄┘   │
//! └───────────────────────────────┘
//! ```
//!
//! # Sync cycle
//!
//! The two archives are independent sub-flows. Each gets up to
//! `max_attempts` immediate attempts: delete the stale staging file, download,
//! write, extract. Extraction is additive (files deleted on the master stay
//! on the slave) and runs under the registry lock so reconciliation never
//! sees a half-extracted registry.
//!
//! After both sub-flows the last-attempt time is always updated; the
//! last-success time only when both succeeded.

use crate::config::{NodeRole, ReplicationSettings};
use crate::error::{ControlPlaneError, Result};
use crate::metrics::{self, MetricsSink};
use crate::resilience::{retry, RetryConfig, RetryOutcome};
use crate::tool::{run_checked, BoxFuture, CommandRunner, CommandSpec};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn, Instrument};

/// Display format for sync timestamps.
pub const SYNC_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const TAR_BINARY: &str = "tar";

// ═══════════════════════════════════════════════════════════════════════════════
// Archive kinds
// ═══════════════════════════════════════════════════════════════════════════════

/// The two replicated archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    /// The easy-rsa `pki/` directory, registry included.
    Certificates,
    /// The client-config-dir.
    Policies,
}

impl ArchiveKind {
    pub const ALL: [ArchiveKind; 2] = [ArchiveKind::Certificates, ArchiveKind::Policies];

    pub fn file_name(&self) -> &'static str {
        match self {
            ArchiveKind::Certificates => "certs.tar.gz",
            ArchiveKind::Policies => "ccd.tar.gz",
        }
    }

    /// Path on the master that serves this archive.
    pub fn download_path(&self) -> &'static str {
        match self {
            ArchiveKind::Certificates => "/api/data/certs/download",
            ArchiveKind::Policies => "/api/data/ccd/download",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ArchiveKind::Certificates => "certs",
            ArchiveKind::Policies => "ccd",
        }
    }
}

impl std::fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Live directories that archives are built from and extracted into.
#[derive(Debug, Clone)]
pub struct ArchiveDirs {
    pub pki_dir: PathBuf,
    pub ccd_dir: PathBuf,
    /// Scratch space for downloaded and generated archives.
    pub staging_dir: PathBuf,
}

impl ArchiveDirs {
    pub fn live_dir(&self, kind: ArchiveKind) -> &Path {
        match kind {
            ArchiveKind::Certificates => &self.pki_dir,
            ArchiveKind::Policies => &self.ccd_dir,
        }
    }

    pub fn staging_path(&self, kind: ArchiveKind) -> PathBuf {
        self.staging_dir.join(kind.file_name())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Archiver: tar through the command runner
// ═══════════════════════════════════════════════════════════════════════════════

/// Creates and unpacks gzip'd tarballs with the `tar` tool.
#[derive(Clone)]
pub struct Archiver {
    runner: Arc<dyn CommandRunner>,
}

impl Archiver {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Pack the contents of `source_dir` into `archive`.
    pub async fn create(&self, source_dir: &Path, archive: &Path) -> Result<()> {
        let spec = CommandSpec::new(TAR_BINARY).args([
            "-czf".to_string(),
            archive.display().to_string(),
            "-C".to_string(),
            source_dir.display().to_string(),
            ".".to_string(),
        ]);
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }

    /// Unpack `archive` on top of `dest_dir`, creating it if needed.
    pub async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| ControlPlaneError::io(dest_dir.display().to_string(), e))?;
        let spec = CommandSpec::new(TAR_BINARY).args([
            "-xzf".to_string(),
            archive.display().to_string(),
            "-C".to_string(),
            dest_dir.display().to_string(),
        ]);
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fetcher: HTTP collaborator
// ═══════════════════════════════════════════════════════════════════════════════

/// Downloads an archive from the master.
pub trait ArchiveFetcher: Send + Sync + 'static {
    fn fetch(&self, kind: ArchiveKind) -> BoxFuture<'_, Vec<u8>>;
}

/// [`ArchiveFetcher`] over HTTP(S).
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    token: String,
    basic_auth: Option<(String, String)>,
}

impl HttpFetcher {
    pub fn new(settings: &ReplicationSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout_duration())
            .build()
            .map_err(|e| ControlPlaneError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: settings.master_url.trim_end_matches('/').to_string(),
            token: settings.sync_token.clone(),
            basic_auth: settings.basic_auth(),
        })
    }

    pub fn url_for(&self, kind: ArchiveKind) -> String {
        format!("{}{}", self.base_url, kind.download_path())
    }
}

impl ArchiveFetcher for HttpFetcher {
    fn fetch(&self, kind: ArchiveKind) -> BoxFuture<'_, Vec<u8>> {
        Box::pin(async move {
            let mut request = self
                .client
                .get(self.url_for(kind))
                .query(&[("token", self.token.as_str())]);
            if let Some((user, password)) = &self.basic_auth {
                request = request.basic_auth(user, Some(password));
            }

            let response = request
                .send()
                .await
                .map_err(|e| ControlPlaneError::replication(kind.file_name(), e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(ControlPlaneError::replication(
                    kind.file_name(),
                    format!("HTTP {}", status.as_u16()),
                ));
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| ControlPlaneError::replication(kind.file_name(), e.to_string()))?;
            Ok(body.to_vec())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncState
// ═══════════════════════════════════════════════════════════════════════════════

/// When the slave last tried, and last fully managed, to sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn last_attempt_display(&self) -> String {
        display_sync_time(self.last_attempt)
    }

    pub fn last_success_display(&self) -> String {
        display_sync_time(self.last_success)
    }
}

fn display_sync_time(when: Option<DateTime<Utc>>) -> String {
    match when {
        Some(t) => t.format(SYNC_TIME_FORMAT).to_string(),
        None => "unknown".to_string(),
    }
}

/// Outcome of one [`ReplicationClient::sync_once`] cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub certificates_ok: bool,
    pub certificates_attempts: usize,
    pub policies_ok: bool,
    pub policies_attempts: usize,
}

impl SyncReport {
    pub fn succeeded(&self) -> bool {
        self.certificates_ok && self.policies_ok
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationClient (slave)
// ═══════════════════════════════════════════════════════════════════════════════

/// Pulls archives from the master and unpacks them into the live directories.
pub struct ReplicationClient {
    fetcher: Arc<dyn ArchiveFetcher>,
    archiver: Archiver,
    dirs: ArchiveDirs,
    retry: RetryConfig,
    registry_lock: Arc<Mutex<()>>,
    state_tx: watch::Sender<SyncState>,
    metrics: Arc<dyn MetricsSink>,
}

impl ReplicationClient {
    pub fn new(
        fetcher: Arc<dyn ArchiveFetcher>,
        archiver: Archiver,
        dirs: ArchiveDirs,
        retry: RetryConfig,
        registry_lock: Arc<Mutex<()>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SyncState::default());
        Self {
            fetcher,
            archiver,
            dirs,
            retry,
            registry_lock,
            state_tx,
            metrics,
        }
    }

    /// Current sync state.
    pub fn state(&self) -> SyncState {
        *self.state_tx.borrow()
    }

    /// Watch sync state changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    /// One full cycle: both archives, then the state update.
    pub async fn sync_once(&self) -> SyncReport {
        let certs = self.sync_archive(ArchiveKind::Certificates).await;
        let ccd = self.sync_archive(ArchiveKind::Policies).await;

        let report = SyncReport {
            certificates_ok: certs.is_ok(),
            certificates_attempts: certs.attempts,
            policies_ok: ccd.is_ok(),
            policies_attempts: ccd.attempts,
        };

        let now = Utc::now();
        self.state_tx.send_modify(|state| {
            state.last_attempt = Some(now);
            if report.succeeded() {
                state.last_success = Some(now);
            }
        });

        self.metrics
            .set_gauge(metrics::SYNC_LAST_ATTEMPT, now.timestamp() as f64);
        if report.succeeded() {
            self.metrics
                .set_gauge(metrics::SYNC_LAST_SUCCESS, now.timestamp() as f64);
            info!(
                certs_attempts = report.certificates_attempts,
                ccd_attempts = report.policies_attempts,
                "Sync with master completed"
            );
        } else {
            warn!(
                certs_ok = report.certificates_ok,
                ccd_ok = report.policies_ok,
                "Sync with master incomplete"
            );
        }

        report
    }

    async fn sync_archive(&self, kind: ArchiveKind) -> RetryOutcome<()> {
        let outcome = retry(&self.retry, kind.label(), |attempt| self.attempt(kind, attempt)).await;
        if let Err(e) = &outcome.result {
            error!(archive = %kind, attempts = outcome.attempts, error = %e, "Giving up on archive this cycle");
        }
        outcome
    }

    async fn attempt(&self, kind: ArchiveKind, attempt: usize) -> Result<()> {
        info!(archive = %kind, attempt, "Downloading archive from master");
        let staging = self.dirs.staging_path(kind);

        match tokio::fs::remove_file(&staging).await {
            Ok(()) => debug!(path = %staging.display(), "Removed stale archive"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ControlPlaneError::io(staging.display().to_string(), e)),
        }

        let bytes = self.fetcher.fetch(kind).await?;

        tokio::fs::create_dir_all(&self.dirs.staging_dir)
            .await
            .map_err(|e| ControlPlaneError::io(self.dirs.staging_dir.display().to_string(), e))?;
        tokio::fs::write(&staging, &bytes)
            .await
            .map_err(|e| ControlPlaneError::io(staging.display().to_string(), e))?;

        let _guard = self.registry_lock.lock().await;
        self.archiver
            .extract(&staging, self.dirs.live_dir(kind))
            .await?;
        debug!(archive = %kind, bytes = bytes.len(), "Archive extracted");
        Ok(())
    }
}

/// Run the slave sync loop until shutdown: one sync now, then one per interval.
pub async fn run_sync_loop(
    client: Arc<ReplicationClient>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("replication");

    async move {
        let _ = shutdown_rx.borrow_and_update();

        info!(interval_secs = interval.as_secs(), "Starting replication task");

        // Initial sync, abandoned if shutdown arrives first
        tokio::select! {
            biased;
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received, stopping replication task");
                    return;
                }
            }
            _ = client.sync_once() => {}
        }

        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping replication task");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            client.sync_once().await;
        }
    }
    .instrument(span)
    .await
}

// ═══════════════════════════════════════════════════════════════════════════════
// ArchiveServer (master)
// ═══════════════════════════════════════════════════════════════════════════════

/// A freshly generated archive ready to be returned to a slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePayload {
    pub file_name: &'static str,
    /// Value for the `Content-Disposition` header.
    pub content_disposition: String,
    pub bytes: Vec<u8>,
}

/// Serves archives of the live directories to slaves.
pub struct ArchiveServer {
    role: NodeRole,
    token: String,
    archiver: Archiver,
    dirs: ArchiveDirs,
    registry_lock: Arc<Mutex<()>>,
}

impl ArchiveServer {
    pub fn new(
        role: NodeRole,
        token: impl Into<String>,
        archiver: Archiver,
        dirs: ArchiveDirs,
        registry_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            role,
            token: token.into(),
            archiver,
            dirs,
            registry_lock,
        }
    }

    /// Check role then token, then archive the live directory.
    pub async fn serve(&self, kind: ArchiveKind, presented_token: &str) -> Result<ArchivePayload> {
        if self.role.is_slave() {
            return Err(ControlPlaneError::Locked {
                operation: format!("download {}", kind.file_name()),
                role: self.role.to_string(),
            });
        }
        if !tokens_match(presented_token, &self.token) {
            warn!(archive = %kind, "Archive request with wrong sync token");
            return Err(ControlPlaneError::Forbidden("invalid sync token".to_string()));
        }

        let archive = self.dirs.staging_path(kind);
        tokio::fs::create_dir_all(&self.dirs.staging_dir)
            .await
            .map_err(|e| ControlPlaneError::io(self.dirs.staging_dir.display().to_string(), e))?;

        let _guard = self.registry_lock.lock().await;
        self.archiver.create(self.dirs.live_dir(kind), &archive).await?;
        let bytes = tokio::fs::read(&archive)
            .await
            .map_err(|e| ControlPlaneError::io(archive.display().to_string(), e))?;
        let _ = tokio::fs::remove_file(&archive).await;

        info!(archive = %kind, bytes = bytes.len(), "Served archive");
        Ok(ArchivePayload {
            file_name: kind.file_name(),
            content_disposition: format!("attachment; filename={}", kind.file_name()),
            bytes,
        })
    }
}

/// Compare without exiting at the first differing byte.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let a = presented.as_bytes();
    let b = expected.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::CommandOutput;
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;

    /// Pretends to be tar: `-czf` writes a marker archive, `-xzf` records.
    #[derive(Default)]
    struct FakeTar {
        calls: StdMutex<Vec<Vec<String>>>,
    }

    impl CommandRunner for FakeTar {
        fn run<'a>(&'a self, spec: &'a CommandSpec) -> BoxFuture<'a, CommandOutput> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(spec.args.clone());
                if spec.args[0] == "-czf" {
                    tokio::fs::write(&spec.args[1], b"TARBALL").await.unwrap();
                }
                Ok(CommandOutput {
                    status: Some(0),
                    ..Default::default()
                })
            })
        }
    }

    fn dirs(root: &Path) -> ArchiveDirs {
        ArchiveDirs {
            pki_dir: root.join("pki"),
            ccd_dir: root.join("ccd"),
            staging_dir: root.join("staging"),
        }
    }

    #[test]
    fn test_archive_kind_constants() {
        assert_eq!(ArchiveKind::Certificates.file_name(), "certs.tar.gz");
        assert_eq!(ArchiveKind::Policies.file_name(), "ccd.tar.gz");
        assert_eq!(ArchiveKind::Certificates.download_path(), "/api/data/certs/download");
        assert_eq!(ArchiveKind::Policies.download_path(), "/api/data/ccd/download");
    }

    #[test]
    fn test_sync_state_display() {
        let mut state = SyncState::default();
        assert_eq!(state.last_attempt_display(), "unknown");
        state.last_attempt = Some(Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap());
        assert_eq!(state.last_attempt_display(), "2024-05-06 07:08:09");
        assert_eq!(state.last_success_display(), "unknown");
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("justasimpleword", "justasimpleword"));
        assert!(!tokens_match("justasimpleworD", "justasimpleword"));
        assert!(!tokens_match("short", "justasimpleword"));
        assert!(!tokens_match("", "justasimpleword"));
    }

    #[test]
    fn test_http_fetcher_url() {
        let settings = ReplicationSettings {
            master_url: "http://master:8080/".to_string(),
            ..Default::default()
        };
        let fetcher = HttpFetcher::new(&settings).unwrap();
        assert_eq!(
            fetcher.url_for(ArchiveKind::Policies),
            "http://master:8080/api/data/ccd/download"
        );
    }

    #[tokio::test]
    async fn test_archiver_commands() {
        let dir = tempfile::tempdir().unwrap();
        let tar = Arc::new(FakeTar::default());
        let archiver = Archiver::new(tar.clone());

        let dest = dir.path().join("live");
        archiver.extract(Path::new("/tmp/x.tar.gz"), &dest).await.unwrap();
        assert!(dest.is_dir());

        let calls = tar.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            vec!["-xzf", "/tmp/x.tar.gz", "-C", dest.to_str().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_serve_checks_role_before_token() {
        let dir = tempfile::tempdir().unwrap();
        let server = ArchiveServer::new(
            NodeRole::Slave,
            "secret",
            Archiver::new(Arc::new(FakeTar::default())),
            dirs(dir.path()),
            Arc::new(Mutex::new(())),
        );
        let err = server.serve(ArchiveKind::Certificates, "wrong").await.unwrap_err();
        assert_eq!(err.status_code(), 423);
    }

    #[tokio::test]
    async fn test_serve_rejects_bad_token() {
        let dir = tempfile::tempdir().unwrap();
        let tar = Arc::new(FakeTar::default());
        let server = ArchiveServer::new(
            NodeRole::Master,
            "secret",
            Archiver::new(tar.clone()),
            dirs(dir.path()),
            Arc::new(Mutex::new(())),
        );
        let err = server.serve(ArchiveKind::Policies, "guess").await.unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert!(tar.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_serve_returns_fresh_archive() {
        let dir = tempfile::tempdir().unwrap();
        let server = ArchiveServer::new(
            NodeRole::Master,
            "secret",
            Archiver::new(Arc::new(FakeTar::default())),
            dirs(dir.path()),
            Arc::new(Mutex::new(())),
        );
        let payload = server.serve(ArchiveKind::Certificates, "secret").await.unwrap();
        assert_eq!(payload.file_name, "certs.tar.gz");
        assert_eq!(payload.content_disposition, "attachment; filename=certs.tar.gz");
        assert_eq!(payload.bytes, b"TARBALL");
        // Staging copy is not left behind
        assert!(!dir.path().join("staging/certs.tar.gz").exists());
    }
}
