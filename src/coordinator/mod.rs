// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Control plane coordinator.
//!
//! The facade the transport layer calls. It ties together:
//! - the certificate registry ([`crate::registry::Registry`])
//! - live sessions ([`crate::session::SessionTracker`])
//! - per-identity policy ([`crate::ccd::CcdStore`])
//! - easy-rsa operations ([`crate::pki::Pki`])
//! - snapshot reconciliation ([`StateReconciler`])
//! - master/slave replication ([`crate::replication`])
//!
//! # Concurrency
//!
//! Every mutation and every registry read goes through one registry lock.
//! Mutations release it before triggering a refresh, so the new state is
//! visible to readers as soon as the call returns. Refreshes themselves run
//! one at a time and publish in the order they read the registry.
//!
//! # Roles
//!
//! A slave is read-only: create, revoke, unrevoke and policy apply answer
//! [`ControlPlaneError::Locked`]. It pulls everything from its master instead.

mod reconcile;
mod types;

pub use reconcile::{build_snapshot, run_reconcile_loop, StateReconciler};
pub use types::{ClientCounts, ClientView, PlaneState, Snapshot};

use crate::ccd::{CcdEntry, CcdStore};
use crate::config::{ControlPlaneConfig, NodeRole};
use crate::error::{ControlPlaneError, Result};
use crate::metrics::{MetricsSink, RecorderSink};
use crate::pki::Pki;
use crate::registry::{validate_identity, CertState, Registry};
use crate::replication::{
    run_sync_loop, ArchiveDirs, ArchiveFetcher, ArchiveKind, ArchivePayload, ArchiveServer,
    Archiver, HttpFetcher, ReplicationClient, SyncState,
};
use crate::session::{SessionRecord, SessionTracker};
use crate::tool::{CommandRunner, ProcessRunner};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// How long `shutdown()` waits for each background task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// External collaborators, injectable for tests.
#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub fetcher: Arc<dyn ArchiveFetcher>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// The VPN fleet control plane.
pub struct ControlPlane {
    config: ControlPlaneConfig,

    registry: Registry,

    /// Serializes mutations, registry reads and archive extraction.
    registry_lock: Arc<Mutex<()>>,

    ccd: CcdStore,

    sessions: SessionTracker,

    pki: Pki,

    reconciler: Arc<StateReconciler>,

    /// Slave only.
    replication: Option<Arc<ReplicationClient>>,

    archive_server: ArchiveServer,

    state_tx: watch::Sender<PlaneState>,

    state_rx: watch::Receiver<PlaneState>,

    shutdown_tx: watch::Sender<bool>,

    shutdown_rx: watch::Receiver<bool>,

    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl ControlPlane {
    /// Create a control plane with production collaborators: child processes
    /// for tools, HTTP for archive downloads, the `metrics` facade for gauges.
    pub fn new(config: ControlPlaneConfig) -> Result<Self> {
        let collaborators = Collaborators {
            runner: Arc::new(ProcessRunner::new(config.easyrsa.tool_timeout_duration())),
            fetcher: Arc::new(HttpFetcher::new(&config.replication)?),
            metrics: Arc::new(RecorderSink),
        };
        Self::with_collaborators(config, collaborators)
    }

    /// Create a control plane with explicit collaborators.
    pub fn with_collaborators(config: ControlPlaneConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let subnet = config.ccd.subnet()?;

        let registry_lock = Arc::new(Mutex::new(()));
        let registry = Registry::new(&config.easyrsa.index_path);
        let sessions = SessionTracker::from_config(&config.management);
        let pki = Pki::new(config.easyrsa.clone(), Arc::clone(&collaborators.runner));
        let archiver = Archiver::new(Arc::clone(&collaborators.runner));
        let dirs = ArchiveDirs {
            pki_dir: config.easyrsa.pki_dir(),
            ccd_dir: config.ccd.dir.clone(),
            staging_dir: config.replication.staging_dir.clone(),
        };

        let reconciler = Arc::new(StateReconciler::new(
            registry.clone(),
            sessions.clone(),
            config.reconcile.probe_ca_expiry.then(|| pki.clone()),
            Arc::clone(&registry_lock),
            Arc::clone(&collaborators.metrics),
        ));

        let replication = config.role.is_slave().then(|| {
            Arc::new(ReplicationClient::new(
                Arc::clone(&collaborators.fetcher),
                archiver.clone(),
                dirs.clone(),
                config.replication.retry_config(),
                Arc::clone(&registry_lock),
                Arc::clone(&collaborators.metrics),
            ))
        });

        let archive_server = ArchiveServer::new(
            config.role,
            config.replication.sync_token.clone(),
            archiver,
            dirs,
            Arc::clone(&registry_lock),
        );

        let (state_tx, state_rx) = watch::channel(PlaneState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            ccd: CcdStore::new(&config.ccd.dir, subnet),
            config,
            registry,
            registry_lock,
            sessions,
            pki,
            reconciler,
            replication,
            archive_server,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            handles: RwLock::new(Vec::new()),
        })
    }

    pub fn role(&self) -> NodeRole {
        self.config.role
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    /// Get current lifecycle state.
    pub fn state(&self) -> PlaneState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<PlaneState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), PlaneState::Running)
    }

    /// Start background work.
    ///
    /// 1. Refreshes the snapshot once
    /// 2. Spawns the reconcile loop
    /// 3. On a slave, spawns the sync loop (which syncs immediately)
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != PlaneState::Created {
            return Err(ControlPlaneError::InvalidState {
                expected: PlaneState::Created.to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            role = %self.config.role,
            management = %self.sessions.address(),
            "Starting control plane"
        );

        if let Err(e) = self.reconciler.refresh().await {
            warn!(error = %e, "Initial refresh failed");
        }

        let mut handles = self.handles.write().await;

        let reconciler = Arc::clone(&self.reconciler);
        let interval = self.config.reconcile.interval_duration();
        let shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            run_reconcile_loop(reconciler, interval, shutdown_rx).await;
        }));
        debug!("Spawned reconcile task");

        if let Some(client) = &self.replication {
            let client = Arc::clone(client);
            let interval = self.config.replication.interval();
            let shutdown_rx = self.shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                run_sync_loop(client, interval, shutdown_rx).await;
            }));
            info!(
                master = %self.config.replication.master_url,
                "Spawned replication task"
            );
        }
        drop(handles);

        let _ = self.state_tx.send(PlaneState::Running);
        info!("Control plane running");
        Ok(())
    }

    /// Stop background work.
    ///
    /// Signals every task, then waits for each with a bounded drain timeout.
    pub async fn shutdown(&mut self) {
        info!("Shutting down control plane");
        let _ = self.state_tx.send(PlaneState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        let _ = self.state_tx.send(PlaneState::Stopped);
        info!("Control plane stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════════

    /// The current snapshot. Take it once per request.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.reconciler.snapshot()
    }

    /// User list for the UI.
    pub fn users(&self) -> Vec<ClientView> {
        self.snapshot().clients.clone()
    }

    /// Live session of `identity`, if connected.
    pub fn user_statistic(&self, identity: &str) -> Option<SessionRecord> {
        self.snapshot().session(identity).cloned()
    }

    /// Run a reconciliation now instead of waiting for the next tick.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>> {
        self.reconciler.refresh().await
    }

    pub fn sync_state(&self) -> SyncState {
        self.replication
            .as_ref()
            .map(|client| client.state())
            .unwrap_or_default()
    }

    /// Watch sync state; `None` on a master.
    pub fn sync_state_receiver(&self) -> Option<watch::Receiver<SyncState>> {
        self.replication.as_ref().map(|client| client.subscribe())
    }

    /// Client profile with inline key material.
    pub async fn client_config(&self, identity: &str) -> Result<String> {
        validate_identity(identity)?;
        let _guard = self.registry_lock.lock().await;
        if self.registry.find(identity).await?.is_none() {
            return Err(ControlPlaneError::NotFound(identity.to_string()));
        }
        self.pki.client_config(identity, &self.config.servers).await
    }

    /// Stored policy of `identity` (default if none).
    pub async fn policy(&self, identity: &str) -> Result<CcdEntry> {
        self.ccd.load(identity).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Mutations
    // ═══════════════════════════════════════════════════════════════════════════

    fn ensure_master(&self, operation: &str) -> Result<()> {
        if self.config.role.is_slave() {
            return Err(ControlPlaneError::Locked {
                operation: operation.to_string(),
                role: self.config.role.to_string(),
            });
        }
        Ok(())
    }

    async fn refresh_after(&self, operation: &str) {
        if let Err(e) = self.reconciler.refresh().await {
            warn!(operation, error = %e, "Refresh after mutation failed");
        }
    }

    /// Issue a certificate for a new identity.
    pub async fn create_user(&self, identity: &str) -> Result<()> {
        self.ensure_master("create")?;
        validate_identity(identity)?;
        {
            let _guard = self.registry_lock.lock().await;
            if self.registry.contains(identity).await? {
                return Err(ControlPlaneError::AlreadyExists(identity.to_string()));
            }
            self.pki.build_client(identity).await?;
        }
        info!(identity, "User created");
        self.refresh_after("create").await;
        Ok(())
    }

    /// Revoke a valid certificate.
    pub async fn revoke_user(&self, identity: &str) -> Result<()> {
        self.ensure_master("revoke")?;
        validate_identity(identity)?;
        {
            let _guard = self.registry_lock.lock().await;
            let record = self
                .registry
                .find(identity)
                .await?
                .ok_or_else(|| ControlPlaneError::NotFound(identity.to_string()))?;
            if record.state != CertState::Valid {
                return Err(ControlPlaneError::Conflict {
                    identity: identity.to_string(),
                    message: format!("cannot be revoked in state {}", record.state),
                });
            }
            self.pki.revoke(identity).await?;
        }
        info!(identity, "User revoked");
        self.refresh_after("revoke").await;
        Ok(())
    }

    /// Reinstate a revoked certificate.
    pub async fn unrevoke_user(&self, identity: &str) -> Result<()> {
        self.ensure_master("unrevoke")?;
        validate_identity(identity)?;
        {
            let _guard = self.registry_lock.lock().await;
            let mut records = self.registry.load().await?;
            let record = records
                .iter_mut()
                .find(|r| !r.is_server() && r.identity == identity)
                .ok_or_else(|| ControlPlaneError::NotFound(identity.to_string()))?;
            if record.state != CertState::Revoked {
                return Err(ControlPlaneError::Conflict {
                    identity: identity.to_string(),
                    message: "is not revoked".to_string(),
                });
            }

            self.pki
                .restore_revoked_files(identity, &record.serial_number)
                .await;
            record.unrevoke();
            self.registry.save(&records).await?;
            self.pki.gen_crl().await?;
        }
        info!(identity, "User unrevoked");
        self.refresh_after("unrevoke").await;
        Ok(())
    }

    /// Drop the live sessions of `identity`. Returns the daemon's reply.
    pub async fn disconnect_user(&self, identity: &str) -> Result<String> {
        self.sessions.kill(identity).await
    }

    /// Validate and store a policy for an existing identity.
    pub async fn apply_policy(&self, entry: &CcdEntry) -> Result<()> {
        self.ensure_master("apply policy")?;
        validate_identity(&entry.user)?;
        let _guard = self.registry_lock.lock().await;
        if self.registry.find(&entry.user).await?.is_none() {
            return Err(ControlPlaneError::NotFound(entry.user.clone()));
        }
        self.ccd.apply(entry).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Replication
    // ═══════════════════════════════════════════════════════════════════════════

    /// Master side of replication: a fresh archive for a slave.
    pub async fn serve_archive(&self, kind: ArchiveKind, token: &str) -> Result<ArchivePayload> {
        self.archive_server.serve(kind, token).await
    }

    /// Run one sync cycle now (slave only).
    pub async fn sync_now(&self) -> Result<SyncState> {
        let client = self.replication.as_ref().ok_or_else(|| ControlPlaneError::Locked {
            operation: "sync".to_string(),
            role: self.config.role.to_string(),
        })?;
        client.sync_once().await;
        Ok(client.state())
    }
}
