// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # VPN Control Plane
//!
//! The core of an OpenVPN fleet administration service: certificate
//! lifecycle, live session tracking, per-client policy, and master/slave
//! replication of the PKI and policy directories.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                             ControlPlane                                  │
//! │                                                                           │
//! │  ┌──────────────┐   ┌────────────────┐   ┌─────────────────────────────┐  │
//! │  │ Registry     │──►│ StateReconciler│──►│ Arc<Snapshot> (watch)       │  │
//! │  │ (index.txt)  │   │ (periodic)     │   │ users / statistics / gauges │  │
//! │  └──────────────┘   └────────────────┘   └─────────────────────────────┘  │
//! │         ▲                   ▲                                             │
//! │         │                   │                                             │
//! │  ┌──────────────┐   ┌────────────────┐   ┌─────────────────────────────┐  │
//! │  │ Pki          │   │ SessionTracker │   │ ReplicationClient (slave)   │  │
//! │  │ (easy-rsa)   │   │ (mgmt socket)  │   │ ArchiveServer (master)      │  │
//! │  └──────────────┘   └────────────────┘   └─────────────────────────────┘  │
//! │                                                                           │
//! │  ┌──────────────┐                                                         │
//! │  │ CcdStore     │  per-client static address and pushed routes            │
//! │  └──────────────┘                                                         │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use vpn_control_plane::{ControlPlane, ControlPlaneConfig};
//!
//! #[tokio::main]
//! async fn main() -> vpn_control_plane::Result<()> {
//!     let config = ControlPlaneConfig::default();
//!     let mut plane = ControlPlane::new(config)?;
//!     plane.start().await?;
//!
//!     for user in plane.users() {
//!         println!("{} {}", user.identity, user.account_status);
//!     }
//!
//!     plane.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod ccd;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod pki;
pub mod registry;
pub mod replication;
pub mod resilience;
pub mod session;
pub mod tool;

// Re-exports for convenience
pub use ccd::{CcdEntry, CcdRejection, CcdRoute, CcdStore, Subnet};
pub use config::{
    CcdConfig, ControlPlaneConfig, EasyRsaConfig, ManagementConfig, NodeRole, ReconcileConfig,
    ReplicationSettings,
};
pub use coordinator::{
    ClientCounts, ClientView, Collaborators, ControlPlane, PlaneState, Snapshot, StateReconciler,
};
pub use error::{ControlPlaneError, Result};
pub use metrics::{MetricsSink, NoOpSink, RecorderSink};
pub use pki::Pki;
pub use registry::{CertState, CertificateRecord, Registry};
pub use replication::{
    ArchiveFetcher, ArchiveKind, ArchivePayload, ArchiveServer, HttpFetcher, ReplicationClient,
    SyncState,
};
pub use session::{SessionRecord, SessionTracker};
pub use tool::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
