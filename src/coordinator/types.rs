// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Control plane state types.
//!
//! # Lifecycle
//!
//! ```text
//!            start()                 shutdown()
//! Created ──────────→ Running ──────────────────→ ShuttingDown ──→ Stopped
//!    │                                                                ↑
//!    └──────────────────────── shutdown() ────────────────────────────┘
//! ```
//!
//! # Snapshot
//!
//! The reconciler builds a complete [`Snapshot`] every cycle and publishes it
//! in one step. Readers take an `Arc<Snapshot>` once per request and never
//! observe a partially built list.

use crate::session::SessionRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneState {
    /// Constructed; background tasks not running.
    Created,
    /// Reconciliation (and, on slaves, replication) running.
    Running,
    /// `shutdown()` called; waiting for tasks to finish.
    ShuttingDown,
    /// All tasks finished. Safe to drop.
    Stopped,
}

impl std::fmt::Display for PlaneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaneState::Created => write!(f, "Created"),
            PlaneState::Running => write!(f, "Running"),
            PlaneState::ShuttingDown => write!(f, "ShuttingDown"),
            PlaneState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// One user row as served to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientView {
    pub identity: String,
    /// `Active`, `Revoked` or `Expired`.
    pub account_status: String,
    /// `YYYY-MM-DD HH:MM:SS`.
    pub expiration_date: String,
    /// Empty unless revoked.
    pub revocation_date: String,
    /// `Connected` or empty.
    pub connection_status: String,
}

/// Aggregates over non-server certificates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientCounts {
    pub total: usize,
    pub valid: usize,
    pub revoked: usize,
    pub expired: usize,
    /// Clients with at least one live session.
    pub connected: usize,
    /// Records in none of the known states.
    pub other: usize,
}

impl ClientCounts {
    /// `total == valid + revoked + expired`.
    pub fn is_consistent(&self) -> bool {
        self.total == self.valid + self.revoked + self.expired
    }
}

/// Everything one reconciliation produced.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub clients: Vec<ClientView>,
    pub sessions: Vec<SessionRecord>,
    pub counts: ClientCounts,
    /// `None` until the first successful refresh.
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn session(&self, identity: &str) -> Option<&SessionRecord> {
        self.sessions.iter().find(|s| s.common_name == identity)
    }

    pub fn client(&self, identity: &str) -> Option<&ClientView> {
        self.clients.iter().find(|c| c.identity == identity)
    }
}
