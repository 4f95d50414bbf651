// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the control plane.
//!
//! Errors are categorized by their source (validation, authorization, external
//! tooling, network collaborators) and carry enough context to be surfaced to
//! the transport layer unchanged.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Status | Description |
//! |------------|-----------|--------|-------------|
//! | `InvalidIdentity` | No | 422 | Identity does not match the allowed pattern |
//! | `Policy` | No | 422 | CCD entry rejected by validation |
//! | `Conflict` | No | 422 | Operation not valid for the certificate's state |
//! | `NotFound` | No | 404 | Identity not present in the registry |
//! | `AlreadyExists` | No | 422 | Identity already issued |
//! | `Forbidden` | No | 403 | Sync token mismatch |
//! | `Locked` | No | 423 | Operation not allowed for this node's role |
//! | `ToolFailed` | No | 500 | External PKI/archive tool exited non-zero |
//! | `Management` | Yes | 502 | Control socket unreachable or misbehaving |
//! | `Timeout` | Yes | 504 | Collaborator did not answer in time |
//! | `Replication` | Yes | 502 | Archive download failed |
//! | `Io` | No | 500 | Local filesystem error |
//! | `Config` | No | 500 | Configuration invalid |
//! | `InvalidState` | No | 500 | Lifecycle method called out of order |
//! | `Shutdown` | No | 503 | Control plane is shutting down |
//! | `Internal` | No | 500 | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ControlPlaneError::is_retryable()`] to decide whether an operation
//! against a remote collaborator is worth repeating.

use crate::ccd::CcdRejection;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for control plane operations.
pub type Result<T> = std::result::Result<T, ControlPlaneError>;

/// Errors that can occur in the control plane.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// Identity failed the `^[A-Za-z0-9_.-]+$` check.
    #[error("Username \"{0}\" incorrect, you can use only ^[A-Za-z0-9_.-]+$")]
    InvalidIdentity(String),

    /// CCD entry failed validation.
    #[error(transparent)]
    Policy(#[from] CcdRejection),

    /// The certificate exists but is in the wrong state for the operation.
    #[error("User \"{identity}\" {message}")]
    Conflict { identity: String, message: String },

    /// No registry record for the identity.
    #[error("User \"{0}\" not found")]
    NotFound(String),

    /// A certificate was already issued for the identity.
    #[error("User \"{0}\" already exists")]
    AlreadyExists(String),

    /// Presented sync token does not match.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Operation is not allowed on a node with this role.
    #[error("Locked: {operation} is not permitted on a {role} node")]
    Locked { operation: String, role: String },

    /// External tool exited unsuccessfully or could not be spawned.
    ///
    /// `status` is `None` when the process never produced an exit code.
    #[error("Tool execution failed ({tool}, status {status:?}): {message}")]
    ToolFailed {
        tool: String,
        status: Option<i32>,
        message: String,
    },

    /// Control socket error.
    #[error("Management interface error ({operation}): {message}")]
    Management { operation: String, message: String },

    /// A collaborator did not answer within its bound.
    #[error("Timed out after {elapsed:?} during {operation}")]
    Timeout { operation: String, elapsed: Duration },

    /// Archive download from the master failed.
    #[error("Replication error ({archive}): {message}")]
    Replication { archive: String, message: String },

    /// Local filesystem error.
    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle method called in the wrong state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlPlaneError {
    /// Wrap an I/O error with the path or action it came from.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a management interface error.
    pub fn management(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Management {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a replication error for an archive.
    pub fn replication(archive: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Replication {
            archive: archive.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Management { .. } => true,
            Self::Timeout { .. } => true,
            Self::Replication { .. } => true,
            Self::InvalidIdentity(_)
            | Self::Policy(_)
            | Self::Conflict { .. }
            | Self::NotFound(_)
            | Self::AlreadyExists(_)
            | Self::Forbidden(_)
            | Self::Locked { .. }
            | Self::ToolFailed { .. }
            | Self::Io { .. }
            | Self::Config(_)
            | Self::InvalidState { .. }
            | Self::Shutdown
            | Self::Internal(_) => false,
        }
    }

    /// HTTP status the transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidIdentity(_)
            | Self::Policy(_)
            | Self::Conflict { .. }
            | Self::AlreadyExists(_) => 422,
            Self::NotFound(_) => 404,
            Self::Forbidden(_) => 403,
            Self::Locked { .. } => 423,
            Self::Management { .. } | Self::Replication { .. } => 502,
            Self::Timeout { .. } => 504,
            Self::Shutdown => 503,
            Self::ToolFailed { .. }
            | Self::Io { .. }
            | Self::Config(_)
            | Self::InvalidState { .. }
            | Self::Internal(_) => 500,
        }
    }
}
