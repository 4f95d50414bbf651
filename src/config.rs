// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the control plane.
//!
//! This module defines all configuration types needed to run the control plane.
//! Configuration is passed to [`ControlPlane::new()`](crate::ControlPlane::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//! Loading it from flags, files or the environment is the embedding binary's job.
//!
//! # Quick Start
//!
//! ```rust
//! use vpn_control_plane::config::{ControlPlaneConfig, NodeRole};
//!
//! let config = ControlPlaneConfig {
//!     role: NodeRole::Slave,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ControlPlaneConfig
//! ├── role: NodeRole                 # master | slave
//! ├── servers: Vec<String>           # HOST:PORT remotes for client profiles
//! ├── easyrsa: EasyRsaConfig         # PKI directory, index file, tool binary
//! ├── ccd: CcdConfig                 # client-config-dir + VPN subnet
//! ├── management: ManagementConfig   # control socket address and bounds
//! ├── reconcile: ReconcileConfig     # snapshot refresh interval
//! └── replication: ReplicationSettings # master URL, token, sync interval
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! role: slave
//! servers: ["vpn.example.com:1194"]
//! ccd:
//!   dir: "/mnt/ccd"
//!   network: "172.16.100.0/24"
//! management:
//!   address: "127.0.0.1:8989"
//!   timeout: "5s"
//! replication:
//!   master_url: "https://vpn-master.example.com"
//!   sync_token: "s3cret"
//!   sync_interval_sec: 600
//! ```

use crate::ccd::Subnet;
use crate::error::{ControlPlaneError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Role of this node in the fleet.
///
/// A master issues and revokes certificates and serves archives; a slave is
/// read-only and pulls everything from its master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Master,
    Slave,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Slave => "slave",
        }
    }

    pub fn is_slave(&self) -> bool {
        matches!(self, NodeRole::Slave)
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = ControlPlaneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(NodeRole::Master),
            "slave" => Ok(NodeRole::Slave),
            other => Err(ControlPlaneError::Config(format!(
                "unknown role \"{}\", expected master or slave",
                other
            ))),
        }
    }
}

/// The top-level config object passed to `ControlPlane::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Master or slave.
    #[serde(default)]
    pub role: NodeRole,

    /// OpenVPN servers (`HOST:PORT`) written as `remote` lines into client profiles.
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,

    #[serde(default)]
    pub easyrsa: EasyRsaConfig,

    #[serde(default)]
    pub ccd: CcdConfig,

    #[serde(default)]
    pub management: ManagementConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub replication: ReplicationSettings,
}

fn default_servers() -> Vec<String> {
    vec!["127.0.0.1:7777".to_string()]
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Master,
            servers: default_servers(),
            easyrsa: EasyRsaConfig::default(),
            ccd: CcdConfig::default(),
            management: ManagementConfig::default(),
            reconcile: ReconcileConfig::default(),
            replication: ReplicationSettings::default(),
        }
    }
}

impl ControlPlaneConfig {
    /// Create a config rooted in a scratch directory, for tests.
    ///
    /// `root/easyrsa/pki/index.txt` is the registry and `root/ccd` the policy dir.
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let easyrsa_dir = root.join("easyrsa");
        Self {
            easyrsa: EasyRsaConfig {
                index_path: easyrsa_dir.join("pki").join("index.txt"),
                dir: easyrsa_dir,
                tool_timeout: "5s".to_string(),
                ..Default::default()
            },
            ccd: CcdConfig {
                dir: root.join("ccd"),
                ..Default::default()
            },
            management: ManagementConfig {
                timeout: "500ms".to_string(),
                ..Default::default()
            },
            replication: ReplicationSettings {
                staging_dir: root.join("staging"),
                request_timeout: "1s".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Check values that would otherwise fail later at runtime.
    pub fn validate(&self) -> Result<()> {
        self.ccd.subnet()?;
        if self.servers.iter().any(|s| !s.contains(':')) {
            return Err(ControlPlaneError::Config(
                "servers must be HOST:PORT".to_string(),
            ));
        }
        if self.role.is_slave() && self.replication.master_url.trim().is_empty() {
            return Err(ControlPlaneError::Config(
                "slave role requires replication.master_url".to_string(),
            ));
        }
        if self.replication.max_attempts == 0 {
            return Err(ControlPlaneError::Config(
                "replication.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EasyRsaConfig: PKI tooling
// ═══════════════════════════════════════════════════════════════════════════════

/// Location of the easy-rsa installation and its certificate registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EasyRsaConfig {
    /// easy-rsa working directory (contains `pki/`).
    #[serde(default = "default_easyrsa_dir")]
    pub dir: PathBuf,

    /// Path to the certificate registry (`index.txt`).
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,

    /// easy-rsa executable.
    #[serde(default = "default_easyrsa_binary")]
    pub binary: String,

    /// openssl executable, used to read the CA expiry date.
    #[serde(default = "default_openssl_binary")]
    pub openssl_binary: String,

    /// Upper bound for a single tool invocation, e.g. "60s".
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout: String,
}

fn default_easyrsa_dir() -> PathBuf {
    PathBuf::from("/mnt/easyrsa")
}

fn default_index_path() -> PathBuf {
    PathBuf::from("/mnt/easyrsa/pki/index.txt")
}

fn default_easyrsa_binary() -> String {
    "easyrsa".to_string()
}

fn default_openssl_binary() -> String {
    "openssl".to_string()
}

fn default_tool_timeout() -> String {
    "60s".to_string()
}

impl Default for EasyRsaConfig {
    fn default() -> Self {
        Self {
            dir: default_easyrsa_dir(),
            index_path: default_index_path(),
            binary: default_easyrsa_binary(),
            openssl_binary: default_openssl_binary(),
            tool_timeout: default_tool_timeout(),
        }
    }
}

impl EasyRsaConfig {
    /// The `pki/` directory that replication archives and restores.
    pub fn pki_dir(&self) -> PathBuf {
        self.dir.join("pki")
    }

    /// Parse the tool timeout, falling back to 60 seconds.
    pub fn tool_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.tool_timeout).unwrap_or(Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CcdConfig: per-identity policy files
// ═══════════════════════════════════════════════════════════════════════════════

/// Client-config-dir settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcdConfig {
    /// Directory holding one policy file per identity.
    #[serde(default = "default_ccd_dir")]
    pub dir: PathBuf,

    /// VPN network in CIDR notation. Static addresses must fall inside it.
    #[serde(default = "default_network")]
    pub network: String,
}

fn default_ccd_dir() -> PathBuf {
    PathBuf::from("/mnt/ccd")
}

fn default_network() -> String {
    "172.16.100.0/24".to_string()
}

impl Default for CcdConfig {
    fn default() -> Self {
        Self {
            dir: default_ccd_dir(),
            network: default_network(),
        }
    }
}

impl CcdConfig {
    /// Parse the configured network.
    pub fn subnet(&self) -> Result<Subnet> {
        self.network
            .parse()
            .map_err(|e| ControlPlaneError::Config(format!("ccd.network: {}", e)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ManagementConfig: VPN daemon control socket
// ═══════════════════════════════════════════════════════════════════════════════

/// Control socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// `HOST:PORT` of the management interface.
    #[serde(default = "default_mgmt_address")]
    pub address: String,

    /// Bound on a whole connect/banner/command/reply exchange, e.g. "5s".
    #[serde(default = "default_mgmt_timeout")]
    pub timeout: String,

    /// Largest status reply accepted before the read is aborted.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

fn default_mgmt_address() -> String {
    "127.0.0.1:8989".to_string()
}

fn default_mgmt_timeout() -> String {
    "5s".to_string()
}

fn default_max_response_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            address: default_mgmt_address(),
            timeout: default_mgmt_timeout(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

impl ManagementConfig {
    /// Parse the exchange timeout, falling back to 5 seconds.
    pub fn timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.timeout).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReconcileConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot refresh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Refresh interval, e.g. "28s".
    #[serde(default = "default_reconcile_interval")]
    pub interval: String,

    /// Read the CA certificate expiry with openssl on every refresh.
    #[serde(default = "default_true")]
    pub probe_ca_expiry: bool,
}

fn default_reconcile_interval() -> String {
    "28s".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: default_reconcile_interval(),
            probe_ca_expiry: true,
        }
    }
}

impl ReconcileConfig {
    /// Parse the interval, falling back to 28 seconds.
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(28))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings: slave → master pulls
// ═══════════════════════════════════════════════════════════════════════════════

/// Master/slave replication settings.
///
/// The token is shared by both sides: the master checks it, the slave sends it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Base URL of the master, e.g. `http://10.0.0.1:8080`.
    #[serde(default = "default_master_url")]
    pub master_url: String,

    /// Basic auth user for the master URL. Used only together with a password.
    #[serde(default)]
    pub basic_auth_user: Option<String>,

    #[serde(default)]
    pub basic_auth_password: Option<String>,

    /// Shared secret sent as `?token=`.
    #[serde(default = "default_sync_token")]
    pub sync_token: String,

    /// Seconds between sync cycles.
    #[serde(default = "default_sync_interval_sec")]
    pub sync_interval_sec: u64,

    /// Attempts per archive per cycle.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Bound on one archive download, e.g. "30s".
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Where downloaded and served archives are written.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

fn default_master_url() -> String {
    "http://127.0.0.1".to_string()
}

fn default_sync_token() -> String {
    "justasimpleword".to_string()
}

fn default_sync_interval_sec() -> u64 {
    600
}

fn default_max_attempts() -> usize {
    3
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir()
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            master_url: default_master_url(),
            basic_auth_user: None,
            basic_auth_password: None,
            sync_token: default_sync_token(),
            sync_interval_sec: default_sync_interval_sec(),
            max_attempts: default_max_attempts(),
            request_timeout: default_request_timeout(),
            staging_dir: default_staging_dir(),
        }
    }
}

impl ReplicationSettings {
    /// Get the sync interval as a Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_sec)
    }

    /// Parse the request timeout, falling back to 30 seconds.
    pub fn request_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Basic auth credentials, present only when both halves are non-empty.
    pub fn basic_auth(&self) -> Option<(String, String)> {
        match (&self.basic_auth_user, &self.basic_auth_password) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some((user.clone(), password.clone()))
            }
            _ => None,
        }
    }

    /// Retry policy for one archive sub-flow.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            attempt_timeout: self.request_timeout_duration(),
            ..RetryConfig::replication()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
