//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A fake easy-rsa/openssl/tar runner that edits a scratch PKI
//! - A scripted archive fetcher
//! - A fake OpenVPN management server
//! - A metrics sink that records every gauge

#![allow(dead_code)]

pub mod fake_tools;
pub mod management;

pub use fake_tools::*;
pub use management::*;

use std::path::Path;
use std::sync::Arc;
use vpn_control_plane::{Collaborators, ControlPlane, ControlPlaneConfig, NodeRole};

/// Route logs to the test writer; honors `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Registry line for a valid certificate.
pub fn valid_line(identity: &str, expires: &str, serial: &str) -> String {
    format!("V\t{}\t\t{}\tunknown\t/CN={}\n", expires, serial, identity)
}

/// Registry line for a revoked certificate.
pub fn revoked_line(identity: &str, expires: &str, revoked: &str, serial: &str) -> String {
    format!(
        "R\t{}\t{}\t{}\tunknown\t/CN={}\n",
        expires, revoked, serial, identity
    )
}

/// Write `index.txt` for a config built with `ControlPlaneConfig::for_testing`.
pub fn seed_registry(config: &ControlPlaneConfig, lines: &[String]) {
    let index = &config.easyrsa.index_path;
    std::fs::create_dir_all(index.parent().unwrap()).unwrap();
    std::fs::write(index, lines.concat()).unwrap();
}

pub fn read_registry(config: &ControlPlaneConfig) -> String {
    std::fs::read_to_string(&config.easyrsa.index_path).unwrap_or_default()
}

/// Everything a control plane test needs, kept alive together.
pub struct TestPlane {
    pub dir: tempfile::TempDir,
    pub config: ControlPlaneConfig,
    pub tools: Arc<FakeTools>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub sink: Arc<RecordingSink>,
}

impl TestPlane {
    /// A scratch config for `role`, with the management socket pointing at
    /// a closed port unless overridden.
    pub fn new(role: NodeRole) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let mut config = ControlPlaneConfig::for_testing(dir.path());
        config.role = role;
        config.management.address = "127.0.0.1:1".to_string();
        config.reconcile.probe_ca_expiry = false;
        config.replication.master_url = "http://master.test".to_string();
        Self {
            dir,
            config,
            tools: Arc::new(FakeTools::default()),
            fetcher: Arc::new(ScriptedFetcher::default()),
            sink: Arc::new(RecordingSink::default()),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn pki_dir(&self) -> std::path::PathBuf {
        self.config.easyrsa.pki_dir()
    }

    pub fn build(&self) -> ControlPlane {
        ControlPlane::with_collaborators(
            self.config.clone(),
            Collaborators {
                runner: self.tools.clone(),
                fetcher: self.fetcher.clone(),
                metrics: self.sink.clone(),
            },
        )
        .unwrap()
    }
}
