// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! easy-rsa operations.
//!
//! Issuing, revoking and CRL generation are done by the `easyrsa` tool run
//! inside the configured easy-rsa directory. This module builds those
//! invocations, checks their exit status, and handles the few file-level
//! tasks the tool does not cover:
//!
//! - restoring a revoked certificate's files on unrevoke
//! - making the CRL readable by the (unprivileged) VPN daemon
//! - reading the CA expiry date with `openssl`
//! - rendering a client profile with inline key material
//!
//! Callers hold the registry lock around every mutating operation.

use crate::config::EasyRsaConfig;
use crate::error::{ControlPlaneError, Result};
use crate::tool::{run_checked, CommandRunner, CommandSpec};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const OPENSSL_DATE_FORMAT: &str = "%b %d %H:%M:%S %Y";
const DEFAULT_VPN_PORT: &str = "1194";

/// easy-rsa front end.
#[derive(Clone)]
pub struct Pki {
    config: EasyRsaConfig,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Pki {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pki").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Pki {
    pub fn new(config: EasyRsaConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn pki_dir(&self) -> PathBuf {
        self.config.pki_dir()
    }

    fn easyrsa(&self) -> CommandSpec {
        CommandSpec::new(&self.config.binary)
            .arg("--batch")
            .current_dir(&self.config.dir)
    }

    /// Issue a client certificate without a key passphrase.
    pub async fn build_client(&self, identity: &str) -> Result<()> {
        let spec = self.easyrsa().args(["build-client-full", identity, "nopass"]);
        run_checked(self.runner.as_ref(), &spec).await?;
        info!(identity, "Client certificate issued");
        Ok(())
    }

    /// Revoke a certificate and publish a fresh CRL.
    pub async fn revoke(&self, identity: &str) -> Result<()> {
        let spec = self.easyrsa().args(["revoke", identity]);
        run_checked(self.runner.as_ref(), &spec).await?;
        info!(identity, "Client certificate revoked");
        self.gen_crl().await
    }

    /// Regenerate the CRL and fix its permissions.
    pub async fn gen_crl(&self) -> Result<()> {
        let spec = self.easyrsa().arg("gen-crl");
        run_checked(self.runner.as_ref(), &spec).await?;
        fix_crl_permissions(&self.pki_dir()).await;
        Ok(())
    }

    /// Copy a revoked certificate's files back to their issued locations.
    ///
    /// Missing files are logged and skipped; the registry is the source of
    /// truth for the certificate's state.
    pub async fn restore_revoked_files(&self, identity: &str, serial: &str) {
        let pki = self.pki_dir();
        let revoked = pki.join("revoked");
        let copies = [
            (
                revoked.join("certs_by_serial").join(format!("{}.crt", serial)),
                pki.join("issued").join(format!("{}.crt", identity)),
            ),
            (
                revoked.join("certs_by_serial").join(format!("{}.crt", serial)),
                pki.join("certs_by_serial").join(format!("{}.pem", serial)),
            ),
            (
                revoked.join("private_by_serial").join(format!("{}.key", serial)),
                pki.join("private").join(format!("{}.key", identity)),
            ),
            (
                revoked.join("reqs_by_serial").join(format!("{}.req", serial)),
                pki.join("reqs").join(format!("{}.req", identity)),
            ),
        ];

        for (from, to) in copies {
            if let Some(parent) = to.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            match tokio::fs::copy(&from, &to).await {
                Ok(_) => debug!(from = %from.display(), to = %to.display(), "Restored file"),
                Err(e) => warn!(
                    from = %from.display(),
                    to = %to.display(),
                    error = %e,
                    "Could not restore revoked file"
                ),
            }
        }
    }

    /// Expiry of the CA certificate.
    pub async fn ca_expiry(&self) -> Result<DateTime<Utc>> {
        let ca = self.pki_dir().join("ca.crt");
        let spec = CommandSpec::new(&self.config.openssl_binary).args([
            "x509".to_string(),
            "-in".to_string(),
            ca.display().to_string(),
            "-noout".to_string(),
            "-enddate".to_string(),
        ]);
        let output = run_checked(self.runner.as_ref(), &spec).await?;
        parse_openssl_enddate(&output.stdout).ok_or_else(|| {
            ControlPlaneError::Internal(format!(
                "cannot parse CA expiry from \"{}\"",
                output.stdout.trim()
            ))
        })
    }

    /// Render a client profile for `identity`, one `remote` per server.
    pub async fn client_config(&self, identity: &str, servers: &[String]) -> Result<String> {
        let pki = self.pki_dir();
        let profile = ClientProfile {
            remotes: servers.iter().map(|s| split_server(s)).collect(),
            ca: read_material(&pki.join("ca.crt")).await?,
            cert: read_material(&pki.join("issued").join(format!("{}.crt", identity))).await?,
            key: read_material(&pki.join("private").join(format!("{}.key", identity))).await?,
            tls_auth: match tokio::fs::read_to_string(pki.join("ta.key")).await {
                Ok(text) => Some(text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(ControlPlaneError::io("ta.key", e)),
            },
        };
        Ok(profile.render())
    }
}

async fn read_material(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ControlPlaneError::io(path.display().to_string(), e))
}

/// The daemon reads the CRL after dropping privileges.
pub async fn fix_crl_permissions(pki_dir: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let targets = [(pki_dir.to_path_buf(), 0o755), (pki_dir.join("crl.pem"), 0o644)];
        for (path, mode) in targets {
            if let Err(e) =
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await
            {
                warn!(path = %path.display(), error = %e, "Could not fix CRL permissions");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pki_dir;
    }
}

/// Parse `notAfter=Jan  2 15:04:05 2034 GMT`.
pub fn parse_openssl_enddate(output: &str) -> Option<DateTime<Utc>> {
    let value = output.trim().strip_prefix("notAfter=")?;
    let mut tokens: Vec<&str> = value.split_whitespace().collect();
    if tokens.last() == Some(&"GMT") {
        tokens.pop();
    }
    NaiveDateTime::parse_from_str(&tokens.join(" "), OPENSSL_DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn split_server(server: &str) -> (String, String) {
    match server.split_once(':') {
        Some((host, port)) => (host.to_string(), port.to_string()),
        None => (server.to_string(), DEFAULT_VPN_PORT.to_string()),
    }
}

/// Everything a client profile carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    /// `(host, port)` pairs.
    pub remotes: Vec<(String, String)>,
    pub ca: String,
    pub cert: String,
    pub key: String,
    pub tls_auth: Option<String>,
}

impl ClientProfile {
    pub fn render(&self) -> String {
        let mut out = String::from("client\n");
        for (host, port) in &self.remotes {
            out.push_str(&format!("remote {} {}\n", host, port));
        }
        out.push_str(
            "dev tun\n\
             nobind\n\
             resolv-retry infinite\n\
             persist-key\n\
             persist-tun\n\
             remote-cert-tls server\n\
             auth-nocache\n\
             verb 3\n",
        );
        push_block(&mut out, "ca", &self.ca);
        push_block(&mut out, "cert", &self.cert);
        push_block(&mut out, "key", &self.key);
        if let Some(ta) = &self.tls_auth {
            out.push_str("key-direction 1\n");
            push_block(&mut out, "tls-auth", ta);
        }
        out
    }
}

fn push_block(out: &mut String, tag: &str, body: &str) {
    out.push_str(&format!("<{}>\n{}\n</{}>\n", tag, body.trim_end(), tag));
}
