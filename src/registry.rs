// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Certificate registry (easy-rsa `index.txt`).
//!
//! One line per issued certificate, whitespace separated:
//!
//! ```text
//! V   <expiration>                <serial> <filename> <dn>
//! R   <expiration> <revocation>   <serial> <filename> <dn>
//! ```
//!
//! Valid lines carry an empty revocation column, which disappears when
//! tokenizing by whitespace, so the two layouts differ in token count.
//!
//! # Parsing is total
//!
//! [`parse`] never fails. Unknown flags, blank lines and lines with too few
//! tokens are skipped. [`render`] is its inverse for Valid/Revoked records;
//! records in any other state are not written back.
//!
//! # Expiry
//!
//! The flag column only says Valid or Revoked. Whether a Valid certificate has
//! run out is decided from its expiration date by
//! [`CertificateRecord::effective_state`].

use crate::error::{ControlPlaneError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Identity of the issuing server's own certificate.
pub const SERVER_IDENTITY: &str = "server";

/// `YYMMDDHHMMSSZ` (UTCTime).
pub const COMPACT_DATE_FORMAT: &str = "%y%m%d%H%M%SZ";
/// `YYYYMMDDHHMMSSZ` (GeneralizedTime, used past 2049).
pub const COMPACT_DATE_FORMAT_LONG: &str = "%Y%m%d%H%M%SZ";
/// What consumers are shown.
pub const DISPLAY_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Allowed identity pattern; also bounds certificate common names.
pub const IDENTITY_PATTERN: &str = r"^[A-Za-z0-9_.-]+$";

static IDENTITY_RE: Lazy<Regex> = Lazy::new(|| {
    // The pattern is a literal; failing to compile would be a programming error.
    Regex::new(IDENTITY_PATTERN).unwrap_or_else(|_| unreachable!("identity pattern compiles"))
});

/// Certificate state in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertState {
    Valid,
    Revoked,
    Expired,
    Other,
}

impl CertState {
    /// Registry flag for states that are written back.
    pub fn flag(&self) -> Option<&'static str> {
        match self {
            CertState::Valid => Some("V"),
            CertState::Revoked => Some("R"),
            CertState::Expired | CertState::Other => None,
        }
    }

    /// Account status shown to users.
    pub fn account_status(&self) -> &'static str {
        match self {
            CertState::Valid => "Active",
            CertState::Revoked => "Revoked",
            CertState::Expired => "Expired",
            CertState::Other => "",
        }
    }
}

impl std::fmt::Display for CertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertState::Valid => write!(f, "Valid"),
            CertState::Revoked => write!(f, "Revoked"),
            CertState::Expired => write!(f, "Expired"),
            CertState::Other => write!(f, "Other"),
        }
    }
}

/// One registry line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    /// Everything after the first `=` of the distinguished name.
    pub identity: String,
    pub distinguished_name: String,
    pub serial_number: String,
    pub filename: String,
    pub state: CertState,
    /// Compact timestamp as stored.
    pub expiration_date: String,
    /// Compact timestamp, only for revoked records.
    pub revocation_date: Option<String>,
}

impl CertificateRecord {
    /// Is this the issuing server's own certificate?
    pub fn is_server(&self) -> bool {
        self.identity == SERVER_IDENTITY
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        parse_compact_timestamp(&self.expiration_date)
    }

    pub fn revoked_at(&self) -> Option<DateTime<Utc>> {
        self.revocation_date.as_deref().and_then(parse_compact_timestamp)
    }

    /// State as of `now`: a Valid certificate past its expiration is Expired.
    ///
    /// An unparseable expiration date leaves the stored state unchanged.
    pub fn effective_state(&self, now: DateTime<Utc>) -> CertState {
        match self.state {
            CertState::Valid => match self.expires_at() {
                Some(expires) if expires < now => CertState::Expired,
                _ => CertState::Valid,
            },
            other => other,
        }
    }

    /// Mark revoked at `when` (compact form).
    pub fn revoke(&mut self, when: DateTime<Utc>) {
        self.state = CertState::Revoked;
        self.revocation_date = Some(format_compact_timestamp(when));
    }

    /// Clear the revocation.
    pub fn unrevoke(&mut self) {
        self.state = CertState::Valid;
        self.revocation_date = None;
    }
}

/// Substring of `dn` after its first `=`; the whole string if there is none.
pub fn identity_from_dn(dn: &str) -> &str {
    match dn.find('=') {
        Some(idx) => &dn[idx + 1..],
        None => dn,
    }
}

/// Parse registry text. Never fails.
pub fn parse(text: &str) -> Vec<CertificateRecord> {
    let mut records = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(flag) = tokens.first() else {
            continue;
        };

        let record = match *flag {
            "V" if tokens.len() >= 5 => CertificateRecord {
                identity: identity_from_dn(tokens[4]).to_string(),
                distinguished_name: tokens[4].to_string(),
                serial_number: tokens[2].to_string(),
                filename: tokens[3].to_string(),
                state: CertState::Valid,
                expiration_date: tokens[1].to_string(),
                revocation_date: None,
            },
            "R" if tokens.len() >= 6 => CertificateRecord {
                identity: identity_from_dn(tokens[5]).to_string(),
                distinguished_name: tokens[5].to_string(),
                serial_number: tokens[3].to_string(),
                filename: tokens[4].to_string(),
                state: CertState::Revoked,
                expiration_date: tokens[1].to_string(),
                revocation_date: Some(tokens[2].to_string()),
            },
            _ => {
                debug!(line = line_no + 1, flag = *flag, "Skipping registry line");
                continue;
            }
        };
        records.push(record);
    }

    records
}

/// Render records back to registry text, dropping Expired/Other.
pub fn render(records: &[CertificateRecord]) -> String {
    let mut out = String::new();

    for record in records {
        match record.state {
            CertState::Valid => {
                out.push_str(&format!(
                    "V\t{}\t\t{}\t{}\t{}\n",
                    record.expiration_date,
                    record.serial_number,
                    record.filename,
                    record.distinguished_name
                ));
            }
            CertState::Revoked => {
                out.push_str(&format!(
                    "R\t{}\t{}\t{}\t{}\t{}\n",
                    record.expiration_date,
                    record.revocation_date.as_deref().unwrap_or_default(),
                    record.serial_number,
                    record.filename,
                    record.distinguished_name
                ));
            }
            CertState::Expired | CertState::Other => {}
        }
    }

    out
}

/// Parse `YYMMDDHHMMSSZ` or `YYYYMMDDHHMMSSZ`.
pub fn parse_compact_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let format = match s.len() {
        13 => COMPACT_DATE_FORMAT,
        15 => COMPACT_DATE_FORMAT_LONG,
        _ => return None,
    };
    NaiveDateTime::parse_from_str(s, format)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn format_compact_timestamp(when: DateTime<Utc>) -> String {
    when.format(COMPACT_DATE_FORMAT).to_string()
}

/// Compact timestamp in display form; unparseable input is returned as-is.
pub fn display_timestamp(compact: &str) -> String {
    match parse_compact_timestamp(compact) {
        Some(when) => when.format(DISPLAY_DATE_FORMAT).to_string(),
        None => compact.to_string(),
    }
}

/// Check an identity against [`IDENTITY_PATTERN`].
pub fn validate_identity(identity: &str) -> Result<()> {
    if IDENTITY_RE.is_match(identity) {
        Ok(())
    } else {
        Err(ControlPlaneError::InvalidIdentity(identity.to_string()))
    }
}

/// The registry file on disk.
///
/// Callers coordinate access through the control plane's registry lock; this
/// type only does the I/O.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the registry. A missing file is an empty registry.
    pub async fn load(&self) -> Result<Vec<CertificateRecord>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "Registry file not found, treating as empty");
                Ok(Vec::new())
            }
            Err(e) => Err(ControlPlaneError::io(self.path.display().to_string(), e)),
        }
    }

    /// Rewrite the whole registry (temp file + rename).
    pub async fn save(&self, records: &[CertificateRecord]) -> Result<()> {
        let text = render(records);
        let tmp = self.path.with_extension("txt.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| ControlPlaneError::io(tmp.display().to_string(), e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ControlPlaneError::io(self.path.display().to_string(), e))?;
        debug!(path = %self.path.display(), records = records.len(), "Registry rewritten");
        Ok(())
    }

    /// Find the (non-server) record for an identity.
    pub async fn find(&self, identity: &str) -> Result<Option<CertificateRecord>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .find(|r| !r.is_server() && r.identity == identity))
    }

    /// Whether any record, the server's included, carries this identity.
    pub async fn contains(&self, identity: &str) -> Result<bool> {
        Ok(self.load().await?.iter().any(|r| r.identity == identity))
    }
}
