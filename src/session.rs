// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live sessions from the VPN daemon's management interface.
//!
//! The management interface is a plaintext TCP line protocol. Every exchange
//! here uses a fresh connection:
//!
//! ```text
//! connect → read banner line → send "<command>\n" → read reply → close
//! ```
//!
//! The whole exchange is bounded by one timeout; dropping the future cancels
//! the socket I/O.
//!
//! # Status report
//!
//! ```text
//! OpenVPN CLIENT LIST
//! Updated,Thu Jun 18 08:12:15 2015
//! Common Name,Real Address,Bytes Received,Bytes Sent,Connected Since
//! alice,10.0.0.5:51234,100,200,Thu Jun 18 04:23:03 2015
//! ROUTING TABLE
//! Virtual Address,Common Name,Real Address,Last Ref
//! 172.16.100.10,alice,10.0.0.5:51234,Thu Jun 18 08:12:09 2015
//! GLOBAL STATS
//! Max bcast/mcast queue length,0
//! END
//! ```
//!
//! The reply is read up to the `END` line (or until the peer closes) and may
//! not exceed `max_response_bytes`; an oversized reply is an error rather
//! than a silently truncated report.

use crate::config::ManagementConfig;
use crate::error::{ControlPlaneError, Result};
use crate::registry::validate_identity;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const CLIENT_LIST_HEADER: &str = "Common Name,Real Address,Bytes Received,Bytes Sent,Connected Since";
const ROUTING_TABLE_MARKER: &str = "ROUTING TABLE";
const ROUTING_HEADER: &str = "Virtual Address,Common Name,Real Address,Last Ref";
const GLOBAL_STATS_MARKER: &str = "GLOBAL STATS";
const END_MARKER: &str = "END";

/// Layout of status timestamps after the weekday is dropped.
const STATUS_DATE_FORMAT: &str = "%b %d %H:%M:%S %Y";

/// One connected client as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionRecord {
    pub common_name: String,
    pub real_address: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connected_since: String,
    #[serde(default)]
    pub virtual_address: Option<String>,
    #[serde(default)]
    pub last_ref: Option<String>,
}

impl SessionRecord {
    pub fn connected_since_epoch(&self) -> Option<i64> {
        parse_status_timestamp(&self.connected_since).map(|t| t.timestamp())
    }

    pub fn last_ref_epoch(&self) -> Option<i64> {
        self.last_ref
            .as_deref()
            .and_then(parse_status_timestamp)
            .map(|t| t.timestamp())
    }
}

/// Parse a status timestamp such as `Mon Jan  2 15:04:05 2006` as UTC.
///
/// The weekday is ignored; extra spaces are tolerated.
pub fn parse_status_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let mut tokens = s.split_whitespace();
    tokens.next()?;
    let rest = tokens.collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&rest, STATUS_DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Clients,
    Routing,
}

/// Parse a `status` reply. Never fails; short rows are skipped.
///
/// Each routing row fills in the first client record with the same common
/// name, and only that one.
pub fn parse_status(text: &str) -> Vec<SessionRecord> {
    let mut sessions: Vec<SessionRecord> = Vec::new();
    let mut section = Section::Preamble;

    for raw in text.lines() {
        let line = raw.trim_end_matches('\r');

        match line {
            CLIENT_LIST_HEADER => {
                section = Section::Clients;
                continue;
            }
            ROUTING_TABLE_MARKER => {
                section = Section::Preamble;
                continue;
            }
            ROUTING_HEADER => {
                section = Section::Routing;
                continue;
            }
            GLOBAL_STATS_MARKER => break,
            _ => {}
        }

        match section {
            Section::Preamble => {}
            Section::Clients => {
                let fields: Vec<&str> = line.split(',').collect();
                if fields.len() < 5 {
                    debug!(line, "Skipping short client row");
                    continue;
                }
                sessions.push(SessionRecord {
                    common_name: fields[0].to_string(),
                    real_address: fields[1].to_string(),
                    bytes_received: fields[2].trim().parse().unwrap_or(0),
                    bytes_sent: fields[3].trim().parse().unwrap_or(0),
                    connected_since: fields[4].to_string(),
                    virtual_address: None,
                    last_ref: None,
                });
            }
            Section::Routing => {
                let fields: Vec<&str> = line.split(',').collect();
                if fields.len() < 4 {
                    debug!(line, "Skipping short routing row");
                    continue;
                }
                if let Some(session) = sessions.iter_mut().find(|s| s.common_name == fields[1]) {
                    session.virtual_address = Some(fields[0].to_string());
                    session.last_ref = Some(fields[3].to_string());
                }
            }
        }
    }

    sessions
}

#[derive(Debug, Clone, Copy)]
enum Reply {
    /// A single line (`kill`).
    Line,
    /// Multi-line report terminated by `END`.
    Report,
}

/// Client for the management interface.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    address: String,
    timeout: Duration,
    max_response_bytes: usize,
}

impl SessionTracker {
    pub fn new(address: impl Into<String>, timeout: Duration, max_response_bytes: usize) -> Self {
        Self {
            address: address.into(),
            timeout,
            max_response_bytes,
        }
    }

    pub fn from_config(config: &ManagementConfig) -> Self {
        Self::new(
            config.address.clone(),
            config.timeout_duration(),
            config.max_response_bytes,
        )
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current sessions.
    pub async fn fetch(&self) -> Result<Vec<SessionRecord>> {
        let reply = self.exchange("status", "status", Reply::Report).await?;
        let sessions = parse_status(&reply);
        debug!(sessions = sessions.len(), "Fetched session report");
        Ok(sessions)
    }

    /// Ask the daemon to drop every session of `identity`. Returns the reply line.
    pub async fn kill(&self, identity: &str) -> Result<String> {
        validate_identity(identity)?;
        let reply = self
            .exchange("kill", &format!("kill {}", identity), Reply::Line)
            .await?;
        let reply = reply.trim().to_string();
        if reply.starts_with("ERROR") {
            warn!(identity, reply = %reply, "Daemon refused kill");
        } else {
            info!(identity, reply = %reply, "Session kill requested");
        }
        Ok(reply)
    }

    async fn exchange(&self, operation: &str, command: &str, reply: Reply) -> Result<String> {
        match tokio::time::timeout(self.timeout, self.exchange_inner(operation, command, reply)).await {
            Ok(result) => result,
            Err(_) => Err(ControlPlaneError::Timeout {
                operation: format!("management {}", operation),
                elapsed: self.timeout,
            }),
        }
    }

    async fn exchange_inner(&self, operation: &str, command: &str, reply: Reply) -> Result<String> {
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            ControlPlaneError::management(operation, format!("connect {}: {}", self.address, e))
        })?;
        let (read_half, mut write_half) = stream.into_split();

        // One extra byte so an oversized reply is detectable.
        let limit = self.max_response_bytes as u64 + 1;
        let mut reader = BufReader::new(read_half).take(limit);

        let mut banner = String::new();
        reader
            .read_line(&mut banner)
            .await
            .map_err(|e| ControlPlaneError::management(operation, format!("read banner: {}", e)))?;

        write_half
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .map_err(|e| ControlPlaneError::management(operation, format!("send: {}", e)))?;

        let mut body = String::new();
        loop {
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|e| ControlPlaneError::management(operation, format!("read: {}", e)))?;
            if n == 0 {
                break;
            }
            if banner.len() + body.len() + n > self.max_response_bytes {
                return Err(ControlPlaneError::management(
                    operation,
                    format!("reply exceeds {} bytes", self.max_response_bytes),
                ));
            }

            let done = match reply {
                Reply::Line => true,
                Reply::Report => line.trim_end() == END_MARKER,
            };
            body.push_str(&line);
            if done {
                break;
            }
        }

        let _ = write_half.shutdown().await;
        Ok(body)
    }
}
