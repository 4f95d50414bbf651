// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation: registry + live sessions → published snapshot.
//!
//! Each cycle:
//!
//! 1. Load the registry under the registry lock. On failure the previous
//!    snapshot stays published.
//! 2. Fetch live sessions. On failure the cycle continues with none.
//! 3. Build a [`ClientView`] per non-server record and the aggregate counts.
//! 4. Publish the new snapshot in one step.
//! 5. Push gauges to the metrics sink.
//!
//! # Metrics
//!
//! | Gauge | Labels | Value |
//! |-------|--------|-------|
//! | `ovpn_server_cert_expire` | | days until the server certificate expires |
//! | `ovpn_server_ca_cert_expire` | | days until the CA expires (when probed) |
//! | `ovpn_clients_{total,valid,revoked,expired,connected}` | | counts |
//! | `ovpn_client_cert_expire` | client | days until expiry |
//! | `ovpn_client_connection_from` | client, ip (real) | connected-since epoch |
//! | `ovpn_client_connection_info` | client, ip (virtual) | last-ref epoch |
//! | `ovpn_client_bytes_{received,sent}` | client | byte counters |

use super::types::{ClientCounts, ClientView, Snapshot};
use crate::error::Result;
use crate::metrics::{self, days_until, MetricsSink};
use crate::pki::Pki;
use crate::registry::{display_timestamp, CertState, CertificateRecord, Registry};
use crate::session::{SessionRecord, SessionTracker};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn, Instrument};

const CONNECTED: &str = "Connected";

/// Builds and publishes snapshots.
pub struct StateReconciler {
    registry: Registry,
    sessions: SessionTracker,
    /// Present when the CA expiry should be probed each cycle.
    ca_probe: Option<Pki>,
    registry_lock: Arc<Mutex<()>>,
    /// Held for a whole refresh so publications happen in load order.
    refresh_lock: Mutex<()>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    metrics: Arc<dyn MetricsSink>,
}

impl StateReconciler {
    pub fn new(
        registry: Registry,
        sessions: SessionTracker,
        ca_probe: Option<Pki>,
        registry_lock: Arc<Mutex<()>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            registry,
            sessions,
            ca_probe,
            registry_lock,
            refresh_lock: Mutex::new(()),
            snapshot_tx,
            metrics,
        }
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Watch snapshot publications.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Run one reconciliation cycle and return the published snapshot.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<Arc<Snapshot>> {
        let _refresh = self.refresh_lock.lock().await;

        let records = {
            let _guard = self.registry_lock.lock().await;
            self.registry.load().await
        };
        let records = match records {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Registry load failed, keeping previous snapshot");
                return Err(e);
            }
        };

        let sessions = match self.sessions.fetch().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Management interface unavailable, assuming no sessions");
                Vec::new()
            }
        };

        let now = Utc::now();
        let snapshot = Arc::new(build_snapshot(&records, sessions, now));

        if !snapshot.counts.is_consistent() {
            warn!(
                total = snapshot.counts.total,
                other = snapshot.counts.other,
                "Certificates in unknown state"
            );
        }

        self.snapshot_tx.send_replace(Arc::clone(&snapshot));
        self.emit_metrics(&records, &snapshot, now).await;

        debug!(
            clients = snapshot.counts.total,
            connected = snapshot.counts.connected,
            "Snapshot published"
        );
        Ok(snapshot)
    }

    async fn emit_metrics(&self, records: &[CertificateRecord], snapshot: &Snapshot, now: DateTime<Utc>) {
        let sink = self.metrics.as_ref();
        let now_epoch = now.timestamp();

        for record in records {
            let Some(expires) = record.expires_at() else {
                continue;
            };
            let days = days_until(expires.timestamp(), now_epoch);
            if record.is_server() {
                sink.set_gauge(metrics::SERVER_CERT_EXPIRE, days);
            } else {
                sink.set_labeled_gauge(
                    metrics::CLIENT_CERT_EXPIRE,
                    &[("client", record.identity.clone())],
                    days,
                );
            }
        }

        let counts = &snapshot.counts;
        sink.set_gauge(metrics::CLIENTS_TOTAL, counts.total as f64);
        sink.set_gauge(metrics::CLIENTS_VALID, counts.valid as f64);
        sink.set_gauge(metrics::CLIENTS_REVOKED, counts.revoked as f64);
        sink.set_gauge(metrics::CLIENTS_EXPIRED, counts.expired as f64);
        sink.set_gauge(metrics::CLIENTS_CONNECTED, counts.connected as f64);

        for session in &snapshot.sessions {
            let client = session.common_name.clone();
            if let Some(since) = session.connected_since_epoch() {
                sink.set_labeled_gauge(
                    metrics::CLIENT_CONNECTION_FROM,
                    &[("client", client.clone()), ("ip", session.real_address.clone())],
                    since as f64,
                );
            }
            if let (Some(virtual_address), Some(last_ref)) =
                (&session.virtual_address, session.last_ref_epoch())
            {
                sink.set_labeled_gauge(
                    metrics::CLIENT_CONNECTION_INFO,
                    &[("client", client.clone()), ("ip", virtual_address.clone())],
                    last_ref as f64,
                );
            }
            sink.set_labeled_gauge(
                metrics::CLIENT_BYTES_RECEIVED,
                &[("client", client.clone())],
                session.bytes_received as f64,
            );
            sink.set_labeled_gauge(
                metrics::CLIENT_BYTES_SENT,
                &[("client", client)],
                session.bytes_sent as f64,
            );
        }

        if let Some(pki) = &self.ca_probe {
            match pki.ca_expiry().await {
                Ok(expires) => sink.set_gauge(
                    metrics::SERVER_CA_CERT_EXPIRE,
                    days_until(expires.timestamp(), now_epoch),
                ),
                Err(e) => debug!(error = %e, "CA expiry probe failed"),
            }
        }
    }
}

/// Merge registry records and sessions into a snapshot. Pure.
pub fn build_snapshot(
    records: &[CertificateRecord],
    sessions: Vec<SessionRecord>,
    now: DateTime<Utc>,
) -> Snapshot {
    let connected: HashSet<&str> = sessions.iter().map(|s| s.common_name.as_str()).collect();
    let mut counts = ClientCounts::default();
    let mut clients = Vec::new();

    for record in records.iter().filter(|r| !r.is_server()) {
        let state = record.effective_state(now);
        counts.total += 1;
        match state {
            CertState::Valid => counts.valid += 1,
            CertState::Revoked => counts.revoked += 1,
            CertState::Expired => counts.expired += 1,
            CertState::Other => counts.other += 1,
        }

        let is_connected = connected.contains(record.identity.as_str());
        if is_connected {
            counts.connected += 1;
        }

        clients.push(ClientView {
            identity: record.identity.clone(),
            account_status: state.account_status().to_string(),
            expiration_date: display_timestamp(&record.expiration_date),
            revocation_date: match (&state, &record.revocation_date) {
                (CertState::Revoked, Some(date)) => display_timestamp(date),
                _ => String::new(),
            },
            connection_status: if is_connected {
                CONNECTED.to_string()
            } else {
                String::new()
            },
        });
    }

    Snapshot {
        clients,
        sessions,
        counts,
        refreshed_at: Some(now),
    }
}

/// Refresh every `interval` until shutdown.
///
/// The first tick fires one interval after start; callers run the initial
/// refresh themselves.
pub async fn run_reconcile_loop(
    reconciler: Arc<StateReconciler>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("reconcile");

    async move {
        // Mark initial shutdown value as seen so changed() only fires on actual changes
        let _ = shutdown_rx.borrow_and_update();

        info!(interval_ms = interval.as_millis() as u64, "Starting reconcile task");

        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        // Skip missed ticks instead of bursting to catch up
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping reconcile task");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            // Errors are logged inside refresh; the previous snapshot stays.
            let _ = reconciler.refresh().await;
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoOpSink;
    use crate::registry::parse;
    use chrono::TimeZone;

    const INDEX: &str = "V\t300101000000Z\t\tA1\tunknown\t/CN=alice\n\
                         R\t300101000000Z\t240601120000Z\tB2\tunknown\t/CN=bob\n\
                         V\t200101000000Z\t\tC3\tunknown\t/CN=carol\n\
                         V\t340101000000Z\t\t01\tunknown\t/CN=server\n";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn session(name: &str) -> SessionRecord {
        SessionRecord {
            common_name: name.to_string(),
            real_address: "10.0.0.5".to_string(),
            connected_since: "Mon Jan 2 15:04:05 2024".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_snapshot_views_and_counts() {
        let records = parse(INDEX);
        let snapshot = build_snapshot(&records, vec![session("alice")], now());

        assert_eq!(snapshot.clients.len(), 3);
        let alice = snapshot.client("alice").unwrap();
        assert_eq!(alice.account_status, "Active");
        assert_eq!(alice.connection_status, "Connected");
        assert_eq!(alice.expiration_date, "2030-01-01 00:00:00");
        assert_eq!(alice.revocation_date, "");

        let bob = snapshot.client("bob").unwrap();
        assert_eq!(bob.account_status, "Revoked");
        assert_eq!(bob.revocation_date, "2024-06-01 12:00:00");
        assert_eq!(bob.connection_status, "");

        let carol = snapshot.client("carol").unwrap();
        assert_eq!(carol.account_status, "Expired");

        assert!(snapshot.client("server").is_none());
        assert_eq!(
            snapshot.counts,
            ClientCounts {
                total: 3,
                valid: 1,
                revoked: 1,
                expired: 1,
                connected: 1,
                other: 0,
            }
        );
        assert!(snapshot.counts.is_consistent());
        assert_eq!(snapshot.refreshed_at, Some(now()));
    }

    #[test]
    fn test_sessions_for_unknown_identities_are_kept_but_not_counted() {
        let records = parse(INDEX);
        let snapshot = build_snapshot(&records, vec![session("mallory")], now());
        assert_eq!(snapshot.counts.connected, 0);
        assert!(snapshot.session("mallory").is_some());
    }

    #[test]
    fn test_other_state_breaks_consistency() {
        let mut records = parse(INDEX);
        records[0].state = CertState::Other;
        let snapshot = build_snapshot(&records, Vec::new(), now());
        assert_eq!(snapshot.counts.other, 1);
        assert!(!snapshot.counts.is_consistent());
    }

    #[tokio::test]
    async fn test_refresh_without_daemon_publishes_empty_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.txt");
        std::fs::write(&path, INDEX).unwrap();

        // Port 1 on localhost: connection refused
        let tracker = SessionTracker::new("127.0.0.1:1", Duration::from_millis(200), 1024);
        let reconciler = StateReconciler::new(
            Registry::new(&path),
            tracker,
            None,
            Arc::new(Mutex::new(())),
            Arc::new(NoOpSink),
        );

        let snapshot = reconciler.refresh().await.unwrap();
        assert_eq!(snapshot.counts.total, 3);
        assert!(snapshot.sessions.is_empty());
        assert!(Arc::ptr_eq(&snapshot, &reconciler.snapshot()));
    }
}
