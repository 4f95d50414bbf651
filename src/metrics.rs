// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! The control plane never talks to a global registry directly. Components
//! receive a [`MetricsSink`] at construction and set gauges through it; the
//! embedding process decides where those values go.
//!
//! - [`RecorderSink`] forwards to the [`metrics`] crate facade, so any
//!   installed recorder (e.g. a Prometheus exporter) picks the values up.
//! - [`NoOpSink`] drops everything (tests, tooling).
//!
//! # Metric Naming Convention
//!
//! Names keep the `ovpn_` prefix that existing dashboards already query.
//! All metrics are gauges:
//! - `*_expire` values are whole days until expiry (negative once expired)
//! - `*_connection_*` values are epoch seconds of the observation they describe
//!
//! # Usage
//!
//! ```rust
//! use vpn_control_plane::metrics::{self, MetricsSink, NoOpSink};
//!
//! let sink = NoOpSink;
//! sink.set_gauge(metrics::CLIENTS_TOTAL, 12.0);
//! sink.set_labeled_gauge(metrics::CLIENT_CERT_EXPIRE, &[("client", "alice".to_string())], 30.0);
//! ```

use metrics::{gauge, Label};

/// Server certificate expiry in days.
pub const SERVER_CERT_EXPIRE: &str = "ovpn_server_cert_expire";
/// CA certificate expiry in days.
pub const SERVER_CA_CERT_EXPIRE: &str = "ovpn_server_ca_cert_expire";
/// Non-server certificates in the registry.
pub const CLIENTS_TOTAL: &str = "ovpn_clients_total";
pub const CLIENTS_VALID: &str = "ovpn_clients_valid";
pub const CLIENTS_REVOKED: &str = "ovpn_clients_revoked";
pub const CLIENTS_EXPIRED: &str = "ovpn_clients_expired";
pub const CLIENTS_CONNECTED: &str = "ovpn_clients_connected";
/// Per-client certificate expiry in days. Label: `client`.
pub const CLIENT_CERT_EXPIRE: &str = "ovpn_client_cert_expire";
/// Assigned VPN address; value is the last-ref epoch. Labels: `client`, `ip`.
pub const CLIENT_CONNECTION_INFO: &str = "ovpn_client_connection_info";
/// Real (remote) address; value is the connected-since epoch. Labels: `client`, `ip`.
pub const CLIENT_CONNECTION_FROM: &str = "ovpn_client_connection_from";
pub const CLIENT_BYTES_RECEIVED: &str = "ovpn_client_bytes_received";
pub const CLIENT_BYTES_SENT: &str = "ovpn_client_bytes_sent";
/// Epoch of the last sync attempt (slave only).
pub const SYNC_LAST_ATTEMPT: &str = "ovpn_sync_last_attempt_timestamp";
/// Epoch of the last fully successful sync (slave only).
pub const SYNC_LAST_SUCCESS: &str = "ovpn_sync_last_success_timestamp";

/// Narrow gauge-setting capability injected into the reconciler and the
/// replication client.
pub trait MetricsSink: Send + Sync + 'static {
    /// Set an unlabeled gauge.
    fn set_gauge(&self, name: &'static str, value: f64);

    /// Set one series of a labeled gauge.
    fn set_labeled_gauge(&self, name: &'static str, labels: &[(&'static str, String)], value: f64);
}

/// Sink that discards every value.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSink;

impl MetricsSink for NoOpSink {
    fn set_gauge(&self, _name: &'static str, _value: f64) {}

    fn set_labeled_gauge(&self, _name: &'static str, _labels: &[(&'static str, String)], _value: f64) {}
}

/// Sink backed by the `metrics` facade.
///
/// Values land in whichever recorder the process installed; without one they
/// are dropped by the facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderSink;

impl MetricsSink for RecorderSink {
    fn set_gauge(&self, name: &'static str, value: f64) {
        gauge!(name).set(value);
    }

    fn set_labeled_gauge(&self, name: &'static str, labels: &[(&'static str, String)], value: f64) {
        let labels: Vec<Label> = labels
            .iter()
            .map(|(key, value)| Label::new(*key, value.clone()))
            .collect();
        gauge!(name, labels).set(value);
    }
}

/// Whole days from `now` until `expires_at` (both epoch seconds).
///
/// Truncates toward zero, so a certificate expiring in 36 hours reports 1.
pub fn days_until(expires_at: i64, now: i64) -> f64 {
    ((expires_at - now) / 86_400) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_days_until() {
        let now = 1_700_000_000;
        assert_eq!(days_until(now + 86_400 * 30, now), 30.0);
        assert_eq!(days_until(now + 86_400 + 3_600 * 12, now), 1.0);
        assert_eq!(days_until(now - 86_400 * 2, now), -2.0);
        assert_eq!(days_until(now, now), 0.0);
    }

    #[test]
    fn test_noop_sink_accepts_everything() {
        let sink = NoOpSink;
        sink.set_gauge(CLIENTS_TOTAL, 1.0);
        sink.set_labeled_gauge(CLIENT_BYTES_SENT, &[("client", "alice".to_string())], 10.0);
    }

    #[test]
    fn test_recorder_sink_without_recorder_is_silent() {
        // No recorder installed: the facade swallows the values.
        let sink = RecorderSink;
        sink.set_gauge(SERVER_CERT_EXPIRE, 100.0);
        sink.set_labeled_gauge(
            CLIENT_CONNECTION_INFO,
            &[("client", "alice".to_string()), ("ip", "172.16.100.10".to_string())],
            1_700_000_000.0,
        );
    }

    #[test]
    fn test_sink_is_object_safe() {
        let sinks: Vec<Box<dyn MetricsSink>> = vec![Box::new(NoOpSink), Box::new(RecorderSink)];
        for sink in &sinks {
            sink.set_gauge(CLIENTS_CONNECTED, 0.0);
        }
    }
}
