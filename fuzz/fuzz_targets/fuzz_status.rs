//! Fuzz target for the management `status` report parser.
//!
//! This tests that `parse_status` and `parse_status_timestamp` never panic
//! on arbitrary input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vpn_control_plane::session::{parse_status, parse_status_timestamp};

fuzz_target!(|text: &str| {
    for session in parse_status(text) {
        let _ = parse_status_timestamp(&session.connected_since);
        if let Some(last_ref) = &session.last_ref {
            let _ = parse_status_timestamp(last_ref);
        }
    }
});
