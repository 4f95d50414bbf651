//! Fuzz target for the certificate registry parser.
//!
//! Parsing never panics, and rendering what was parsed reparses to the
//! same records.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vpn_control_plane::registry::{parse, render};

fuzz_target!(|text: &str| {
    let records = parse(text);
    let again = parse(&render(&records));
    assert_eq!(records, again);
});
