//! Fuzz target for policy files.
//!
//! Parsing and validating arbitrary policy text never panics.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vpn_control_plane::ccd::{parse, render, validate, Subnet};

fuzz_target!(|data: (&str, &str)| {
    let (text, network) = data;
    let entry = parse("fuzz", text);

    let subnet = network
        .parse::<Subnet>()
        .unwrap_or_else(|_| "172.16.100.0/24".parse().unwrap());
    if validate(&entry, &[], &subnet).is_ok() {
        let _ = render(&entry, &subnet);
    }
});
