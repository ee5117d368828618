//! Fuzz target for hostname ordinal parsing.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mysql_sidecar::topology::parse_ordinal;

fuzz_target!(|hostname: &str| {
    if let Some(ordinal) = parse_ordinal(hostname) {
        // The ordinal must print back to the hostname's suffix.
        let label = hostname.split('.').next().unwrap_or_default();
        assert!(label.ends_with(&format!("-{ordinal}")));
    }
});
