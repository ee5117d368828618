//! Fuzz target for `xtrabackup_checkpoints` parsing.
//!
//! Arbitrary file contents must parse or fail cleanly, and anything that
//! passes the full-backup check must have a usable LSN range.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mysql_sidecar::datadir::Checkpoints;

fuzz_target!(|text: &str| {
    if let Ok(checkpoints) = Checkpoints::parse(text) {
        if checkpoints.check_full(false).is_ok() {
            assert_eq!(checkpoints.from_lsn, 0);
            assert!(checkpoints.to_lsn > 0);
        }
    }
});
