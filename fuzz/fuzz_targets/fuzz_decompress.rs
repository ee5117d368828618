//! Fuzz target for snapshot decoding.
//!
//! `maybe_decompress` and a `Detect` pump over the same bytes must never
//! panic, and must agree whenever both succeed.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mysql_sidecar::stream::{maybe_decompress, Codec, Pump};
use tokio_util::sync::CancellationToken;

fuzz_target!(|data: &[u8]| {
    let whole = maybe_decompress(data);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let streamed = runtime.block_on(async {
        let mut reader = data;
        let mut out = Vec::new();
        Pump::new(512)
            .codec(Codec::Detect)
            .run(&mut reader, &mut out, &CancellationToken::new())
            .await
            .map(|_| out)
    });

    if let (Ok(a), Ok(b)) = (whole, streamed) {
        assert_eq!(a, b);
    }
});
