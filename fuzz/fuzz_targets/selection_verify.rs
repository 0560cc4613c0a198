//! Fuzz harness for selection re-verification.
//!
//! Builds a pool snapshot and claim from arbitrary bytes and checks that
//! `verify_claim` never panics, that it accepts exactly the witness
//! `expected_witness` returns, and that record deserialization followed by
//! `verify` never panics on arbitrary JSON.

#![no_main]
use attest_core::selection::{SEED_LEN, SelectionRecord, expected_witness, verify_claim};
use attest_core::types::WitnessId;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = serde_json::from_slice::<SelectionRecord>(data) {
        let _ = record.verify();
    }

    if data.len() < SEED_LEN + 1 {
        return;
    }
    let mut seed = [0u8; SEED_LEN];
    seed.copy_from_slice(&data[..SEED_LEN]);
    let rest = &data[SEED_LEN..];

    // One witness per byte; the order is whatever the input gives, so some
    // snapshots are unsorted or contain duplicates on purpose.
    let pool: Vec<WitnessId> = rest
        .iter()
        .skip(1)
        .filter_map(|b| WitnessId::new(format!("w{b:03}")).ok())
        .collect();
    let Ok(claimed) = WitnessId::new(format!("w{:03}", rest[0])) else {
        return;
    };

    let verdict = verify_claim(&seed, &pool, &claimed);
    match expected_witness(&seed, &pool) {
        Ok(expected) => assert_eq!(verdict.is_ok(), *expected == claimed),
        Err(_) => assert!(verdict.is_err()),
    }
});
