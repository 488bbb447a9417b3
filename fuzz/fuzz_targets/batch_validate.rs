//! Fuzz target for outgoing batch validation
//!
//! Builds batches from arbitrary payload lengths and checks that accepted
//! batches satisfy the uniform-length rule.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use sockio::OutgoingBatch;
use sockio::send::BatchLimits;

#[derive(Debug, Arbitrary)]
struct Input {
    lengths: Vec<u16>,
    max_segments: u8,
}

fuzz_target!(|input: Input| {
    let payloads: Vec<Vec<u8>> = input
        .lengths
        .iter()
        .take(128)
        .map(|&len| vec![0u8; usize::from(len)])
        .collect();
    let limits = BatchLimits {
        max_segments: usize::from(input.max_segments),
        ..BatchLimits::default()
    };
    let dst = "127.0.0.1:4433".parse().unwrap();

    if let Ok(batch) = OutgoingBatch::new(dst, &payloads, &limits) {
        let segment = batch.segment_size();
        let (last, rest) = payloads.split_last().unwrap();
        assert!(rest.iter().all(|p| p.len() == segment));
        assert!(!last.is_empty() && last.len() <= segment);
        assert!(batch.total_bytes() <= limits.max_bytes);
    }
});
