//! Speedup integration test harness.
//!
//! `sim` wires a device sender straight to a host receiver through a
//! scripted lossy link, one deterministic round at a time. `loopback` runs
//! the real reactor and transfer client over 127.0.0.1 UDP, optionally
//! through a proxy that drops datagrams.
//!
//!   cargo test --test integration

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

mod loopback;
mod sim;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Reproducible pseudo-random payload.
pub fn source_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill(&mut data[..]);
    data
}

/// Little-endian payload words, the final one zero-padded.
pub fn words_of(data: &[u8]) -> Vec<u32> {
    data.chunks(4)
        .map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(word)
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[test]
fn test_words_of_pads_final_word() {
    assert_eq!(words_of(&[1, 2, 3, 4, 5]), vec![0x0403_0201, 0x0000_0005]);
    assert!(words_of(&[]).is_empty());
}

#[test]
fn test_source_bytes_is_reproducible() {
    assert_eq!(source_bytes(64, 9), source_bytes(64, 9));
    assert_ne!(source_bytes(64, 9), source_bytes(64, 10));
}
