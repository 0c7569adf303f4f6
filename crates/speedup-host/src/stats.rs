//! Per-transfer diagnostics returned alongside the buffer.

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub bytes: u64,
    /// Data packets decoded, duplicates included.
    pub packets: u64,
    /// Sequences received again inside an open window.
    pub duplicates: u64,
    /// Sequences received again after their window was acknowledged.
    pub stale: u64,
    pub malformed: u64,
    pub cumulative_acks: u64,
    pub keepalive_acks: u64,
    pub timeouts: u32,
    pub start_reissues: u32,
    pub reset_attempts: u32,
    pub elapsed_ms: u64,
    /// BLAKE3 of the reassembled buffer, hex encoded.
    pub digest: String,
}

impl TransferStats {
    /// Sequences seen more than once.
    pub fn retransmitted(&self) -> u64 {
        self.duplicates + self.stale
    }

    /// Record the final buffer and wall time.
    pub fn seal(&mut self, data: &[u8], elapsed: Duration) {
        self.bytes = data.len() as u64;
        self.elapsed_ms = elapsed.as_millis() as u64;
        self.digest = hex::encode(blake3::hash(data).as_bytes());
    }

    pub fn throughput_mbps(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0) / (self.elapsed_ms as f64 * 1000.0)
    }
}
