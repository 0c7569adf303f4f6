//! Window-by-window reassembly of a data stream into its destination buffer.
//!
//! Writes are keyed by sequence number, so duplicated and reordered packets
//! never corrupt the buffer. A per-sequence bitmap and per-window counters
//! track completeness; the reassembler walks forward one window at a time
//! and emits a cumulative ACK for each window as it fills. The final window
//! may be short.

use bytes::{Bytes, BytesMut};

use speedup_core::wire::{AckPacket, DataPacket, WireError, WORD_SIZE};
use speedup_core::{ProtocolError, SessionDescriptor};

/// What happened to an accepted data packet.
///
/// `Duplicate` and `Stale` are the non-fatal
/// [`ProtocolError::DuplicateOrStaleSequence`] condition, absorbed by the
/// reassembler instead of being returned as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// First copy of this sequence; payload written.
    Stored,
    /// Sequence already held in an open window.
    Duplicate,
    /// Sequence below the window start; the ACK for its window was repeated.
    Stale,
}

impl Receipt {
    /// The absorbed condition behind a packet that was not stored.
    pub fn absorbed(self, seq: u32) -> Option<ProtocolError> {
        match self {
            Receipt::Stored => None,
            Receipt::Duplicate | Receipt::Stale => Some(ProtocolError::DuplicateOrStaleSequence(seq)),
        }
    }
}

pub struct Reassembler {
    descriptor: SessionDescriptor,
    buffer: BytesMut,
    received: Vec<u64>,
    window_counts: Vec<u32>,
    /// Oldest window not yet acknowledged (the final window once complete).
    window_index: u32,
    /// Sequence of the end-of-stream packet, once seen.
    last_seq: Option<u32>,
    /// Most recently processed sequence, for the keep-alive gap check.
    latest_seq: u32,
    /// Keep-alive threshold divisor; 0 disables keep-alives.
    keepalive_divisor: u32,
    complete: bool,
}

impl Reassembler {
    pub fn new(descriptor: SessionDescriptor, keepalive_divisor: u32) -> Self {
        let sequences = descriptor.max_seq() as usize + 1;
        Self {
            buffer: BytesMut::zeroed(descriptor.total_length_bytes() as usize),
            received: vec![0u64; sequences.div_ceil(64)],
            window_counts: vec![0u32; descriptor.window_count() as usize],
            window_index: 0,
            last_seq: None,
            latest_seq: 0,
            keepalive_divisor,
            complete: false,
            descriptor,
        }
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// First sequence of the oldest open window.
    pub fn window_start(&self) -> u32 {
        self.window_index * self.descriptor.window_size()
    }

    pub fn window_index(&self) -> u32 {
        self.window_index
    }

    pub fn last_seq(&self) -> Option<u32> {
        self.last_seq
    }

    /// Most recent window acknowledged cumulatively.
    pub fn last_completed_window(&self) -> Option<u32> {
        if self.complete {
            Some(self.window_index)
        } else {
            self.window_index.checked_sub(1)
        }
    }

    pub fn has(&self, seq: u32) -> bool {
        let i = seq as usize;
        self.received
            .get(i / 64)
            .is_some_and(|bits| bits & (1u64 << (i % 64)) != 0)
    }

    fn mark(&mut self, seq: u32) {
        let i = seq as usize;
        self.received[i / 64] |= 1u64 << (i % 64);
    }

    /// Take one data packet. ACKs to send are appended to `acks`.
    ///
    /// `MalformedPacket` is non-fatal (drop the datagram); every other error
    /// ends the session.
    pub fn accept(&mut self, packet: &DataPacket, acks: &mut Vec<AckPacket>) -> Result<Receipt, ProtocolError> {
        let seq = packet.seq_num;
        let max_seq = self.descriptor.max_seq();
        if seq > max_seq || (packet.is_last && seq != max_seq) {
            return Err(ProtocolError::SequenceOutOfRange { seq, max_seq });
        }

        let expected = self.descriptor.payload_len(seq);
        if packet.payload.len() > expected.div_ceil(WORD_SIZE) * WORD_SIZE {
            return Err(ProtocolError::MalformedPacket(WireError::PayloadTooLarge(
                packet.payload_words(),
            )));
        }

        let window = self.descriptor.window_of(seq);
        if window < self.window_index {
            tracing::trace!(seq, window, window_start = self.window_start(), "stale sequence, repeating ack");
            acks.push(AckPacket::cumulative(window));
            return Ok(Receipt::Stale);
        }
        if packet.is_last {
            self.last_seq = Some(seq);
        }
        if self.has(seq) {
            tracing::trace!(seq, "duplicate sequence");
            return Ok(Receipt::Duplicate);
        }

        let offset = self.descriptor.offset_of(seq);
        let len = packet.payload.len().min(expected);
        self.buffer[offset..offset + len].copy_from_slice(&packet.payload[..len]);
        self.mark(seq);
        self.window_counts[window as usize] += 1;

        let gap = seq.saturating_sub(self.latest_seq);
        self.latest_seq = seq;

        let before = acks.len();
        self.advance(acks);

        if acks.len() == before && self.keepalive_due(seq, gap) {
            tracing::trace!(seq, gap, "keep-alive ack");
            acks.push(AckPacket::keep_alive(seq));
        }
        Ok(Receipt::Stored)
    }

    /// Slide over every window that is now full.
    fn advance(&mut self, acks: &mut Vec<AckPacket>) {
        let final_window = self.descriptor.window_count() - 1;
        while !self.complete {
            let w = self.window_index;
            let needed = self.descriptor.window_range(w).count() as u32;
            if self.window_counts[w as usize] < needed {
                break;
            }
            acks.push(AckPacket::cumulative(w));
            if w == final_window {
                self.complete = true;
                tracing::debug!(window = w, last_seq = ?self.last_seq, "final window complete");
            } else {
                self.window_index += 1;
                tracing::trace!(window = w, window_start = self.window_start(), "window complete");
            }
        }
    }

    fn keepalive_due(&self, seq: u32, gap: u32) -> bool {
        if self.keepalive_divisor == 0 || self.complete {
            return false;
        }
        let threshold = self.descriptor.window_size() / self.keepalive_divisor;
        gap > 2 && seq.saturating_sub(self.window_start()) > threshold
    }

    /// The reassembled buffer. Only meaningful once complete.
    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }
}
