//! Session descriptor: the immutable shape of one transfer.
//!
//! Created when a start command is issued (host) or received (device) and
//! shared by reference with the sender and receiver for the life of the
//! session.

use crate::wire::{StartCommand, BYTES_PER_PACKET, ERROR_SENTINEL, WORD_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionDescriptor {
    total_length_bytes: u32,
    max_seq: u32,
    window_size: u32,
    sliding_window: u32,
    source_address: u32,
    tag: u32,
}

/// Highest sequence number needed to carry `total_length_bytes`.
///
/// Callers must pass a non-zero length.
pub fn max_seq_for(total_length_bytes: u32) -> u32 {
    let packets = (total_length_bytes as u64).div_ceil(BYTES_PER_PACKET as u64);
    packets.saturating_sub(1) as u32
}

impl SessionDescriptor {
    pub fn new(
        total_length_bytes: u32,
        window_size: u32,
        sliding_window: u32,
        source_address: u32,
        tag: u32,
    ) -> Result<Self, DescriptorError> {
        if total_length_bytes == 0 {
            return Err(DescriptorError::EmptyTransfer);
        }
        if window_size == 0 {
            return Err(DescriptorError::ZeroWindow);
        }
        if window_size > sliding_window {
            return Err(DescriptorError::WindowLargerThanSliding {
                window_size,
                sliding_window,
            });
        }
        if sliding_window % window_size != 0 {
            return Err(DescriptorError::SlidingNotMultiple {
                window_size,
                sliding_window,
            });
        }
        let max_seq = max_seq_for(total_length_bytes);
        if max_seq >= ERROR_SENTINEL {
            return Err(DescriptorError::TooManySequences(max_seq));
        }
        Ok(Self {
            total_length_bytes,
            max_seq,
            window_size,
            sliding_window,
            source_address,
            tag,
        })
    }

    /// Rebuild the descriptor a host advertised in its start command.
    pub fn from_start(cmd: &StartCommand) -> Result<Self, DescriptorError> {
        Self::new(
            cmd.total_length_bytes,
            cmd.window_size,
            cmd.sliding_window,
            cmd.source_address,
            cmd.tag,
        )
    }

    pub fn start_command(&self) -> StartCommand {
        StartCommand {
            source_address: self.source_address,
            total_length_bytes: self.total_length_bytes,
            window_size: self.window_size,
            sliding_window: self.sliding_window,
            tag: self.tag,
        }
    }

    pub fn total_length_bytes(&self) -> u32 {
        self.total_length_bytes
    }

    pub fn max_seq(&self) -> u32 {
        self.max_seq
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn sliding_window(&self) -> u32 {
        self.sliding_window
    }

    pub fn source_address(&self) -> u32 {
        self.source_address
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Window that `seq` belongs to.
    pub fn window_of(&self, seq: u32) -> u32 {
        seq / self.window_size
    }

    /// Number of windows in the whole transfer; the last may be short.
    pub fn window_count(&self) -> u32 {
        self.window_of(self.max_seq) + 1
    }

    /// Byte offset of `seq`'s payload in the destination buffer.
    pub fn offset_of(&self, seq: u32) -> usize {
        seq as usize * BYTES_PER_PACKET
    }

    /// Data bytes carried by `seq`. Only the final packet may be short.
    pub fn payload_len(&self, seq: u32) -> usize {
        if seq > self.max_seq {
            return 0;
        }
        let remaining = self.total_length_bytes as usize - self.offset_of(seq);
        remaining.min(BYTES_PER_PACKET)
    }

    /// Payload words on the wire for `seq` (the final word may be padded).
    pub fn payload_words(&self, seq: u32) -> usize {
        self.payload_len(seq).div_ceil(WORD_SIZE)
    }

    /// Sequence numbers making up window `index`, clipped to `max_seq`.
    pub fn window_range(&self, index: u32) -> std::ops::RangeInclusive<u32> {
        let start = index.saturating_mul(self.window_size);
        let end = start
            .saturating_add(self.window_size - 1)
            .min(self.max_seq);
        start..=end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("total length must be greater than zero")]
    EmptyTransfer,

    #[error("window size must be greater than zero")]
    ZeroWindow,

    #[error("window size {window_size} exceeds sliding window {sliding_window}")]
    WindowLargerThanSliding { window_size: u32, sliding_window: u32 },

    #[error("sliding window {sliding_window} is not a multiple of window size {window_size}")]
    SlidingNotMultiple { window_size: u32, sliding_window: u32 },

    #[error("transfer needs sequence numbers up to {0}, beyond the 31-bit space")]
    TooManySequences(u32),
}
