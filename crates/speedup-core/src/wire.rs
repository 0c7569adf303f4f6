//! Speedup wire format: every datagram exchanged between the host and a
//! device gatherer.
//!
//! The channel underneath is raw datagrams: no connection, no ordering, no
//! delivery guarantee, and an MTU of a few hundred bytes. Every packet is a
//! whole number of little-endian 32-bit words.
//!
//! Fixed-size frames are `#[repr(C)]` structs of unaligned little-endian words
//! with zerocopy derives, so encoding and decoding never allocate beyond the
//! datagram itself. Data packets carry a variable number of payload words and
//! are framed by hand on top of the same word type.
//!
//! Decoding is direction-typed: [`Upstream`] is what a device may send to the
//! host, [`Downstream`] is what the host may send to a device. The same word
//! value means different things in each direction (`0` is an ACK code going
//! down and a reset confirmation going up).

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// One on-wire word.
pub type Word = U32<LittleEndian>;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Bytes per word.
pub const WORD_SIZE: usize = 4;

/// Length of the data packet header (the sequence word).
pub const HEADER_LEN: usize = WORD_SIZE;

/// Maximum payload words per data packet (68 words per datagram, one of which
/// is the sequence header).
pub const MAX_PAYLOAD_WORDS: usize = 67;

/// Payload bytes carried by every data packet except possibly the last.
pub const BYTES_PER_PACKET: usize = MAX_PAYLOAD_WORDS * WORD_SIZE;

/// Largest datagram either endpoint ever sends.
pub const MAX_DATAGRAM: usize = HEADER_LEN + BYTES_PER_PACKET;

/// High bit of a data packet header: this is the final packet of the stream.
pub const END_OF_STREAM: u32 = 0x8000_0000;

/// Bits of the data packet header holding the sequence number.
pub const SEQ_MASK: u32 = 0x7FFF_FFFF;

/// Single-word value either side sends to abort a session.
pub const ERROR_SENTINEL: u32 = 0x7FFF_FFFF;

/// First word of an acknowledgement.
pub const ACK_CODE: u32 = 0;

/// Host → device: transfer complete, please reset.
pub const RESET_REQUEST: u32 = 1;

/// Device → host: reset done, session closed.
pub const RESET_CONFIRM: u32 = 0;

/// First word of the out-of-band start command.
pub const START_COMMAND: u32 = 100;

/// Bit 0 of an ACK's flags word: the ACK is cumulative for `window_index`.
pub const ACK_FLAG_CUMULATIVE: u32 = 0x1;

// ── Fixed frames ──────────────────────────────────────────────────────────────

/// Acknowledgement frame, host → device.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct AckFrame {
    /// Always [`ACK_CODE`].
    pub code: Word,
    /// Window being acknowledged (cumulative) or most recent sequence seen
    /// (keep-alive).
    pub window_index: Word,
    /// Bit 0: cumulative. Remaining bits reserved, must be zero.
    pub flags: Word,
}

assert_eq_size!(AckFrame, [u8; 12]);

/// Start command, host → device control port.
///
/// Wire size: 24 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct StartFrame {
    /// Always [`START_COMMAND`].
    pub command: Word,
    /// Device memory address the stream is read from.
    pub source_address: Word,
    pub total_length_bytes: Word,
    pub window_size: Word,
    pub sliding_window: Word,
    /// Routing tag of the host endpoint.
    pub tag: Word,
}

assert_eq_size!(StartFrame, [u8; 24]);

// ── Packets ───────────────────────────────────────────────────────────────────

/// A data packet: one sequence-numbered run of payload words.
///
/// `payload` is the raw little-endian word bytes; decoding slices it out of
/// the datagram without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub seq_num: u32,
    pub is_last: bool,
    pub payload: Bytes,
}

impl DataPacket {
    /// Build a data packet from payload words.
    pub fn from_words(seq_num: u32, is_last: bool, words: &[u32]) -> Result<Self, WireError> {
        if seq_num & !SEQ_MASK != 0 || seq_num == ERROR_SENTINEL {
            return Err(WireError::SequenceTooLarge(seq_num));
        }
        if words.len() > MAX_PAYLOAD_WORDS {
            return Err(WireError::PayloadTooLarge(words.len()));
        }
        if words.is_empty() && !is_last {
            return Err(WireError::EmptyPayload(seq_num));
        }
        let mut payload = BytesMut::with_capacity(words.len() * WORD_SIZE);
        for word in words {
            payload.put_u32_le(*word);
        }
        Ok(Self {
            seq_num,
            is_last,
            payload: payload.freeze(),
        })
    }

    /// The header word: `(is_last << 31) | seq_num`.
    pub fn header_word(&self) -> u32 {
        let flag = if self.is_last { END_OF_STREAM } else { 0 };
        flag | (self.seq_num & SEQ_MASK)
    }

    /// Payload as words.
    pub fn words(&self) -> impl Iterator<Item = u32> + '_ {
        self.payload
            .chunks_exact(WORD_SIZE)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
    }

    pub fn payload_words(&self) -> usize {
        self.payload.len() / WORD_SIZE
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        out.put_slice(Word::new(self.header_word()).as_bytes());
        out.put_slice(&self.payload);
        out.freeze()
    }
}

/// Acknowledgement, host → device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPacket {
    pub window_index: u32,
    /// `false` marks a keep-alive: it resets the sender's retransmission
    /// timer without moving the window.
    pub is_cumulative: bool,
}

impl AckPacket {
    pub fn cumulative(window_index: u32) -> Self {
        Self {
            window_index,
            is_cumulative: true,
        }
    }

    pub fn keep_alive(latest_seq: u32) -> Self {
        Self {
            window_index: latest_seq,
            is_cumulative: false,
        }
    }

    fn frame(&self) -> AckFrame {
        AckFrame {
            code: Word::new(ACK_CODE),
            window_index: Word::new(self.window_index),
            flags: Word::new(if self.is_cumulative { ACK_FLAG_CUMULATIVE } else { 0 }),
        }
    }
}

/// Out-of-band start command, host → device control port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartCommand {
    pub source_address: u32,
    pub total_length_bytes: u32,
    pub window_size: u32,
    pub sliding_window: u32,
    pub tag: u32,
}

impl StartCommand {
    pub fn encode(&self) -> Bytes {
        let frame = StartFrame {
            command: Word::new(START_COMMAND),
            source_address: Word::new(self.source_address),
            total_length_bytes: Word::new(self.total_length_bytes),
            window_size: Word::new(self.window_size),
            sliding_window: Word::new(self.sliding_window),
            tag: Word::new(self.tag),
        };
        Bytes::copy_from_slice(frame.as_bytes())
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let frame = StartFrame::read_from(datagram).ok_or(WireError::BadLength(datagram.len()))?;
        if frame.command.get() != START_COMMAND {
            return Err(WireError::UnknownCode(frame.command.get()));
        }
        Ok(Self {
            source_address: frame.source_address.get(),
            total_length_bytes: frame.total_length_bytes.get(),
            window_size: frame.window_size.get(),
            sliding_window: frame.sliding_window.get(),
            tag: frame.tag.get(),
        })
    }
}

/// Datagrams travelling device → host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    Data(DataPacket),
    ResetConfirm,
    /// Error sentinel: the device gave up on the session.
    Abort,
}

impl Upstream {
    pub fn encode(&self) -> Bytes {
        match self {
            Upstream::Data(packet) => packet.encode(),
            Upstream::ResetConfirm => single_word(RESET_CONFIRM),
            Upstream::Abort => single_word(ERROR_SENTINEL),
        }
    }

    pub fn decode(datagram: &Bytes) -> Result<Self, WireError> {
        let len = datagram.len();
        if len < HEADER_LEN || len > MAX_DATAGRAM || len % WORD_SIZE != 0 {
            return Err(WireError::BadLength(len));
        }
        let first = Word::read_from_prefix(datagram.as_ref())
            .ok_or(WireError::BadLength(len))?
            .get();

        if first & SEQ_MASK == ERROR_SENTINEL {
            return Ok(Upstream::Abort);
        }
        let is_last = first & END_OF_STREAM != 0;
        if len == HEADER_LEN && !is_last {
            if first == RESET_CONFIRM {
                return Ok(Upstream::ResetConfirm);
            }
            return Err(WireError::EmptyPayload(first));
        }

        Ok(Upstream::Data(DataPacket {
            seq_num: first & SEQ_MASK,
            is_last,
            payload: datagram.slice(HEADER_LEN..),
        }))
    }
}

/// Datagrams travelling host → device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Downstream {
    Ack(AckPacket),
    ResetRequest,
    /// Error sentinel: the host gave up on the session.
    Abort,
}

impl Downstream {
    pub fn encode(&self) -> Bytes {
        match self {
            Downstream::Ack(ack) => Bytes::copy_from_slice(ack.frame().as_bytes()),
            Downstream::ResetRequest => single_word(RESET_REQUEST),
            Downstream::Abort => single_word(ERROR_SENTINEL),
        }
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        match datagram.len() {
            HEADER_LEN => {
                let word = Word::read_from(datagram)
                    .ok_or(WireError::BadLength(HEADER_LEN))?
                    .get();
                match word {
                    RESET_REQUEST => Ok(Downstream::ResetRequest),
                    w if w & SEQ_MASK == ERROR_SENTINEL => Ok(Downstream::Abort),
                    other => Err(WireError::UnknownCode(other)),
                }
            }
            12 => {
                let frame = AckFrame::read_from(datagram).ok_or(WireError::BadLength(12))?;
                if frame.code.get() != ACK_CODE {
                    return Err(WireError::UnknownCode(frame.code.get()));
                }
                let flags = frame.flags.get();
                if flags & !ACK_FLAG_CUMULATIVE != 0 {
                    return Err(WireError::ReservedFlagsSet(flags));
                }
                Ok(Downstream::Ack(AckPacket {
                    window_index: frame.window_index.get(),
                    is_cumulative: flags & ACK_FLAG_CUMULATIVE != 0,
                }))
            }
            other => Err(WireError::BadLength(other)),
        }
    }
}

fn single_word(value: u32) -> Bytes {
    Bytes::copy_from_slice(Word::new(value).as_bytes())
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram length {0} is not a valid packet length")]
    BadLength(usize),

    #[error("unknown control code: 0x{0:08x}")]
    UnknownCode(u32),

    #[error("reserved ack flags are non-zero: 0x{0:08x}")]
    ReservedFlagsSet(u32),

    #[error("payload of {0} words exceeds maximum {}", MAX_PAYLOAD_WORDS)]
    PayloadTooLarge(usize),

    #[error("data packet 0x{0:08x} has no payload and no end-of-stream flag")]
    EmptyPayload(u32),

    #[error("sequence number {0} does not fit in 31 bits")]
    SequenceTooLarge(u32),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
