//! Device memory the sender streams from.
//!
//! A start command names a 32-bit source address and a byte length. The
//! reactor resolves that range through [`DeviceMemory`] and feeds the sender
//! one little-endian word at a time; a trailing partial word is padded with
//! zeros.

use std::collections::BTreeMap;

use bytes::Bytes;

use speedup_core::wire::WORD_SIZE;
use speedup_core::SessionDescriptor;

/// Readable device address space.
pub trait DeviceMemory: Send + Sync {
    fn read(&self, address: u32, len: usize) -> Result<Bytes, MemoryError>;
}

/// Non-overlapping memory regions keyed by base address.
#[derive(Debug, Clone, Default)]
pub struct RegionTable {
    regions: BTreeMap<u32, Bytes>,
}

impl RegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `data` at `base`.
    pub fn insert(&mut self, base: u32, data: Bytes) -> Result<(), MemoryError> {
        if base as usize % WORD_SIZE != 0 {
            return Err(MemoryError::Misaligned(base));
        }
        let end = base as u64 + data.len() as u64;
        if end > u32::MAX as u64 + 1 {
            return Err(MemoryError::Unmapped {
                address: base,
                len: data.len(),
            });
        }
        let below = self.regions.range(..=base).next_back();
        if let Some((&b, existing)) = below {
            if b as u64 + existing.len() as u64 > base as u64 {
                return Err(MemoryError::Overlap(base));
            }
        }
        let above = self.regions.range(base..).next();
        if let Some((&b, _)) = above {
            if (b as u64) < end {
                return Err(MemoryError::Overlap(base));
            }
        }
        self.regions.insert(base, data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// `(base, length)` of every mapped region.
    pub fn regions(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.regions.iter().map(|(&base, data)| (base, data.len()))
    }
}

impl DeviceMemory for RegionTable {
    fn read(&self, address: u32, len: usize) -> Result<Bytes, MemoryError> {
        let unmapped = MemoryError::Unmapped { address, len };
        let (&base, data) = self.regions.range(..=address).next_back().ok_or(unmapped.clone())?;
        let start = (address - base) as usize;
        let end = start.checked_add(len).ok_or(unmapped.clone())?;
        if end > data.len() {
            return Err(unmapped);
        }
        Ok(data.slice(start..end))
    }
}

/// Payload words for one session, padded to a whole word at the end.
#[derive(Debug, Clone)]
pub struct WordStream {
    data: Bytes,
    pos: usize,
}

impl WordStream {
    /// Resolve the descriptor's source range.
    pub fn open(memory: &dyn DeviceMemory, descriptor: &SessionDescriptor) -> Result<Self, MemoryError> {
        let address = descriptor.source_address();
        if address as usize % WORD_SIZE != 0 {
            return Err(MemoryError::Misaligned(address));
        }
        let data = memory.read(address, descriptor.total_length_bytes() as usize)?;
        Ok(Self { data, pos: 0 })
    }

    /// Words left to hand out.
    pub fn remaining(&self) -> usize {
        (self.data.len() - self.pos).div_ceil(WORD_SIZE)
    }
}

impl Iterator for WordStream {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.pos >= self.data.len() {
            return None;
        }
        let mut word = [0u8; WORD_SIZE];
        let end = (self.pos + WORD_SIZE).min(self.data.len());
        word[..end - self.pos].copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Some(u32::from_le_bytes(word))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("range 0x{address:08x}+{len} is not mapped")]
    Unmapped { address: u32, len: usize },

    #[error("region at 0x{0:08x} overlaps an existing region")]
    Overlap(u32),

    #[error("address 0x{0:08x} is not word aligned")]
    Misaligned(u32),
}
