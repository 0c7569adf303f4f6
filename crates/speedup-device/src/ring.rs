//! Bounded retransmission buffer.
//!
//! One slot per packet of the sliding window, indexed by
//! `seq % capacity`. All storage is allocated when the session starts; a
//! slot holds the encoded datagram exactly as it was first transmitted so a
//! retransmission is a plain copy.

use speedup_core::wire::MAX_DATAGRAM;

struct Slot {
    seq: u32,
    len: usize,
    occupied: bool,
    bytes: [u8; MAX_DATAGRAM],
}

impl Slot {
    const EMPTY: Slot = Slot {
        seq: 0,
        len: 0,
        occupied: false,
        bytes: [0u8; MAX_DATAGRAM],
    };
}

pub struct RetransmitRing {
    slots: Box<[Slot]>,
    occupied: usize,
}

impl RetransmitRing {
    pub fn with_capacity(capacity: u32) -> Self {
        let slots = (0..capacity.max(1)).map(|_| Slot::EMPTY).collect();
        Self { slots, occupied: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Packets currently held.
    pub fn occupied(&self) -> usize {
        self.occupied
    }

    fn index(&self, seq: u32) -> usize {
        seq as usize % self.slots.len()
    }

    /// Store the datagram for `seq`. Fails if its slot still holds an
    /// unacknowledged packet.
    pub fn insert(&mut self, seq: u32, datagram: &[u8]) -> Result<(), RingError> {
        if datagram.len() > MAX_DATAGRAM {
            return Err(RingError::Oversized(datagram.len()));
        }
        let index = self.index(seq);
        let slot = &mut self.slots[index];
        if slot.occupied {
            return Err(RingError::Occupied {
                seq,
                holder: slot.seq,
            });
        }
        slot.bytes[..datagram.len()].copy_from_slice(datagram);
        slot.len = datagram.len();
        slot.seq = seq;
        slot.occupied = true;
        self.occupied += 1;
        Ok(())
    }

    /// The stored datagram for `seq`, if it is still held.
    pub fn get(&self, seq: u32) -> Option<&[u8]> {
        let slot = &self.slots[self.index(seq)];
        (slot.occupied && slot.seq == seq).then(|| &slot.bytes[..slot.len])
    }

    /// Sequence numbers currently held, oldest first.
    pub fn held_sequences(&self) -> Vec<u32> {
        let mut held: Vec<u32> = self
            .slots
            .iter()
            .filter(|s| s.occupied)
            .map(|s| s.seq)
            .collect();
        held.sort_unstable();
        held
    }

    /// Free the slot for `seq`. Returns whether anything was freed.
    pub fn release(&mut self, seq: u32) -> bool {
        let index = self.index(seq);
        let slot = &mut self.slots[index];
        if slot.occupied && slot.seq == seq {
            slot.occupied = false;
            slot.len = 0;
            self.occupied -= 1;
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.occupied = false;
            slot.len = 0;
        }
        self.occupied = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("slot for sequence {seq} still holds unacknowledged sequence {holder}")]
    Occupied { seq: u32, holder: u32 },
    #[error("datagram of {0} bytes does not fit a slot")]
    Oversized(usize),
}
