//! Shared random blocks and the allocation instructions carved from them.
//!
//! A block is consumed front to back. `offset` is the consumption cursor:
//! bytes before it have been handed to some key, bytes after it are still
//! available. Instructions are half-open `[start, end)` ranges, so a key's
//! material is the concatenation of its instruction slices in order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    error::QkdError,
    ids::{BlockId, LinkId},
};

/// One byte range consumed from one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    /// Block the range was carved from.
    pub block_id: BlockId,
    /// First byte (inclusive).
    pub start: usize,
    /// One past the last byte.
    pub end: usize,
}

impl Instruction {
    /// Builds an instruction, rejecting empty or inverted ranges.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` unless `start < end`.
    pub fn new(block_id: BlockId, start: usize, end: usize) -> Result<Self, QkdError> {
        let instruction = Self { block_id, start, end };
        instruction.validate()?;
        Ok(instruction)
    }

    /// Checks `start < end`. Instructions received from peers are
    /// deserialized without going through [`Self::new`].
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` on an empty or inverted range.
    pub fn validate(&self) -> Result<(), QkdError> {
        if self.start >= self.end {
            return Err(QkdError::ProtocolViolation(format!(
                "instruction on block {} has empty range [{}, {})",
                self.block_id, self.start, self.end
            )));
        }
        Ok(())
    }

    /// Number of bytes covered.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// True if the range covers nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if both instructions touch the same bytes of the same block.
    pub fn overlaps(&self, other: &Instruction) -> bool {
        self.block_id == other.block_id && self.start < other.end && other.start < self.end
    }
}

/// Total bytes covered by an instruction list.
pub fn total_len(instructions: &[Instruction]) -> usize {
    instructions.iter().map(Instruction::len).sum()
}

/// A finite pool of shared random bytes delivered over one link.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block identifier, identical on both ends of the link.
    pub id: BlockId,
    /// Link the block arrived on.
    pub link_id: LinkId,
    /// Arrival time, seconds since the Unix epoch.
    pub timestamp: u64,
    /// Local arrival sequence number. Breaks ties between blocks with the
    /// same timestamp.
    pub arrival: u64,
    /// Raw shared randomness.
    pub bytes: Vec<u8>,
    /// Consumption cursor. Only moves forward, except when a key-generation
    /// batch rolls back its own carves.
    pub offset: usize,
    /// Number of keys that still need to replay ranges of this block.
    pub in_use: u32,
}

impl Block {
    /// A fresh, fully available block.
    pub fn new(id: BlockId, link_id: LinkId, timestamp: u64, arrival: u64, bytes: Vec<u8>) -> Self {
        Self { id, link_id, timestamp, arrival, bytes, offset: 0, in_use: 0 }
    }

    /// Bytes not yet allocated.
    pub fn available(&self) -> usize {
        self.bytes.len().saturating_sub(self.offset)
    }

    /// True once the block is older than `ttl_secs`.
    pub fn is_expired(&self, now_secs: u64, ttl_secs: u64) -> bool {
        now_secs.saturating_sub(self.timestamp) >= ttl_secs
    }

    /// Eligible for new allocations: bytes left and not expired.
    pub fn is_eligible(&self, now_secs: u64, ttl_secs: u64) -> bool {
        self.available() > 0 && !self.is_expired(now_secs, ttl_secs)
    }

    /// Eviction rule: nothing references the block and it is either
    /// exhausted or expired.
    pub fn is_evictable(&self, now_secs: u64, ttl_secs: u64) -> bool {
        self.in_use == 0 && (self.available() == 0 || self.is_expired(now_secs, ttl_secs))
    }

    /// Carves up to `max` bytes at the cursor and takes a reference.
    pub fn carve(&mut self, max: usize) -> Option<Instruction> {
        let take = self.available().min(max);
        if take == 0 {
            return None;
        }

        let instruction =
            Instruction { block_id: self.id, start: self.offset, end: self.offset + take };
        self.offset += take;
        self.in_use += 1;
        Some(instruction)
    }

    /// Reverts the most recent carve, dropping its reference too if
    /// `release_ref` is set. Returns false if `instruction` is not the range
    /// that ends at the cursor.
    pub fn uncarve(&mut self, instruction: &Instruction, release_ref: bool) -> bool {
        if instruction.block_id != self.id || instruction.end != self.offset {
            return false;
        }
        self.offset = instruction.start;
        if release_ref {
            self.in_use = self.in_use.saturating_sub(1);
        }
        true
    }

    /// Mirrors a carve made by the companion KME: advances the cursor past
    /// the range and, if this side will replay it, takes a reference.
    pub fn acknowledge(&mut self, instruction: &Instruction, retain: bool) {
        self.offset = self.offset.max(instruction.end.min(self.bytes.len()));
        if retain {
            self.in_use += 1;
        }
    }

    /// Drops one reference.
    pub fn release(&mut self) {
        self.in_use = self.in_use.saturating_sub(1);
    }

    /// The bytes an instruction refers to.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if the range falls outside the block.
    pub fn slice(&self, instruction: &Instruction) -> Result<&[u8], QkdError> {
        instruction.validate()?;
        self.bytes.get(instruction.start..instruction.end).ok_or_else(|| {
            QkdError::ProtocolViolation(format!(
                "range [{}, {}) outside block {} of {} bytes",
                instruction.start,
                instruction.end,
                self.id,
                self.bytes.len()
            ))
        })
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("link_id", &self.link_id)
            .field("timestamp", &self.timestamp)
            .field("len", &self.bytes.len())
            .field("offset", &self.offset)
            .field("in_use", &self.in_use)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(len: usize) -> Block {
        Block::new(BlockId(1), LinkId(1), 100, 0, (0..len).map(|i| i as u8).collect())
    }

    #[test]
    fn instruction_rejects_empty_range() {
        assert!(Instruction::new(BlockId(1), 4, 4).is_err());
        assert!(Instruction::new(BlockId(1), 5, 4).is_err());
        assert!(Instruction::new(BlockId(1), 4, 5).is_ok());
    }

    #[test]
    fn carve_advances_cursor_and_refcount() {
        let mut b = block(32);

        let first = b.carve(16).unwrap();
        let second = b.carve(20).unwrap();

        assert_eq!((first.start, first.end), (0, 16));
        assert_eq!((second.start, second.end), (16, 32));
        assert_eq!(b.available(), 0);
        assert_eq!(b.in_use, 2);
        assert!(b.carve(1).is_none());
        assert!(!first.overlaps(&second));
    }

    #[test]
    fn uncarve_only_reverts_the_tail() {
        let mut b = block(32);
        let first = b.carve(8).unwrap();
        let second = b.carve(8).unwrap();

        assert!(!b.uncarve(&first, true));
        assert!(b.uncarve(&second, true));
        assert!(b.uncarve(&first, false));
        assert_eq!(b.offset, 0);
        assert_eq!(b.in_use, 1);
    }

    #[test]
    fn acknowledge_never_moves_cursor_back() {
        let mut b = block(32);
        b.acknowledge(&Instruction { block_id: b.id, start: 0, end: 24 }, true);
        b.acknowledge(&Instruction { block_id: b.id, start: 0, end: 8 }, false);

        assert_eq!(b.offset, 24);
        assert_eq!(b.in_use, 1);
    }

    #[test]
    fn eviction_rule() {
        let mut b = block(8);
        assert!(!b.is_evictable(100, 15));
        assert!(b.is_evictable(115, 15));

        let _ = b.carve(8);
        assert!(!b.is_evictable(200, 15), "in-use block survives expiry");

        b.release();
        assert!(b.is_evictable(100, 15), "exhausted and unreferenced");
    }

    #[test]
    fn slice_checks_bounds() {
        let b = block(8);
        assert_eq!(b.slice(&Instruction { block_id: b.id, start: 2, end: 4 }).unwrap(), &[2, 3]);
        assert!(b.slice(&Instruction { block_id: b.id, start: 4, end: 9 }).is_err());
    }
}
