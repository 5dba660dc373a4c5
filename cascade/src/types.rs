//! Identifier newtypes shared by the runtime and the transport.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of low bits of a [`ChainId`] left to the local counter.
///
/// The bits above carry the block handed out by the cluster-wide `chainID`
/// sequence, so two handlers never produce the same id.
pub const CHAIN_ID_BLOCK_SHIFT: u32 = 40;

/// Number of low bits of a bucket id left to the local counter.
pub const BUCKET_ID_BLOCK_SHIFT: u32 = 16;

/// Index of a node within the sorted cluster membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(u32);

impl PartitionId {
    /// The coordinator: first member in sort order and startup-barrier target.
    pub const COORDINATOR: Self = Self(0);

    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for PartitionId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<PartitionId> for u32 {
    fn from(p: PartitionId) -> Self {
        p.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster-unique chain identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(u64);

impl ChainId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ChainId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifier of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(u32);

impl SubmissionId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

impl From<u32> for SubmissionId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Names an input layer registered in an [`crate::input::InputRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputLayerId(u8);

impl InputLayerId {
    /// The layer chains read from unless told otherwise.
    pub const DEFAULT: Self = Self(0);

    #[must_use]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }
}

impl From<u8> for InputLayerId {
    fn from(v: u8) -> Self {
        Self(v)
    }
}

impl fmt::Display for InputLayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out chain ids from a block seeded once by the cluster sequence.
#[derive(Debug, Clone)]
pub struct ChainIdAllocator {
    next: u64,
}

impl ChainIdAllocator {
    /// Starts a block from a value of the cluster-wide `chainID` sequence.
    #[must_use]
    pub const fn from_sequence(sequence: u64) -> Self {
        Self {
            next: (sequence + 1) << CHAIN_ID_BLOCK_SHIFT,
        }
    }

    pub fn next_id(&mut self) -> ChainId {
        let id = ChainId(self.next);
        self.next += 1;
        id
    }
}

/// Hands out bucket ids from a block seeded once by the cluster sequence.
#[derive(Debug, Clone)]
pub struct BucketIdAllocator {
    next: u32,
}

impl BucketIdAllocator {
    /// Starts a block from a value of the cluster-wide `bucketID` sequence.
    #[must_use]
    pub const fn from_sequence(sequence: u64) -> Self {
        Self {
            next: ((sequence as u32) + 1) << BUCKET_ID_BLOCK_SHIFT,
        }
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_blocks_do_not_overlap() {
        let mut a = ChainIdAllocator::from_sequence(0);
        let mut b = ChainIdAllocator::from_sequence(1);
        let first_a = a.next_id();
        let first_b = b.next_id();
        assert_eq!(first_a.as_u64(), 1 << 40);
        assert_eq!(first_b.as_u64(), 2 << 40);
        assert_eq!(a.next_id().as_u64(), (1 << 40) + 1);
    }

    #[test]
    fn bucket_ids_start_above_block_shift() {
        let mut ids = BucketIdAllocator::from_sequence(2);
        assert_eq!(ids.next_id(), 3 << 16);
        assert_eq!(ids.next_id(), (3 << 16) + 1);
    }

    #[test]
    fn display_formats() {
        assert_eq!(format!("{}", PartitionId::new(3)), "3");
        assert_eq!(format!("{}", ChainId::new(255)), "0xff");
        assert_eq!(format!("{}", SubmissionId::new(7)), "7");
    }
}
