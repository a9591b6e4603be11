//! Type-safe wrappers for quorum protocol primitives.
//!
//! These newtypes provide type safety to prevent mixing up different
//! integer types that have the same underlying representation but
//! different semantic meanings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a replica in the quorum.
///
/// Node ids are 32-bit signed integers. Non-negative values identify real
/// replicas; `-1` is the wire sentinel meaning "no node" (no leader elected,
/// no vote cast, unknown destination).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub i32);

impl NodeId {
    /// Sentinel for an unknown or absent node.
    pub const INVALID: Self = NodeId(-1);

    /// Create a new node id from a raw value.
    #[inline]
    pub const fn new(value: i32) -> Self {
        NodeId(value)
    }

    /// Get the raw i32 value.
    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }

    /// Check if this is a valid (non-negative) node id.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl From<i32> for NodeId {
    fn from(value: i32) -> Self {
        NodeId(value)
    }
}

impl From<NodeId> for i32 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A correlation id used to match responses to in-flight requests.
///
/// Correlation ids are allocated from a monotonic 32-bit counter per
/// network channel and are unique within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CorrelationId(pub u32);

impl CorrelationId {
    #[inline]
    pub const fn new(value: u32) -> Self {
        CorrelationId(value)
    }

    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for CorrelationId {
    fn from(value: u32) -> Self {
        CorrelationId(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A log position qualified by the leader epoch that wrote it.
///
/// Ordering is lexicographic on `(epoch, offset)`, which is exactly the
/// "at least as up-to-date" comparison used when deciding whether to grant
/// a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OffsetAndEpoch {
    pub epoch: i32,
    pub offset: u64,
}

impl OffsetAndEpoch {
    #[inline]
    pub const fn new(offset: u64, epoch: i32) -> Self {
        OffsetAndEpoch { epoch, offset }
    }
}

impl fmt::Display for OffsetAndEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(offset={}, epoch={})", self.offset, self.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_sentinel() {
        assert!(!NodeId::INVALID.is_valid());
        assert_eq!(NodeId::INVALID.value(), -1);
        assert!(NodeId::new(0).is_valid());
        assert!(NodeId::new(7).is_valid());
    }

    #[test]
    fn test_node_id_conversions() {
        let id = NodeId::from(3);
        assert_eq!(i32::from(id), 3);
        assert_eq!(format!("{}", id), "3");
    }

    #[test]
    fn test_correlation_id_ordering() {
        assert!(CorrelationId::new(2) > CorrelationId::new(1));
        assert_eq!(CorrelationId::from(5).value(), 5);
    }

    #[test]
    fn test_offset_and_epoch_ordering_is_epoch_major() {
        let older = OffsetAndEpoch::new(10, 2);
        let newer = OffsetAndEpoch::new(1, 3);
        assert!(newer > older);

        let shorter = OffsetAndEpoch::new(4, 3);
        let longer = OffsetAndEpoch::new(9, 3);
        assert!(longer > shorter);
        assert_eq!(shorter, OffsetAndEpoch::new(4, 3));
    }
}
