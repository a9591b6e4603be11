//! Record and batch model for the replicated log.
//!
//! Batches are the unit of replication: every batch is tagged with the
//! leader epoch that wrote it, and control batches carry quorum metadata
//! (currently only the leader-change marker) instead of application data.
//!
//! The exact on-the-wire encoding of batches is owned by the surrounding
//! log format; this module only fixes the design-level shape.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::types::NodeId;

/// Timestamp sentinel for records without a client-assigned timestamp.
pub const NO_TIMESTAMP: i64 = -1;

/// Control record key marking a leader change: two big-endian i16s,
/// schema version followed by the control record type id.
pub const LEADER_CHANGE_KEY: [u8; 4] = [0, 0, 0, 2];

/// A record as submitted for appending, before an offset is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl NewRecord {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            timestamp: NO_TIMESTAMP,
            key: None,
            value: value.into(),
        }
    }
}

/// A record stored in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: u64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

/// A batch of records written atomically at a single leader epoch.
///
/// Offsets within a batch are contiguous starting at `base_offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub base_offset: u64,
    pub epoch: i32,
    pub is_control: bool,
    pub records: Vec<Record>,
}

impl RecordBatch {
    /// Offset of the last record in the batch.
    pub fn last_offset(&self) -> u64 {
        self.base_offset + self.records.len().saturating_sub(1) as u64
    }

    /// Offset just past the last record in the batch.
    pub fn next_offset(&self) -> u64 {
        self.base_offset + self.records.len() as u64
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// A voter entry captured in the leader-change control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderChangeVoter {
    pub voter_id: NodeId,
}

/// Value of the leader-change control record, written as the first entry
/// of every leadership term. Captures the new leader and the rest of the
/// voter set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderChangeMessage {
    pub version: i16,
    pub leader_id: NodeId,
    pub voters: Vec<LeaderChangeVoter>,
}

impl LeaderChangeMessage {
    pub fn new(leader_id: NodeId, voter_ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            version: 0,
            leader_id,
            voters: voter_ids
                .into_iter()
                .map(|voter_id| LeaderChangeVoter { voter_id })
                .collect(),
        }
    }

    /// Serialize into a control record value.
    pub fn to_record_value(&self) -> Result<Bytes> {
        let value = serde_json::to_vec(self).map_err(|e| RaftError::Log(e.to_string()))?;
        Ok(Bytes::from(value))
    }

    /// Parse a control record back into a message. Returns `None` when the
    /// record key does not carry the leader-change marker.
    pub fn from_record(record: &Record) -> Option<Self> {
        let key = record.key.as_ref()?;
        if key.as_ref() != LEADER_CHANGE_KEY {
            return None;
        }
        serde_json::from_slice(&record.value).ok()
    }
}
