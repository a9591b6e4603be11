//! Replicated log abstraction.
//!
//! The consensus client drives a [`ReplicatedLog`] through three write
//! paths: leader appends (offsets assigned locally), follower appends
//! (offsets dictated by the leader), and tail truncation when a follower
//! discovers its log has diverged. Durable segment storage is the
//! embedder's concern; [`MemoryLog`] is the in-memory implementation used
//! by tests and light embedders.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{RaftError, Result};
use crate::record::{LeaderChangeMessage, NewRecord, Record, RecordBatch, LEADER_CHANGE_KEY};
use crate::types::OffsetAndEpoch;

/// Ordered log of record batches tagged by leader epoch.
pub trait ReplicatedLog: Send {
    /// Offset just past the last appended record.
    fn end_offset(&self) -> u64;

    /// Epoch of the last record, or 0 for an empty log.
    fn last_fetched_epoch(&self) -> i32;

    /// Append records as leader, assigning offsets from the end of the log.
    /// Returns the base offset of the new batch.
    fn append_as_leader(&mut self, records: Vec<NewRecord>, epoch: i32) -> Result<u64>;

    /// Append the leader-change control batch that opens a leadership term.
    /// Returns the base offset of the control batch.
    fn append_leader_change(
        &mut self,
        message: LeaderChangeMessage,
        epoch: i32,
        timestamp_ms: i64,
    ) -> Result<u64>;

    /// Append batches replicated from the leader at the offsets the leader
    /// assigned. Fails if the batches would leave an offset gap.
    fn append_as_follower(&mut self, batches: Vec<RecordBatch>) -> Result<()>;

    /// Discard all records at or after `offset`. Idempotent.
    fn truncate_to(&mut self, offset: u64);

    /// Read batches covering `[start_offset, max_offset)`. May return less
    /// on batch boundaries; never returns partial batches.
    fn read(&self, start_offset: u64, max_offset: Option<u64>) -> Vec<RecordBatch>;

    /// Largest epoch at most `epoch` present in the log together with its
    /// end offset. This is the divergence point handed to a follower whose
    /// fetch position does not match this log.
    fn end_offset_for_epoch(&self, epoch: i32) -> OffsetAndEpoch;

    /// Epoch of the record at `offset`, if present.
    fn epoch_at(&self, offset: u64) -> Option<i32>;
}

/// In-memory replicated log.
#[derive(Debug, Default)]
pub struct MemoryLog {
    batches: Vec<RecordBatch>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    fn push_batch(&mut self, batch: RecordBatch) -> Result<()> {
        if batch.base_offset != self.end_offset() {
            return Err(RaftError::Log(format!(
                "append at offset {} would leave a gap, log ends at {}",
                batch.base_offset,
                self.end_offset()
            )));
        }
        if batch.epoch < self.last_fetched_epoch() {
            return Err(RaftError::Log(format!(
                "batch epoch {} regresses below {}",
                batch.epoch,
                self.last_fetched_epoch()
            )));
        }
        if batch.records.is_empty() {
            return Err(RaftError::Log("empty batch".to_string()));
        }
        self.batches.push(batch);
        Ok(())
    }
}

impl ReplicatedLog for MemoryLog {
    fn end_offset(&self) -> u64 {
        self.batches.last().map(|b| b.next_offset()).unwrap_or(0)
    }

    fn last_fetched_epoch(&self) -> i32 {
        self.batches.last().map(|b| b.epoch).unwrap_or(0)
    }

    fn append_as_leader(&mut self, records: Vec<NewRecord>, epoch: i32) -> Result<u64> {
        let base_offset = self.end_offset();
        let records = records
            .into_iter()
            .enumerate()
            .map(|(i, r)| Record {
                offset: base_offset + i as u64,
                timestamp: r.timestamp,
                key: r.key,
                value: r.value,
            })
            .collect();
        self.push_batch(RecordBatch {
            base_offset,
            epoch,
            is_control: false,
            records,
        })?;
        Ok(base_offset)
    }

    fn append_leader_change(
        &mut self,
        message: LeaderChangeMessage,
        epoch: i32,
        timestamp_ms: i64,
    ) -> Result<u64> {
        let base_offset = self.end_offset();
        let record = Record {
            offset: base_offset,
            timestamp: timestamp_ms,
            key: Some(bytes::Bytes::copy_from_slice(&LEADER_CHANGE_KEY)),
            value: message.to_record_value()?,
        };
        self.push_batch(RecordBatch {
            base_offset,
            epoch,
            is_control: true,
            records: vec![record],
        })?;
        Ok(base_offset)
    }

    fn append_as_follower(&mut self, batches: Vec<RecordBatch>) -> Result<()> {
        for batch in batches {
            self.push_batch(batch)?;
        }
        Ok(())
    }

    fn truncate_to(&mut self, offset: u64) {
        self.batches.retain(|b| b.base_offset < offset);
        if let Some(last) = self.batches.last_mut() {
            if last.next_offset() > offset {
                last.records.retain(|r| r.offset < offset);
            }
        }
        self.batches.retain(|b| !b.records.is_empty());
    }

    fn read(&self, start_offset: u64, max_offset: Option<u64>) -> Vec<RecordBatch> {
        self.batches
            .iter()
            .filter(|b| {
                b.next_offset() > start_offset
                    && max_offset.map(|max| b.base_offset < max).unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    fn end_offset_for_epoch(&self, epoch: i32) -> OffsetAndEpoch {
        let mut result = OffsetAndEpoch::new(0, 0);
        for batch in &self.batches {
            if batch.epoch > epoch {
                break;
            }
            result = OffsetAndEpoch::new(batch.next_offset(), batch.epoch);
        }
        result
    }

    fn epoch_at(&self, offset: u64) -> Option<i32> {
        self.batches
            .iter()
            .find(|b| b.base_offset <= offset && offset < b.next_offset())
            .map(|b| b.epoch)
    }
}

/// Shared handle so a test or embedder can inspect the log the client owns.
impl<L: ReplicatedLog> ReplicatedLog for Arc<Mutex<L>> {
    fn end_offset(&self) -> u64 {
        self.lock().end_offset()
    }

    fn last_fetched_epoch(&self) -> i32 {
        self.lock().last_fetched_epoch()
    }

    fn append_as_leader(&mut self, records: Vec<NewRecord>, epoch: i32) -> Result<u64> {
        self.lock().append_as_leader(records, epoch)
    }

    fn append_leader_change(
        &mut self,
        message: LeaderChangeMessage,
        epoch: i32,
        timestamp_ms: i64,
    ) -> Result<u64> {
        self.lock().append_leader_change(message, epoch, timestamp_ms)
    }

    fn append_as_follower(&mut self, batches: Vec<RecordBatch>) -> Result<()> {
        self.lock().append_as_follower(batches)
    }

    fn truncate_to(&mut self, offset: u64) {
        self.lock().truncate_to(offset)
    }

    fn read(&self, start_offset: u64, max_offset: Option<u64>) -> Vec<RecordBatch> {
        self.lock().read(start_offset, max_offset)
    }

    fn end_offset_for_epoch(&self, epoch: i32) -> OffsetAndEpoch {
        self.lock().end_offset_for_epoch(epoch)
    }

    fn epoch_at(&self, offset: u64) -> Option<i32> {
        self.lock().epoch_at(offset)
    }
}
