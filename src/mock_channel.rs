//! In-memory mock network channel for testing.
//!
//! Captures everything the client sends and feeds back messages a test
//! scripts with [`MockChannel::mock_receive`]. Available during unit tests
//! or with the `test-utilities` feature:
//!
//! ```toml
//! [dev-dependencies]
//! raftesque = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::{BTreeMap, VecDeque};

use crate::channel::NetworkChannel;
use crate::error::Result;
use crate::message::RaftMessage;
use crate::types::{CorrelationId, NodeId};

/// Scriptable channel: sends are captured, receives are replayed.
#[derive(Debug, Default)]
pub struct MockChannel {
    next_correlation: u32,
    send_queue: Vec<RaftMessage>,
    receive_queue: VecDeque<RaftMessage>,
    endpoints: BTreeMap<NodeId, String>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for the next `receive` call.
    pub fn mock_receive(&mut self, message: RaftMessage) {
        self.receive_queue.push_back(message);
    }

    /// Take all messages the client has sent since the last drain.
    pub fn drain_send_queue(&mut self) -> Vec<RaftMessage> {
        std::mem::take(&mut self.send_queue)
    }

    pub fn has_sent_messages(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Addresses learned through `update_endpoint`.
    pub fn endpoints(&self) -> &BTreeMap<NodeId, String> {
        &self.endpoints
    }
}

impl NetworkChannel for MockChannel {
    fn new_correlation_id(&mut self) -> CorrelationId {
        let id = CorrelationId(self.next_correlation);
        self.next_correlation = self.next_correlation.wrapping_add(1);
        id
    }

    fn send(&mut self, message: RaftMessage) -> Result<()> {
        self.send_queue.push(message);
        Ok(())
    }

    fn receive(&mut self, _timeout_ms: u64) -> Result<Vec<RaftMessage>> {
        Ok(self.receive_queue.drain(..).collect())
    }

    fn wakeup(&self) {}

    fn update_endpoint(&mut self, id: NodeId, address: String) {
        self.endpoints.insert(id, address);
    }
}
