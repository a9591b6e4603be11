//! # Raftesque
//! Raft-style quorum consensus client for Kafka-compatible replicated logs.
//!
//! This crate implements the consensus core of a single-partition
//! replicated log: leader election, fetch-driven replication, and
//! high-watermark tracking, in cooperation with a set of voter peers.
//! Observers replicate the same log but do not vote and cannot be elected.
//!
//! # Goals
//! - A complete, deterministic single-threaded consensus state machine
//! - Clear seams to the embedding broker: the byte transport, durable log
//!   segments, and the applied state machine all stay outside
//! - Kafka wire-protocol error codes so the surrounding broker can forward
//!   quorum errors unchanged
//!
//! ## Architecture
//!
//! The embedding application drives everything through
//! [`RaftClient::poll`](client::RaftClient::poll): each call handles timer
//! expirations, emits the outbound requests the current role needs, blocks
//! once on the [`NetworkChannel`](channel::NetworkChannel), and dispatches
//! whatever arrived. Writes to the durable election record always happen
//! before the transition they record becomes observable.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use raftesque::prelude::*;
//!
//! # fn run<C: NetworkChannel>(channel: C) -> Result<()> {
//! let store = Arc::new(FileQuorumStateStore::new("/var/lib/broker/quorum-state"));
//! let quorum = QuorumState::new(NodeId(0), [NodeId(0), NodeId(1), NodeId(2)], store);
//! let mut client = RaftClient::new(
//!     channel,
//!     MemoryLog::new(),
//!     quorum,
//!     Arc::new(SystemClock),
//!     fastrand::Rng::new(),
//!     "broker-0.internal",
//!     9990,
//!     RaftConfig::default(),
//! )?;
//!
//! let append_handle = client.append_handle();
//! loop {
//!     client.poll(500)?;
//!     if !client.is_running() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod channel;
pub mod client;
pub mod clock;
pub mod config;
pub mod election;
pub mod error;
pub mod log;
pub mod message;
pub mod quorum;
pub mod record;
pub mod telemetry;
pub mod types;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock_channel;

pub mod prelude {
    //! Main exports for embedding the consensus client.

    pub use crate::channel::{NetworkChannel, RaftNetworkChannel, Transport};
    pub use crate::client::{AppendFuture, AppendHandle, RaftClient};
    pub use crate::clock::{Clock, MockClock, SystemClock};
    pub use crate::config::RaftConfig;
    pub use crate::election::{
        ElectionState, FileQuorumStateStore, MemoryQuorumStateStore, QuorumStateStore,
    };
    pub use crate::error::{ErrorCode, RaftError, Result};
    pub use crate::log::{MemoryLog, ReplicatedLog};
    pub use crate::message::{ApiKey, RaftMessage, RequestPayload, ResponsePayload};
    pub use crate::quorum::QuorumState;
    pub use crate::record::{LeaderChangeMessage, NewRecord, Record, RecordBatch};
    pub use crate::types::{CorrelationId, NodeId, OffsetAndEpoch};

    pub use bytes;
}
