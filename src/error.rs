//! Crate & protocol level errors.
//!
//! The crate uses a two-layer error hierarchy:
//!
//! ## Crate layer
//!
//! - [`RaftError`]: errors surfaced to the embedding application. Transient
//!   protocol conditions are recovered inside the client and never appear
//!   here; what remains is fatal (I/O on the election store, queue overflow,
//!   corrupt persistent state) or caller misuse (append on a non-leader).
//!
//! ## Wire layer
//!
//! - [`ErrorCode`]: error codes carried in quorum protocol responses. These
//!   use the Kafka protocol's numeric values so the surrounding broker can
//!   forward them unchanged.
//!
//! [Kafka Errors](http://kafka.apache.org/protocol.html)

use std::{io, result};

use num_derive::FromPrimitive;
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, RaftError>;

/// Errors surfaced by the consensus client.
#[derive(Debug, ThisError)]
pub enum RaftError {
    /// I/O failure, e.g. writing the election state file. Fatal.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The election state file exists but could not be parsed. Fatal:
    /// clearing it silently could allow a double vote.
    #[error("Corrupt election state file: {0}")]
    CorruptStateFile(String),

    /// A bounded channel queue overflowed. Fatal; queues are sized to the
    /// peer set and cannot overflow in steady state.
    #[error("Outbound queue overflow: {0} pending messages")]
    QueueOverflow(usize),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An append was submitted to a node that is not the leader.
    #[error("Not leader for partition")]
    NotLeaderForPartition,

    /// A role transition was requested that the persisted state forbids.
    #[error("Illegal state transition: {0}")]
    IllegalTransition(String),

    /// The log rejected an append, e.g. a follower append that would leave
    /// an offset gap.
    #[error("Log error: {0}")]
    Log(String),
}

impl RaftError {
    /// Whether this error must terminate the consensus client.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RaftError::Io(_)
                | RaftError::CorruptStateFile(_)
                | RaftError::QueueOverflow(_)
                | RaftError::IllegalTransition(_)
        )
    }
}

/// Error codes carried in quorum protocol responses.
///
/// Values match the Kafka wire protocol error table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, Default)]
pub enum ErrorCode {
    /// An unexpected server error.
    UnknownServerError = -1,
    #[default]
    None = 0,
    /// The requested fetch offset does not match the leader's log; the
    /// response carries the divergence point to truncate to.
    OffsetOutOfRange = 1,
    /// The request was addressed to a replica that is not the leader.
    NotLeaderForPartition = 6,
    /// The destination is unreachable: unknown address, failed connection,
    /// or disconnect. Synthesized locally by the network channel.
    BrokerNotAvailable = 8,
    /// The sender is not authorized for inter-broker APIs. Synthesized by
    /// the network channel on authentication failures.
    ClusterAuthorizationFailed = 31,
    /// The request could not be classified (e.g. unknown api key).
    InvalidRequest = 42,
    /// The request's leader epoch is older than the receiver's.
    FencedLeaderEpoch = 74,
}

impl ErrorCode {
    #[inline]
    pub fn is_none(self) -> bool {
        self == ErrorCode::None
    }

    #[inline]
    pub fn code(self) -> i16 {
        self as i16
    }
}
