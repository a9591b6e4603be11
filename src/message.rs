//! Quorum protocol messages.
//!
//! Every message carries a correlation id and one of five api payloads.
//! The outer [`RaftMessage`] tag distinguishes inbound from outbound and
//! requests from responses, so the dispatch in the client and the network
//! channel is total over an enum instead of a runtime type check.
//!
//! Error responses carry sentinel fields: `leader_epoch = -1`,
//! `leader_id = -1`, `high_watermark = -1` and an empty record set.

use std::fmt;

use crate::error::ErrorCode;
use crate::record::RecordBatch;
use crate::types::{CorrelationId, NodeId};

/// The five apis of the quorum protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiKey {
    Vote,
    BeginQuorumEpoch,
    EndQuorumEpoch,
    FetchQuorumRecords,
    FindQuorum,
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApiKey::Vote => "Vote",
            ApiKey::BeginQuorumEpoch => "BeginQuorumEpoch",
            ApiKey::EndQuorumEpoch => "EndQuorumEpoch",
            ApiKey::FetchQuorumRecords => "FetchQuorumRecords",
            ApiKey::FindQuorum => "FindQuorum",
        };
        f.write_str(name)
    }
}

/// Vote solicitation from a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub candidate_epoch: i32,
    pub candidate_id: NodeId,
    /// Epoch of the last record in the candidate's log.
    pub last_epoch: i32,
    /// End offset of the candidate's log at `last_epoch`.
    pub last_epoch_end_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteResponse {
    pub error_code: ErrorCode,
    pub leader_epoch: i32,
    pub leader_id: NodeId,
    pub vote_granted: bool,
}

/// Announcement of a newly elected leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginQuorumEpochRequest {
    pub leader_epoch: i32,
    pub leader_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginQuorumEpochResponse {
    pub error_code: ErrorCode,
    pub leader_epoch: i32,
    pub leader_id: NodeId,
}

/// Graceful resignation of the current leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndQuorumEpochRequest {
    pub leader_epoch: i32,
    pub leader_id: NodeId,
    pub replica_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndQuorumEpochResponse {
    pub error_code: ErrorCode,
    pub leader_epoch: i32,
    pub leader_id: NodeId,
}

/// Replication fetch from a follower or observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchQuorumRecordsRequest {
    pub leader_epoch: i32,
    pub fetch_offset: u64,
    /// Epoch of the record preceding `fetch_offset` in the sender's log,
    /// used by the leader to detect divergence.
    pub last_fetched_epoch: i32,
    pub replica_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchQuorumRecordsResponse {
    pub error_code: ErrorCode,
    pub leader_epoch: i32,
    pub leader_id: NodeId,
    pub high_watermark: i64,
    pub records: Vec<RecordBatch>,
    /// Divergence point; only meaningful with `OffsetOutOfRange`.
    pub next_fetch_offset: i64,
    pub next_fetch_offset_epoch: i32,
}

/// Leader discovery probe sent to a bootstrap address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindQuorumRequest {
    pub replica_id: NodeId,
}

/// A voter endpoint advertised in a FindQuorum response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoterAddress {
    pub voter_id: NodeId,
    pub boot_timestamp: i64,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindQuorumResponse {
    pub error_code: ErrorCode,
    pub leader_epoch: i32,
    pub leader_id: NodeId,
    pub voters: Vec<VoterAddress>,
}

/// Request payloads, one variant per api key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    Vote(VoteRequest),
    BeginQuorumEpoch(BeginQuorumEpochRequest),
    EndQuorumEpoch(EndQuorumEpochRequest),
    FetchQuorumRecords(FetchQuorumRecordsRequest),
    FindQuorum(FindQuorumRequest),
}

impl RequestPayload {
    pub fn api_key(&self) -> ApiKey {
        match self {
            RequestPayload::Vote(_) => ApiKey::Vote,
            RequestPayload::BeginQuorumEpoch(_) => ApiKey::BeginQuorumEpoch,
            RequestPayload::EndQuorumEpoch(_) => ApiKey::EndQuorumEpoch,
            RequestPayload::FetchQuorumRecords(_) => ApiKey::FetchQuorumRecords,
            RequestPayload::FindQuorum(_) => ApiKey::FindQuorum,
        }
    }

    /// The epoch asserted by the sender, if this api carries one.
    pub fn epoch(&self) -> Option<i32> {
        match self {
            RequestPayload::Vote(r) => Some(r.candidate_epoch),
            RequestPayload::BeginQuorumEpoch(r) => Some(r.leader_epoch),
            RequestPayload::EndQuorumEpoch(r) => Some(r.leader_epoch),
            RequestPayload::FetchQuorumRecords(r) => Some(r.leader_epoch),
            RequestPayload::FindQuorum(_) => None,
        }
    }
}

/// Response payloads, one variant per api key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    Vote(VoteResponse),
    BeginQuorumEpoch(BeginQuorumEpochResponse),
    EndQuorumEpoch(EndQuorumEpochResponse),
    FetchQuorumRecords(FetchQuorumRecordsResponse),
    FindQuorum(FindQuorumResponse),
}

impl ResponsePayload {
    pub fn api_key(&self) -> ApiKey {
        match self {
            ResponsePayload::Vote(_) => ApiKey::Vote,
            ResponsePayload::BeginQuorumEpoch(_) => ApiKey::BeginQuorumEpoch,
            ResponsePayload::EndQuorumEpoch(_) => ApiKey::EndQuorumEpoch,
            ResponsePayload::FetchQuorumRecords(_) => ApiKey::FetchQuorumRecords,
            ResponsePayload::FindQuorum(_) => ApiKey::FindQuorum,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            ResponsePayload::Vote(r) => r.error_code,
            ResponsePayload::BeginQuorumEpoch(r) => r.error_code,
            ResponsePayload::EndQuorumEpoch(r) => r.error_code,
            ResponsePayload::FetchQuorumRecords(r) => r.error_code,
            ResponsePayload::FindQuorum(r) => r.error_code,
        }
    }

    /// The leader epoch advertised by the responder.
    pub fn leader_epoch(&self) -> i32 {
        match self {
            ResponsePayload::Vote(r) => r.leader_epoch,
            ResponsePayload::BeginQuorumEpoch(r) => r.leader_epoch,
            ResponsePayload::EndQuorumEpoch(r) => r.leader_epoch,
            ResponsePayload::FetchQuorumRecords(r) => r.leader_epoch,
            ResponsePayload::FindQuorum(r) => r.leader_epoch,
        }
    }

    /// The leader advertised by the responder, `INVALID` if unknown.
    pub fn leader_id(&self) -> NodeId {
        match self {
            ResponsePayload::Vote(r) => r.leader_id,
            ResponsePayload::BeginQuorumEpoch(r) => r.leader_id,
            ResponsePayload::EndQuorumEpoch(r) => r.leader_id,
            ResponsePayload::FetchQuorumRecords(r) => r.leader_id,
            ResponsePayload::FindQuorum(r) => r.leader_id,
        }
    }

    /// Build the error response for any api, with sentinel fields.
    pub fn error_of(api_key: ApiKey, error_code: ErrorCode) -> Self {
        match api_key {
            ApiKey::Vote => ResponsePayload::Vote(VoteResponse {
                error_code,
                leader_epoch: -1,
                leader_id: NodeId::INVALID,
                vote_granted: false,
            }),
            ApiKey::BeginQuorumEpoch => {
                ResponsePayload::BeginQuorumEpoch(BeginQuorumEpochResponse {
                    error_code,
                    leader_epoch: -1,
                    leader_id: NodeId::INVALID,
                })
            }
            ApiKey::EndQuorumEpoch => ResponsePayload::EndQuorumEpoch(EndQuorumEpochResponse {
                error_code,
                leader_epoch: -1,
                leader_id: NodeId::INVALID,
            }),
            ApiKey::FetchQuorumRecords => {
                ResponsePayload::FetchQuorumRecords(FetchQuorumRecordsResponse {
                    error_code,
                    leader_epoch: -1,
                    leader_id: NodeId::INVALID,
                    high_watermark: -1,
                    records: Vec::new(),
                    next_fetch_offset: -1,
                    next_fetch_offset_epoch: -1,
                })
            }
            ApiKey::FindQuorum => ResponsePayload::FindQuorum(FindQuorumResponse {
                error_code,
                leader_epoch: -1,
                leader_id: NodeId::INVALID,
                voters: Vec::new(),
            }),
        }
    }
}

/// A quorum protocol message as seen by the network channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftMessage {
    /// A request from a peer, awaiting a correlated outbound response.
    InboundRequest {
        correlation_id: CorrelationId,
        request: RequestPayload,
        received_at_ms: u64,
    },
    /// A request we are sending to `destination`.
    OutboundRequest {
        correlation_id: CorrelationId,
        destination: NodeId,
        request: RequestPayload,
    },
    /// A response to one of our outbound requests (possibly synthesized by
    /// the channel itself).
    InboundResponse {
        correlation_id: CorrelationId,
        source: NodeId,
        response: ResponsePayload,
    },
    /// A response we are sending back for an inbound request.
    OutboundResponse {
        correlation_id: CorrelationId,
        response: ResponsePayload,
    },
}

impl RaftMessage {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            RaftMessage::InboundRequest { correlation_id, .. }
            | RaftMessage::OutboundRequest { correlation_id, .. }
            | RaftMessage::InboundResponse { correlation_id, .. }
            | RaftMessage::OutboundResponse { correlation_id, .. } => *correlation_id,
        }
    }

    pub fn api_key(&self) -> ApiKey {
        match self {
            RaftMessage::InboundRequest { request, .. }
            | RaftMessage::OutboundRequest { request, .. } => request.api_key(),
            RaftMessage::InboundResponse { response, .. }
            | RaftMessage::OutboundResponse { response, .. } => response.api_key(),
        }
    }
}
