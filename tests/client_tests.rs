//! End-to-end tests for the consensus client poll loop.
//!
//! These drive a client against a scriptable mock channel, a shared
//! in-memory log, and a manually advanced clock, covering elections,
//! replication, leader discovery, and graceful shutdown.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use raftesque::error::{ErrorCode, RaftError};
use raftesque::message::{
    BeginQuorumEpochRequest, FetchQuorumRecordsRequest, FetchQuorumRecordsResponse,
    FindQuorumRequest, FindQuorumResponse, RaftMessage, RequestPayload, ResponsePayload,
    VoteRequest, VoteResponse, VoterAddress,
};
use raftesque::mock_channel::MockChannel;
use raftesque::prelude::*;
use raftesque::record::Record;

const LOCAL_ID: i32 = 0;
const ELECTION_TIMEOUT_MS: u64 = 10_000;
const ELECTION_JITTER_MS: u64 = 100;
const RETRY_BACKOFF_MS: u64 = 50;
const REQUEST_TIMEOUT_MS: u64 = 5_000;
const RNG_SEED: u64 = 0x5eed;

type SharedChannel = Arc<Mutex<MockChannel>>;
type SharedLog = Arc<Mutex<MemoryLog>>;

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    client: RaftClient<SharedChannel, SharedLog>,
    channel: SharedChannel,
    log: SharedLog,
    store: Arc<MemoryQuorumStateStore>,
    clock: MockClock,
}

fn test_config() -> RaftConfig {
    RaftConfig {
        election_timeout: std::time::Duration::from_millis(ELECTION_TIMEOUT_MS),
        election_jitter: std::time::Duration::from_millis(ELECTION_JITTER_MS),
        retry_backoff: std::time::Duration::from_millis(RETRY_BACKOFF_MS),
        request_timeout: std::time::Duration::from_millis(REQUEST_TIMEOUT_MS),
        max_pending_sends: None,
    }
}

/// The jitter the client will draw on its n-th sample, given the fixed
/// test seed.
fn expected_jitter(draw: usize) -> u64 {
    let mut rng = fastrand::Rng::with_seed(RNG_SEED);
    let mut jitter = 0;
    for _ in 0..draw {
        jitter = rng.u64(0..ELECTION_JITTER_MS);
    }
    jitter
}

fn mock_host(id: i32) -> (String, u16) {
    ("localhost".to_string(), (9990 + id) as u16)
}

impl Harness {
    fn build(
        voters: &[i32],
        stored: Option<ElectionState>,
        prime_log: impl FnOnce(&mut MemoryLog),
    ) -> Self {
        let store = Arc::new(MemoryQuorumStateStore::new());
        if let Some(state) = stored {
            store.write(state).unwrap();
        }
        let log = Arc::new(Mutex::new(MemoryLog::new()));
        prime_log(&mut *log.lock());
        let channel = Arc::new(Mutex::new(MockChannel::new()));
        let clock = MockClock::new();

        let quorum = QuorumState::new(
            NodeId(LOCAL_ID),
            voters.iter().map(|&v| NodeId(v)),
            store.clone(),
        );
        let client = RaftClient::new(
            channel.clone(),
            log.clone(),
            quorum,
            Arc::new(clock.clone()),
            fastrand::Rng::with_seed(RNG_SEED),
            mock_host(LOCAL_ID).0,
            mock_host(LOCAL_ID).1,
            test_config(),
        )
        .unwrap();

        Harness {
            client,
            channel,
            log,
            store,
            clock,
        }
    }

    fn new(voters: &[i32]) -> Self {
        Self::build(voters, None, |_| {})
    }

    fn poll(&mut self) {
        self.client.poll(0).unwrap();
    }

    fn poll_until_send(&mut self) {
        for _ in 0..10 {
            self.poll();
            if self.channel.lock().has_sent_messages() {
                return;
            }
        }
        panic!("client never sent a message");
    }

    fn drain_sent(&mut self) -> Vec<RaftMessage> {
        self.channel.lock().drain_send_queue()
    }

    fn mock_receive(&mut self, message: RaftMessage) {
        self.channel.lock().mock_receive(message);
    }

    fn receive_response(
        &mut self,
        correlation_id: CorrelationId,
        source: i32,
        response: ResponsePayload,
    ) {
        self.mock_receive(RaftMessage::InboundResponse {
            correlation_id,
            source: NodeId(source),
            response,
        });
    }

    fn receive_request(&mut self, request: RequestPayload) -> CorrelationId {
        let correlation_id = self.channel.lock().new_correlation_id();
        let received_at_ms = self.clock.now_ms();
        self.mock_receive(RaftMessage::InboundRequest {
            correlation_id,
            request,
            received_at_ms,
        });
        correlation_id
    }

    fn stored_state(&self) -> ElectionState {
        self.store.read().unwrap().expect("nothing persisted")
    }

    fn end_offset(&self) -> u64 {
        self.log.lock().end_offset()
    }

    // -- sent-message assertions ------------------------------------------

    fn assert_sent_find_quorum(&mut self) -> CorrelationId {
        let sent = self.drain_sent();
        assert_eq!(sent.len(), 1, "expected exactly one message, got {:?}", sent);
        match &sent[0] {
            RaftMessage::OutboundRequest {
                correlation_id,
                request: RequestPayload::FindQuorum(request),
                ..
            } => {
                assert_eq!(request.replica_id, NodeId(LOCAL_ID));
                *correlation_id
            }
            other => panic!("expected FindQuorum request, got {:?}", other),
        }
    }

    fn collect_vote_requests(
        &mut self,
        epoch: i32,
        last_epoch: i32,
        last_epoch_end_offset: u64,
    ) -> Vec<(CorrelationId, NodeId)> {
        self.drain_sent()
            .into_iter()
            .filter_map(|message| match message {
                RaftMessage::OutboundRequest {
                    correlation_id,
                    destination,
                    request: RequestPayload::Vote(request),
                } => {
                    assert_eq!(request.candidate_epoch, epoch);
                    assert_eq!(request.candidate_id, NodeId(LOCAL_ID));
                    assert_eq!(request.last_epoch, last_epoch);
                    assert_eq!(request.last_epoch_end_offset, last_epoch_end_offset);
                    Some((correlation_id, destination))
                }
                _ => None,
            })
            .collect()
    }

    fn assert_sent_vote_request(
        &mut self,
        epoch: i32,
        last_epoch: i32,
        last_epoch_end_offset: u64,
    ) -> CorrelationId {
        let requests = self.collect_vote_requests(epoch, last_epoch, last_epoch_end_offset);
        assert_eq!(requests.len(), 1);
        requests[0].0
    }

    fn assert_sent_begin_quorum_epoch(&mut self, epoch: i32) -> CorrelationId {
        let sent = self.drain_sent();
        assert_eq!(sent.len(), 1, "expected exactly one message, got {:?}", sent);
        match &sent[0] {
            RaftMessage::OutboundRequest {
                correlation_id,
                request: RequestPayload::BeginQuorumEpoch(request),
                ..
            } => {
                assert_eq!(request.leader_epoch, epoch);
                assert_eq!(request.leader_id, NodeId(LOCAL_ID));
                *correlation_id
            }
            other => panic!("expected BeginQuorumEpoch request, got {:?}", other),
        }
    }

    fn assert_sent_end_quorum_epoch(&mut self, epoch: i32) -> CorrelationId {
        let sent = self.drain_sent();
        assert_eq!(sent.len(), 1, "expected exactly one message, got {:?}", sent);
        match &sent[0] {
            RaftMessage::OutboundRequest {
                correlation_id,
                request: RequestPayload::EndQuorumEpoch(request),
                ..
            } => {
                assert_eq!(request.leader_epoch, epoch);
                assert_eq!(request.leader_id, NodeId(LOCAL_ID));
                assert_eq!(request.replica_id, NodeId(LOCAL_ID));
                *correlation_id
            }
            other => panic!("expected EndQuorumEpoch request, got {:?}", other),
        }
    }

    fn assert_sent_fetch(
        &mut self,
        epoch: i32,
        fetch_offset: u64,
        last_fetched_epoch: i32,
    ) -> CorrelationId {
        let sent = self.drain_sent();
        assert_eq!(sent.len(), 1, "expected exactly one message, got {:?}", sent);
        match &sent[0] {
            RaftMessage::OutboundRequest {
                correlation_id,
                request: RequestPayload::FetchQuorumRecords(request),
                ..
            } => {
                assert_eq!(request.leader_epoch, epoch);
                assert_eq!(request.fetch_offset, fetch_offset);
                assert_eq!(request.last_fetched_epoch, last_fetched_epoch);
                assert_eq!(request.replica_id, NodeId(LOCAL_ID));
                *correlation_id
            }
            other => panic!("expected FetchQuorumRecords request, got {:?}", other),
        }
    }

    fn assert_sent_fetch_response(&mut self, epoch: i32, leader: i32) -> FetchQuorumRecordsResponse {
        let sent = self.drain_sent();
        assert_eq!(sent.len(), 1, "expected exactly one message, got {:?}", sent);
        match &sent[0] {
            RaftMessage::OutboundResponse {
                response: ResponsePayload::FetchQuorumRecords(response),
                ..
            } => {
                assert_eq!(response.error_code, ErrorCode::None);
                assert_eq!(response.leader_epoch, epoch);
                assert_eq!(response.leader_id, NodeId(leader));
                response.clone()
            }
            other => panic!("expected FetchQuorumRecords response, got {:?}", other),
        }
    }

    fn assert_sent_find_quorum_response(&mut self, epoch: i32, leader: Option<i32>) {
        let sent = self.drain_sent();
        assert_eq!(sent.len(), 1, "expected exactly one message, got {:?}", sent);
        match &sent[0] {
            RaftMessage::OutboundResponse {
                response: ResponsePayload::FindQuorum(response),
                ..
            } => {
                assert_eq!(response.error_code, ErrorCode::None);
                assert_eq!(response.leader_epoch, epoch);
                assert_eq!(response.leader_id, NodeId(leader.unwrap_or(-1)));
            }
            other => panic!("expected FindQuorum response, got {:?}", other),
        }
    }
}

// ============================================================================
// Response / request builders
// ============================================================================

fn find_quorum_response(leader: i32, epoch: i32, voters: &[i32]) -> ResponsePayload {
    ResponsePayload::FindQuorum(FindQuorumResponse {
        error_code: ErrorCode::None,
        leader_epoch: epoch,
        leader_id: NodeId(leader),
        voters: voters
            .iter()
            .map(|&id| {
                let (host, port) = mock_host(id);
                VoterAddress {
                    voter_id: NodeId(id),
                    boot_timestamp: 0,
                    host,
                    port,
                }
            })
            .collect(),
    })
}

fn find_quorum_failure(error_code: ErrorCode) -> ResponsePayload {
    ResponsePayload::FindQuorum(FindQuorumResponse {
        error_code,
        leader_epoch: -1,
        leader_id: NodeId::INVALID,
        voters: Vec::new(),
    })
}

fn vote_response(granted: bool, leader: Option<i32>, epoch: i32) -> ResponsePayload {
    ResponsePayload::Vote(VoteResponse {
        error_code: ErrorCode::None,
        leader_epoch: epoch,
        leader_id: NodeId(leader.unwrap_or(-1)),
        vote_granted: granted,
    })
}

fn fetch_response(
    error_code: ErrorCode,
    epoch: i32,
    leader: i32,
    records: Vec<RecordBatch>,
    high_watermark: i64,
) -> ResponsePayload {
    ResponsePayload::FetchQuorumRecords(FetchQuorumRecordsResponse {
        error_code,
        leader_epoch: epoch,
        leader_id: NodeId(leader),
        high_watermark,
        records,
        next_fetch_offset: -1,
        next_fetch_offset_epoch: -1,
    })
}

fn out_of_range_fetch_response(
    epoch: i32,
    leader: i32,
    next_fetch_offset: i64,
    next_fetch_offset_epoch: i32,
    high_watermark: i64,
) -> ResponsePayload {
    ResponsePayload::FetchQuorumRecords(FetchQuorumRecordsResponse {
        error_code: ErrorCode::OffsetOutOfRange,
        leader_epoch: epoch,
        leader_id: NodeId(leader),
        high_watermark,
        records: Vec::new(),
        next_fetch_offset,
        next_fetch_offset_epoch,
    })
}

fn vote_request_payload(epoch: i32, candidate: i32) -> RequestPayload {
    RequestPayload::Vote(VoteRequest {
        candidate_epoch: epoch,
        candidate_id: NodeId(candidate),
        last_epoch: 0,
        last_epoch_end_offset: 0,
    })
}

fn begin_epoch_request(epoch: i32, leader: i32) -> RequestPayload {
    RequestPayload::BeginQuorumEpoch(BeginQuorumEpochRequest {
        leader_epoch: epoch,
        leader_id: NodeId(leader),
    })
}

fn fetch_request(epoch: i32, replica: i32, fetch_offset: u64, last_fetched_epoch: i32) -> RequestPayload {
    RequestPayload::FetchQuorumRecords(FetchQuorumRecordsRequest {
        leader_epoch: epoch,
        fetch_offset,
        last_fetched_epoch,
        replica_id: NodeId(replica),
    })
}

fn batch(base_offset: u64, epoch: i32, values: &[&str]) -> RecordBatch {
    RecordBatch {
        base_offset,
        epoch,
        is_control: false,
        records: values
            .iter()
            .enumerate()
            .map(|(i, value)| Record {
                offset: base_offset + i as u64,
                timestamp: -1,
                key: None,
                value: Bytes::copy_from_slice(value.as_bytes()),
            })
            .collect(),
    }
}

fn new_records(values: &[&str]) -> Vec<NewRecord> {
    values
        .iter()
        .map(|v| NewRecord::new(Bytes::copy_from_slice(v.as_bytes())))
        .collect()
}

// ============================================================================
// Initialization & elections
// ============================================================================

#[test]
fn test_initialize_single_member_quorum() {
    let mut harness = Harness::new(&[LOCAL_ID]);
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(1, NodeId(LOCAL_ID))
    );
    // Leader-change control record is in place before the first poll.
    assert_eq!(harness.end_offset(), 1);

    harness.poll();
    assert!(harness.drain_sent().is_empty());
}

#[test]
fn test_initialize_as_candidate_and_become_leader() {
    let other_node = 1;
    let mut harness = Harness::new(&[LOCAL_ID, other_node]);
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_voted_candidate(1, NodeId(LOCAL_ID))
    );

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(-1, 1, &[0, 1]));

    harness.poll_until_send();
    let vote_id = harness.assert_sent_vote_request(1, 0, 0);

    // Advance time a little so the control record timestamp is visible.
    harness.clock.sleep(3);
    let now = harness.clock.now_ms();
    harness.receive_response(vote_id, other_node, vote_response(true, None, 1));

    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(1, NodeId(LOCAL_ID))
    );
    assert_eq!(harness.end_offset(), 1);

    harness.poll();
    harness.assert_sent_begin_quorum_epoch(1);

    // The term opens with a control batch naming the other voters.
    let batches = harness.log.lock().read(0, Some(1));
    assert_eq!(batches.len(), 1);
    assert!(batches[0].is_control);
    let record = &batches[0].records[0];
    assert_eq!(record.timestamp, now as i64);
    let message = LeaderChangeMessage::from_record(record).unwrap();
    assert_eq!(message.leader_id, NodeId(LOCAL_ID));
    assert_eq!(message.voters.len(), 1);
    assert_eq!(message.voters[0].voter_id, NodeId(other_node));
}

#[test]
fn test_vote_request_timeout_late_response_still_counts() {
    let other_node = 1;
    let mut harness = Harness::new(&[LOCAL_ID, other_node]);

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(LOCAL_ID, 1, &[0, 1]));

    harness.poll_until_send();
    let first_vote_id = harness.assert_sent_vote_request(1, 0, 0);

    // The request times out and is re-issued.
    harness.clock.sleep(REQUEST_TIMEOUT_MS);
    harness.poll();
    let retry_vote_id = harness.assert_sent_vote_request(1, 0, 0);
    assert_ne!(first_vote_id, retry_vote_id);

    // The response to the original request arrives late but still counts.
    harness.receive_response(first_vote_id, other_node, vote_response(true, None, 1));
    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(1, NodeId(LOCAL_ID))
    );

    // The retry's response has no further effect.
    harness.receive_response(retry_vote_id, other_node, vote_response(true, None, 1));
    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(1, NodeId(LOCAL_ID))
    );
}

#[test]
fn test_retry_election_after_rejection() {
    let other_node = 1;
    let mut harness = Harness::new(&[LOCAL_ID, other_node]);

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(-1, 1, &[0, 1]));

    harness.poll_until_send();
    let vote_id = harness.assert_sent_vote_request(1, 0, 0);
    harness.receive_response(vote_id, other_node, vote_response(false, None, 1));
    harness.poll();

    // The rejection does not erase our own vote.
    let state = harness.stored_state();
    assert_eq!(state.epoch, 1);
    assert_eq!(state.voted_id(), Some(NodeId(LOCAL_ID)));

    // No new election until election timeout plus jitter has elapsed.
    let jitter = expected_jitter(1);
    harness.clock.sleep(ELECTION_TIMEOUT_MS + jitter - 1);
    harness.poll();
    assert_eq!(harness.stored_state().epoch, 1);
    assert!(harness.drain_sent().is_empty());

    harness.clock.sleep(1);
    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_voted_candidate(2, NodeId(LOCAL_ID))
    );
    harness.assert_sent_vote_request(2, 0, 0);
}

#[test]
fn test_initialize_as_follower_empty_log() {
    let other_node = 1;
    let mut harness = Harness::build(
        &[LOCAL_ID, other_node],
        Some(ElectionState::with_elected_leader(5, NodeId(other_node))),
        |_| {},
    );
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(5, NodeId(other_node))
    );

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(other_node, 5, &[0, 1]));

    harness.poll_until_send();
    harness.assert_sent_fetch(5, 0, 0);
}

#[test]
fn test_initialize_as_follower_non_empty_log() {
    let other_node = 1;
    let last_epoch = 3;
    let mut harness = Harness::build(
        &[LOCAL_ID, other_node],
        Some(ElectionState::with_elected_leader(5, NodeId(other_node))),
        |log| {
            log.append_as_leader(new_records(&["foo"]), last_epoch).unwrap();
        },
    );

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(other_node, 5, &[0, 1]));

    harness.poll_until_send();
    harness.assert_sent_fetch(5, 1, last_epoch);
}

#[test]
fn test_become_candidate_after_election_timeout() {
    let other_node = 1;
    let last_epoch = 3;
    let mut harness = Harness::build(
        &[LOCAL_ID, other_node],
        Some(ElectionState::with_elected_leader(5, NodeId(other_node))),
        |log| {
            log.append_as_leader(new_records(&["foo"]), last_epoch).unwrap();
        },
    );

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(other_node, 5, &[0, 1]));

    harness.poll_until_send();
    harness.assert_sent_fetch(5, 1, last_epoch);

    harness.clock.sleep(ELECTION_TIMEOUT_MS);
    harness.poll();
    harness.assert_sent_vote_request(6, last_epoch, 1);
}

// ============================================================================
// Observer discovery
// ============================================================================

#[test]
fn test_initialize_observer_no_previous_state() {
    let leader = 1;
    let mut harness = Harness::new(&[leader]);

    harness.poll();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(leader, 5, &[leader]));

    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(5, NodeId(leader))
    );
}

#[test]
fn test_observer_find_quorum_failure_retries_after_backoff() {
    let leader = 1;
    let mut harness = Harness::new(&[leader]);

    harness.poll();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(
        find_quorum_id,
        -1,
        find_quorum_failure(ErrorCode::UnknownServerError),
    );

    harness.poll();
    assert!(harness.drain_sent().is_empty());

    harness.clock.sleep(RETRY_BACKOFF_MS);
    harness.poll();
    let retry_id = harness.assert_sent_find_quorum();
    harness.receive_response(retry_id, -1, find_quorum_response(leader, 5, &[leader]));

    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(5, NodeId(leader))
    );
}

#[test]
fn test_observer_rediscovers_after_election_timeout() {
    let leader = 1;
    let mut harness = Harness::new(&[leader]);

    harness.poll();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(leader, 5, &[leader]));

    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(5, NodeId(leader))
    );

    harness.clock.sleep(ELECTION_TIMEOUT_MS);
    harness.poll();
    harness.assert_sent_find_quorum();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_unknown_leader(5)
    );
}

#[test]
fn test_observer_rediscovery_after_broker_not_available() {
    let leader = 1;
    let mut harness = Harness::new(&[leader]);

    harness.poll();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(leader, 5, &[leader]));

    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(5, NodeId(leader))
    );

    harness.poll();
    let fetch_id = harness.assert_sent_fetch(5, 0, 0);

    harness.receive_response(
        fetch_id,
        leader,
        fetch_response(ErrorCode::BrokerNotAvailable, 5, leader, Vec::new(), 0),
    );
    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_unknown_leader(5)
    );

    harness.poll();
    harness.assert_sent_find_quorum();
}

#[test]
fn test_observer_rediscovery_after_fetch_timeout() {
    let leader = 1;
    let mut harness = Harness::new(&[leader]);

    harness.poll();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(leader, 5, &[leader]));

    harness.poll_until_send();
    harness.assert_sent_fetch(5, 0, 0);

    harness.clock.sleep(REQUEST_TIMEOUT_MS);
    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_unknown_leader(5)
    );

    harness.poll();
    harness.assert_sent_find_quorum();
}

// ============================================================================
// Stale responses
// ============================================================================

#[test]
fn test_fetch_response_ignored_after_becoming_candidate() {
    let other_node = 1;
    let mut harness = Harness::build(
        &[LOCAL_ID, other_node],
        Some(ElectionState::with_elected_leader(5, NodeId(other_node))),
        |_| {},
    );

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(-1, 1, &[0, 1]));

    harness.poll_until_send();
    let fetch_id = harness.assert_sent_fetch(5, 0, 0);

    harness.clock.sleep(ELECTION_TIMEOUT_MS);
    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_voted_candidate(6, NodeId(LOCAL_ID))
    );
    harness.drain_sent();

    // The stale fetch response returns with records, but must be ignored.
    harness.receive_response(
        fetch_id,
        other_node,
        fetch_response(
            ErrorCode::None,
            5,
            other_node,
            vec![batch(0, 3, &["a", "b"])],
            0,
        ),
    );
    harness.poll();
    assert_eq!(harness.end_offset(), 0);
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_voted_candidate(6, NodeId(LOCAL_ID))
    );
}

#[test]
fn test_fetch_response_ignored_after_becoming_follower_of_different_leader() {
    let voter2 = 1;
    let voter3 = 2;
    let mut harness = Harness::build(
        &[LOCAL_ID, voter2, voter3],
        Some(ElectionState::with_elected_leader(5, NodeId(voter2))),
        |_| {},
    );

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(-1, 1, &[0, 1, 2]));

    harness.poll_until_send();
    let fetch_id = harness.assert_sent_fetch(5, 0, 0);

    harness.receive_request(begin_epoch_request(6, voter3));
    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(6, NodeId(voter3))
    );
    harness.drain_sent();

    harness.receive_response(
        fetch_id,
        voter2,
        fetch_response(
            ErrorCode::None,
            5,
            voter2,
            vec![batch(0, 3, &["a", "b"])],
            0,
        ),
    );
    harness.poll();
    assert_eq!(harness.end_offset(), 0);
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(6, NodeId(voter3))
    );
}

#[test]
fn test_vote_response_ignored_after_becoming_follower() {
    let voter2 = 1;
    let voter3 = 2;
    let mut harness = Harness::build(
        &[LOCAL_ID, voter2, voter3],
        Some(ElectionState::with_voted_candidate(5, NodeId(LOCAL_ID))),
        |_| {},
    );

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(-1, 1, &[0, 1, 2]));

    harness.poll_until_send();
    let vote_requests = harness.collect_vote_requests(5, 0, 0);
    assert_eq!(vote_requests.len(), 2);

    // While the votes are inflight, the quorum elects someone else.
    harness.receive_request(begin_epoch_request(5, voter3));
    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(5, NodeId(voter3))
    );
    harness.drain_sent();

    harness.receive_response(vote_requests[0].0, voter2, vote_response(false, None, 5));
    harness.receive_response(vote_requests[1].0, voter3, vote_response(false, Some(voter3), 5));
    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(5, NodeId(voter3))
    );
}

// ============================================================================
// Replication
// ============================================================================

#[test]
fn test_follower_replication() {
    let other_node = 1;
    let mut harness = Harness::build(
        &[LOCAL_ID, other_node],
        Some(ElectionState::with_elected_leader(5, NodeId(other_node))),
        |_| {},
    );

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(other_node, 5, &[0, 1]));

    harness.poll_until_send();
    let fetch_id = harness.assert_sent_fetch(5, 0, 0);

    harness.receive_response(
        fetch_id,
        other_node,
        fetch_response(
            ErrorCode::None,
            5,
            other_node,
            vec![batch(0, 3, &["a", "b"])],
            2,
        ),
    );
    harness.poll();
    assert_eq!(harness.end_offset(), 2);
    assert_eq!(harness.client.high_watermark(), 2);
}

#[test]
fn test_follower_log_reconciliation() {
    let other_node = 1;
    let last_epoch = 3;
    let mut harness = Harness::build(
        &[LOCAL_ID, other_node],
        Some(ElectionState::with_elected_leader(5, NodeId(other_node))),
        |log| {
            log.append_as_leader(new_records(&["foo", "bar"]), last_epoch)
                .unwrap();
            log.append_as_leader(new_records(&["baz"]), last_epoch).unwrap();
        },
    );
    assert_eq!(harness.end_offset(), 3);

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(other_node, 5, &[0, 1]));

    harness.poll_until_send();
    let fetch_id = harness.assert_sent_fetch(5, 3, last_epoch);

    harness.receive_response(
        fetch_id,
        other_node,
        out_of_range_fetch_response(5, other_node, 2, last_epoch, 1),
    );

    // The next poll completes the truncation, the one after resumes
    // fetching at the divergence point.
    harness.poll();
    assert_eq!(harness.end_offset(), 2);

    harness.poll();
    harness.assert_sent_fetch(5, 2, last_epoch);
}

#[test]
fn test_append_to_non_leader_fails() {
    let other_node = 1;
    let mut harness = Harness::build(
        &[LOCAL_ID, other_node],
        Some(ElectionState::with_elected_leader(5, NodeId(other_node))),
        |_| {},
    );

    let mut future = harness.client.append(new_records(&["a", "b", "c"]));
    harness.poll();

    match future.try_recv().expect("append future not completed") {
        Err(RaftError::NotLeaderForPartition) => {}
        other => panic!("unexpected append completion: {:?}", other),
    }
}

#[test]
fn test_leader_append_single_member_quorum() {
    let mut harness = Harness::new(&[LOCAL_ID]);
    let boot_time = harness.clock.now_ms();

    // A single-voter quorum advances the watermark to the end offset on
    // every poll; the first poll covers the leader-change record.
    harness.poll();
    assert_eq!(harness.client.high_watermark(), 1);

    let mut future = harness.client.append(new_records(&["a", "b", "c"]));
    harness.poll();
    assert_eq!(harness.client.high_watermark(), 4);
    let offset_and_epoch = future
        .try_recv()
        .expect("append future not completed")
        .unwrap();
    assert_eq!(offset_and_epoch, OffsetAndEpoch::new(1, 1));

    // Read the log back through the fetch path.
    let observer = 1;
    harness.receive_request(fetch_request(1, observer, 0, 0));
    harness.poll();

    let response = harness.assert_sent_fetch_response(1, LOCAL_ID);
    assert_eq!(response.high_watermark, 4);
    assert_eq!(response.records.len(), 2);

    let leader_change_batch = &response.records[0];
    assert!(leader_change_batch.is_control);
    assert_eq!(leader_change_batch.record_count(), 1);
    let record = &leader_change_batch.records[0];
    assert_eq!(record.timestamp, boot_time as i64);
    let message = LeaderChangeMessage::from_record(record).unwrap();
    assert_eq!(message.leader_id, NodeId(LOCAL_ID));
    assert!(message.voters.is_empty());

    let data_batch = &response.records[1];
    assert_eq!(data_batch.epoch, 1);
    assert_eq!(data_batch.record_count(), 3);
    for (record, value) in data_batch.records.iter().zip(["a", "b", "c"]) {
        assert_eq!(record.value, Bytes::copy_from_slice(value.as_bytes()));
    }
}

#[test]
fn test_fetch_treated_as_leader_endorsement() {
    let other_node = 1;
    let mut harness = Harness::build(
        &[LOCAL_ID, other_node],
        Some(ElectionState::with_elected_leader(5, NodeId(LOCAL_ID))),
        |_| {},
    );
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(5, NodeId(LOCAL_ID))
    );

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(LOCAL_ID, 5, &[0, 1]));

    // We push BeginQuorumEpoch, but the voter finds us through discovery
    // and starts fetching instead.
    harness.poll_until_send();
    harness.assert_sent_begin_quorum_epoch(5);

    harness.receive_request(fetch_request(5, other_node, 0, 0));
    harness.poll();
    harness.assert_sent_fetch_response(5, LOCAL_ID);

    // The BeginQuorumEpoch request times out, but the fetch already
    // endorsed this leadership: nothing is re-sent.
    harness.clock.sleep(REQUEST_TIMEOUT_MS);
    harness.poll();
    assert!(harness.drain_sent().is_empty());
}

#[test]
fn test_leader_rejects_stale_epoch_fetch() {
    let mut harness = Harness::build(
        &[LOCAL_ID],
        Some(ElectionState::with_elected_leader(5, NodeId(LOCAL_ID))),
        |_| {},
    );

    harness.receive_request(fetch_request(4, 1, 0, 0));
    harness.poll();

    let sent = harness.drain_sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        RaftMessage::OutboundResponse {
            response: ResponsePayload::FetchQuorumRecords(response),
            ..
        } => {
            assert_eq!(response.error_code, ErrorCode::FencedLeaderEpoch);
            assert_eq!(response.leader_epoch, -1);
            assert_eq!(response.leader_id, NodeId::INVALID);
        }
        other => panic!("expected fetch response, got {:?}", other),
    }
}

#[test]
fn test_leader_reports_divergence_point() {
    let mut harness = Harness::new(&[LOCAL_ID]);
    let mut future = harness.client.append(new_records(&["a", "b"]));
    harness.poll();
    future.try_recv().unwrap().unwrap();
    assert_eq!(harness.end_offset(), 3);

    // Fetching past the end of the log diverges.
    harness.receive_request(fetch_request(1, 1, 5, 1));
    harness.poll();
    let sent = harness.drain_sent();
    match &sent[0] {
        RaftMessage::OutboundResponse {
            response: ResponsePayload::FetchQuorumRecords(response),
            ..
        } => {
            assert_eq!(response.error_code, ErrorCode::OffsetOutOfRange);
            assert_eq!(response.next_fetch_offset, 3);
            assert_eq!(response.next_fetch_offset_epoch, 1);
        }
        other => panic!("expected fetch response, got {:?}", other),
    }

    // So does a matching offset with the wrong epoch anchor.
    harness.receive_request(fetch_request(1, 1, 2, 7));
    harness.poll();
    let sent = harness.drain_sent();
    match &sent[0] {
        RaftMessage::OutboundResponse {
            response: ResponsePayload::FetchQuorumRecords(response),
            ..
        } => {
            assert_eq!(response.error_code, ErrorCode::OffsetOutOfRange);
        }
        other => panic!("expected fetch response, got {:?}", other),
    }
}

#[test]
fn test_leader_advances_high_watermark_on_voter_fetch() {
    let other_node = 1;
    let mut harness = Harness::new(&[LOCAL_ID, other_node]);

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(-1, 1, &[0, 1]));

    harness.poll_until_send();
    let vote_id = harness.assert_sent_vote_request(1, 0, 0);
    harness.receive_response(vote_id, other_node, vote_response(true, None, 1));
    harness.poll();
    harness.drain_sent();

    // Nothing is committed until the other voter has fetched past it.
    assert_eq!(harness.client.high_watermark(), 0);
    assert_eq!(harness.end_offset(), 1);

    harness.receive_request(fetch_request(1, other_node, 1, 1));
    harness.poll();
    assert_eq!(harness.client.high_watermark(), 1);

    // The high watermark never regresses.
    harness.receive_request(fetch_request(1, other_node, 0, 0));
    harness.poll();
    assert_eq!(harness.client.high_watermark(), 1);
}

// ============================================================================
// FindQuorum serving
// ============================================================================

#[test]
fn test_leader_handles_find_quorum() {
    let mut harness = Harness::new(&[LOCAL_ID]);

    let observer = 1;
    harness.receive_request(RequestPayload::FindQuorum(FindQuorumRequest {
        replica_id: NodeId(observer),
    }));
    harness.poll();
    harness.assert_sent_find_quorum_response(1, Some(LOCAL_ID));
}

#[test]
fn test_find_quorum_response_lists_known_voter_endpoints() {
    let mut harness = Harness::new(&[LOCAL_ID]);
    harness.receive_request(RequestPayload::FindQuorum(FindQuorumRequest {
        replica_id: NodeId(7),
    }));
    harness.poll();

    let sent = harness.drain_sent();
    match &sent[0] {
        RaftMessage::OutboundResponse {
            response: ResponsePayload::FindQuorum(response),
            ..
        } => {
            assert_eq!(response.voters.len(), 1);
            assert_eq!(response.voters[0].voter_id, NodeId(LOCAL_ID));
            assert_eq!(response.voters[0].host, "localhost");
            assert_eq!(response.voters[0].port, 9990);
        }
        other => panic!("expected FindQuorum response, got {:?}", other),
    }
}

// ============================================================================
// Graceful shutdown
// ============================================================================

#[test]
fn test_leader_graceful_shutdown() {
    let other_node = 1;
    let mut harness = Harness::new(&[LOCAL_ID, other_node]);

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(-1, 1, &[0, 1]));

    harness.poll_until_send();
    let vote_id = harness.assert_sent_vote_request(1, 0, 0);
    harness.receive_response(vote_id, other_node, vote_response(true, None, 1));
    harness.poll();
    assert_eq!(
        harness.stored_state(),
        ElectionState::with_elected_leader(1, NodeId(LOCAL_ID))
    );
    harness.drain_sent();

    harness.client.shutdown(5_000);
    assert!(harness.client.is_running());

    // The leader drains by notifying the quorum.
    harness.poll();
    assert!(harness.client.is_running());
    harness.assert_sent_end_quorum_epoch(1);

    // Any evidence of a bumped epoch completes the shutdown.
    harness.receive_request(vote_request_payload(2, other_node));
    harness.poll();
    assert!(!harness.client.is_running());
}

#[test]
fn test_leader_graceful_shutdown_timeout() {
    let other_node = 1;
    let mut harness = Harness::new(&[LOCAL_ID, other_node]);

    harness.poll_until_send();
    let find_quorum_id = harness.assert_sent_find_quorum();
    harness.receive_response(find_quorum_id, -1, find_quorum_response(-1, 1, &[0, 1]));

    harness.poll_until_send();
    let vote_id = harness.assert_sent_vote_request(1, 0, 0);
    harness.receive_response(vote_id, other_node, vote_response(true, None, 1));
    harness.poll();
    harness.drain_sent();

    harness.client.shutdown(5_000);
    harness.poll();
    assert!(harness.client.is_running());
    harness.assert_sent_end_quorum_epoch(1);

    // No epoch bump arrives; the deadline finishes the drain.
    harness.clock.sleep(5_000);
    harness.poll();
    assert!(!harness.client.is_running());
}

#[test]
fn test_follower_graceful_shutdown() {
    let other_node = 1;
    let mut harness = Harness::build(
        &[LOCAL_ID, other_node],
        Some(ElectionState::with_elected_leader(5, NodeId(other_node))),
        |_| {},
    );

    harness.poll();

    harness.client.shutdown(5_000);
    assert!(harness.client.is_running());
    harness.poll();
    assert!(!harness.client.is_running());
}

#[test]
fn test_graceful_shutdown_single_member_quorum() {
    let mut harness = Harness::new(&[LOCAL_ID]);
    harness.poll();
    assert!(harness.drain_sent().is_empty());

    harness.client.shutdown(5_000);
    assert!(harness.client.is_running());
    harness.poll();
    assert!(!harness.client.is_running());
}

// ============================================================================
// Durability & correlation discipline
// ============================================================================

#[test]
fn test_vote_survives_restart() {
    let other_node = 1;
    let store = Arc::new(MemoryQuorumStateStore::new());

    {
        let quorum = QuorumState::new(
            NodeId(LOCAL_ID),
            [NodeId(LOCAL_ID), NodeId(other_node)],
            store.clone(),
        );
        let _client = RaftClient::new(
            Arc::new(Mutex::new(MockChannel::new())),
            Arc::new(Mutex::new(MemoryLog::new())),
            quorum,
            Arc::new(MockClock::new()),
            fastrand::Rng::with_seed(RNG_SEED),
            "localhost",
            9990,
            test_config(),
        )
        .unwrap();
    }
    assert_eq!(
        store.read().unwrap(),
        Some(ElectionState::with_voted_candidate(1, NodeId(LOCAL_ID)))
    );

    // A restarted client resumes the same candidacy instead of voting anew.
    let quorum = QuorumState::new(
        NodeId(LOCAL_ID),
        [NodeId(LOCAL_ID), NodeId(other_node)],
        store.clone(),
    );
    let client = RaftClient::new(
        Arc::new(Mutex::new(MockChannel::new())),
        Arc::new(Mutex::new(MemoryLog::new())),
        quorum,
        Arc::new(MockClock::new()),
        fastrand::Rng::with_seed(RNG_SEED),
        "localhost",
        9990,
        test_config(),
    )
    .unwrap();
    assert!(client.quorum().is_candidate());
    assert_eq!(client.epoch(), 1);
    assert_eq!(
        store.read().unwrap(),
        Some(ElectionState::with_voted_candidate(1, NodeId(LOCAL_ID)))
    );
}

#[test]
fn test_outbound_correlation_ids_are_unique() {
    let other_node = 1;
    let mut harness = Harness::new(&[LOCAL_ID, other_node]);

    let mut seen = std::collections::HashSet::new();
    harness.poll_until_send();
    for message in harness.drain_sent() {
        assert!(seen.insert(message.correlation_id()));
    }

    // Trigger a few election rounds worth of traffic.
    for _ in 0..3 {
        harness.clock.sleep(ELECTION_TIMEOUT_MS + ELECTION_JITTER_MS);
        harness.poll();
        for message in harness.drain_sent() {
            if let RaftMessage::OutboundRequest { correlation_id, .. } = message {
                assert!(seen.insert(correlation_id), "correlation id reused");
            }
        }
    }
}
