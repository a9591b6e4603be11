//! The consensus client: a single-threaded poll loop driving elections,
//! replication, and the high-watermark for one log partition.
//!
//! All work happens inside [`RaftClient::poll`]: timer-driven transitions
//! first, then outbound requests for the current role, then one receive on
//! the network channel, then dispatch of whatever came back. The only
//! cross-thread edge is the append mailbox, drained at the top of each
//! poll.
//!
//! Correlation entries for outbound requests are kept until a response
//! arrives or the role/epoch changes. A request that timed out may be
//! re-issued, but a late response to the original is still honored while
//! the role is unchanged; any role or epoch transition discards the whole
//! table, which is what makes stale responses harmless.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::channel::NetworkChannel;
use crate::clock::Clock;
use crate::config::RaftConfig;
use crate::error::{ErrorCode, RaftError, Result};
use crate::log::ReplicatedLog;
use crate::message::{
    ApiKey, BeginQuorumEpochRequest, BeginQuorumEpochResponse, EndQuorumEpochRequest,
    EndQuorumEpochResponse, FetchQuorumRecordsRequest, FetchQuorumRecordsResponse,
    FindQuorumRequest, FindQuorumResponse, RaftMessage, RequestPayload, ResponsePayload,
    VoteRequest, VoteResponse, VoterAddress,
};
use crate::quorum::QuorumState;
use crate::record::{LeaderChangeMessage, NewRecord};
use crate::types::{CorrelationId, NodeId, OffsetAndEpoch};

/// Completion handle for an append: resolves to the base offset and epoch
/// of the written batch, or `NotLeaderForPartition`.
pub type AppendFuture = oneshot::Receiver<Result<OffsetAndEpoch>>;

struct PendingAppend {
    records: Vec<NewRecord>,
    completion: oneshot::Sender<Result<OffsetAndEpoch>>,
}

/// Cloneable handle for submitting appends from the application thread.
#[derive(Clone)]
pub struct AppendHandle {
    tx: mpsc::UnboundedSender<PendingAppend>,
}

impl AppendHandle {
    pub fn append(&self, records: Vec<NewRecord>) -> AppendFuture {
        let (completion, future) = oneshot::channel();
        if let Err(mpsc::error::SendError(pending)) =
            self.tx.send(PendingAppend { records, completion })
        {
            let _ = pending.completion.send(Err(RaftError::NotLeaderForPartition));
        }
        future
    }
}

#[derive(Debug, Clone, Copy)]
struct InflightRequest {
    api_key: ApiKey,
    destination: NodeId,
    deadline_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct GracefulShutdown {
    deadline_ms: u64,
    epoch: i32,
}

/// Raft-style consensus client for a single replicated-log partition.
pub struct RaftClient<C: NetworkChannel, L: ReplicatedLog> {
    config: RaftConfig,
    channel: C,
    log: L,
    quorum: QuorumState,
    clock: Arc<dyn Clock>,
    rng: fastrand::Rng,
    voter_addresses: BTreeMap<NodeId, VoterAddress>,
    inflight: HashMap<CorrelationId, InflightRequest>,
    peer_backoff_until: BTreeMap<NodeId, u64>,
    discovery_backoff_until_ms: u64,
    high_watermark: u64,
    appends_tx: mpsc::UnboundedSender<PendingAppend>,
    appends_rx: mpsc::UnboundedReceiver<PendingAppend>,
    shutdown: Option<GracefulShutdown>,
    running: bool,
}

impl<C: NetworkChannel, L: ReplicatedLog> RaftClient<C, L> {
    /// Build and initialize the client.
    ///
    /// Recovers the role from the persisted election record: a fresh voter
    /// starts a candidacy right away, a single-member quorum elects itself
    /// and appends the leader-change record before the first poll.
    pub fn new(
        mut channel: C,
        log: L,
        mut quorum: QuorumState,
        clock: Arc<dyn Clock>,
        rng: fastrand::Rng,
        host: impl Into<String>,
        port: u16,
        config: RaftConfig,
    ) -> Result<Self> {
        if let Err(errors) = config.validate() {
            return Err(RaftError::Config(errors.join(", ")));
        }

        quorum.initialize(log.end_offset())?;

        let now_ms = clock.now_ms();
        let local_address = VoterAddress {
            voter_id: quorum.local_id(),
            boot_timestamp: now_ms as i64,
            host: host.into(),
            port,
        };
        let mut voter_addresses = BTreeMap::new();
        if quorum.is_voter(quorum.local_id()) {
            voter_addresses.insert(quorum.local_id(), local_address.clone());
        }
        channel.update_endpoint(
            local_address.voter_id,
            format!("{}:{}", local_address.host, local_address.port),
        );

        let (appends_tx, appends_rx) = mpsc::unbounded_channel();
        let mut client = Self {
            config,
            channel,
            log,
            quorum,
            clock,
            rng,
            voter_addresses,
            inflight: HashMap::new(),
            peer_backoff_until: BTreeMap::new(),
            discovery_backoff_until_ms: 0,
            high_watermark: 0,
            appends_tx,
            appends_rx,
            shutdown: None,
            running: true,
        };

        if client.quorum.is_candidate() && client.quorum.majority_reached() {
            client.on_election_won(now_ms)?;
        } else if client.quorum.is_leader() {
            // Resumed leadership from persisted state: reopen the term with
            // a fresh leader-change record.
            client.append_leader_change()?;
        }
        client.rearm_election_timer(now_ms);
        Ok(client)
    }

    /// Perform one quantum of work, blocking in the channel for at most
    /// `timeout_ms` (clamped to the next deadline).
    pub fn poll(&mut self, timeout_ms: u64) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        let now_ms = self.clock.now_ms();
        if self.complete_shutdown_if_due(now_ms) {
            return Ok(());
        }

        self.handle_election_timeout(now_ms)?;
        self.handle_request_timeouts(now_ms)?;
        self.drain_appends();
        self.send_outbound_requests(now_ms)?;

        let receive_timeout = self.receive_timeout_ms(now_ms, timeout_ms);
        let messages = self.channel.receive(receive_timeout)?;
        let now_ms = self.clock.now_ms();
        for message in messages {
            // Re-read role and epoch per message: an earlier one may have
            // made a later one obsolete.
            self.handle_message(message, now_ms)?;
        }

        self.maybe_complete_shutdown_after_epoch_bump();
        self.update_high_watermark();
        Ok(())
    }

    /// Append records as leader at the current epoch. The returned future
    /// resolves on a subsequent poll.
    pub fn append(&self, records: Vec<NewRecord>) -> AppendFuture {
        self.append_handle().append(records)
    }

    /// Handle for appending from another thread.
    pub fn append_handle(&self) -> AppendHandle {
        AppendHandle {
            tx: self.appends_tx.clone(),
        }
    }

    /// Begin a graceful shutdown. Non-blocking: the caller keeps polling
    /// until [`is_running`](Self::is_running) turns false. A leader drains
    /// by notifying the quorum with EndQuorumEpoch and waits for the epoch
    /// to move on (or the deadline); everyone else stops on the next poll.
    pub fn shutdown(&mut self, timeout_ms: u64) {
        if self.shutdown.is_none() {
            let deadline_ms = self.clock.now_ms() + timeout_ms;
            info!(deadline_ms, "shutdown requested");
            self.shutdown = Some(GracefulShutdown {
                deadline_ms,
                epoch: self.quorum.epoch(),
            });
            self.channel.wakeup();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Unblock a concurrent poll.
    pub fn wakeup(&self) {
        self.channel.wakeup();
    }

    pub fn high_watermark(&self) -> u64 {
        self.high_watermark
    }

    pub fn quorum(&self) -> &QuorumState {
        &self.quorum
    }

    pub fn epoch(&self) -> i32 {
        self.quorum.epoch()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.quorum.leader_id()
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn election_jitter_ms(&mut self) -> u64 {
        let bound = self.config.election_jitter_ms();
        if bound == 0 {
            0
        } else {
            self.rng.u64(0..bound)
        }
    }

    fn rearm_election_timer(&mut self, now_ms: u64) {
        let deadline = if self.quorum.is_candidate() {
            now_ms + self.config.election_timeout_ms() + self.election_jitter_ms()
        } else {
            now_ms + self.config.election_timeout_ms()
        };
        self.quorum.arm_election_timer(deadline);
    }

    fn handle_election_timeout(&mut self, now_ms: u64) -> Result<()> {
        let Some(deadline) = self.quorum.election_deadline_ms() else {
            return Ok(());
        };
        if now_ms < deadline {
            return Ok(());
        }
        if self.quorum.is_observer() {
            // Nothing to elect; go back to discovery in case the leader
            // moved without telling us.
            if self.quorum.leader_id().is_some() {
                info!(epoch = self.quorum.epoch(), "observer lost contact with leader");
                self.become_unattached(self.quorum.epoch(), now_ms)?;
            } else {
                self.rearm_election_timer(now_ms);
            }
        } else {
            info!(epoch = self.quorum.epoch(), "election timeout");
            self.become_candidate(now_ms)?;
        }
        Ok(())
    }

    fn handle_request_timeouts(&mut self, now_ms: u64) -> Result<()> {
        // A timed-out fetch means the leader is unreachable; drop it and
        // rediscover. Other expired requests just become eligible for
        // re-issue, their correlation entries stay live for late replies.
        let fetch_to_leader_expired = self.inflight.values().any(|request| {
            request.api_key == ApiKey::FetchQuorumRecords
                && request.deadline_ms <= now_ms
                && Some(request.destination) == self.quorum.leader_id()
        });
        if fetch_to_leader_expired {
            warn!(
                epoch = self.quorum.epoch(),
                leader = ?self.quorum.leader_id(),
                "fetch to leader timed out"
            );
            self.become_unattached(self.quorum.epoch(), now_ms)?;
        }
        Ok(())
    }

    fn receive_timeout_ms(&self, now_ms: u64, timeout_ms: u64) -> u64 {
        let mut timeout = timeout_ms;
        let mut clamp = |deadline: u64| {
            timeout = timeout.min(deadline.saturating_sub(now_ms));
        };
        if let Some(deadline) = self.quorum.election_deadline_ms() {
            clamp(deadline);
        }
        if let Some(shutdown) = &self.shutdown {
            clamp(shutdown.deadline_ms);
        }
        if let Some(deadline) = self.inflight.values().map(|r| r.deadline_ms).min() {
            clamp(deadline);
        }
        if self.discovery_backoff_until_ms > now_ms {
            clamp(self.discovery_backoff_until_ms);
        }
        timeout
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn reset_connections(&mut self) {
        self.inflight.clear();
        self.peer_backoff_until.clear();
    }

    fn become_candidate(&mut self, now_ms: u64) -> Result<()> {
        self.quorum.become_candidate()?;
        self.reset_connections();
        self.rearm_election_timer(now_ms);
        Ok(())
    }

    fn become_follower(&mut self, epoch: i32, leader_id: NodeId, now_ms: u64) -> Result<()> {
        if self.quorum.become_follower(epoch, leader_id)? {
            self.reset_connections();
        }
        self.rearm_election_timer(now_ms);
        Ok(())
    }

    fn become_unattached(&mut self, epoch: i32, now_ms: u64) -> Result<()> {
        self.quorum.become_unattached(epoch)?;
        self.reset_connections();
        self.rearm_election_timer(now_ms);
        Ok(())
    }

    fn grant_vote(&mut self, epoch: i32, candidate_id: NodeId, now_ms: u64) -> Result<()> {
        self.quorum.record_vote(epoch, candidate_id)?;
        self.reset_connections();
        self.rearm_election_timer(now_ms);
        Ok(())
    }

    /// A candidate has collected a majority: assume leadership and open
    /// the term with the leader-change control record.
    fn on_election_won(&mut self, _now_ms: u64) -> Result<()> {
        self.quorum.become_leader(self.log.end_offset())?;
        self.reset_connections();
        self.append_leader_change()
    }

    fn append_leader_change(&mut self) -> Result<()> {
        let epoch = self.quorum.epoch();
        let message = LeaderChangeMessage::new(
            self.quorum.local_id(),
            self.quorum.remote_voters().collect::<Vec<_>>(),
        );
        let timestamp = self.clock.now_ms() as i64;
        self.log.append_leader_change(message, epoch, timestamp)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Appends
    // ------------------------------------------------------------------

    fn drain_appends(&mut self) {
        while let Ok(pending) = self.appends_rx.try_recv() {
            if !self.quorum.is_leader() {
                let _ = pending
                    .completion
                    .send(Err(RaftError::NotLeaderForPartition));
                continue;
            }
            let epoch = self.quorum.epoch();
            match self.log.append_as_leader(pending.records, epoch) {
                Ok(base_offset) => {
                    let _ = pending
                        .completion
                        .send(Ok(OffsetAndEpoch::new(base_offset, epoch)));
                }
                Err(e) => {
                    error!(error = %e, "leader append failed");
                    let _ = pending.completion.send(Err(e));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound requests
    // ------------------------------------------------------------------

    fn has_live_inflight(&self, api_key: ApiKey, destination: NodeId, now_ms: u64) -> bool {
        self.inflight.values().any(|request| {
            request.api_key == api_key
                && request.destination == destination
                && request.deadline_ms > now_ms
        })
    }

    fn peer_ready(&self, peer: NodeId, now_ms: u64) -> bool {
        self.voter_addresses.contains_key(&peer)
            && self
                .peer_backoff_until
                .get(&peer)
                .map(|&until| now_ms >= until)
                .unwrap_or(true)
    }

    fn send_request(
        &mut self,
        destination: NodeId,
        request: RequestPayload,
        now_ms: u64,
    ) -> Result<()> {
        let correlation_id = self.channel.new_correlation_id();
        debug!(
            %correlation_id,
            destination = %destination,
            api = %request.api_key(),
            "sending request"
        );
        self.inflight.insert(
            correlation_id,
            InflightRequest {
                api_key: request.api_key(),
                destination,
                deadline_ms: now_ms + self.config.request_timeout_ms(),
            },
        );
        self.channel.send(RaftMessage::OutboundRequest {
            correlation_id,
            destination,
            request,
        })
    }

    fn needs_discovery(&self) -> bool {
        let missing_endpoints = self
            .quorum
            .remote_voters()
            .any(|voter| !self.voter_addresses.contains_key(&voter));
        missing_endpoints
            || (self.quorum.leader_id().is_none() && !self.quorum.is_candidate())
    }

    fn send_outbound_requests(&mut self, now_ms: u64) -> Result<()> {
        if self.shutdown.is_some() {
            // The only traffic while draining is the leader's resignation.
            if self.quorum.is_leader() {
                let epoch = self.quorum.epoch();
                let local_id = self.quorum.local_id();
                for voter in self.quorum.remote_voters().collect::<Vec<_>>() {
                    if !self.has_live_inflight(ApiKey::EndQuorumEpoch, voter, now_ms) {
                        self.send_request(
                            voter,
                            RequestPayload::EndQuorumEpoch(EndQuorumEpochRequest {
                                leader_epoch: epoch,
                                leader_id: local_id,
                                replica_id: local_id,
                            }),
                            now_ms,
                        )?;
                    }
                }
            }
            return Ok(());
        }

        if self.needs_discovery()
            && now_ms >= self.discovery_backoff_until_ms
            && !self.has_live_inflight(ApiKey::FindQuorum, NodeId::INVALID, now_ms)
        {
            let replica_id = self.quorum.local_id();
            self.send_request(
                NodeId::INVALID,
                RequestPayload::FindQuorum(FindQuorumRequest { replica_id }),
                now_ms,
            )?;
        }

        if self.quorum.is_candidate() {
            let epoch = self.quorum.epoch();
            let candidate_id = self.quorum.local_id();
            let last_epoch = self.log.last_fetched_epoch();
            let last_epoch_end_offset = self.log.end_offset();
            let pending_voters: Vec<NodeId> = self
                .quorum
                .remote_voters()
                .filter(|&voter| {
                    !self
                        .quorum
                        .candidate_state()
                        .map(|state| state.has_responded(voter))
                        .unwrap_or(false)
                })
                .collect();
            for voter in pending_voters {
                if self.peer_ready(voter, now_ms)
                    && !self.has_live_inflight(ApiKey::Vote, voter, now_ms)
                {
                    self.send_request(
                        voter,
                        RequestPayload::Vote(VoteRequest {
                            candidate_epoch: epoch,
                            candidate_id,
                            last_epoch,
                            last_epoch_end_offset,
                        }),
                        now_ms,
                    )?;
                }
            }
        } else if self.quorum.is_leader() {
            let epoch = self.quorum.epoch();
            let leader_id = self.quorum.local_id();
            let unendorsed: Vec<NodeId> = self
                .quorum
                .remote_voters()
                .filter(|&voter| {
                    !self
                        .quorum
                        .leader_state()
                        .map(|state| state.is_endorsed(voter))
                        .unwrap_or(true)
                })
                .collect();
            for voter in unendorsed {
                if self.peer_ready(voter, now_ms)
                    && !self.has_live_inflight(ApiKey::BeginQuorumEpoch, voter, now_ms)
                {
                    self.send_request(
                        voter,
                        RequestPayload::BeginQuorumEpoch(BeginQuorumEpochRequest {
                            leader_epoch: epoch,
                            leader_id,
                        }),
                        now_ms,
                    )?;
                }
            }
        } else if let Some(leader_id) = self.quorum.leader_id() {
            // Follower or observer attached to a leader: keep fetching.
            if self.peer_ready(leader_id, now_ms)
                && !self.has_live_inflight(ApiKey::FetchQuorumRecords, leader_id, now_ms)
            {
                let request = FetchQuorumRecordsRequest {
                    leader_epoch: self.quorum.epoch(),
                    fetch_offset: self.log.end_offset(),
                    last_fetched_epoch: self.log.last_fetched_epoch(),
                    replica_id: self.quorum.local_id(),
                };
                self.send_request(
                    leader_id,
                    RequestPayload::FetchQuorumRecords(request),
                    now_ms,
                )?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    fn handle_message(&mut self, message: RaftMessage, now_ms: u64) -> Result<()> {
        match message {
            RaftMessage::InboundRequest {
                correlation_id,
                request,
                ..
            } => {
                let response = self.handle_request(request, now_ms)?;
                self.channel.send(RaftMessage::OutboundResponse {
                    correlation_id,
                    response,
                })
            }
            RaftMessage::InboundResponse {
                correlation_id,
                source,
                response,
            } => self.handle_response(correlation_id, source, response, now_ms),
            other => {
                warn!(api = %other.api_key(), "ignoring unexpected outbound message in receive");
                Ok(())
            }
        }
    }

    fn handle_request(
        &mut self,
        request: RequestPayload,
        now_ms: u64,
    ) -> Result<ResponsePayload> {
        let api_key = request.api_key();
        if let Some(epoch) = request.epoch() {
            if epoch < 0 {
                return Ok(ResponsePayload::error_of(api_key, ErrorCode::InvalidRequest));
            }
            if epoch < self.quorum.epoch() {
                debug!(
                    api = %api_key,
                    epoch,
                    current = self.quorum.epoch(),
                    "rejecting stale-epoch request"
                );
                return Ok(ResponsePayload::error_of(
                    api_key,
                    ErrorCode::FencedLeaderEpoch,
                ));
            }
            // A higher epoch moves us forward before classification. Vote
            // and BeginQuorumEpoch fold the adoption into their handling.
            if epoch > self.quorum.epoch()
                && !matches!(api_key, ApiKey::Vote | ApiKey::BeginQuorumEpoch)
            {
                self.become_unattached(epoch, now_ms)?;
            }
        }

        match request {
            RequestPayload::Vote(request) => self.handle_vote_request(request, now_ms),
            RequestPayload::BeginQuorumEpoch(request) => {
                self.become_follower(request.leader_epoch, request.leader_id, now_ms)?;
                Ok(ResponsePayload::BeginQuorumEpoch(BeginQuorumEpochResponse {
                    error_code: ErrorCode::None,
                    leader_epoch: self.quorum.epoch(),
                    leader_id: self.quorum.leader_id().unwrap_or(NodeId::INVALID),
                }))
            }
            RequestPayload::EndQuorumEpoch(request) => {
                let resigning_leader_known = self.quorum.leader_id() == Some(request.leader_id)
                    || self.quorum.leader_id().is_none();
                if request.leader_epoch == self.quorum.epoch() && resigning_leader_known {
                    info!(
                        epoch = request.leader_epoch,
                        leader_id = %request.leader_id,
                        "leader resigned"
                    );
                    self.become_unattached(request.leader_epoch, now_ms)?;
                }
                Ok(ResponsePayload::EndQuorumEpoch(EndQuorumEpochResponse {
                    error_code: ErrorCode::None,
                    leader_epoch: self.quorum.epoch(),
                    leader_id: self.quorum.leader_id().unwrap_or(NodeId::INVALID),
                }))
            }
            RequestPayload::FetchQuorumRecords(request) => {
                self.handle_fetch_request(request)
            }
            RequestPayload::FindQuorum(_) => {
                let voters = self
                    .quorum
                    .voters()
                    .iter()
                    .filter_map(|voter| self.voter_addresses.get(voter).cloned())
                    .collect();
                Ok(ResponsePayload::FindQuorum(FindQuorumResponse {
                    error_code: ErrorCode::None,
                    leader_epoch: self.quorum.epoch(),
                    leader_id: self.quorum.leader_id().unwrap_or(NodeId::INVALID),
                    voters,
                }))
            }
        }
    }

    fn handle_vote_request(
        &mut self,
        request: VoteRequest,
        now_ms: u64,
    ) -> Result<ResponsePayload> {
        let candidate_position =
            OffsetAndEpoch::new(request.last_epoch_end_offset, request.last_epoch);
        let local_position =
            OffsetAndEpoch::new(self.log.end_offset(), self.log.last_fetched_epoch());
        let log_ok = candidate_position >= local_position;
        let candidate_is_voter = self.quorum.is_voter(request.candidate_id);
        let can_grant = candidate_is_voter && !self.quorum.is_observer();

        let granted = if request.candidate_epoch > self.quorum.epoch() {
            if log_ok && can_grant {
                self.grant_vote(request.candidate_epoch, request.candidate_id, now_ms)?;
                true
            } else {
                self.become_unattached(request.candidate_epoch, now_ms)?;
                false
            }
        } else {
            // Same epoch: a vote is only available while no leader is known
            // and we have not voted for anyone else.
            let vote_available = self.quorum.leader_id().is_none()
                && self
                    .quorum
                    .voted_id()
                    .map(|voted| voted == request.candidate_id)
                    .unwrap_or(true);
            if log_ok && can_grant && vote_available {
                if self.quorum.voted_id().is_none() {
                    self.grant_vote(request.candidate_epoch, request.candidate_id, now_ms)?;
                } else {
                    // Repeat request from the candidate we already voted
                    // for; refresh the timer, nothing to persist.
                    self.rearm_election_timer(now_ms);
                }
                true
            } else {
                false
            }
        };

        debug!(
            candidate_id = %request.candidate_id,
            epoch = request.candidate_epoch,
            granted,
            "handled vote request"
        );
        Ok(ResponsePayload::Vote(VoteResponse {
            error_code: ErrorCode::None,
            leader_epoch: self.quorum.epoch(),
            leader_id: self.quorum.leader_id().unwrap_or(NodeId::INVALID),
            vote_granted: granted,
        }))
    }

    fn handle_fetch_request(
        &mut self,
        request: FetchQuorumRecordsRequest,
    ) -> Result<ResponsePayload> {
        if !self.quorum.is_leader() {
            return Ok(ResponsePayload::error_of(
                ApiKey::FetchQuorumRecords,
                ErrorCode::NotLeaderForPartition,
            ));
        }

        let epoch = self.quorum.epoch();
        let leader_id = self.quorum.local_id();
        let end_offset = self.log.end_offset();
        let position_matches = if request.fetch_offset == 0 {
            request.last_fetched_epoch == 0
        } else if request.fetch_offset <= end_offset {
            self.log.epoch_at(request.fetch_offset - 1) == Some(request.last_fetched_epoch)
        } else {
            false
        };

        if !position_matches {
            let divergence = self.log.end_offset_for_epoch(request.last_fetched_epoch);
            debug!(
                replica_id = %request.replica_id,
                fetch_offset = request.fetch_offset,
                last_fetched_epoch = request.last_fetched_epoch,
                divergence = %divergence,
                "fetch position diverges"
            );
            return Ok(ResponsePayload::FetchQuorumRecords(
                FetchQuorumRecordsResponse {
                    error_code: ErrorCode::OffsetOutOfRange,
                    leader_epoch: epoch,
                    leader_id,
                    high_watermark: self.high_watermark as i64,
                    records: Vec::new(),
                    next_fetch_offset: divergence.offset as i64,
                    next_fetch_offset_epoch: divergence.epoch,
                },
            ));
        }

        // A fetch at our epoch is an implicit endorsement of this
        // leadership; no need to keep pushing BeginQuorumEpoch.
        if self.quorum.is_voter(request.replica_id) {
            if let Some(leader_state) = self.quorum.leader_state_mut() {
                leader_state.update_match_offset(request.replica_id, request.fetch_offset);
                leader_state.endorse(request.replica_id);
            }
        }

        Ok(ResponsePayload::FetchQuorumRecords(
            FetchQuorumRecordsResponse {
                error_code: ErrorCode::None,
                leader_epoch: epoch,
                leader_id,
                high_watermark: self.high_watermark as i64,
                records: self.log.read(request.fetch_offset, None),
                next_fetch_offset: -1,
                next_fetch_offset_epoch: -1,
            },
        ))
    }

    fn handle_response(
        &mut self,
        correlation_id: CorrelationId,
        source: NodeId,
        response: ResponsePayload,
        now_ms: u64,
    ) -> Result<()> {
        let Some(request) = self.inflight.get(&correlation_id).copied() else {
            debug!(%correlation_id, source = %source, "dropping uncorrelated response");
            return Ok(());
        };
        if request.api_key != response.api_key() || request.destination != source {
            warn!(
                %correlation_id,
                expected = %request.api_key,
                got = %response.api_key(),
                "dropping mismatched response"
            );
            return Ok(());
        }
        self.inflight.remove(&correlation_id);

        // An advertised higher epoch moves us forward regardless of the
        // response kind.
        let response_epoch = response.leader_epoch();
        if response_epoch > self.quorum.epoch() {
            let leader_id = response.leader_id();
            if leader_id.is_valid() && leader_id != self.quorum.local_id() {
                self.become_follower(response_epoch, leader_id, now_ms)?;
            } else {
                self.become_unattached(response_epoch, now_ms)?;
            }
        }

        match response {
            ResponsePayload::Vote(response) => self.handle_vote_response(source, response, now_ms),
            ResponsePayload::BeginQuorumEpoch(response) => {
                match response.error_code {
                    ErrorCode::None => {
                        if self.quorum.is_leader()
                            && response.leader_epoch == self.quorum.epoch()
                        {
                            if let Some(leader_state) = self.quorum.leader_state_mut() {
                                leader_state.endorse(source);
                            }
                        }
                    }
                    ErrorCode::BrokerNotAvailable | ErrorCode::ClusterAuthorizationFailed => {
                        self.note_peer_failure(source, response.error_code, now_ms);
                    }
                    _ => {}
                }
                Ok(())
            }
            ResponsePayload::EndQuorumEpoch(_) => Ok(()),
            ResponsePayload::FetchQuorumRecords(response) => {
                self.handle_fetch_response(source, response, now_ms)
            }
            ResponsePayload::FindQuorum(response) => {
                self.handle_find_quorum_response(response, now_ms)
            }
        }
    }

    fn handle_vote_response(
        &mut self,
        source: NodeId,
        response: VoteResponse,
        now_ms: u64,
    ) -> Result<()> {
        if !self.quorum.is_candidate() || response.leader_epoch != self.quorum.epoch() {
            return Ok(());
        }
        match response.error_code {
            ErrorCode::None => {
                if response.vote_granted {
                    debug!(source = %source, epoch = self.quorum.epoch(), "vote granted");
                    if self.quorum.record_granted_vote(source) {
                        self.on_election_won(now_ms)?;
                    }
                } else {
                    debug!(source = %source, epoch = self.quorum.epoch(), "vote rejected");
                    self.quorum.record_rejected_vote(source);
                }
            }
            ErrorCode::BrokerNotAvailable | ErrorCode::ClusterAuthorizationFailed => {
                self.note_peer_failure(source, response.error_code, now_ms);
            }
            other => {
                warn!(source = %source, code = ?other, "unexpected vote response error");
            }
        }
        Ok(())
    }

    fn handle_fetch_response(
        &mut self,
        source: NodeId,
        response: FetchQuorumRecordsResponse,
        now_ms: u64,
    ) -> Result<()> {
        if self.quorum.leader_id() != Some(source) {
            return Ok(());
        }
        match response.error_code {
            ErrorCode::None if response.leader_epoch == self.quorum.epoch() => {
                if !response.records.is_empty() {
                    self.log.append_as_follower(response.records)?;
                }
                if response.high_watermark >= 0 {
                    let advertised = response.high_watermark as u64;
                    if advertised > self.high_watermark {
                        self.high_watermark = advertised.min(self.log.end_offset());
                    }
                }
                self.rearm_election_timer(now_ms);
            }
            ErrorCode::OffsetOutOfRange => {
                if response.next_fetch_offset >= 0 {
                    info!(
                        next_fetch_offset = response.next_fetch_offset,
                        "truncating diverged log"
                    );
                    self.log.truncate_to(response.next_fetch_offset as u64);
                }
                self.rearm_election_timer(now_ms);
            }
            ErrorCode::BrokerNotAvailable | ErrorCode::ClusterAuthorizationFailed => {
                self.note_peer_failure(source, response.error_code, now_ms);
                self.become_unattached(self.quorum.epoch(), now_ms)?;
            }
            other => {
                warn!(source = %source, code = ?other, "unexpected fetch response error");
            }
        }
        Ok(())
    }

    fn handle_find_quorum_response(
        &mut self,
        response: FindQuorumResponse,
        now_ms: u64,
    ) -> Result<()> {
        if !response.error_code.is_none() {
            debug!(code = ?response.error_code, "leader discovery failed, backing off");
            self.discovery_backoff_until_ms = now_ms + self.config.retry_backoff_ms();
            return Ok(());
        }

        for voter in response.voters {
            self.channel.update_endpoint(
                voter.voter_id,
                format!("{}:{}", voter.host, voter.port),
            );
            self.voter_addresses.insert(voter.voter_id, voter);
        }

        if response.leader_id.is_valid()
            && response.leader_id != self.quorum.local_id()
            && response.leader_epoch >= self.quorum.epoch()
            && !self.quorum.is_leader()
        {
            self.become_follower(response.leader_epoch, response.leader_id, now_ms)?;
        }
        Ok(())
    }

    fn note_peer_failure(&mut self, peer: NodeId, code: ErrorCode, now_ms: u64) {
        if code == ErrorCode::ClusterAuthorizationFailed {
            error!(peer = %peer, "not authorized for quorum APIs on peer");
        } else {
            debug!(peer = %peer, "peer unavailable, backing off");
        }
        self.peer_backoff_until
            .insert(peer, now_ms + self.config.retry_backoff_ms());
    }

    // ------------------------------------------------------------------
    // High-watermark & shutdown
    // ------------------------------------------------------------------

    fn update_high_watermark(&mut self) {
        let end_offset = self.log.end_offset();
        let local_id = self.quorum.local_id();
        let Some(leader_state) = self.quorum.leader_state_mut() else {
            return;
        };
        leader_state.update_match_offset(local_id, end_offset);
        let replicated = leader_state.quorum_match_offset();
        // Only offsets inside the current term are committed by counting
        // replicas; earlier entries commit transitively with them.
        if replicated >= leader_state.epoch_start_offset && replicated > self.high_watermark {
            self.high_watermark = replicated.min(end_offset);
            debug!(high_watermark = self.high_watermark, "advanced high watermark");
        }
    }

    fn complete_shutdown_if_due(&mut self, now_ms: u64) -> bool {
        let Some(shutdown) = self.shutdown else {
            return false;
        };
        if now_ms >= shutdown.deadline_ms {
            info!("shutdown deadline reached");
            self.running = false;
            return true;
        }
        let has_peers_to_notify =
            self.quorum.is_leader() && self.quorum.remote_voters().next().is_some();
        if !has_peers_to_notify {
            info!("shutdown complete");
            self.running = false;
            return true;
        }
        false
    }

    fn maybe_complete_shutdown_after_epoch_bump(&mut self) {
        if let Some(shutdown) = self.shutdown {
            if self.quorum.epoch() > shutdown.epoch {
                info!(epoch = self.quorum.epoch(), "epoch moved on, shutdown complete");
                self.running = false;
            }
        }
    }
}
