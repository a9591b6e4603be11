//! In-memory projection of the election record plus per-role bookkeeping.
//!
//! [`QuorumState`] owns the durable `(epoch, leader, votedFor)` triple and
//! the transient state each role carries: granted and rejected votes for a
//! candidate, the election deadline for a follower, per-voter match offsets
//! for a leader. Transitions replace the role variant rather than mutating
//! a shared base, and every change to the durable triple is written through
//! the [`QuorumStateStore`] before it becomes observable.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::info;

use crate::election::{ElectionState, QuorumStateStore};
use crate::error::{RaftError, Result};
use crate::types::NodeId;

/// Minimum number of voters that constitutes a quorum.
pub fn majority_size(voter_count: usize) -> usize {
    voter_count / 2 + 1
}

/// Transient state of a candidate soliciting votes.
#[derive(Debug)]
pub struct CandidateState {
    granted: BTreeSet<NodeId>,
    rejected: BTreeSet<NodeId>,
    /// When the current candidacy gives up and restarts with a bumped
    /// epoch. Includes the per-election jitter.
    pub election_deadline_ms: u64,
}

impl CandidateState {
    fn new(local_id: NodeId) -> Self {
        let mut granted = BTreeSet::new();
        granted.insert(local_id);
        Self {
            granted,
            rejected: BTreeSet::new(),
            election_deadline_ms: 0,
        }
    }

    pub fn granted(&self) -> &BTreeSet<NodeId> {
        &self.granted
    }

    pub fn rejected(&self) -> &BTreeSet<NodeId> {
        &self.rejected
    }

    /// Voters that have neither granted nor rejected.
    pub fn has_responded(&self, id: NodeId) -> bool {
        self.granted.contains(&id) || self.rejected.contains(&id)
    }
}

/// Transient state of a follower attached to a leader.
#[derive(Debug)]
pub struct FollowerState {
    pub leader_id: NodeId,
    /// When the follower gives up on the leader and starts an election
    /// (voters) or rediscovers the quorum (observers).
    pub election_deadline_ms: u64,
}

/// Transient state of the leader.
#[derive(Debug)]
pub struct LeaderState {
    /// Offset of the start of this leadership term (the leader-change
    /// control batch).
    pub epoch_start_offset: u64,
    /// Largest fetch offset observed from each voter, including the local
    /// replica's own end offset.
    match_offsets: BTreeMap<NodeId, u64>,
    /// Voters known to have accepted this leadership, either through a
    /// BeginQuorumEpoch response or by fetching at this epoch.
    endorsed: BTreeSet<NodeId>,
}

impl LeaderState {
    fn new(local_id: NodeId, voters: &BTreeSet<NodeId>, epoch_start_offset: u64) -> Self {
        let match_offsets = voters.iter().map(|&v| (v, 0)).collect();
        let mut endorsed = BTreeSet::new();
        endorsed.insert(local_id);
        Self {
            epoch_start_offset,
            match_offsets,
            endorsed,
        }
    }

    /// Record a fetch position from a voter. Match offsets never regress.
    pub fn update_match_offset(&mut self, voter: NodeId, offset: u64) {
        if let Some(current) = self.match_offsets.get_mut(&voter) {
            *current = (*current).max(offset);
        }
    }

    pub fn match_offset(&self, voter: NodeId) -> Option<u64> {
        self.match_offsets.get(&voter).copied()
    }

    pub fn endorse(&mut self, voter: NodeId) {
        self.endorsed.insert(voter);
    }

    pub fn is_endorsed(&self, voter: NodeId) -> bool {
        self.endorsed.contains(&voter)
    }

    /// Largest offset that a strict majority of voters has matched.
    pub fn quorum_match_offset(&self) -> u64 {
        let mut offsets: Vec<u64> = self.match_offsets.values().copied().collect();
        offsets.sort_unstable_by(|a, b| b.cmp(a));
        let majority = majority_size(self.match_offsets.len());
        offsets.get(majority - 1).copied().unwrap_or(0)
    }
}

/// Role of the local replica, carrying role-specific transient state.
#[derive(Debug)]
pub enum Role {
    /// Voter (or observer) without a known leader or pending candidacy at
    /// the current epoch.
    Unattached { election_deadline_ms: u64 },
    Candidate(CandidateState),
    Follower(FollowerState),
    Leader(LeaderState),
}

/// The local replica's view of the quorum.
pub struct QuorumState {
    local_id: NodeId,
    voters: BTreeSet<NodeId>,
    store: Arc<dyn QuorumStateStore>,
    epoch: i32,
    voted_id: Option<NodeId>,
    role: Role,
}

impl QuorumState {
    pub fn new(
        local_id: NodeId,
        voters: impl IntoIterator<Item = NodeId>,
        store: Arc<dyn QuorumStateStore>,
    ) -> Self {
        Self {
            local_id,
            voters: voters.into_iter().collect(),
            store,
            epoch: 0,
            voted_id: None,
            role: Role::Unattached {
                election_deadline_ms: 0,
            },
        }
    }

    /// Recover the role from the persisted election record.
    ///
    /// A fresh voter (nothing persisted) starts a candidacy immediately; a
    /// persisted leader record naming the local replica resumes leadership
    /// with `log_end_offset` as the term start. The caller is responsible
    /// for the leader bootstrap work (control record, BeginQuorumEpoch).
    pub fn initialize(&mut self, log_end_offset: u64) -> Result<()> {
        let stored = self.store.read()?.unwrap_or_default();

        self.epoch = stored.epoch;
        self.voted_id = stored.voted_id();

        if stored.is_leader(self.local_id) && self.is_voter(self.local_id) {
            self.role = Role::Leader(LeaderState::new(
                self.local_id,
                &self.voters,
                log_end_offset,
            ));
        } else if let Some(leader_id) = stored.leader_id() {
            self.role = Role::Follower(FollowerState {
                leader_id,
                election_deadline_ms: 0,
            });
        } else if stored.is_voted_candidate(self.local_id) && self.is_voter(self.local_id) {
            self.role = Role::Candidate(CandidateState::new(self.local_id));
        } else if stored.epoch == 0
            && !stored.has_voted()
            && self.is_voter(self.local_id)
        {
            // First boot of a voter: no history, start electing right away.
            self.become_candidate()?;
        } else {
            self.role = Role::Unattached {
                election_deadline_ms: 0,
            };
        }
        Ok(())
    }

    fn persist(&self, state: ElectionState) -> Result<()> {
        self.store.write(state)
    }

    /// Start a new candidacy: bump the epoch and vote for ourselves.
    pub fn become_candidate(&mut self) -> Result<()> {
        if !self.is_voter(self.local_id) {
            return Err(RaftError::IllegalTransition(
                "observers cannot become candidates".to_string(),
            ));
        }
        if self.is_leader() {
            return Err(RaftError::IllegalTransition(
                "leaders cannot start elections".to_string(),
            ));
        }
        let epoch = self.epoch + 1;
        self.persist(ElectionState::with_voted_candidate(epoch, self.local_id))?;
        info!(local_id = %self.local_id, epoch, "became candidate");
        self.epoch = epoch;
        self.voted_id = Some(self.local_id);
        self.role = Role::Candidate(CandidateState::new(self.local_id));
        Ok(())
    }

    /// Attach to `leader_id` at `epoch`. Returns false when we were
    /// already following that leader at that epoch.
    pub fn become_follower(&mut self, epoch: i32, leader_id: NodeId) -> Result<bool> {
        if epoch < self.epoch {
            return Err(RaftError::IllegalTransition(format!(
                "cannot become follower at epoch {} behind current {}",
                epoch, self.epoch
            )));
        }
        if epoch == self.epoch {
            if self.is_leader() {
                return Err(RaftError::IllegalTransition(
                    "leader cannot become follower in its own epoch".to_string(),
                ));
            }
            if let Role::Follower(state) = &self.role {
                if state.leader_id == leader_id {
                    return Ok(false);
                }
            }
        }
        self.persist(ElectionState::with_elected_leader(epoch, leader_id))?;
        info!(local_id = %self.local_id, epoch, leader_id = %leader_id, "became follower");
        self.epoch = epoch;
        self.voted_id = None;
        self.role = Role::Follower(FollowerState {
            leader_id,
            election_deadline_ms: 0,
        });
        Ok(true)
    }

    /// Drop to unattached at `epoch`, clearing leader and vote.
    pub fn become_unattached(&mut self, epoch: i32) -> Result<()> {
        if epoch < self.epoch {
            return Err(RaftError::IllegalTransition(format!(
                "cannot become unattached at epoch {} behind current {}",
                epoch, self.epoch
            )));
        }
        self.persist(ElectionState::with_unknown_leader(epoch))?;
        info!(local_id = %self.local_id, epoch, "became unattached");
        self.epoch = epoch;
        self.voted_id = None;
        self.role = Role::Unattached {
            election_deadline_ms: 0,
        };
        Ok(())
    }

    /// Grant a vote to `candidate_id` at `epoch`. The epoch may be ahead of
    /// the current one (the vote adopts it); within the current epoch a
    /// vote may only be cast once and never while a leader is known.
    pub fn record_vote(&mut self, epoch: i32, candidate_id: NodeId) -> Result<()> {
        if !self.is_voter(self.local_id) {
            return Err(RaftError::IllegalTransition(
                "observers cannot vote".to_string(),
            ));
        }
        if epoch < self.epoch {
            return Err(RaftError::IllegalTransition(format!(
                "cannot vote at epoch {} behind current {}",
                epoch, self.epoch
            )));
        }
        if epoch == self.epoch {
            if self.leader_id().is_some() {
                return Err(RaftError::IllegalTransition(
                    "cannot vote while a leader is known at this epoch".to_string(),
                ));
            }
            if matches!(self.voted_id, Some(voted) if voted != candidate_id) {
                return Err(RaftError::IllegalTransition(
                    "already voted for a different candidate at this epoch".to_string(),
                ));
            }
        }
        self.persist(ElectionState::with_voted_candidate(epoch, candidate_id))?;
        info!(local_id = %self.local_id, epoch, candidate_id = %candidate_id, "granted vote");
        self.epoch = epoch;
        self.voted_id = Some(candidate_id);
        self.role = Role::Unattached {
            election_deadline_ms: 0,
        };
        Ok(())
    }

    /// Assume leadership. Only valid for a candidate holding a majority.
    pub fn become_leader(&mut self, epoch_start_offset: u64) -> Result<()> {
        let has_majority = match &self.role {
            Role::Candidate(state) => state.granted().len() >= self.majority(),
            _ => false,
        };
        if !has_majority {
            return Err(RaftError::IllegalTransition(
                "only a candidate with a vote majority can become leader".to_string(),
            ));
        }
        self.persist(ElectionState::with_elected_leader(self.epoch, self.local_id))?;
        info!(local_id = %self.local_id, epoch = self.epoch, "became leader");
        self.voted_id = None;
        self.role = Role::Leader(LeaderState::new(
            self.local_id,
            &self.voters,
            epoch_start_offset,
        ));
        Ok(())
    }

    /// Count a vote response. Returns true once a majority has granted.
    pub fn record_granted_vote(&mut self, from: NodeId) -> bool {
        let majority = self.majority();
        if let Role::Candidate(state) = &mut self.role {
            state.granted.insert(from);
            state.granted.len() >= majority
        } else {
            false
        }
    }

    pub fn record_rejected_vote(&mut self, from: NodeId) {
        if let Role::Candidate(state) = &mut self.role {
            state.rejected.insert(from);
        }
    }

    pub fn majority(&self) -> usize {
        majority_size(self.voters.len())
    }

    pub fn majority_reached(&self) -> bool {
        match &self.role {
            Role::Candidate(state) => state.granted().len() >= self.majority(),
            _ => false,
        }
    }

    /// Arm the election timer on the current role. No-op for leaders.
    pub fn arm_election_timer(&mut self, deadline_ms: u64) {
        match &mut self.role {
            Role::Unattached {
                election_deadline_ms,
            } => *election_deadline_ms = deadline_ms,
            Role::Candidate(state) => state.election_deadline_ms = deadline_ms,
            Role::Follower(state) => state.election_deadline_ms = deadline_ms,
            Role::Leader(_) => {}
        }
    }

    pub fn election_deadline_ms(&self) -> Option<u64> {
        match &self.role {
            Role::Unattached {
                election_deadline_ms,
            } => Some(*election_deadline_ms),
            Role::Candidate(state) => Some(state.election_deadline_ms),
            Role::Follower(state) => Some(state.election_deadline_ms),
            Role::Leader(_) => None,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn epoch(&self) -> i32 {
        self.epoch
    }

    pub fn voters(&self) -> &BTreeSet<NodeId> {
        &self.voters
    }

    /// Voters other than the local replica.
    pub fn remote_voters(&self) -> impl Iterator<Item = NodeId> + '_ {
        let local_id = self.local_id;
        self.voters.iter().copied().filter(move |&v| v != local_id)
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.voters.contains(&id)
    }

    pub fn is_observer(&self) -> bool {
        !self.voters.contains(&self.local_id)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self.role, Role::Candidate(_))
    }

    pub fn is_follower(&self) -> bool {
        matches!(self.role, Role::Follower(_))
    }

    pub fn is_unattached(&self) -> bool {
        matches!(self.role, Role::Unattached { .. })
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        match &self.role {
            Role::Leader(_) => Some(self.local_id),
            Role::Follower(state) => Some(state.leader_id),
            _ => None,
        }
    }

    pub fn voted_id(&self) -> Option<NodeId> {
        self.voted_id
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn leader_state(&self) -> Option<&LeaderState> {
        match &self.role {
            Role::Leader(state) => Some(state),
            _ => None,
        }
    }

    pub fn leader_state_mut(&mut self) -> Option<&mut LeaderState> {
        match &mut self.role {
            Role::Leader(state) => Some(state),
            _ => None,
        }
    }

    pub fn candidate_state(&self) -> Option<&CandidateState> {
        match &self.role {
            Role::Candidate(state) => Some(state),
            _ => None,
        }
    }

    /// The durable triple as currently persisted.
    pub fn election_state(&self) -> ElectionState {
        match &self.role {
            Role::Leader(_) => ElectionState::with_elected_leader(self.epoch, self.local_id),
            Role::Follower(state) => {
                ElectionState::with_elected_leader(self.epoch, state.leader_id)
            }
            _ => match self.voted_id {
                Some(voted) => ElectionState::with_voted_candidate(self.epoch, voted),
                None => ElectionState::with_unknown_leader(self.epoch),
            },
        }
    }
}
