//! Durable election state.
//!
//! Every transition of `(epoch, leader, votedFor)` is persisted through a
//! [`QuorumStateStore`] before it becomes observable, so a replica can
//! never forget a vote it already cast. The file-backed store writes a
//! sibling `.tmp` file and renames it into place; a crash between the two
//! steps leaves the prior record intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::types::NodeId;

/// The persisted election record: `(epoch, leader, votedFor)`.
///
/// At most one of `leader` and `votedFor` is set within an epoch; electing
/// a leader at an epoch clears any vote recorded at that epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionState {
    pub epoch: i32,
    leader_id: NodeId,
    voted_id: NodeId,
}

impl ElectionState {
    /// State with a known elected leader.
    pub fn with_elected_leader(epoch: i32, leader_id: NodeId) -> Self {
        Self {
            epoch,
            leader_id,
            voted_id: NodeId::INVALID,
        }
    }

    /// State with a vote cast but no leader elected yet.
    pub fn with_voted_candidate(epoch: i32, voted_id: NodeId) -> Self {
        Self {
            epoch,
            leader_id: NodeId::INVALID,
            voted_id,
        }
    }

    /// State with neither a leader nor a vote at this epoch.
    pub fn with_unknown_leader(epoch: i32) -> Self {
        Self {
            epoch,
            leader_id: NodeId::INVALID,
            voted_id: NodeId::INVALID,
        }
    }

    pub fn has_leader(&self) -> bool {
        self.leader_id.is_valid()
    }

    pub fn has_voted(&self) -> bool {
        self.voted_id.is_valid()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id.is_valid().then_some(self.leader_id)
    }

    pub fn voted_id(&self) -> Option<NodeId> {
        self.voted_id.is_valid().then_some(self.voted_id)
    }

    pub fn is_leader(&self, id: NodeId) -> bool {
        self.leader_id == id && id.is_valid()
    }

    pub fn is_voted_candidate(&self, id: NodeId) -> bool {
        self.voted_id == id && id.is_valid()
    }
}

impl Default for ElectionState {
    fn default() -> Self {
        Self::with_unknown_leader(0)
    }
}

/// Store for the durable election record.
pub trait QuorumStateStore: Send + Sync {
    /// Read the persisted record. `None` when nothing has been written yet.
    fn read(&self) -> Result<Option<ElectionState>>;

    /// Atomically persist the record.
    fn write(&self, state: ElectionState) -> Result<()>;

    /// Remove the persisted record.
    fn clear(&self) -> Result<()>;
}

/// File-backed store using write-temp-then-rename.
#[derive(Debug)]
pub struct FileQuorumStateStore {
    path: PathBuf,
}

impl FileQuorumStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_owned();
        os.push(".tmp");
        PathBuf::from(os)
    }
}

impl QuorumStateStore for FileQuorumStateStore {
    fn read(&self) -> Result<Option<ElectionState>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if raw.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| RaftError::CorruptStateFile(format!("{}: {}", self.path.display(), e)))
    }

    fn write(&self, state: ElectionState) -> Result<()> {
        let tmp = self.tmp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer(&mut file, &state)
                .map_err(|e| RaftError::Io(std::io::Error::other(e)))?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        for path in [&self.path, &self.tmp_path()] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryQuorumStateStore {
    state: Mutex<Option<ElectionState>>,
}

impl MemoryQuorumStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuorumStateStore for MemoryQuorumStateStore {
    fn read(&self) -> Result<Option<ElectionState>> {
        Ok(*self.state.lock())
    }

    fn write(&self, state: ElectionState) -> Result<()> {
        *self.state.lock() = Some(state);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.state.lock() = None;
        Ok(())
    }
}

impl<S: QuorumStateStore + ?Sized> QuorumStateStore for Arc<S> {
    fn read(&self) -> Result<Option<ElectionState>> {
        (**self).read()
    }

    fn write(&self, state: ElectionState) -> Result<()> {
        (**self).write(state)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }
}
