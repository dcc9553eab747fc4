//! Host state machine interface.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::storage::SnapshotFile;
use crate::types::{EntryPayload, LogIndex, SharedEntry, Term};

/// Application driven by the committed log.
///
/// Committed entries arrive in index order, in batches, never twice and
/// never with a gap (a snapshot restore moves the starting point). An
/// error from any method is treated as fatal and the node enters ERROR.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Apply a batch of committed entries. Configuration entries are
    /// included so the application sees every index.
    async fn apply(&self, entries: &[SharedEntry]) -> Result<()>;

    /// Capture the applied state as a set of named files.
    async fn snapshot(&self) -> Result<Vec<SnapshotFile>>;

    /// Replace the applied state with a snapshot.
    async fn restore(&self, files: Vec<SnapshotFile>) -> Result<()>;

    async fn on_leader_start(&self, _term: Term) {}

    async fn on_leader_stop(&self) {}
}

const DATA_FILE: &str = "data";

#[derive(Default, Serialize, Deserialize)]
struct MemoryState {
    last_index: LogIndex,
    values: Vec<Bytes>,
}

/// Keeps every applied data payload in memory. Handy for tests and for
/// embedding the core without a real application.
#[derive(Default)]
pub struct MemoryStateMachine {
    state: Mutex<MemoryState>,
}

impl MemoryStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Data payloads applied so far, in log order.
    pub fn values(&self) -> Vec<Bytes> {
        self.state.lock().values.clone()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state.lock().last_index
    }
}

#[async_trait]
impl StateMachine for MemoryStateMachine {
    async fn apply(&self, entries: &[SharedEntry]) -> Result<()> {
        let mut state = self.state.lock();
        for entry in entries {
            if entry.id.index <= state.last_index {
                return Err(RaftError::Internal {
                    reason: format!(
                        "entry {} applied after {}",
                        entry.id.index, state.last_index
                    ),
                });
            }
            if let EntryPayload::Data(data) = &entry.payload {
                state.values.push(data.clone());
            }
            state.last_index = entry.id.index;
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<SnapshotFile>> {
        let encoded = bincode::serialize(&*self.state.lock())?;
        Ok(vec![SnapshotFile::new(DATA_FILE, encoded)])
    }

    async fn restore(&self, files: Vec<SnapshotFile>) -> Result<()> {
        let file = files
            .into_iter()
            .find(|f| f.name == DATA_FILE)
            .ok_or_else(|| RaftError::storage("snapshot has no data file"))?;
        let restored: MemoryState = bincode::deserialize(&file.data)?;
        *self.state.lock() = restored;
        Ok(())
    }
}
