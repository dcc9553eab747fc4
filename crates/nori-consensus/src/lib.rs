//! nori-consensus: Raft consensus core with leases and throttled snapshot
//! transfer.
//!
//! - Leader election with pre-vote and follower leases
//! - Pipelined log replication with conflict hints and an out-of-order cache
//! - Leader leases and read-index for linearizable reads
//! - Leadership transfer through TimeoutNow
//! - Joint consensus for membership changes
//! - Snapshots pulled chunk by chunk, sparse-aware and throughput-throttled
//! - A process-wide node registry and an RPC layer routing into it
//!
//! Storage, transport and the state machine are traits; in-memory and
//! local-disk implementations are included.

pub mod clock;
pub mod config;
pub mod copier;
pub mod error;
pub mod file_service;
pub mod lease;
pub mod log;
pub mod raft;
pub mod registry;
pub mod service;
pub mod state_machine;
pub mod storage;
pub mod throttle;
pub mod timer;
pub mod transport;
pub mod types;

mod election;
mod replication;
mod snapshot;
mod state;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{RaftConfig, ThrottleConfig};
pub use error::{ErrorCode, RaftError, Result, RpcError};
pub use file_service::{FileReader, FileService, LocalDirReader};
pub use lease::{LeaseInfo, LeaseState};
pub use raft::{NodeOptions, NodeStatus, Raft};
pub use registry::{NodeHandle, NodeRegistry};
pub use service::{ConsensusService, RaftServer, RaftService};
pub use state::RoleSnapshot;
pub use state_machine::{MemoryStateMachine, StateMachine};
pub use storage::{
    FileMetaStore, HardState, LocalSnapshotStore, LogStore, MemoryLogStore, MemoryMetaStore,
    MetaStore, SnapshotStore,
};
pub use throttle::{SnapshotThrottle, ThrottleTask, ThroughputSnapshotThrottle};
pub use transport::{InMemoryNetwork, InMemoryTransport, RaftTransport};
pub use types::*;
