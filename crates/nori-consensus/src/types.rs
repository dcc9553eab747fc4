//! Core consensus types: terms, log identity, peers, entries and RPC messages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::RaftError;

/// Raft term number (monotonically increasing).
///
/// Terms establish logical clocks in Raft. Each term has at most one leader.
/// When a server starts an election, it increments its term.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log index (1-indexed, 0 is sentinel for "no entry").
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Identity of a log entry.
///
/// Ordered by `term` first and `index` second, which is exactly the Raft
/// "at least as up-to-date" comparison used by elections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogId {
    pub index: LogIndex,
    pub term: Term,
}

impl LogId {
    pub const ZERO: LogId = LogId {
        index: LogIndex::ZERO,
        term: Term::ZERO,
    };

    pub fn new(index: u64, term: u64) -> Self {
        Self {
            index: LogIndex(index),
            term: Term(term),
        }
    }
}

impl Ord for LogId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.term
            .cmp(&other.term)
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl PartialOrd for LogId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.term, self.index)
    }
}

/// Replica flavour carried in a peer address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    #[default]
    Replica,
    Witness,
}

/// Address of one replica: `ip:port`, a slot index for several replicas
/// behind one endpoint, and a role tag.
///
/// Equality, hashing and ordering use `addr` and `idx` only; the role is a
/// tag and never distinguishes two peers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PeerAddress {
    pub addr: SocketAddr,
    pub idx: u32,
    pub role: PeerRole,
}

impl PeerAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            idx: 0,
            role: PeerRole::Replica,
        }
    }

    pub fn with_idx(addr: SocketAddr, idx: u32) -> Self {
        Self {
            addr,
            idx,
            role: PeerRole::Replica,
        }
    }

    pub fn witness(addr: SocketAddr, idx: u32) -> Self {
        Self {
            addr,
            idx,
            role: PeerRole::Witness,
        }
    }

    pub fn is_witness(&self) -> bool {
        self.role == PeerRole::Witness
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.idx == other.idx
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
        self.idx.hash(state);
    }
}

impl Ord for PeerAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr
            .cmp(&other.addr)
            .then_with(|| self.idx.cmp(&other.idx))
    }
}

impl PartialOrd for PeerAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            PeerRole::Replica => 0,
            PeerRole::Witness => 1,
        };
        write!(f, "{}:{}:{}", self.addr, self.idx, role)
    }
}

impl FromStr for PeerAddress {
    type Err = RaftError;

    /// Parses `ip:port[:idx[:role]]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RaftError::InvalidPeer {
            peer: s.to_string(),
        };
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(invalid());
        }
        let addr: SocketAddr = format!("{}:{}", parts[0], parts[1])
            .parse()
            .map_err(|_| invalid())?;
        let idx = match parts.get(2) {
            Some(v) => v.parse::<u32>().map_err(|_| invalid())?,
            None => 0,
        };
        let role = match parts.get(3) {
            None | Some(&"0") => PeerRole::Replica,
            Some(&"1") => PeerRole::Witness,
            Some(_) => return Err(invalid()),
        };
        Ok(Self { addr, idx, role })
    }
}

/// Identifies exactly one replica of one consensus group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub group_id: String,
    pub peer_id: PeerAddress,
}

impl NodeId {
    pub fn new(group_id: impl Into<String>, peer_id: PeerAddress) -> Self {
        Self {
            group_id: group_id.into(),
            peer_id,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_id, self.peer_id)
    }
}

/// An ordered set of peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    peers: BTreeSet<PeerAddress>,
}

impl Configuration {
    pub fn new(peers: impl IntoIterator<Item = PeerAddress>) -> Self {
        Self {
            peers: peers.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(&self, peer: &PeerAddress) -> bool {
        self.peers.contains(peer)
    }

    pub fn add_peer(&mut self, peer: PeerAddress) -> bool {
        self.peers.insert(peer)
    }

    pub fn remove_peer(&mut self, peer: &PeerAddress) -> bool {
        self.peers.remove(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerAddress> {
        self.peers.iter()
    }

    /// Majority size for this set.
    pub fn quorum(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    fn has_quorum(&self, votes: &HashSet<PeerAddress>) -> bool {
        if self.peers.is_empty() {
            return true;
        }
        self.peers.iter().filter(|p| votes.contains(p)).count() >= self.quorum()
    }

    /// Value acknowledged by a majority: the `quorum()`-th largest of the
    /// per-peer values. `None` for an empty set.
    fn quorum_value<T: Ord + Copy>(&self, value_of: &dyn Fn(&PeerAddress) -> T) -> Option<T> {
        if self.peers.is_empty() {
            return None;
        }
        let mut values: Vec<T> = self.peers.iter().map(value_of).collect();
        values.sort_unstable_by(|a, b| b.cmp(a));
        Some(values[self.quorum() - 1])
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peers: Vec<String> = self.peers.iter().map(|p| p.to_string()).collect();
        write!(f, "[{}]", peers.join(","))
    }
}

/// Membership as recorded in the log: the current peer set plus, while a
/// joint-consensus change is in flight, the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationEntry {
    pub peers: Configuration,
    pub old_peers: Option<Configuration>,
}

impl ConfigurationEntry {
    pub fn stable(peers: Configuration) -> Self {
        Self {
            peers,
            old_peers: None,
        }
    }

    pub fn joint(new: Configuration, old: Configuration) -> Self {
        Self {
            peers: new,
            old_peers: Some(old),
        }
    }

    pub fn is_joint(&self) -> bool {
        self.old_peers.is_some()
    }

    pub fn contains(&self, peer: &PeerAddress) -> bool {
        self.peers.contains(peer)
            || self
                .old_peers
                .as_ref()
                .map_or(false, |old| old.contains(peer))
    }

    /// Union of the new and old peer sets.
    pub fn all_peers(&self) -> Vec<PeerAddress> {
        let mut all: BTreeSet<PeerAddress> = self.peers.iter().copied().collect();
        if let Some(old) = &self.old_peers {
            all.extend(old.iter().copied());
        }
        all.into_iter().collect()
    }

    /// A vote set is a quorum when it holds a majority of every active set.
    pub fn has_quorum(&self, votes: &HashSet<PeerAddress>) -> bool {
        self.peers.has_quorum(votes)
            && self
                .old_peers
                .as_ref()
                .map_or(true, |old| old.has_quorum(votes))
    }

    /// Highest index acknowledged by a quorum of every active set.
    pub fn quorum_index(&self, match_of: impl Fn(&PeerAddress) -> LogIndex) -> LogIndex {
        self.quorum_value(match_of).unwrap_or(LogIndex::ZERO)
    }

    /// Generalised quorum over any ordered per-peer value (match index,
    /// last acknowledgement time). Joint configurations take the minimum of
    /// both majorities.
    pub fn quorum_value<T: Ord + Copy>(&self, value_of: impl Fn(&PeerAddress) -> T) -> Option<T> {
        let new_val = self.peers.quorum_value(&value_of);
        match &self.old_peers {
            Some(old) => match (new_val, old.quorum_value(&value_of)) {
                (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
                (a, b) => a.or(b),
            },
            None => new_val,
        }
    }
}

/// Kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Data,
    Configuration,
}

/// Entry payload: opaque bytes for data, a membership record otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    Data(Bytes),
    Configuration(ConfigurationEntry),
}

/// Immutable log entry.
///
/// Once created an entry is never mutated; it is shared as [`SharedEntry`]
/// between the log store and every replication target reading it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogId,
    pub payload: EntryPayload,
}

pub type SharedEntry = Arc<LogEntry>;

impl LogEntry {
    pub fn data(id: LogId, data: Bytes) -> Self {
        Self {
            id,
            payload: EntryPayload::Data(data),
        }
    }

    pub fn configuration(id: LogId, conf: ConfigurationEntry) -> Self {
        Self {
            id,
            payload: EntryPayload::Configuration(conf),
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self.payload {
            EntryPayload::Data(_) => EntryKind::Data,
            EntryPayload::Configuration(_) => EntryKind::Configuration,
        }
    }

    /// Approximate payload size, used for batch limits.
    pub fn size_hint(&self) -> usize {
        match &self.payload {
            EntryPayload::Data(d) => d.len(),
            EntryPayload::Configuration(c) => 32 * (c.peers.len() + c.old_peers.as_ref().map_or(0, |o| o.len())),
        }
    }
}

/// Node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
    Transferring,
    Error,
    ShuttingDown,
}

impl NodeState {
    /// States in which the node still takes part in the protocol.
    pub fn is_active(self) -> bool {
        !matches!(self, NodeState::Error | NodeState::ShuttingDown)
    }

    /// A transferring leader still replicates and answers as leader.
    pub fn is_leader(self) -> bool {
        matches!(self, NodeState::Leader | NodeState::Transferring)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Follower => "FOLLOWER",
            NodeState::Candidate => "CANDIDATE",
            NodeState::Leader => "LEADER",
            NodeState::Transferring => "TRANSFERRING",
            NodeState::Error => "ERROR",
            NodeState::ShuttingDown => "SHUTTING_DOWN",
        };
        f.write_str(s)
    }
}

/// Snapshot metadata: the last entry folded into the snapshot and the
/// membership in force at that point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included: LogId,
    pub configuration: ConfigurationEntry,
}

/// PreVote / RequestVote RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub group_id: String,
    /// Candidate
    pub server_id: PeerAddress,
    /// Voter
    pub peer_id: PeerAddress,
    /// For a pre-vote this is the term the candidate would run in.
    pub term: Term,
    pub last_log_id: LogId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub granted: bool,
    /// Refused only because the voter still trusts its current leader.
    pub rejected_by_lease: bool,
}

/// AppendEntries RPC request. Empty `entries` is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub group_id: String,
    /// Leader
    pub server_id: PeerAddress,
    pub peer_id: PeerAddress,
    pub term: Term,
    pub prev_log_id: LogId,
    pub entries: Vec<SharedEntry>,
    pub committed_index: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On a log mismatch: the follower's last index that may still match
    /// the leader. The leader resumes replication right after it.
    pub conflict_index: Option<LogIndex>,
    pub last_log_index: LogIndex,
}

/// InstallSnapshot RPC request.
///
/// The snapshot data itself is pulled by the follower through `GetFile`
/// from `uri` (`remote://ip:port/reader_id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub group_id: String,
    pub server_id: PeerAddress,
    pub peer_id: PeerAddress,
    pub term: Term,
    pub meta: SnapshotMeta,
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub success: bool,
}

/// TimeoutNow RPC request (leadership transfer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    pub group_id: String,
    pub server_id: PeerAddress,
    pub peer_id: PeerAddress,
    pub term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowResponse {
    pub term: Term,
    pub success: bool,
}

/// GetFile RPC request. Signed fields so invalid values can be rejected
/// instead of wrapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFileRequest {
    pub reader_id: i64,
    pub filename: String,
    pub offset: i64,
    pub count: i64,
    pub read_partly: bool,
}

/// A run of file data tagged with its absolute offset in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSegment {
    pub offset: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetFileResponse {
    /// Non-zero segments of the chunk. All-zero blocks are omitted when
    /// hole detection is on.
    pub segments: Vec<FileSegment>,
    pub eof: bool,
    /// Logical bytes covered by this chunk, holes included.
    pub read_size: u64,
}
