//! Raft node - wires the protocol engine to its background tasks and
//! exposes the client and administrative API.
//!
//! A node runs three tasks for its whole life: the election timer, the
//! election loop and the apply loop. Replicators come and go with
//! leadership and are owned by the leader state.
//!
//! # Reads
//!
//! [`Raft::read_index`] returns an index the caller may read at once the
//! state machine has applied it:
//!
//! ```text
//! wait until an entry of the leader's own term is committed
//! read_index = commit_index
//!   lease VALID     -> no network round trip
//!   lease otherwise -> one heartbeat round acknowledged by a quorum
//! wait for last_applied >= read_index
//! ```

use bytes::Bytes;
use nori_observe::{Meter, NoopMeter, RaftKind};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::clock::{Clock, MonotonicClock};
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::lease::{FollowerLease, LeaderLease, LeaseInfo, LeaseState};
use crate::log::RaftLog;
use crate::registry::{NodeHandle, NodeRegistry};
use crate::state::{hash_u32, Core, OutOfOrderCache, RaftState, RoleSnapshot};
use crate::state_machine::StateMachine;
use crate::storage::{LogStore, MetaStore, SnapshotStore};
use crate::throttle::SnapshotThrottle;
use crate::timer::ElectionTimer;
use crate::transport::RaftTransport;
use crate::types::*;

/// Everything needed to start a node.
pub struct NodeOptions {
    pub group_id: String,
    pub peer_id: PeerAddress,
    /// Membership used when neither the log nor a snapshot records one.
    pub initial_peers: Configuration,
    pub config: RaftConfig,
    pub log_store: Arc<dyn LogStore>,
    /// Current term and vote.
    pub meta_store: Arc<dyn MetaStore>,
    pub snapshot_store: Arc<dyn SnapshotStore>,
    pub state_machine: Arc<dyn StateMachine>,
    pub transport: Arc<dyn RaftTransport>,
    /// Usually one per disk, shared by every node on it.
    pub snapshot_throttle: Option<Arc<dyn SnapshotThrottle>>,
    pub clock: Arc<dyn Clock>,
    pub meter: Arc<dyn Meter>,
}

impl NodeOptions {
    pub fn new(
        group_id: impl Into<String>,
        peer_id: PeerAddress,
        initial_peers: Configuration,
        log_store: Arc<dyn LogStore>,
        meta_store: Arc<dyn MetaStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            peer_id,
            initial_peers,
            config: RaftConfig::default(),
            log_store,
            meta_store,
            snapshot_store,
            state_machine,
            transport,
            snapshot_throttle: None,
            clock: Arc::new(MonotonicClock),
            meter: Arc::new(NoopMeter),
        }
    }
}

/// Point-in-time view of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: NodeState,
    pub term: Term,
    pub leader: Option<PeerAddress>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_id: LogId,
    pub snapshot_index: LogIndex,
    pub lease: LeaseInfo,
}

pub struct Raft {
    state: Arc<RaftState>,
    registry: Weak<NodeRegistry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Raft {
    /// Start a node and register it. The node's address must already be
    /// served by a service registered with `registry`; snapshot files are
    /// offered through that service's file service.
    pub async fn create(options: NodeOptions, registry: &Arc<NodeRegistry>) -> Result<Arc<Raft>> {
        options
            .config
            .validate()
            .map_err(|reason| RaftError::ConfigError { reason })?;
        let id = NodeId::new(options.group_id, options.peer_id);
        let service = registry
            .service(&id.peer_id.addr)
            .ok_or(RaftError::ServiceNotRegistered {
                addr: id.peer_id.addr,
            })?;
        if registry.get(&id.group_id, &id.peer_id).is_some() {
            return Err(RaftError::NodeExists { node: id });
        }

        let latest = options.snapshot_store.latest();
        if let Some(handle) = &latest {
            let files = options.snapshot_store.load(handle).await?;
            options.state_machine.restore(files).await?;
        }
        let log = RaftLog::open(
            options.log_store,
            latest.as_ref().map(|h| &h.meta),
            ConfigurationEntry::stable(options.initial_peers),
        )
        .await?;

        let config = options.config;
        let clock = options.clock;
        let start = log.snapshot_id().index;
        let hard = options.meta_store.load()?;
        // never campaign below a term already in the log
        let term = std::cmp::max(hard.term, log.last_log_id().term);
        let voted_for = if hard.term == term { hard.voted_for } else { None };
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let timer = Arc::new(ElectionTimer::new(config.clone(), trigger_tx));
        let role = RoleSnapshot {
            term,
            state: NodeState::Follower,
            leader: None,
        };

        let state = Arc::new(RaftState {
            core: Mutex::new(Core {
                state: NodeState::Follower,
                current_term: term,
                voted_for,
                leader_id: None,
                commit_index: start,
                last_applied: start,
                leader_lease: LeaderLease::new(
                    config.enable_leader_lease,
                    config.leader_lease_timeout(),
                    clock.clone(),
                ),
                follower_lease: FollowerLease::new(
                    config.enable_leader_lease,
                    config.election_timeout_min,
                    config.max_clock_drift,
                    clock.clone(),
                ),
                leader: None,
                transfer_target: None,
                conf_change_in_flight: false,
            }),
            commit_tx: watch::channel(start).0,
            applied_tx: watch::channel(start).0,
            last_index_tx: watch::channel(log.last_index()).0,
            role_tx: watch::channel(role).0,
            shutdown_tx: watch::channel(false).0,
            id: id.clone(),
            log,
            meta: options.meta_store,
            append_lock: tokio::sync::Mutex::new(()),
            apply_lock: tokio::sync::Mutex::new(()),
            snapshot_lock: tokio::sync::Mutex::new(()),
            ooo_cache: Mutex::new(OutOfOrderCache::default()),
            transport: options.transport,
            fsm: options.state_machine,
            snapshots: options.snapshot_store,
            file_service: service.file_service(),
            throttle: options.snapshot_throttle,
            clock,
            meter: options.meter,
            timer: timer.clone(),
            config,
        });

        let tasks = vec![
            tokio::spawn(timer.run()),
            tokio::spawn(
                state
                    .clone()
                    .run_election_loop(trigger_rx, state.shutdown_tx.subscribe()),
            ),
            tokio::spawn(state.clone().run_apply_loop(state.shutdown_tx.subscribe())),
        ];
        let raft = Arc::new(Raft {
            state,
            registry: Arc::downgrade(registry),
            tasks: Mutex::new(tasks),
        });
        if let Err(e) = registry.add(raft.clone()) {
            raft.stop_tasks();
            return Err(e);
        }

        tracing::info!(
            node = %id,
            term = %term,
            voted_for = ?voted_for,
            last_log = %raft.state.log.last_log_id(),
            snapshot = %start,
            "Raft node started"
        );
        Ok(raft)
    }

    fn stop_tasks(&self) {
        self.state.shutdown_tx.send_replace(true);
        self.state.timer.shutdown();
    }

    /// Leave the group: stop all tasks and unregister.
    pub async fn shutdown(self: &Arc<Self>) {
        {
            let mut core = self.state.core.lock();
            if core.state == NodeState::ShuttingDown {
                return;
            }
            if core.state.is_leader() {
                core.leader_lease.on_leader_stop();
            }
            // dropping the leader state stops the replicators
            core.leader = None;
            core.state = NodeState::ShuttingDown;
            self.state.publish_role(&core);
        }
        self.stop_tasks();
        if let Some(registry) = self.registry.upgrade() {
            let handle: Arc<dyn NodeHandle> = self.clone();
            registry.remove(&handle);
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(node = %self.state.id, "Raft node stopped");
    }

    /// Replicate `data` and wait until it commits. Returns its index.
    pub async fn propose(&self, data: Bytes) -> Result<LogIndex> {
        let (index, term) = self
            .state
            .append_as_leader(vec![EntryPayload::Data(data)], false)
            .await?;
        self.wait_committed(index, term, self.state.config.propose_timeout)
            .await?;
        Ok(index)
    }

    /// Wait until `index`, written in `term`, is committed.
    async fn wait_committed(&self, index: LogIndex, term: Term, limit: Duration) -> Result<()> {
        match tokio::time::timeout(limit, self.commit_of(index, term)).await {
            Ok(result) => result,
            Err(_) => Err(RaftError::Timeout {
                elapsed_ms: limit.as_millis() as u64,
            }),
        }
    }

    async fn commit_of(&self, index: LogIndex, term: Term) -> Result<()> {
        let mut commit_rx = self.state.commit_tx.subscribe();
        let mut role_rx = self.state.role_tx.subscribe();
        loop {
            if *commit_rx.borrow_and_update() >= index {
                // the entry may have been replaced by another leader's
                return match self.state.log.term_at(index).await? {
                    Some(t) if t != term => Err(RaftError::NotLeader {
                        leader: self.state.role_tx.borrow().leader,
                    }),
                    _ => Ok(()),
                };
            }
            let role = *role_rx.borrow_and_update();
            if !role.state.is_active() {
                return Err(RaftError::NotActive { state: role.state });
            }
            if role.term != term || !role.state.is_leader() {
                return Err(RaftError::NotLeader {
                    leader: role.leader,
                });
            }
            tokio::select! {
                changed = commit_rx.changed() => changed.map_err(|_| RaftError::Shutdown)?,
                changed = role_rx.changed() => changed.map_err(|_| RaftError::Shutdown)?,
            }
        }
    }

    /// Index at which a linearizable read may be served. Returns once the
    /// state machine has applied it.
    pub async fn read_index(&self) -> Result<LogIndex> {
        let limit = self.state.config.propose_timeout;
        let result = tokio::time::timeout(limit, self.read_index_inner()).await;
        result.unwrap_or(Err(RaftError::Timeout {
            elapsed_ms: limit.as_millis() as u64,
        }))
    }

    async fn read_index_inner(&self) -> Result<LogIndex> {
        let term = {
            let core = self.state.core.lock();
            self.state.check_active(&core)?;
            if !core.state.is_leader() {
                return Err(self.state.not_leader(&core));
            }
            core.current_term
        };

        // commit_index only bounds earlier writes once our own term committed
        let mut commit_rx = self.state.commit_tx.subscribe();
        let read_index = loop {
            let commit = *commit_rx.borrow_and_update();
            if self.state.log.term_at(commit).await? == Some(term) {
                break commit;
            }
            commit_rx.changed().await.map_err(|_| RaftError::Shutdown)?;
        };

        let lease = self.state.core.lock().leader_lease.get_lease_info();
        if lease.state != LeaseState::Valid || lease.term != term {
            self.state.confirm_leadership(term).await?;
        }

        let mut applied_rx = self.state.applied_tx.subscribe();
        applied_rx
            .wait_for(|applied| *applied >= read_index)
            .await
            .map_err(|_| RaftError::Shutdown)?;
        Ok(read_index)
    }

    /// Hand leadership to `target`.
    ///
    /// Client writes are refused while the transfer runs. Once `target`
    /// holds the whole log it is told to campaign immediately. If no new
    /// leader has taken over after one election timeout this node resumes
    /// leading.
    pub async fn transfer_leadership_to(&self, target: PeerAddress) -> Result<()> {
        let term = {
            let mut core = self.state.core.lock();
            self.state.check_active(&core)?;
            match core.state {
                NodeState::Leader => {}
                NodeState::Transferring => return Err(RaftError::busy("leadership transfer already running")),
                _ => return Err(self.state.not_leader(&core)),
            }
            if target == self.state.me() {
                return Ok(());
            }
            let (_, conf) = self.state.log.current_configuration();
            if conf.is_joint() || core.conf_change_in_flight {
                return Err(RaftError::busy("configuration change in progress"));
            }
            if !conf.peers.contains(&target) || target.is_witness() {
                return Err(RaftError::invalid(format!("{} cannot take over leadership", target)));
            }
            core.state = NodeState::Transferring;
            core.transfer_target = Some(target);
            self.state.publish_role(&core);
            core.current_term
        };
        tracing::info!(group = %self.state.id.group_id, target = %target, term = %term, "Transferring leadership");
        self.state.emit(term, RaftKind::TransferLeadership { to: hash_u32(&target) });

        let watchdog = self.state.clone();
        let window = self.state.config.election_timeout_min;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            watchdog.end_transfer(term, "transfer timed out");
        });

        let result = tokio::time::timeout(window, self.hand_over(target, term)).await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.state.end_transfer(term, "transfer failed");
                Err(e)
            }
            Err(_) => {
                self.state.end_transfer(term, "target did not catch up");
                Err(RaftError::Timeout {
                    elapsed_ms: window.as_millis() as u64,
                })
            }
        }
    }

    async fn hand_over(&self, target: PeerAddress, term: Term) -> Result<()> {
        let poll = std::cmp::max(self.state.config.heartbeat_interval / 4, Duration::from_millis(1));
        loop {
            let caught_up = {
                let core = self.state.core.lock();
                if core.state != NodeState::Transferring || core.current_term != term {
                    return Err(self.state.not_leader(&core));
                }
                core.leader
                    .as_ref()
                    .and_then(|l| l.progress.get(&target))
                    .map_or(false, |p| p.match_index >= self.state.log.last_index())
            };
            if caught_up {
                break;
            }
            tokio::time::sleep(poll).await;
        }

        let request = TimeoutNowRequest {
            group_id: self.state.id.group_id.clone(),
            server_id: self.state.me(),
            peer_id: target,
            term,
        };
        let response = self
            .state
            .transport
            .timeout_now(&target, request, self.state.config.rpc_timeout)
            .await?;
        if response.term > term {
            let mut core = self.state.core.lock();
            self.state.step_down(&mut core, response.term, "higher term in timeout-now response");
            return Err(self.state.not_leader(&core));
        }
        if !response.success {
            return Err(RaftError::invalid(format!("{} refused to take over", target)));
        }
        Ok(())
    }

    /// Move the group to `new_peers` through a joint configuration.
    ///
    /// Returns once the final configuration is committed. A leader that is
    /// not part of `new_peers` steps down afterwards.
    pub async fn change_peers(&self, new_peers: Configuration) -> Result<()> {
        if new_peers.is_empty() {
            return Err(RaftError::invalid("new configuration has no peers"));
        }
        let (term, old_peers) = {
            let mut core = self.state.core.lock();
            self.state.check_active(&core)?;
            match core.state {
                NodeState::Leader => {}
                NodeState::Transferring => return Err(RaftError::busy("leadership transfer in progress")),
                _ => return Err(self.state.not_leader(&core)),
            }
            let (_, conf) = self.state.log.current_configuration();
            if core.conf_change_in_flight || conf.is_joint() {
                return Err(RaftError::busy("another configuration change is in flight"));
            }
            if conf.peers == new_peers {
                return Ok(());
            }
            core.conf_change_in_flight = true;
            (core.current_term, conf.peers)
        };

        let result = self.run_conf_change(term, old_peers, new_peers).await;
        let mut core = self.state.core.lock();
        if core.current_term == term {
            core.conf_change_in_flight = false;
        }
        result
    }

    async fn run_conf_change(&self, term: Term, old_peers: Configuration, new_peers: Configuration) -> Result<()> {
        let limit = self.state.config.propose_timeout;
        tracing::info!(
            group = %self.state.id.group_id,
            old = old_peers.len(),
            new = new_peers.len(),
            "Entering joint configuration"
        );

        let joint = ConfigurationEntry::joint(new_peers.clone(), old_peers);
        let (index, _) = self
            .state
            .append_as_leader(vec![EntryPayload::Configuration(joint.clone())], true)
            .await?;
        self.state.sync_replicators(term, &joint);
        self.wait_committed(index, term, limit).await?;

        let stable = ConfigurationEntry::stable(new_peers.clone());
        let (index, _) = self
            .state
            .append_as_leader(vec![EntryPayload::Configuration(stable.clone())], true)
            .await?;
        self.wait_committed(index, term, limit).await?;
        // removed peers were fed until the final entry committed
        self.state.sync_replicators(term, &stable);

        tracing::info!(group = %self.state.id.group_id, peers = new_peers.len(), "Configuration changed");
        self.state.emit(
            term,
            RaftKind::ConfigurationChanged {
                voters: new_peers.len(),
            },
        );
        if !new_peers.contains(&self.state.me()) {
            let mut core = self.state.core.lock();
            self.state.step_down(&mut core, term, "removed from configuration");
        }
        Ok(())
    }

    /// Snapshot the state machine now and compact the log.
    pub async fn snapshot(&self) -> Result<SnapshotMeta> {
        self.state.take_snapshot().await
    }

    pub fn node_id(&self) -> &NodeId {
        &self.state.id
    }

    pub fn is_leader(&self) -> bool {
        self.state.core.lock().state.is_leader()
    }

    pub fn leader_id(&self) -> Option<PeerAddress> {
        self.state.core.lock().leader_id
    }

    pub fn current_term(&self) -> Term {
        self.state.current_term()
    }

    pub fn configuration(&self) -> ConfigurationEntry {
        self.state.log.current_configuration().1
    }

    /// Role changes as they happen.
    pub fn subscribe_role(&self) -> watch::Receiver<RoleSnapshot> {
        self.state.role_tx.subscribe()
    }

    pub fn status(&self) -> NodeStatus {
        let core = self.state.core.lock();
        NodeStatus {
            id: self.state.id.clone(),
            state: core.state,
            term: core.current_term,
            leader: core.leader_id,
            commit_index: core.commit_index,
            last_applied: core.last_applied,
            last_log_id: self.state.log.last_log_id(),
            snapshot_index: self.state.log.snapshot_id().index,
            lease: core.leader_lease.get_lease_info(),
        }
    }
}

impl RaftState {
    /// Resume leading if the transfer started in `term` is still running.
    fn end_transfer(&self, term: Term, reason: &str) {
        let mut core = self.core.lock();
        if core.state == NodeState::Transferring && core.current_term == term {
            tracing::warn!(group = %self.id.group_id, term = %term, reason, "Leadership transfer abandoned");
            core.state = NodeState::Leader;
            core.transfer_target = None;
            self.publish_role(&core);
        }
    }
}

#[async_trait::async_trait]
impl NodeHandle for Raft {
    fn node_id(&self) -> NodeId {
        self.state.id.clone()
    }

    fn current_term(&self) -> Term {
        self.state.current_term()
    }

    fn handle_pre_vote(&self, request: &RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.state.handle_pre_vote(request)
    }

    fn handle_request_vote(&self, request: &RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.state.handle_request_vote(request)
    }

    async fn handle_append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.state.handle_append_entries(request).await
    }

    async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.state.handle_install_snapshot(request).await
    }

    fn handle_timeout_now(&self, request: &TimeoutNowRequest) -> Result<TimeoutNowResponse> {
        self.state.handle_timeout_now(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_service::FileService;
    use crate::service::{ConsensusService, RaftServer, RaftService};
    use crate::state::tests::peer;
    use crate::state_machine::MemoryStateMachine;
    use crate::storage::{FileMetaStore, LocalSnapshotStore, MemoryLogStore, MemoryMetaStore};
    use crate::transport::{InMemoryNetwork, InMemoryTransport};
    use tempfile::TempDir;

    fn fast_config() -> RaftConfig {
        RaftConfig {
            heartbeat_interval: Duration::from_millis(20),
            election_timeout_min: Duration::from_millis(100),
            election_timeout_max: Duration::from_millis(200),
            max_clock_drift: Duration::from_millis(10),
            rpc_timeout: Duration::from_millis(100),
            propose_timeout: Duration::from_secs(2),
            ..RaftConfig::default()
        }
    }

    async fn single_node(dir: &TempDir) -> (Arc<Raft>, Arc<NodeRegistry>, RaftServer) {
        start_node(
            dir,
            Configuration::new([peer(1)]),
            Arc::new(MemoryLogStore::new()),
            Arc::new(MemoryMetaStore::new()),
        )
        .await
    }

    async fn start_node(
        dir: &TempDir,
        peers: Configuration,
        log_store: Arc<MemoryLogStore>,
        meta_store: Arc<dyn MetaStore>,
    ) -> (Arc<Raft>, Arc<NodeRegistry>, RaftServer) {
        let network = InMemoryNetwork::new();
        let registry = NodeRegistry::new();
        let me = peer(1);
        let service: Arc<dyn ConsensusService> =
            Arc::new(RaftService::new(&registry, Arc::new(FileService::new(false, 4096))));
        registry.add_service(me.addr, service.clone()).unwrap();
        let server = RaftServer::serve(&network, me.addr, service).unwrap();

        let mut options = NodeOptions::new(
            "g",
            me,
            peers,
            log_store,
            meta_store,
            Arc::new(LocalSnapshotStore::open(dir.path()).await.unwrap()),
            Arc::new(MemoryStateMachine::new()),
            Arc::new(InMemoryTransport::new(me.addr, network)),
        );
        options.config = fast_config();
        let raft = Raft::create(options, &registry).await.unwrap();
        (raft, registry, server)
    }

    async fn wait_leader(raft: &Raft) {
        let mut role = raft.subscribe_role();
        tokio::time::timeout(Duration::from_secs(2), role.wait_for(|r| r.state == NodeState::Leader))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_commits() {
        let dir = TempDir::new().unwrap();
        let (raft, _registry, _server) = single_node(&dir).await;
        wait_leader(&raft).await;

        let index = raft.propose(Bytes::from_static(b"a")).await.unwrap();
        assert!(index >= LogIndex(2));
        let read = raft.read_index().await.unwrap();
        assert!(read >= index);
        assert!(raft.status().last_applied >= index);
        raft.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_requires_service() {
        let dir = TempDir::new().unwrap();
        let registry = NodeRegistry::new();
        let options = NodeOptions::new(
            "g",
            peer(1),
            Configuration::new([peer(1)]),
            Arc::new(MemoryLogStore::new()),
            Arc::new(MemoryMetaStore::new()),
            Arc::new(LocalSnapshotStore::open(dir.path()).await.unwrap()),
            Arc::new(MemoryStateMachine::new()),
            Arc::new(InMemoryTransport::new(peer(1).addr, InMemoryNetwork::new())),
        );
        assert!(matches!(
            Raft::create(options, &registry).await,
            Err(RaftError::ServiceNotRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_unregisters() {
        let dir = TempDir::new().unwrap();
        let (raft, registry, _server) = single_node(&dir).await;
        assert!(registry.get("g", &peer(1)).is_some());

        raft.shutdown().await;
        assert!(registry.get("g", &peer(1)).is_none());
        assert_eq!(raft.status().state, NodeState::ShuttingDown);
        assert!(matches!(
            raft.propose(Bytes::from_static(b"late")).await,
            Err(RaftError::NotActive { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshot_then_restart_restores_state() {
        let dir = TempDir::new().unwrap();
        let (raft, _registry, server) = single_node(&dir).await;
        wait_leader(&raft).await;
        for value in [&b"x"[..], b"y", b"z"] {
            raft.propose(Bytes::copy_from_slice(value)).await.unwrap();
        }
        raft.read_index().await.unwrap();
        let meta = raft.snapshot().await.unwrap();
        assert_eq!(meta.last_included.index, raft.status().last_applied);
        raft.shutdown().await;
        drop(server);

        let (restarted, _registry, _server) = single_node(&dir).await;
        let status = restarted.status();
        assert_eq!(status.snapshot_index, meta.last_included.index);
        assert_eq!(status.last_applied, meta.last_included.index);
        assert!(status.term >= meta.last_included.term);
        restarted.shutdown().await;
    }

    #[tokio::test]
    async fn test_change_peers_rejects_empty_configuration() {
        let dir = TempDir::new().unwrap();
        let (raft, _registry, _server) = single_node(&dir).await;
        assert!(matches!(
            raft.change_peers(Configuration::default()).await,
            Err(RaftError::InvalidRequest { .. })
        ));
        raft.shutdown().await;
    }

    #[tokio::test]
    async fn test_vote_survives_restart() {
        let dir = TempDir::new().unwrap();
        let peers = Configuration::new([peer(1), peer(2), peer(3)]);
        let log_store = Arc::new(MemoryLogStore::new());
        let meta_path = dir.path().join("meta").join("raft_meta");
        let vote = |candidate: u16| RequestVoteRequest {
            group_id: "g".to_string(),
            server_id: peer(candidate),
            peer_id: peer(1),
            term: Term(5),
            last_log_id: LogId::ZERO,
        };

        let meta: Arc<dyn MetaStore> = Arc::new(FileMetaStore::open(&meta_path).unwrap());
        let (raft, _registry, server) = start_node(&dir, peers.clone(), log_store.clone(), meta).await;
        assert!(raft.handle_request_vote(&vote(2)).unwrap().granted);
        raft.shutdown().await;
        drop(server);

        let meta: Arc<dyn MetaStore> = Arc::new(FileMetaStore::open(&meta_path).unwrap());
        let (restarted, _registry, _server) = start_node(&dir, peers, log_store, meta).await;
        assert_eq!(restarted.current_term(), Term(5));

        let other = restarted.handle_request_vote(&vote(3)).unwrap();
        assert!(!other.granted);
        assert_eq!(other.term, Term(5));
        // the candidate it already voted for may ask again
        assert!(restarted.handle_request_vote(&vote(2)).unwrap().granted);
        restarted.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_vote_save_enters_error() {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(MemoryMetaStore::new());
        let (raft, _registry, _server) = start_node(
            &dir,
            Configuration::new([peer(1), peer(2), peer(3)]),
            Arc::new(MemoryLogStore::new()),
            meta.clone(),
        )
        .await;

        meta.set_fail_writes(true);
        let request = RequestVoteRequest {
            group_id: "g".to_string(),
            server_id: peer(2),
            peer_id: peer(1),
            term: Term(3),
            last_log_id: LogId::ZERO,
        };
        // the term could not be saved, so nothing is granted
        assert!(raft.handle_request_vote(&request).is_err());
        assert_eq!(raft.status().state, NodeState::Error);
        assert!(matches!(
            raft.handle_request_vote(&request),
            Err(RaftError::NotActive { .. })
        ));
        raft.shutdown().await;
    }
}
