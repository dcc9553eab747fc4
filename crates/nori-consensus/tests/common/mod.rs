//! Multi-node harness over the in-memory network.
//!
//! Every node gets its own registry, endpoint and snapshot directory, the
//! way separate processes would.

#![allow(dead_code)]

use bytes::Bytes;
use nori_consensus::*;
use nori_observe::MemoryMeter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const GROUP: &str = "g1";

pub fn init_tracing() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
}

pub fn peer(port: u16) -> PeerAddress {
    PeerAddress::new(SocketAddr::from(([127, 0, 0, 1], port)))
}

pub fn fast_config() -> RaftConfig {
    RaftConfig {
        heartbeat_interval: Duration::from_millis(30),
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        max_clock_drift: Duration::from_millis(10),
        rpc_timeout: Duration::from_millis(100),
        propose_timeout: Duration::from_secs(3),
        install_snapshot_timeout: Duration::from_secs(5),
        copy_retry_interval: Duration::from_millis(50),
        snapshot_chunk_size: 64,
        ..Default::default()
    }
}

pub struct TestNode {
    pub peer: PeerAddress,
    pub raft: Arc<Raft>,
    pub fsm: Arc<MemoryStateMachine>,
    pub meter: Arc<MemoryMeter>,
    pub registry: Arc<NodeRegistry>,
    pub server: RaftServer,
    _dir: TempDir,
}

impl TestNode {
    pub fn values(&self) -> Vec<Bytes> {
        self.fsm.values()
    }
}

pub struct Cluster {
    pub network: Arc<InMemoryNetwork>,
    pub config: RaftConfig,
    pub nodes: Vec<TestNode>,
}

impl Cluster {
    pub async fn start(ports: &[u16]) -> Self {
        Self::start_with(ports, fast_config()).await
    }

    pub async fn start_with(ports: &[u16], config: RaftConfig) -> Self {
        init_tracing();
        let mut cluster = Self {
            network: InMemoryNetwork::new(),
            config,
            nodes: Vec::new(),
        };
        let conf = Configuration::new(ports.iter().map(|p| peer(*p)));
        for port in ports {
            cluster.add_node(*port, conf.clone()).await;
        }
        cluster
    }

    /// Start one more node whose initial membership is `initial_peers`.
    pub async fn add_node(&mut self, port: u16, initial_peers: Configuration) -> &TestNode {
        let me = peer(port);
        let dir = TempDir::new().unwrap();
        let registry = NodeRegistry::new();
        let files = Arc::new(FileService::from_config(&self.config));
        let service: Arc<dyn ConsensusService> = Arc::new(RaftService::new(&registry, files));
        registry.add_service(me.addr, service.clone()).unwrap();
        let server = RaftServer::serve(&self.network, me.addr, service).unwrap();

        let fsm = Arc::new(MemoryStateMachine::new());
        let meter = Arc::new(MemoryMeter::new());
        let snapshots = LocalSnapshotStore::open(dir.path().join("snapshot")).await.unwrap();
        let mut options = NodeOptions::new(
            GROUP,
            me,
            initial_peers,
            Arc::new(MemoryLogStore::new()),
            Arc::new(FileMetaStore::open(dir.path().join("raft_meta")).unwrap()),
            Arc::new(snapshots),
            fsm.clone(),
            Arc::new(InMemoryTransport::new(me.addr, self.network.clone())),
        );
        options.config = self.config.clone();
        options.meter = meter.clone();
        options.snapshot_throttle =
            ThroughputSnapshotThrottle::build(&self.config.throttle, options.clock.clone());
        let raft = Raft::create(options, &registry).await.unwrap();

        self.nodes.push(TestNode {
            peer: me,
            raft,
            fsm,
            meter,
            registry,
            server,
            _dir: dir,
        });
        self.nodes.last().unwrap()
    }

    pub fn node(&self, peer: PeerAddress) -> &TestNode {
        self.nodes.iter().find(|n| n.peer == peer).unwrap()
    }

    /// Wait until exactly one of `among` leads and every other member of
    /// `among` follows it in the same term.
    pub async fn wait_leader_among(&self, among: &[PeerAddress]) -> PeerAddress {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let statuses: Vec<NodeStatus> =
                among.iter().map(|p| self.node(*p).raft.status()).collect();
            let leaders: Vec<&NodeStatus> =
                statuses.iter().filter(|s| s.state == NodeState::Leader).collect();
            if let [leader] = leaders.as_slice() {
                let settled = statuses.iter().all(|s| {
                    s.term == leader.term && s.leader == Some(leader.id.peer_id)
                });
                if settled {
                    return leader.id.peer_id;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no stable leader: {:?}",
                statuses
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_leader(&self) -> PeerAddress {
        let all: Vec<PeerAddress> = self.nodes.iter().map(|n| n.peer).collect();
        self.wait_leader_among(&all).await
    }

    /// Wait until `peer` has applied `count` values.
    pub async fn wait_applied(&self, peer: PeerAddress, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.node(peer).values().len() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} applied {} of {} values",
                peer,
                self.node(peer).values().len(),
                count
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn propose_all(&self, leader: PeerAddress, values: impl IntoIterator<Item = String>) {
        let raft = &self.node(leader).raft;
        for value in values {
            raft.propose(Bytes::from(value)).await.unwrap();
        }
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.raft.shutdown().await;
            node.server.shutdown();
        }
    }
}
