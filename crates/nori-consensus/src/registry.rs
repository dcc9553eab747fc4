//! Process-wide registry of consensus nodes and RPC endpoints.
//!
//! Every inbound RPC resolves its target through [`NodeRegistry::get`], so
//! lookups must never wait on node creation or removal. The node maps are
//! an immutable `Arc<NodeMaps>`: readers clone the pointer and work on that
//! point-in-time copy, writers build a modified copy and swap it in.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{RaftError, Result};
use crate::service::ConsensusService;
use crate::types::*;

/// What the RPC layer needs from a node. Keeps the service independent of
/// the concrete node type.
#[async_trait]
pub trait NodeHandle: Send + Sync {
    fn node_id(&self) -> NodeId;

    fn current_term(&self) -> Term;

    fn handle_pre_vote(&self, request: &RequestVoteRequest) -> Result<RequestVoteResponse>;

    fn handle_request_vote(&self, request: &RequestVoteRequest) -> Result<RequestVoteResponse>;

    async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;

    fn handle_timeout_now(&self, request: &TimeoutNowRequest) -> Result<TimeoutNowResponse>;
}

#[derive(Default, Clone)]
struct NodeMaps {
    by_id: HashMap<NodeId, Arc<dyn NodeHandle>>,
    by_group: HashMap<String, Vec<Arc<dyn NodeHandle>>>,
}

fn same_object<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[derive(Default)]
pub struct NodeRegistry {
    services: Mutex<HashMap<SocketAddr, Arc<dyn ConsensusService>>>,
    maps: RwLock<Arc<NodeMaps>>,
    // serializes copy-and-swap writers
    write_lock: Mutex<()>,
}

impl NodeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind `service` to `addr`. Registering the same service twice is a
    /// no-op; a different service on a taken address is refused.
    pub fn add_service(&self, addr: SocketAddr, service: Arc<dyn ConsensusService>) -> Result<()> {
        let mut services = self.services.lock();
        match services.get(&addr) {
            Some(existing) if same_object(existing, &service) => Ok(()),
            Some(_) => Err(RaftError::DuplicateService { addr }),
            None => {
                services.insert(addr, service);
                tracing::info!(addr = %addr, "Consensus service registered");
                Ok(())
            }
        }
    }

    pub fn remove_service(&self, addr: &SocketAddr) -> bool {
        self.services.lock().remove(addr).is_some()
    }

    pub fn service(&self, addr: &SocketAddr) -> Option<Arc<dyn ConsensusService>> {
        self.services.lock().get(addr).cloned()
    }

    /// Register a node. Its address must already serve RPCs.
    pub fn add(&self, node: Arc<dyn NodeHandle>) -> Result<()> {
        let id = node.node_id();
        if !self.services.lock().contains_key(&id.peer_id.addr) {
            return Err(RaftError::ServiceNotRegistered {
                addr: id.peer_id.addr,
            });
        }

        let _guard = self.write_lock.lock();
        let current = self.maps.read().clone();
        if current.by_id.contains_key(&id) {
            return Err(RaftError::NodeExists { node: id });
        }
        let mut next = (*current).clone();
        next.by_group
            .entry(id.group_id.clone())
            .or_default()
            .push(node.clone());
        next.by_id.insert(id.clone(), node);
        *self.maps.write() = Arc::new(next);
        tracing::debug!(node = %id, "Node registered");
        Ok(())
    }

    /// Unregister `node`. Ignored when a different instance now holds its
    /// id, so a late removal cannot evict a re-created node.
    pub fn remove(&self, node: &Arc<dyn NodeHandle>) -> bool {
        let id = node.node_id();
        let _guard = self.write_lock.lock();
        let current = self.maps.read().clone();
        match current.by_id.get(&id) {
            Some(registered) if same_object(registered, node) => {}
            Some(_) => {
                tracing::warn!(node = %id, "Not removing node: a newer instance is registered");
                return false;
            }
            None => return false,
        }

        let mut next = (*current).clone();
        next.by_id.remove(&id);
        if let Some(group) = next.by_group.get_mut(&id.group_id) {
            group.retain(|n| !same_object(n, node));
            if group.is_empty() {
                next.by_group.remove(&id.group_id);
            }
        }
        *self.maps.write() = Arc::new(next);
        tracing::debug!(node = %id, "Node unregistered");
        true
    }

    pub fn get(&self, group_id: &str, peer_id: &PeerAddress) -> Option<Arc<dyn NodeHandle>> {
        let maps = self.maps.read().clone();
        maps.by_id.get(&NodeId::new(group_id, *peer_id)).cloned()
    }

    pub fn get_nodes_by_group(&self, group_id: &str) -> Vec<Arc<dyn NodeHandle>> {
        let maps = self.maps.read().clone();
        maps.by_group.get(group_id).cloned().unwrap_or_default()
    }

    pub fn get_all_nodes(&self) -> Vec<Arc<dyn NodeHandle>> {
        let maps = self.maps.read().clone();
        maps.by_id.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::file_service::FileService;
    use crate::state::tests::peer;

    struct StubNode {
        id: NodeId,
    }

    #[async_trait]
    impl NodeHandle for StubNode {
        fn node_id(&self) -> NodeId {
            self.id.clone()
        }

        fn current_term(&self) -> Term {
            Term(1)
        }

        fn handle_pre_vote(&self, _: &RequestVoteRequest) -> Result<RequestVoteResponse> {
            Err(RaftError::Shutdown)
        }

        fn handle_request_vote(&self, _: &RequestVoteRequest) -> Result<RequestVoteResponse> {
            Err(RaftError::Shutdown)
        }

        async fn handle_append_entries(&self, _: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
            Err(RaftError::Shutdown)
        }

        async fn handle_install_snapshot(&self, _: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
            Err(RaftError::Shutdown)
        }

        fn handle_timeout_now(&self, _: &TimeoutNowRequest) -> Result<TimeoutNowResponse> {
            Err(RaftError::Shutdown)
        }
    }

    struct StubService(Arc<FileService>);

    fn down<T>() -> std::result::Result<T, RpcError> {
        Err(RpcError::from(&RaftError::Shutdown))
    }

    #[async_trait]
    impl ConsensusService for StubService {
        async fn pre_vote(&self, _: RequestVoteRequest) -> std::result::Result<RequestVoteResponse, RpcError> {
            down()
        }
        async fn request_vote(&self, _: RequestVoteRequest) -> std::result::Result<RequestVoteResponse, RpcError> {
            down()
        }
        async fn append_entries(&self, _: AppendEntriesRequest) -> std::result::Result<AppendEntriesResponse, RpcError> {
            down()
        }
        async fn install_snapshot(&self, _: InstallSnapshotRequest) -> std::result::Result<InstallSnapshotResponse, RpcError> {
            down()
        }
        async fn timeout_now(&self, _: TimeoutNowRequest) -> std::result::Result<TimeoutNowResponse, RpcError> {
            down()
        }
        async fn get_file(&self, _: GetFileRequest) -> std::result::Result<GetFileResponse, RpcError> {
            down()
        }
        fn file_service(&self) -> Arc<FileService> {
            self.0.clone()
        }
    }

    fn service() -> Arc<dyn ConsensusService> {
        Arc::new(StubService(Arc::new(FileService::new(false, 4096))))
    }

    fn node(group: &str, port: u16) -> Arc<dyn NodeHandle> {
        Arc::new(StubNode {
            id: NodeId::new(group, peer(port)),
        })
    }

    #[test]
    fn test_add_service_idempotent() {
        let registry = NodeRegistry::new();
        let svc = service();
        registry.add_service(peer(1).addr, svc.clone()).unwrap();
        registry.add_service(peer(1).addr, svc).unwrap();
        assert!(matches!(
            registry.add_service(peer(1).addr, service()),
            Err(RaftError::DuplicateService { .. })
        ));
    }

    #[test]
    fn test_add_requires_service_and_unique_id() {
        let registry = NodeRegistry::new();
        assert!(matches!(
            registry.add(node("g", 1)),
            Err(RaftError::ServiceNotRegistered { .. })
        ));

        registry.add_service(peer(1).addr, service()).unwrap();
        registry.add(node("g", 1)).unwrap();
        assert!(matches!(registry.add(node("g", 1)), Err(RaftError::NodeExists { .. })));

        registry.add(node("h", 1)).unwrap();
        assert_eq!(registry.get_all_nodes().len(), 2);
        assert_eq!(registry.get_nodes_by_group("g").len(), 1);
        assert!(registry.get("h", &peer(1)).is_some());
        assert!(registry.get("h", &peer(2)).is_none());
    }

    #[test]
    fn test_stale_remove_is_ignored() {
        let registry = NodeRegistry::new();
        registry.add_service(peer(1).addr, service()).unwrap();

        let old = node("g", 1);
        registry.add(old.clone()).unwrap();
        assert!(registry.remove(&old));

        let fresh = node("g", 1);
        registry.add(fresh.clone()).unwrap();
        assert!(!registry.remove(&old));
        assert!(registry.get("g", &peer(1)).is_some());

        assert!(registry.remove(&fresh));
        assert!(registry.get_nodes_by_group("g").is_empty());
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let registry = NodeRegistry::new();
        registry.add_service(peer(1).addr, service()).unwrap();
        let n = node("g", 1);
        registry.add(n.clone()).unwrap();

        let before = registry.get_all_nodes();
        registry.remove(&n);
        assert_eq!(before.len(), 1);
        assert!(registry.get_all_nodes().is_empty());
    }
}
