//! RPC layer: decodes the target of each request, finds the node in the
//! registry and forwards the typed request into it.
//!
//! Node errors leave this layer as [`RpcError`] stamped with the node's
//! current term, so a caller that was rejected still learns the term.
//! `GetFile` is per endpoint rather than per node and goes to the file
//! service bound with the endpoint.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

use crate::error::{RaftError, Result, RpcError};
use crate::file_service::FileService;
use crate::registry::{NodeHandle, NodeRegistry};
use crate::transport::{InMemoryNetwork, RpcMessage, RpcReceiver, RpcResult};
use crate::types::*;

/// One method per consensus RPC.
#[async_trait]
pub trait ConsensusService: Send + Sync {
    async fn pre_vote(&self, request: RequestVoteRequest) -> RpcResult<RequestVoteResponse>;

    async fn request_vote(&self, request: RequestVoteRequest) -> RpcResult<RequestVoteResponse>;

    async fn append_entries(&self, request: AppendEntriesRequest) -> RpcResult<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> RpcResult<InstallSnapshotResponse>;

    async fn timeout_now(&self, request: TimeoutNowRequest) -> RpcResult<TimeoutNowResponse>;

    async fn get_file(&self, request: GetFileRequest) -> RpcResult<GetFileResponse>;

    /// Readers registered here are reachable through this endpoint.
    fn file_service(&self) -> Arc<FileService>;
}

/// Routes requests to nodes in a [`NodeRegistry`].
pub struct RaftService {
    registry: Weak<NodeRegistry>,
    file_service: Arc<FileService>,
}

impl RaftService {
    pub fn new(registry: &Arc<NodeRegistry>, file_service: Arc<FileService>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            file_service,
        }
    }

    fn lookup(&self, group_id: &str, peer_id: &PeerAddress) -> RpcResult<Arc<dyn NodeHandle>> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| RpcError::from(&RaftError::Shutdown))?;
        registry.get(group_id, peer_id).ok_or_else(|| {
            RpcError::from(&RaftError::NodeNotFound {
                node: NodeId::new(group_id, *peer_id).to_string(),
            })
        })
    }
}

fn reply<T>(node: &dyn NodeHandle, result: Result<T>) -> RpcResult<T> {
    result.map_err(|e| {
        tracing::debug!(node = %node.node_id(), error = %e, "Request failed");
        RpcError::from(&e).with_term(node.current_term())
    })
}

#[async_trait]
impl ConsensusService for RaftService {
    async fn pre_vote(&self, request: RequestVoteRequest) -> RpcResult<RequestVoteResponse> {
        let node = self.lookup(&request.group_id, &request.peer_id)?;
        reply(node.as_ref(), node.handle_pre_vote(&request))
    }

    async fn request_vote(&self, request: RequestVoteRequest) -> RpcResult<RequestVoteResponse> {
        let node = self.lookup(&request.group_id, &request.peer_id)?;
        reply(node.as_ref(), node.handle_request_vote(&request))
    }

    async fn append_entries(&self, request: AppendEntriesRequest) -> RpcResult<AppendEntriesResponse> {
        let node = self.lookup(&request.group_id, &request.peer_id)?;
        let result = node.handle_append_entries(request).await;
        reply(node.as_ref(), result)
    }

    async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> RpcResult<InstallSnapshotResponse> {
        let node = self.lookup(&request.group_id, &request.peer_id)?;
        let result = node.handle_install_snapshot(request).await;
        reply(node.as_ref(), result)
    }

    async fn timeout_now(&self, request: TimeoutNowRequest) -> RpcResult<TimeoutNowResponse> {
        let node = self.lookup(&request.group_id, &request.peer_id)?;
        reply(node.as_ref(), node.handle_timeout_now(&request))
    }

    async fn get_file(&self, request: GetFileRequest) -> RpcResult<GetFileResponse> {
        self.file_service
            .get_file(&request)
            .await
            .map_err(|e| RpcError::from(&e))
    }

    fn file_service(&self) -> Arc<FileService> {
        self.file_service.clone()
    }
}

/// Serves one listen address of an [`InMemoryNetwork`].
///
/// Each request runs on its own task, so a slow snapshot install never
/// holds up votes or heartbeats for other nodes on the same endpoint.
pub struct RaftServer {
    addr: SocketAddr,
    network: Arc<InMemoryNetwork>,
    shutdown_tx: watch::Sender<bool>,
}

impl RaftServer {
    pub fn serve(
        network: &Arc<InMemoryNetwork>,
        addr: SocketAddr,
        service: Arc<dyn ConsensusService>,
    ) -> Result<Self> {
        let rx = network.bind(addr, 1024)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(dispatch_loop(addr, service, rx, shutdown_rx));
        tracing::info!(addr = %addr, "Consensus server listening");
        Ok(Self {
            addr,
            network: network.clone(),
            shutdown_tx,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            self.network.unbind(&self.addr);
        }
    }
}

impl Drop for RaftServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn dispatch_loop(
    addr: SocketAddr,
    service: Arc<dyn ConsensusService>,
    mut rx: RpcReceiver,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                tokio::spawn(dispatch(service.clone(), message));
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    tracing::info!(addr = %addr, "Consensus server stopped");
}

async fn dispatch(service: Arc<dyn ConsensusService>, message: RpcMessage) {
    // a dropped receiver means the caller gave up
    match message {
        RpcMessage::PreVote {
            request,
            response_tx,
        } => {
            let _ = response_tx.send(service.pre_vote(request).await);
        }
        RpcMessage::RequestVote {
            request,
            response_tx,
        } => {
            let _ = response_tx.send(service.request_vote(request).await);
        }
        RpcMessage::AppendEntries {
            request,
            response_tx,
        } => {
            let _ = response_tx.send(service.append_entries(request).await);
        }
        RpcMessage::InstallSnapshot {
            request,
            response_tx,
        } => {
            let _ = response_tx.send(service.install_snapshot(request).await);
        }
        RpcMessage::TimeoutNow {
            request,
            response_tx,
        } => {
            let _ = response_tx.send(service.timeout_now(request).await);
        }
        RpcMessage::GetFile {
            request,
            response_tx,
        } => {
            let _ = response_tx.send(service.get_file(request).await);
        }
    }
}
