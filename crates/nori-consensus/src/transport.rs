//! Transport abstraction for consensus RPCs.
//!
//! Defines the `RaftTransport` trait the node uses to reach its peers, the
//! `RpcMessage` envelope a server endpoint receives, and an in-process
//! network used by tests and embedded deployments:
//! - `InMemoryNetwork`: address → endpoint table with partition controls
//! - `InMemoryTransport`: one node's client side of that network
//!
//! Every call carries a deadline. A call that misses it fails with
//! `RaftError::Timeout`; an endpoint that is gone or cut off fails with
//! `RaftError::Unreachable`. Errors raised by the remote handler come back
//! as `RaftError::Remote`.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::error::{RaftError, Result, RpcError};
use crate::types::*;

pub type RpcResult<T> = std::result::Result<T, RpcError>;

#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn pre_vote(
        &self,
        target: &PeerAddress,
        request: RequestVoteRequest,
        deadline: Duration,
    ) -> Result<RequestVoteResponse>;

    async fn request_vote(
        &self,
        target: &PeerAddress,
        request: RequestVoteRequest,
        deadline: Duration,
    ) -> Result<RequestVoteResponse>;

    /// Heartbeats are AppendEntries with no entries.
    async fn append_entries(
        &self,
        target: &PeerAddress,
        request: AppendEntriesRequest,
        deadline: Duration,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        target: &PeerAddress,
        request: InstallSnapshotRequest,
        deadline: Duration,
    ) -> Result<InstallSnapshotResponse>;

    async fn timeout_now(
        &self,
        target: &PeerAddress,
        request: TimeoutNowRequest,
        deadline: Duration,
    ) -> Result<TimeoutNowResponse>;

    /// File chunks are served per endpoint, not per node.
    async fn get_file(
        &self,
        endpoint: SocketAddr,
        request: GetFileRequest,
        deadline: Duration,
    ) -> Result<GetFileResponse>;
}

/// RPC message envelope delivered to a server endpoint.
#[derive(Debug)]
pub enum RpcMessage {
    PreVote {
        request: RequestVoteRequest,
        response_tx: oneshot::Sender<RpcResult<RequestVoteResponse>>,
    },
    RequestVote {
        request: RequestVoteRequest,
        response_tx: oneshot::Sender<RpcResult<RequestVoteResponse>>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        response_tx: oneshot::Sender<RpcResult<AppendEntriesResponse>>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response_tx: oneshot::Sender<RpcResult<InstallSnapshotResponse>>,
    },
    TimeoutNow {
        request: TimeoutNowRequest,
        response_tx: oneshot::Sender<RpcResult<TimeoutNowResponse>>,
    },
    GetFile {
        request: GetFileRequest,
        response_tx: oneshot::Sender<RpcResult<GetFileResponse>>,
    },
}

pub type RpcSender = mpsc::Sender<RpcMessage>;
pub type RpcReceiver = mpsc::Receiver<RpcMessage>;

/// In-process network: one endpoint per listen address.
///
/// Links can be cut per address pair to simulate partitions.
#[derive(Default)]
pub struct InMemoryNetwork {
    endpoints: RwLock<HashMap<SocketAddr, RpcSender>>,
    blocked: RwLock<HashSet<(SocketAddr, SocketAddr)>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind `addr`. Returns the receiving half for the server loop.
    pub fn bind(&self, addr: SocketAddr, capacity: usize) -> Result<RpcReceiver> {
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(&addr) {
            return Err(RaftError::DuplicateService { addr });
        }
        let (tx, rx) = mpsc::channel(capacity);
        endpoints.insert(addr, tx);
        Ok(rx)
    }

    pub fn unbind(&self, addr: &SocketAddr) {
        self.endpoints.write().remove(addr);
    }

    /// Cut both directions between `a` and `b`.
    pub fn partition(&self, a: SocketAddr, b: SocketAddr) {
        let mut blocked = self.blocked.write();
        blocked.insert((a, b));
        blocked.insert((b, a));
    }

    /// Cut `addr` off from every other bound endpoint.
    pub fn isolate(&self, addr: SocketAddr) {
        let others: Vec<SocketAddr> = self
            .endpoints
            .read()
            .keys()
            .copied()
            .filter(|other| *other != addr)
            .collect();
        for other in others {
            self.partition(addr, other);
        }
    }

    pub fn heal(&self) {
        self.blocked.write().clear();
    }

    fn is_blocked(&self, from: SocketAddr, to: SocketAddr) -> bool {
        self.blocked.read().contains(&(from, to))
    }

    fn route(&self, from: SocketAddr, to: SocketAddr) -> Result<RpcSender> {
        if self.is_blocked(from, to) {
            return Err(RaftError::Unreachable {
                peer: to.to_string(),
            });
        }
        self.endpoints
            .read()
            .get(&to)
            .cloned()
            .ok_or_else(|| RaftError::Unreachable {
                peer: to.to_string(),
            })
    }
}

/// Client side of the in-memory network for one local endpoint.
pub struct InMemoryTransport {
    local: SocketAddr,
    network: Arc<InMemoryNetwork>,
}

impl InMemoryTransport {
    pub fn new(local: SocketAddr, network: Arc<InMemoryNetwork>) -> Self {
        Self { local, network }
    }

    async fn call<T>(
        &self,
        to: SocketAddr,
        deadline: Duration,
        make: impl FnOnce(oneshot::Sender<RpcResult<T>>) -> RpcMessage,
    ) -> Result<T> {
        let exchange = async {
            let endpoint = self.network.route(self.local, to)?;
            let (response_tx, response_rx) = oneshot::channel();
            endpoint
                .send(make(response_tx))
                .await
                .map_err(|_| RaftError::Unreachable {
                    peer: to.to_string(),
                })?;
            let reply = response_rx.await.map_err(|_| RaftError::Unreachable {
                peer: to.to_string(),
            })?;
            // A partition that opened while the call was in flight drops the reply.
            if self.network.is_blocked(to, self.local) {
                return Err(RaftError::Unreachable {
                    peer: to.to_string(),
                });
            }
            reply.map_err(RaftError::from)
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RaftError::Timeout {
                elapsed_ms: deadline.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn pre_vote(
        &self,
        target: &PeerAddress,
        request: RequestVoteRequest,
        deadline: Duration,
    ) -> Result<RequestVoteResponse> {
        self.call(target.addr, deadline, |response_tx| RpcMessage::PreVote {
            request,
            response_tx,
        })
        .await
    }

    async fn request_vote(
        &self,
        target: &PeerAddress,
        request: RequestVoteRequest,
        deadline: Duration,
    ) -> Result<RequestVoteResponse> {
        self.call(target.addr, deadline, |response_tx| {
            RpcMessage::RequestVote {
                request,
                response_tx,
            }
        })
        .await
    }

    async fn append_entries(
        &self,
        target: &PeerAddress,
        request: AppendEntriesRequest,
        deadline: Duration,
    ) -> Result<AppendEntriesResponse> {
        self.call(target.addr, deadline, |response_tx| {
            RpcMessage::AppendEntries {
                request,
                response_tx,
            }
        })
        .await
    }

    async fn install_snapshot(
        &self,
        target: &PeerAddress,
        request: InstallSnapshotRequest,
        deadline: Duration,
    ) -> Result<InstallSnapshotResponse> {
        self.call(target.addr, deadline, |response_tx| {
            RpcMessage::InstallSnapshot {
                request,
                response_tx,
            }
        })
        .await
    }

    async fn timeout_now(
        &self,
        target: &PeerAddress,
        request: TimeoutNowRequest,
        deadline: Duration,
    ) -> Result<TimeoutNowResponse> {
        self.call(target.addr, deadline, |response_tx| RpcMessage::TimeoutNow {
            request,
            response_tx,
        })
        .await
    }

    async fn get_file(
        &self,
        endpoint: SocketAddr,
        request: GetFileRequest,
        deadline: Duration,
    ) -> Result<GetFileResponse> {
        self.call(endpoint, deadline, |response_tx| RpcMessage::GetFile {
            request,
            response_tx,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn vote_request(term: u64) -> RequestVoteRequest {
        RequestVoteRequest {
            group_id: "g".to_string(),
            server_id: PeerAddress::new(addr(2)),
            peer_id: PeerAddress::new(addr(1)),
            term: Term(term),
            last_log_id: LogId::new(10, 4),
        }
    }

    #[tokio::test]
    async fn test_in_memory_transport_request_vote() {
        let network = InMemoryNetwork::new();
        let mut rx1 = network.bind(addr(1), 10).unwrap();
        let transport = InMemoryTransport::new(addr(2), network.clone());

        tokio::spawn(async move {
            if let Some(RpcMessage::RequestVote { response_tx, .. }) = rx1.recv().await {
                let _ = response_tx.send(Ok(RequestVoteResponse {
                    term: Term(5),
                    granted: true,
                    rejected_by_lease: false,
                }));
            }
        });

        let response = transport
            .request_vote(
                &PeerAddress::new(addr(1)),
                vote_request(5),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(response.term, Term(5));
        assert!(response.granted);
    }

    #[tokio::test]
    async fn test_unbound_peer_is_unreachable() {
        let network = InMemoryNetwork::new();
        let transport = InMemoryTransport::new(addr(1), network);
        let err = transport
            .request_vote(
                &PeerAddress::new(addr(9)),
                vote_request(1),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_partition_and_heal() {
        let network = InMemoryNetwork::new();
        let _rx1 = network.bind(addr(1), 10).unwrap();
        let _rx2 = network.bind(addr(2), 10).unwrap();
        network.isolate(addr(1));

        let transport = InMemoryTransport::new(addr(2), network.clone());
        let err = transport
            .pre_vote(
                &PeerAddress::new(addr(1)),
                vote_request(1),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::Unreachable { .. }));

        network.heal();
        // Nobody serves rx1, so the call now runs into its deadline instead.
        let err = transport
            .pre_vote(
                &PeerAddress::new(addr(1)),
                vote_request(1),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_remote_error_is_typed() {
        let network = InMemoryNetwork::new();
        let mut rx1 = network.bind(addr(1), 10).unwrap();
        let transport = InMemoryTransport::new(addr(2), network.clone());

        tokio::spawn(async move {
            if let Some(RpcMessage::GetFile { response_tx, .. }) = rx1.recv().await {
                let _ = response_tx.send(Err(RpcError::new(ErrorCode::NotFound, "no reader")));
            }
        });

        let err = transport
            .get_file(
                addr(1),
                GetFileRequest {
                    reader_id: 1,
                    filename: "f".to_string(),
                    offset: 0,
                    count: 1,
                    read_partly: false,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_duplicate_bind_rejected() {
        let network = InMemoryNetwork::new();
        let _rx = network.bind(addr(1), 1).unwrap();
        assert!(matches!(
            network.bind(addr(1), 1),
            Err(RaftError::DuplicateService { .. })
        ));
    }
}
