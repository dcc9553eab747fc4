//! Consensus error types.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::{LogIndex, NodeId, PeerAddress, Term};

/// Consensus errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader (cannot handle write/propose/admin operation).
    #[error("Not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<PeerAddress> },

    /// Request from an older term.
    #[error("Term mismatch (current: {current}, request: {request})")]
    TermMismatch { current: Term, request: Term },

    /// Follower log doesn't match the leader's prev log id.
    #[error("Log inconsistency at index {index} (expected term {expected_term}, got {actual_term:?})")]
    LogInconsistency {
        index: LogIndex,
        expected_term: Term,
        actual_term: Option<Term>,
    },

    /// Resource exhausted (snapshot task limit, cache full, change in flight).
    /// Back off and retry.
    #[error("Busy: {reason}")]
    Busy { reason: String },

    /// No node registered under this id.
    #[error("Node not found: {node}")]
    NodeNotFound { node: String },

    /// Unknown (or already removed) file reader id.
    #[error("File reader not found: {reader_id}")]
    ReaderNotFound { reader_id: i64 },

    /// Malformed request.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Unparseable peer address.
    #[error("Invalid peer address: {peer}")]
    InvalidPeer { peer: String },

    /// Configuration error (invalid config).
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    /// A different server is already bound to this listen address.
    #[error("Duplicate service on {addr}")]
    DuplicateService { addr: std::net::SocketAddr },

    /// Node added for an address that never had `add_service` called.
    #[error("No service registered for {addr}")]
    ServiceNotRegistered { addr: std::net::SocketAddr },

    /// Node with the same id already registered.
    #[error("Node already exists: {node}")]
    NodeExists { node: NodeId },

    /// Storage failure. Fatal for the node.
    #[error("Storage error: {reason}")]
    Storage { reason: String },

    /// I/O error (disk or snapshot files).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },

    /// Deadline reached while waiting.
    #[error("Timeout after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Operation was cancelled (shutdown or superseded).
    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    /// Node or server is shutting down.
    #[error("Shutting down")]
    Shutdown,

    /// Node is in ERROR or shutting down.
    #[error("Node is not active ({state})")]
    NotActive { state: crate::types::NodeState },

    /// Peer unreachable (connection lost, endpoint gone).
    #[error("Peer unreachable: {peer}")]
    Unreachable { peer: String },

    /// Error reported by a remote peer.
    #[error("Remote error {code}: {message} (remote term {term:?})")]
    Remote {
        code: ErrorCode,
        term: Option<Term>,
        message: String,
    },

    /// Internal error (bug).
    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

/// Raft result type.
pub type Result<T> = std::result::Result<T, RaftError>;

/// Wire-neutral error class carried across the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Protocol rejection: stale term, not leader, log mismatch.
    Rejected,
    /// Resource exhaustion: retry later.
    Busy,
    NotFound,
    InvalidRequest,
    Timeout,
    /// Storage/fatal failure on the remote node.
    Storage,
    NotActive,
    Unreachable,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ErrorCode {
    /// Whether a fresh attempt may succeed without operator intervention.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Busy | ErrorCode::Timeout | ErrorCode::NotFound | ErrorCode::Unreachable
        )
    }
}

impl RaftError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RaftError::NotLeader { .. }
            | RaftError::TermMismatch { .. }
            | RaftError::LogInconsistency { .. } => ErrorCode::Rejected,
            RaftError::Busy { .. } => ErrorCode::Busy,
            RaftError::NodeNotFound { .. } | RaftError::ReaderNotFound { .. } => {
                ErrorCode::NotFound
            }
            RaftError::InvalidRequest { .. }
            | RaftError::InvalidPeer { .. }
            | RaftError::ConfigError { .. }
            | RaftError::DuplicateService { .. }
            | RaftError::ServiceNotRegistered { .. }
            | RaftError::NodeExists { .. } => ErrorCode::InvalidRequest,
            RaftError::Storage { .. } | RaftError::Io { .. } | RaftError::Serialization { .. } => {
                ErrorCode::Storage
            }
            RaftError::Timeout { .. } | RaftError::Cancelled { .. } => ErrorCode::Timeout,
            RaftError::NotActive { .. } | RaftError::Shutdown => ErrorCode::NotActive,
            RaftError::Unreachable { .. } => ErrorCode::Unreachable,
            RaftError::Remote { code, .. } => *code,
            RaftError::Internal { .. } => ErrorCode::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Storage-class failures move the node to ERROR.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RaftError::Storage { .. } | RaftError::Io { .. } | RaftError::Serialization { .. }
        )
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        RaftError::Storage {
            reason: reason.into(),
        }
    }

    pub fn busy(reason: impl Into<String>) -> Self {
        RaftError::Busy {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        RaftError::InvalidRequest {
            reason: reason.into(),
        }
    }
}

/// The only error shape that crosses the RPC boundary: a code, the
/// responder's term (when the responder is a node) and a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub term: Option<Term>,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            term: None,
            message: message.into(),
        }
    }

    pub fn with_term(mut self, term: Term) -> Self {
        self.term = Some(term);
        self
    }
}

impl From<&RaftError> for RpcError {
    fn from(err: &RaftError) -> Self {
        match err {
            RaftError::Remote {
                code,
                term,
                message,
            } => RpcError {
                code: *code,
                term: *term,
                message: message.clone(),
            },
            other => RpcError::new(other.code(), other.to_string()),
        }
    }
}

impl From<RpcError> for RaftError {
    fn from(err: RpcError) -> Self {
        RaftError::Remote {
            code: err.code,
            term: err.term,
            message: err.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(RaftError::busy("limit").code(), ErrorCode::Busy);
        assert!(RaftError::busy("limit").is_retryable());
        assert!(RaftError::storage("disk").is_fatal());
        assert!(!RaftError::storage("disk").is_retryable());
        assert_eq!(
            RaftError::ReaderNotFound { reader_id: 3 }.code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            RaftError::Timeout { elapsed_ms: 10 }.code(),
            ErrorCode::Timeout
        );
    }

    #[test]
    fn test_rpc_error_never_leaks_storage_detail_type() {
        let err = RaftError::Io {
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
        };
        let rpc = RpcError::from(&err).with_term(Term(4));
        assert_eq!(rpc.code, ErrorCode::Storage);
        assert_eq!(rpc.term, Some(Term(4)));

        let back: RaftError = rpc.into();
        assert!(matches!(back, RaftError::Remote { code: ErrorCode::Storage, .. }));
        assert!(!back.is_fatal());
    }
}
