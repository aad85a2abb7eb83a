//! DHT error types

use peerlink_protocol::PeerId;
use thiserror::Error;

/// DHT-specific errors
#[derive(Error, Debug)]
pub enum DhtError {
    #[error("Peer {peer} unreachable: {reason}")]
    UnreachablePeer { peer: PeerId, reason: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Bootstrap failed: none of {attempted} seed peers responded")]
    BootstrapFailed { attempted: usize },

    #[error("Routing table has no peers to query")]
    NoKnownPeers,

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(#[from] peerlink_network::NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] peerlink_protocol::ProtocolError),
}

/// Result type for DHT operations
pub type Result<T> = std::result::Result<T, DhtError>;
