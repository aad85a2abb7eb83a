//! Network error types

use peerlink_protocol::PeerId;
use thiserror::Error;

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Peer {peer} unreachable: {reason}")]
    Unreachable { peer: PeerId, reason: String },

    #[error("No known address for peer {0}")]
    NoAddress(PeerId),

    #[error("Operation timed out")]
    Timeout,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Listen failed: {0}")]
    ListenFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] peerlink_protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;
