//! Node error types

use peerlink_network::NetworkError;
use peerlink_protocol::PeerId;
use thiserror::Error;

/// Errors surfaced by the node lifecycle
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Failed to listen: {0}")]
    Listen(#[source] NetworkError),

    #[error("Failed to connect to {peer}: {source}")]
    Connect {
        peer: PeerId,
        #[source]
        source: NetworkError,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Node is not running")]
    NotRunning,

    #[error("Node was already started")]
    AlreadyStarted,
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
