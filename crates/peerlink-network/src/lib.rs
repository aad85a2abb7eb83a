//! PeerLink Network Layer
//!
//! This crate provides the stream abstraction the rest of the node runs on:
//! - `Transport` / `Stream`: identity-tagged, per-protocol byte streams
//! - TCP and in-process (memory) transports
//! - Inbound stream dispatch by protocol id
//! - The ping protocol (RTT measurement and liveness)
//! - The node-wide shutdown signal

pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod ping;
pub mod shutdown;
pub mod tcp;
pub mod transport;

pub use dispatcher::{ProtocolHandler, StreamDispatcher, DEFAULT_HANDLER_TIMEOUT};
pub use error::{NetworkError, Result};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use ping::{
    PingConfig, PingFailure, PingOutcome, PingSample, PingService, PingState, PING_PAYLOAD_SIZE,
};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use tcp::{TcpConfig, TcpTransport};
pub use transport::{Stream, StreamIo, Transport};
