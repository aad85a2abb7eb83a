//! PeerLink node
//!
//! Composition root wiring the transport, DHT, ping service and telemetry
//! pipeline into one [`Node`] with a start/connect/stop lifecycle.

pub mod config;
pub mod error;
pub mod logging;
pub mod node;
#[cfg(feature = "otlp")]
pub mod otlp;

pub use config::Config;
pub use error::{NodeError, Result};
pub use logging::{init_logging, LoggingGuard};
pub use node::{Node, NodeStats, StartReport};
