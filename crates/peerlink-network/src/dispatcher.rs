//! Inbound stream dispatch
//!
//! Accepts streams from a transport and routes each one, by protocol id, to
//! the registered [`ProtocolHandler`]. Every stream runs on its own task,
//! bounded by the handler timeout and aborted on shutdown.

use crate::error::{NetworkError, Result};
use crate::shutdown::ShutdownSignal;
use crate::transport::{Stream, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default bound on serving one inbound stream
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

/// Handler for one stream protocol
#[async_trait::async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Protocol id this handler serves
    fn protocol_id(&self) -> &'static str;

    /// Serve one inbound stream
    async fn handle(&self, stream: Stream) -> Result<()>;
}

/// Routes inbound streams to protocol handlers
pub struct StreamDispatcher {
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
    handler_timeout: Duration,
}

impl Default for StreamDispatcher {
    fn default() -> Self {
        StreamDispatcher {
            handlers: HashMap::new(),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }
}

impl StreamDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound on serving one stream; a handler still running after it is
    /// dropped together with its stream
    pub fn with_handler_timeout(mut self, handler_timeout: Duration) -> Self {
        self.handler_timeout = handler_timeout.max(Duration::from_millis(1));
        self
    }

    /// Register a handler; replaces any handler for the same protocol
    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(handler.protocol_id().to_string(), handler);
    }

    /// Protocol ids with a registered handler
    pub fn protocols(&self) -> Vec<String> {
        let mut protocols: Vec<String> = self.handlers.keys().cloned().collect();
        protocols.sort();
        protocols
    }

    /// Run the accept loop until shutdown or until the transport closes
    ///
    /// The returned task resolves only after every in-flight handler has
    /// finished or been aborted.
    pub fn spawn(
        self,
        transport: Arc<dyn Transport>,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        let handlers = Arc::new(self.handlers);
        let handler_timeout = self.handler_timeout;

        tokio::spawn(async move {
            let mut in_flight = JoinSet::new();

            loop {
                let stream = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
                    accepted = transport.accept() => match accepted {
                        Ok(stream) => stream,
                        Err(e) => {
                            debug!("dispatcher stopping: {}", e);
                            break;
                        }
                    },
                };

                let Some(handler) = handlers.get(stream.protocol()).cloned() else {
                    debug!(
                        "dropping stream from {} for unsupported protocol {}",
                        stream.remote_peer(),
                        stream.protocol()
                    );
                    continue;
                };

                let mut cancelled = shutdown.clone();
                in_flight.spawn(async move {
                    let remote = stream.remote_peer();
                    let result = tokio::select! {
                        _ = cancelled.cancelled() => return,
                        served = timeout(handler_timeout, handler.handle(stream)) => {
                            served.unwrap_or(Err(NetworkError::Timeout))
                        }
                    };
                    if let Err(e) = result {
                        warn!("{} handler failed for {}: {}", handler.protocol_id(), remote, e);
                    }
                });
            }

            in_flight.shutdown().await;
        })
    }
}
