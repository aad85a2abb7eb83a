//! In-process transport
//!
//! A [`MemoryNetwork`] is a shared switchboard of `/memory/<n>` addresses.
//! Streams are `tokio::io::duplex` pairs, so several nodes can run inside one
//! process (tests, simulations). Black-holed addresses model unroutable peers:
//! dialling them never completes.

use crate::error::{NetworkError, Result};
use crate::transport::{Stream, Transport};
use dashmap::{DashMap, DashSet};
use peerlink_protocol::{Address, PeerId, PeerInfo, CONNECT_PROTOCOL};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Buffer size of each in-memory stream direction
pub const MEMORY_STREAM_BUFFER: usize = 64 * 1024;

/// Inbound stream queue depth per listener
const INCOMING_QUEUE: usize = 128;

#[derive(Debug)]
struct Listener {
    peer_id: PeerId,
    tx: mpsc::Sender<Stream>,
}

#[derive(Debug, Default)]
struct MemoryNetworkInner {
    listeners: DashMap<u64, Listener>,
    blackholes: DashSet<u64>,
    next_port: AtomicU64,
}

/// Shared in-process network
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<MemoryNetworkInner>,
}

enum Route {
    Listener(PeerId, mpsc::Sender<Stream>),
    Blackhole,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_port(&self) -> u64 {
        loop {
            let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed) + 1;
            if !self.inner.listeners.contains_key(&port) && !self.inner.blackholes.contains(&port)
            {
                return port;
            }
        }
    }

    /// Listen on a memory address; port 0 picks a free port
    pub fn bind(&self, peer_id: PeerId, address: &Address) -> Result<MemoryTransport> {
        let requested = address.memory_port().ok_or_else(|| {
            NetworkError::ListenFailed(format!("{} is not a memory address", address))
        })?;
        let port = if requested == 0 {
            self.allocate_port()
        } else {
            requested
        };

        let (tx, rx) = mpsc::channel(INCOMING_QUEUE);
        match self.inner.listeners.entry(port) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(NetworkError::ListenFailed(format!(
                    "/memory/{} already in use",
                    port
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Listener { peer_id, tx });
            }
        }

        debug!("memory transport for {} listening on /memory/{}", peer_id, port);

        Ok(MemoryTransport {
            network: self.clone(),
            peer_id,
            port,
            incoming: Mutex::new(rx),
        })
    }

    /// Make an address swallow every dial attempt
    pub fn add_blackhole(&self) -> Address {
        let port = self.allocate_port();
        self.inner.blackholes.insert(port);
        Address::Memory(port)
    }

    fn unbind(&self, port: u64, peer_id: PeerId) {
        self.inner
            .listeners
            .remove_if(&port, |_, listener| listener.peer_id == peer_id);
    }

    fn route(&self, peer: &PeerInfo) -> Result<Route> {
        let ports: Vec<u64> = peer.addresses.iter().filter_map(Address::memory_port).collect();
        if ports.is_empty() {
            return Err(NetworkError::NoAddress(peer.peer_id));
        }

        let mut last_error = None;
        for port in ports {
            if let Some(listener) = self.inner.listeners.get(&port) {
                if listener.peer_id != peer.peer_id {
                    last_error = Some(NetworkError::HandshakeFailed(format!(
                        "/memory/{} is {}, expected {}",
                        port, listener.peer_id, peer.peer_id
                    )));
                    continue;
                }
                return Ok(Route::Listener(listener.peer_id, listener.tx.clone()));
            }
            if self.inner.blackholes.contains(&port) {
                return Ok(Route::Blackhole);
            }
        }

        Err(last_error.unwrap_or_else(|| NetworkError::Unreachable {
            peer: peer.peer_id,
            reason: "connection refused".to_string(),
        }))
    }
}

/// Transport bound to one memory address
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    peer_id: PeerId,
    port: u64,
    incoming: Mutex<mpsc::Receiver<Stream>>,
}

impl MemoryTransport {
    /// The bound address
    pub fn address(&self) -> Address {
        Address::Memory(self.port)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn listen_addresses(&self) -> Vec<Address> {
        vec![self.address()]
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<()> {
        let stream = self.open_stream(peer, CONNECT_PROTOCOL).await?;
        drop(stream);
        Ok(())
    }

    async fn open_stream(&self, peer: &PeerInfo, protocol: &str) -> Result<Stream> {
        match self.network.route(peer)? {
            Route::Blackhole => std::future::pending().await,
            Route::Listener(remote, tx) => {
                let (local_io, remote_io) = tokio::io::duplex(MEMORY_STREAM_BUFFER);
                tx.send(Stream::new(remote_io, self.peer_id, protocol))
                    .await
                    .map_err(|_| NetworkError::Unreachable {
                        peer: remote,
                        reason: "listener closed".to_string(),
                    })?;
                Ok(Stream::new(local_io, remote, protocol))
            }
        }
    }

    async fn accept(&self) -> Result<Stream> {
        let mut incoming = self.incoming.lock().await;
        loop {
            let stream = incoming.recv().await.ok_or(NetworkError::Closed)?;
            if stream.protocol() != CONNECT_PROTOCOL {
                return Ok(stream);
            }
        }
    }

    async fn close(&self) {
        self.network.unbind(self.port, self.peer_id);
        self.incoming.lock().await.close();
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.unbind(self.port, self.peer_id);
    }
}
