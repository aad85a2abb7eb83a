//! TCP transport
//!
//! One TCP connection per stream. The dialer opens every connection with a
//! [`StreamHello`] frame naming itself, the identity it expects and the
//! protocol; the listener answers with a [`StreamAck`]. No encryption or
//! multiplexing happens here.

use crate::error::{NetworkError, Result};
use crate::transport::{Stream, Transport};
use peerlink_protocol::{
    read_frame, write_frame, Address, PeerId, PeerInfo, StreamAck, StreamHello, CONNECT_PROTOCOL,
};
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Inbound stream queue depth
const INCOMING_QUEUE: usize = 256;

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Timeout for establishing the TCP connection
    pub connect_timeout: Duration,

    /// Timeout for the hello/ack exchange
    pub handshake_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// TCP transport listening on one or more socket addresses
#[derive(Debug)]
pub struct TcpTransport {
    peer_id: PeerId,
    config: TcpConfig,
    listen_addrs: Vec<Address>,
    incoming: Mutex<mpsc::Receiver<Stream>>,
    accept_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind every listen address
    ///
    /// Fails if any address is not a TCP address or cannot be bound.
    pub async fn listen(peer_id: PeerId, addresses: &[Address], config: TcpConfig) -> Result<Self> {
        if addresses.is_empty() {
            return Err(NetworkError::ListenFailed("no listen addresses".to_string()));
        }

        let (tx, rx) = mpsc::channel(INCOMING_QUEUE);
        let mut listen_addrs = Vec::with_capacity(addresses.len());
        let mut accept_tasks = Vec::with_capacity(addresses.len());

        for address in addresses {
            let socket_addr = address.socket_addr().ok_or_else(|| {
                NetworkError::ListenFailed(format!("{} is not a TCP address", address))
            })?;

            let listener = match TcpListener::bind(socket_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    for task in &accept_tasks {
                        JoinHandle::abort(task);
                    }
                    return Err(NetworkError::ListenFailed(format!("{}: {}", address, e)));
                }
            };
            let bound = listener.local_addr()?;
            debug!("tcp transport for {} listening on {}", peer_id, bound);

            listen_addrs.push(Address::Tcp(bound));
            accept_tasks.push(tokio::spawn(accept_loop(
                listener,
                peer_id,
                config.handshake_timeout,
                tx.clone(),
            )));
        }

        Ok(TcpTransport {
            peer_id,
            config,
            listen_addrs,
            incoming: Mutex::new(rx),
            accept_tasks: StdMutex::new(accept_tasks),
        })
    }

    async fn dial(&self, peer: &PeerInfo, protocol: &str) -> Result<TcpStream> {
        let candidates: Vec<SocketAddr> =
            peer.addresses.iter().filter_map(Address::socket_addr).collect();
        if candidates.is_empty() {
            return Err(NetworkError::NoAddress(peer.peer_id));
        }

        let mut last_error = None;
        for socket_addr in candidates {
            match self.dial_one(peer.peer_id, socket_addr, protocol).await {
                Ok(socket) => return Ok(socket),
                Err(e) => {
                    debug!("dial {} at {} failed: {}", peer.peer_id, socket_addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(NetworkError::NoAddress(peer.peer_id)))
    }

    async fn dial_one(
        &self,
        remote: PeerId,
        socket_addr: SocketAddr,
        protocol: &str,
    ) -> Result<TcpStream> {
        let mut socket = timeout(self.config.connect_timeout, TcpStream::connect(socket_addr))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::Unreachable {
                peer: remote,
                reason: e.to_string(),
            })?;
        socket.set_nodelay(true)?;

        let hello = StreamHello {
            peer_id: self.peer_id,
            remote_peer_id: remote,
            protocol: protocol.to_string(),
        };

        let ack: StreamAck = timeout(self.config.handshake_timeout, async {
            write_frame(&mut socket, &hello).await?;
            read_frame(&mut socket).await
        })
        .await
        .map_err(|_| NetworkError::Timeout)?
        .map_err(|e| NetworkError::HandshakeFailed(e.to_string()))?;

        match ack {
            StreamAck::Accepted { peer_id } if peer_id == remote => Ok(socket),
            StreamAck::Accepted { peer_id } => Err(NetworkError::HandshakeFailed(format!(
                "expected {}, reached {}",
                remote, peer_id
            ))),
            StreamAck::Rejected { reason } => Err(NetworkError::HandshakeFailed(reason)),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    local: PeerId,
    handshake_timeout: Duration,
    tx: mpsc::Sender<Stream>,
) {
    loop {
        let (socket, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("tcp accept failed: {}", e);
                continue;
            }
        };

        let tx = tx.clone();
        tokio::spawn(async move {
            match timeout(handshake_timeout, answer_hello(socket, local)).await {
                Ok(Ok(Some(stream))) => {
                    let _ = tx.send(stream).await;
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => debug!("inbound handshake from {} failed: {}", remote_addr, e),
                Err(_) => debug!("inbound handshake from {} timed out", remote_addr),
            }
        });
    }
}

async fn answer_hello(mut socket: TcpStream, local: PeerId) -> Result<Option<Stream>> {
    let hello: StreamHello = read_frame(&mut socket).await?;

    if hello.remote_peer_id != local {
        let ack = StreamAck::Rejected {
            reason: format!("this is {}, not {}", local, hello.remote_peer_id),
        };
        write_frame(&mut socket, &ack).await?;
        return Ok(None);
    }

    write_frame(&mut socket, &StreamAck::Accepted { peer_id: local }).await?;

    if hello.protocol == CONNECT_PROTOCOL {
        return Ok(None);
    }

    let observed = socket.peer_addr()?;
    Ok(Some(
        Stream::new(socket, hello.peer_id, hello.protocol)
            .with_remote_addr(Address::Tcp(observed)),
    ))
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn listen_addresses(&self) -> Vec<Address> {
        self.listen_addrs.clone()
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<()> {
        self.dial(peer, CONNECT_PROTOCOL).await.map(drop)
    }

    async fn open_stream(&self, peer: &PeerInfo, protocol: &str) -> Result<Stream> {
        let socket = self.dial(peer, protocol).await?;
        Ok(Stream::new(socket, peer.peer_id, protocol))
    }

    async fn accept(&self) -> Result<Stream> {
        self.incoming.lock().await.recv().await.ok_or(NetworkError::Closed)
    }

    async fn close(&self) {
        let tasks: Vec<JoinHandle<()>> = match self.accept_tasks.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            task.abort();
        }
        self.incoming.lock().await.close();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.accept_tasks.lock() {
            for task in guard.drain(..) {
                task.abort();
            }
        }
    }
}
