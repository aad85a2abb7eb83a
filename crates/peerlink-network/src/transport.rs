//! Transport and stream abstraction
//!
//! A transport hands out ordered, reliable byte streams to peers, tagged with
//! the remote identity and the protocol the stream was opened for. Connection
//! establishment and security live below this trait.

use crate::error::Result;
use peerlink_protocol::{Address, PeerId, PeerInfo};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Byte stream usable as a transport stream
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> StreamIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A protocol stream to a remote peer
pub struct Stream {
    io: Box<dyn StreamIo>,
    remote_peer: PeerId,
    protocol: String,
    remote_addr: Option<Address>,
}

impl Stream {
    /// Wrap a byte stream
    pub fn new(io: impl StreamIo + 'static, remote_peer: PeerId, protocol: impl Into<String>) -> Self {
        Stream {
            io: Box::new(io),
            remote_peer,
            protocol: protocol.into(),
            remote_addr: None,
        }
    }

    /// Record the address the remote side was seen from
    pub fn with_remote_addr(mut self, addr: Address) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Observed address of the remote side, when the transport knows it
    pub fn remote_addr(&self) -> Option<&Address> {
        self.remote_addr.as_ref()
    }

    /// Identity of the peer on the other end
    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    /// Protocol id this stream was opened for
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Close the write half; the remote side reads EOF
    pub async fn close(&mut self) -> io::Result<()> {
        self.io.shutdown().await
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("remote_peer", &self.remote_peer)
            .field("protocol", &self.protocol)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Transport trait
///
/// All transport implementations must implement this trait
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Identity of the local peer
    fn local_peer_id(&self) -> PeerId;

    /// Addresses this transport is listening on
    fn listen_addresses(&self) -> Vec<Address>;

    /// Local identity plus listen addresses
    fn local_peer_info(&self) -> PeerInfo {
        PeerInfo::with_addresses(self.local_peer_id(), self.listen_addresses())
    }

    /// Check that the peer is reachable at one of its addresses and that it
    /// answers with the expected identity
    async fn connect(&self, peer: &PeerInfo) -> Result<()>;

    /// Open a stream to a peer for the given protocol
    async fn open_stream(&self, peer: &PeerInfo, protocol: &str) -> Result<Stream>;

    /// Wait for the next inbound stream
    ///
    /// Returns `NetworkError::Closed` once the transport is closed.
    async fn accept(&self) -> Result<Stream>;

    /// Stop listening; idempotent
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_stream_passes_bytes_through() {
        let (a, b) = tokio::io::duplex(64);
        let peer = PeerId::from_bytes([1; 32]);
        let mut left = Stream::new(a, peer, "/test/1.0.0");
        let mut right = Stream::new(b, peer, "/test/1.0.0");

        left.write_all(b"hello").await.unwrap();
        left.close().await.unwrap();

        let mut buf = Vec::new();
        right.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
        assert_eq!(right.protocol(), "/test/1.0.0");
        assert_eq!(right.remote_peer(), peer);
    }
}
