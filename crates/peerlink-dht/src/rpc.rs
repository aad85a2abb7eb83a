//! FIND_NODE over transport streams

use crate::error::{DhtError, Result};
use crate::lookup::LookupTransport;
use peerlink_network::Transport;
use peerlink_protocol::{
    read_frame, write_frame, DhtRequest, DhtResponse, PeerId, PeerInfo, ProtocolError,
    DHT_PROTOCOL,
};
use std::sync::Arc;
use tracing::{info_span, Instrument};

/// Upper bound on peers accepted in one response
pub const MAX_CLOSER_PEERS: usize = 256;

/// Sends FIND_NODE requests, one stream per query
#[derive(Clone)]
pub struct NetworkRpc {
    transport: Arc<dyn Transport>,
}

impl NetworkRpc {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        NetworkRpc { transport }
    }

    async fn query(&self, peer: &PeerInfo, target: PeerId) -> Result<Vec<PeerInfo>> {
        let unreachable = |reason: String| DhtError::UnreachablePeer {
            peer: peer.peer_id,
            reason,
        };

        let mut stream = self
            .transport
            .open_stream(peer, DHT_PROTOCOL)
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let request = DhtRequest::find_node(target, Some(self.transport.local_peer_info()));
        write_frame(&mut stream, &request)
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let response: DhtResponse = read_frame(&mut stream).await.map_err(|e| match e {
            ProtocolError::Io(io) => unreachable(io.to_string()),
            other => DhtError::ProtocolViolation(other.to_string()),
        })?;

        if response.closer_peers.len() > MAX_CLOSER_PEERS {
            return Err(DhtError::ProtocolViolation(format!(
                "{} returned {} peers",
                peer.peer_id,
                response.closer_peers.len()
            )));
        }

        let _ = stream.close().await;
        Ok(response.closer_peers)
    }
}

#[async_trait::async_trait]
impl LookupTransport for NetworkRpc {
    async fn find_node(&self, peer: &PeerInfo, target: PeerId) -> Result<Vec<PeerInfo>> {
        let span = info_span!("dht.find_node", peer = %peer.peer_id, target = %target);
        self.query(peer, target).instrument(span).await
    }
}
