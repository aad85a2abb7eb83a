//! Wire messages exchanged on peer streams

use serde::{Deserialize, Serialize};

use crate::peer_info::PeerInfo;
use crate::types::PeerId;

/// Protocol id for the ping echo exchange
pub const PING_PROTOCOL: &str = "/ipfs/ping/1.0.0";

/// Protocol id for DHT routing queries
pub const DHT_PROTOCOL: &str = "/ipfs/kad/1.0.0";

/// Protocol id used when a dialer only checks reachability
pub const CONNECT_PROTOCOL: &str = "/peerlink/connect/1.0.0";

/// DHT query type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    /// Ask for the peers closest to a target identifier
    FindNode,
}

/// DHT request sent on a [`DHT_PROTOCOL`] stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtRequest {
    /// Query type
    pub query: QueryType,

    /// Target identifier
    pub target: PeerId,

    /// The requester's own identity and listen addresses, if it wants to be
    /// added to the responder's routing table
    pub sender: Option<PeerInfo>,
}

impl DhtRequest {
    /// Create a FIND_NODE request
    pub fn find_node(target: PeerId, sender: Option<PeerInfo>) -> Self {
        DhtRequest {
            query: QueryType::FindNode,
            target,
            sender,
        }
    }
}

/// DHT response: closer peers ordered by ascending distance to the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtResponse {
    pub closer_peers: Vec<PeerInfo>,
}

/// First frame on every transport stream: who is dialling, and for what
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHello {
    /// Dialer identity
    pub peer_id: PeerId,

    /// Expected identity of the listener
    pub remote_peer_id: PeerId,

    /// Requested protocol id
    pub protocol: String,
}

/// Listener's reply to [`StreamHello`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamAck {
    /// Stream accepted by the given listener identity
    Accepted { peer_id: PeerId },

    /// Stream refused
    Rejected { reason: String },
}
