//! PeerLink Protocol Module
//!
//! Core data structures and wire formats shared by every PeerLink crate:
//! peer identities and XOR distance, multiaddr-style addresses, peer info
//! records, DHT query messages and the length-prefixed frame codec.

pub mod address;
pub mod error;
pub mod frame;
pub mod message;
pub mod peer_info;
pub mod types;

pub use address::{Address, P2pAddr};
pub use error::{ProtocolError, Result};
pub use frame::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use message::{
    DhtRequest, DhtResponse, QueryType, StreamAck, StreamHello, CONNECT_PROTOCOL, DHT_PROTOCOL,
    PING_PROTOCOL,
};
pub use peer_info::PeerInfo;
pub use types::{Distance, PeerId, PEER_ID_BITS, PEER_ID_SIZE};
