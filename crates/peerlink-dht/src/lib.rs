//! PeerLink DHT (Distributed Hash Table)
//!
//! Kademlia-style peer routing:
//! - XOR-metric routing table with k-buckets and an address book
//! - Iterative FIND_NODE lookups with bounded parallelism
//! - Bootstrap from seed peers and periodic bucket refresh

pub mod address_book;
pub mod entry;
pub mod error;
pub mod handler;
pub mod kbucket;
pub mod lookup;
pub mod probe;
pub mod routing_table;
pub mod rpc;
pub mod service;

pub use address_book::AddressBook;
pub use entry::PeerEntry;
pub use error::{DhtError, Result};
pub use handler::DhtRequestHandler;
pub use kbucket::KBucket;
pub use lookup::{IterativeLookup, LookupConfig, LookupResult, LookupStats, LookupTransport};
pub use probe::{EvictionPolicy, LivenessProbe};
pub use routing_table::{InsertOutcome, RoutingTable, TableConfig};
pub use rpc::NetworkRpc;
pub use service::{BootstrapReport, DhtConfig, DhtService, PeerRouting, RefreshReport};

/// Kademlia k parameter (nodes per k-bucket)
pub const K: usize = 20;

/// Alpha parameter (parallel queries)
pub const ALPHA: usize = 3;
