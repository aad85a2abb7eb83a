#![no_main]

use libfuzzer_sys::fuzz_target;
use peerlink_dht::RoutingTable;
use peerlink_protocol::{PeerId, PeerInfo, PEER_ID_SIZE};

fuzz_target!(|data: &[u8]| {
    let mut table = RoutingTable::with_bucket_size(PeerId::from_bytes([1u8; PEER_ID_SIZE]), 4);

    for chunk in data.chunks_exact(PEER_ID_SIZE) {
        let mut bytes = [0u8; PEER_ID_SIZE];
        bytes.copy_from_slice(chunk);
        table.insert(PeerInfo::new(PeerId::from_bytes(bytes)));
    }

    // The local id never lands in the table
    assert!(!table.contains(table.local_peer_id()));

    let mut target = [0u8; PEER_ID_SIZE];
    let n = data.len().min(PEER_ID_SIZE);
    target[..n].copy_from_slice(&data[..n]);
    let closest = table.closest_peers(&PeerId::from_bytes(target), 20);
    assert!(closest.len() <= table.node_count());
});
