#![no_main]

use libfuzzer_sys::fuzz_target;
use peerlink_protocol::frame::{decode, encode};
use peerlink_protocol::{DhtRequest, DhtResponse, P2pAddr};

fuzz_target!(|data: &[u8]| {
    // Malformed payloads must be rejected, never panic
    if let Ok(request) = decode::<DhtRequest>(data) {
        if let Ok(bytes) = encode(&request) {
            let _ = decode::<DhtRequest>(&bytes);
        }
    }
    let _ = decode::<DhtResponse>(data);

    if let Ok(text) = std::str::from_utf8(data) {
        let _ = text.parse::<P2pAddr>();
    }
});
