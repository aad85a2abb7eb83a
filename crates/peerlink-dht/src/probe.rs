//! Bucket eviction policy and liveness probing

use peerlink_network::PingService;
use peerlink_protocol::PeerInfo;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do with the least-recently-seen entry of a full bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Probe the oldest entry; evict it only if the probe fails
    #[default]
    ProbeOldest,

    /// Always replace the oldest entry with the newcomer
    EvictOldest,

    /// Keep the oldest entry unless it already failed too often or expired
    KeepOldest,
}

/// Checks whether a peer is still alive
#[async_trait::async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Round-trip time if the peer answered, `None` otherwise
    async fn probe(&self, peer: &PeerInfo) -> Option<Duration>;
}

#[async_trait::async_trait]
impl LivenessProbe for PingService {
    async fn probe(&self, peer: &PeerInfo) -> Option<Duration> {
        let sample = self.ping_once(peer).await;
        if sample.is_success() {
            sample.rtt
        } else {
            None
        }
    }
}
