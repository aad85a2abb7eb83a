//! Routing table entry bookkeeping

use peerlink_protocol::PeerId;
use std::time::Duration;
use tokio::time::Instant;

/// Liveness information about a peer held in a k-bucket
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Peer identifier
    pub peer_id: PeerId,

    /// When the peer entered the table
    pub first_seen: Instant,

    /// Last contact (insert, inbound request or successful query)
    pub last_seen: Instant,

    /// Consecutive failed queries
    pub failures: u32,

    /// Round-trip time of the last successful query
    pub rtt: Option<Duration>,

    /// Total successful queries
    pub successes: u64,
}

impl PeerEntry {
    /// Create an entry seen just now
    pub fn new(peer_id: PeerId) -> Self {
        let now = Instant::now();
        PeerEntry {
            peer_id,
            first_seen: now,
            last_seen: now,
            failures: 0,
            rtt: None,
            successes: 0,
        }
    }

    /// Mark the peer as seen just now
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Record a successful query
    pub fn record_success(&mut self, rtt: Duration) {
        self.touch();
        self.failures = 0;
        self.rtt = Some(rtt);
        self.successes += 1;
    }

    /// Record a failed query
    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    /// Time since last contact
    pub fn age(&self) -> Duration {
        self.last_seen.elapsed()
    }

    /// Check if the peer has not been seen for `max_age`
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }

    /// Passive eviction check, used when no probe is run
    pub fn should_evict(&self, max_failures: u32, max_age: Duration) -> bool {
        self.failures >= max_failures || self.is_stale(max_age)
    }
}
