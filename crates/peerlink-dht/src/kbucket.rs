//! K-bucket implementation for Kademlia DHT
//!
//! Entries are kept least-recently-seen first: the front of the deque is the
//! eviction candidate, the back is the freshest contact.

use crate::entry::PeerEntry;
use peerlink_protocol::PeerId;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// A k-bucket for storing peers at a specific distance range
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Bucket index (0 is the closest range)
    pub index: usize,

    /// Maximum number of entries
    capacity: usize,

    /// Entries, least recently seen first
    entries: VecDeque<PeerEntry>,

    /// Last time this bucket was touched by an insert or refresh
    pub last_updated: Instant,
}

impl KBucket {
    /// Create a new k-bucket
    pub fn new(index: usize, capacity: usize) -> Self {
        KBucket {
            index,
            capacity,
            entries: VecDeque::with_capacity(capacity),
            last_updated: Instant::now(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get number of entries in bucket
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if bucket is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if bucket is full
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Entries, least recently seen first
    pub fn entries(&self) -> &VecDeque<PeerEntry> {
        &self.entries
    }

    /// Find entry by ID
    pub fn find(&self, peer_id: &PeerId) -> Option<&PeerEntry> {
        self.entries.iter().find(|e| &e.peer_id == peer_id)
    }

    /// Find entry mutably
    pub fn find_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerEntry> {
        self.entries.iter_mut().find(|e| &e.peer_id == peer_id)
    }

    /// Least recently seen entry
    pub fn oldest(&self) -> Option<&PeerEntry> {
        self.entries.front()
    }

    /// Move an existing entry to the back and mark it seen
    ///
    /// Returns false if the peer is not in this bucket.
    pub fn touch(&mut self, peer_id: &PeerId) -> bool {
        match self.entries.iter().position(|e| &e.peer_id == peer_id) {
            Some(pos) => {
                if let Some(mut entry) = self.entries.remove(pos) {
                    entry.touch();
                    self.entries.push_back(entry);
                }
                self.mark_updated();
                true
            }
            None => false,
        }
    }

    /// Append a new entry as most recently seen
    ///
    /// Returns false if the bucket is full; the bucket is left unchanged.
    pub fn push(&mut self, entry: PeerEntry) -> bool {
        if self.is_full() {
            return false;
        }
        self.entries.push_back(entry);
        self.mark_updated();
        true
    }

    /// Replace the least recently seen entry with `entry`
    pub fn replace_oldest(&mut self, entry: PeerEntry) -> Option<PeerEntry> {
        let evicted = self.entries.pop_front();
        self.entries.push_back(entry);
        self.mark_updated();
        evicted
    }

    /// Remove an entry from the bucket
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerEntry> {
        let pos = self.entries.iter().position(|e| &e.peer_id == peer_id)?;
        self.entries.remove(pos)
    }

    /// Remove entries not seen for `max_age`, returning their ids
    pub fn prune_stale(&mut self, max_age: Duration) -> Vec<PeerId> {
        let mut removed = Vec::new();

        self.entries.retain(|entry| {
            let keep = !entry.is_stale(max_age);
            if !keep {
                removed.push(entry.peer_id);
            }
            keep
        });

        removed
    }

    /// Mark the bucket as refreshed
    pub fn mark_updated(&mut self) {
        self.last_updated = Instant::now();
    }
}
