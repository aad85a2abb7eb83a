//! Iterative FIND_NODE lookup
//!
//! Each round queries the α closest unqueried candidates in parallel and
//! merges their answers into the shortlist. The lookup stops once a round
//! discovers nothing closer than what was already known and the k closest
//! live candidates have all been queried. The round cap and the global
//! deadline bound it regardless.

use crate::error::{DhtError, Result};
use crate::{ALPHA, K};
use futures::future::join_all;
use peerlink_network::ShutdownSignal;
use peerlink_protocol::{Distance, PeerId, PeerInfo};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::debug;

/// Lookup parameters
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Number of closest peers to return
    pub k: usize,

    /// Parallel queries per round
    pub alpha: usize,

    /// Timeout of a single FIND_NODE round trip
    pub query_timeout: Duration,

    /// Wall-clock bound on the whole lookup
    pub deadline: Duration,

    /// Hard cap on the number of rounds
    pub max_rounds: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        LookupConfig {
            k: K,
            alpha: ALPHA,
            query_timeout: Duration::from_secs(10),
            deadline: Duration::from_secs(60),
            max_rounds: 16,
        }
    }
}

/// Sends FIND_NODE queries on behalf of a lookup
#[async_trait::async_trait]
pub trait LookupTransport: Send + Sync {
    /// Ask `peer` for its closest peers to `target`
    async fn find_node(&self, peer: &PeerInfo, target: PeerId) -> Result<Vec<PeerInfo>>;
}

/// Lookup statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupStats {
    /// Rounds started
    pub rounds: usize,

    /// Queries sent
    pub queried: usize,

    /// Queries that failed or timed out
    pub failed: usize,

    /// Whether the global deadline cut the lookup short
    pub deadline_hit: bool,
}

/// Outcome of a finished lookup
#[derive(Debug, Clone)]
pub struct LookupResult {
    /// Closest responsive peers, nearest first
    pub peers: Vec<PeerInfo>,

    /// Every peer that answered, with its round-trip time
    pub responded: Vec<(PeerInfo, Duration)>,

    /// Every peer that failed or timed out
    pub failed: Vec<PeerId>,

    pub stats: LookupStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryState {
    Pending,
    Queried,
    Responded,
    Failed,
}

#[derive(Debug)]
struct Candidate {
    info: PeerInfo,
    state: QueryState,
}

/// State of one iterative lookup
#[derive(Debug)]
pub struct IterativeLookup {
    local_peer_id: PeerId,
    target: PeerId,
    config: LookupConfig,
    candidates: BTreeMap<Distance, Candidate>,
    responded: Vec<(PeerInfo, Duration)>,
    failed: Vec<PeerId>,
    stats: LookupStats,
}

impl IterativeLookup {
    /// Start a lookup for `target` from the given seed peers
    pub fn new(
        local_peer_id: PeerId,
        target: PeerId,
        seeds: Vec<PeerInfo>,
        config: LookupConfig,
    ) -> Self {
        let mut lookup = IterativeLookup {
            local_peer_id,
            target,
            config,
            candidates: BTreeMap::new(),
            responded: Vec::new(),
            failed: Vec::new(),
            stats: LookupStats::default(),
        };
        for seed in seeds {
            lookup.add_candidate(seed);
        }
        lookup
    }

    /// Add a peer to the shortlist; returns true if it was new
    fn add_candidate(&mut self, peer: PeerInfo) -> bool {
        if peer.peer_id == self.local_peer_id {
            return false;
        }
        let distance = self.target.distance(&peer.peer_id);
        match self.candidates.get_mut(&distance) {
            Some(known) => {
                known.info.merge_addresses(peer.addresses);
                false
            }
            None => {
                self.candidates.insert(
                    distance,
                    Candidate {
                        info: peer,
                        state: QueryState::Pending,
                    },
                );
                true
            }
        }
    }

    fn closest_known(&self) -> Option<Distance> {
        self.candidates.keys().next().copied()
    }

    /// Whether any of the k closest live candidates is still unqueried
    fn closest_pending(&self) -> bool {
        self.candidates
            .values()
            .filter(|c| c.state != QueryState::Failed)
            .take(self.config.k)
            .any(|c| c.state == QueryState::Pending)
    }

    fn next_batch(&mut self) -> Vec<PeerInfo> {
        let mut batch = Vec::with_capacity(self.config.alpha);
        for candidate in self.candidates.values_mut() {
            if batch.len() >= self.config.alpha {
                break;
            }
            if candidate.state == QueryState::Pending {
                candidate.state = QueryState::Queried;
                batch.push(candidate.info.clone());
            }
        }
        batch
    }

    fn set_state(&mut self, peer_id: &PeerId, state: QueryState) {
        let distance = self.target.distance(peer_id);
        if let Some(candidate) = self.candidates.get_mut(&distance) {
            candidate.state = state;
        }
    }

    /// Run the lookup to completion
    ///
    /// Per-peer failures are recorded and skipped. Only shutdown aborts the
    /// whole lookup.
    pub async fn run<T>(mut self, transport: &T, mut shutdown: ShutdownSignal) -> Result<LookupResult>
    where
        T: LookupTransport + ?Sized,
    {
        let deadline = Instant::now() + self.config.deadline;
        let query_timeout = self.config.query_timeout;
        let target = self.target;

        while self.stats.rounds < self.config.max_rounds {
            if shutdown.is_triggered() {
                return Err(DhtError::Cancelled);
            }

            let batch = self.next_batch();
            if batch.is_empty() {
                break;
            }

            let best_before = self.closest_known();
            self.stats.rounds += 1;
            self.stats.queried += batch.len();

            let queries = batch.iter().map(|peer| async move {
                let started = Instant::now();
                let result = timeout(query_timeout, transport.find_node(peer, target)).await;
                (peer, started.elapsed(), result)
            });

            let round = tokio::select! {
                _ = shutdown.cancelled() => return Err(DhtError::Cancelled),
                round = timeout_at(deadline, join_all(queries)) => round,
            };
            let Ok(responses) = round else {
                debug!("lookup for {} hit its deadline after {} rounds", target, self.stats.rounds);
                self.stats.deadline_hit = true;
                break;
            };

            for (peer, rtt, result) in responses {
                match result {
                    Ok(Ok(closer)) => {
                        self.set_state(&peer.peer_id, QueryState::Responded);
                        self.responded.push((peer.clone(), rtt));
                        for found in closer {
                            self.add_candidate(found);
                        }
                    }
                    Ok(Err(e)) => {
                        debug!("find_node to {} failed: {}", peer.peer_id, e);
                        self.set_state(&peer.peer_id, QueryState::Failed);
                        self.failed.push(peer.peer_id);
                        self.stats.failed += 1;
                    }
                    Err(_) => {
                        debug!("find_node to {} timed out", peer.peer_id);
                        self.set_state(&peer.peer_id, QueryState::Failed);
                        self.failed.push(peer.peer_id);
                        self.stats.failed += 1;
                    }
                }
            }

            let progressed = match (best_before, self.closest_known()) {
                (Some(before), Some(after)) => after < before,
                (None, Some(_)) => true,
                _ => false,
            };
            if !progressed && !self.closest_pending() {
                break;
            }
        }

        Ok(self.finish())
    }

    fn finish(self) -> LookupResult {
        let k = self.config.k;
        let peers = self
            .candidates
            .into_values()
            .filter(|c| c.state == QueryState::Responded)
            .take(k)
            .map(|c| c.info)
            .collect();

        LookupResult {
            peers,
            responded: self.responded,
            failed: self.failed,
            stats: self.stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_network::Shutdown;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Static network where every peer knows a fixed neighbour list
    #[derive(Default)]
    struct StaticNetwork {
        neighbours: HashMap<PeerId, Vec<PeerInfo>>,
        dead: HashSet<PeerId>,
        stalled: HashSet<PeerId>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        queried: Mutex<Vec<PeerId>>,
    }

    impl StaticNetwork {
        /// Fully connected network of `n` random peers; returns it and the ids
        fn complete(n: usize) -> (Self, Vec<PeerId>) {
            let ids: Vec<PeerId> = (0..n).map(|_| PeerId::random()).collect();
            let mut network = StaticNetwork::default();
            for id in &ids {
                let others = ids
                    .iter()
                    .filter(|other| *other != id)
                    .map(|other| PeerInfo::new(*other))
                    .collect();
                network.neighbours.insert(*id, others);
            }
            (network, ids)
        }
    }

    #[async_trait::async_trait]
    impl LookupTransport for StaticNetwork {
        async fn find_node(&self, peer: &PeerInfo, target: PeerId) -> Result<Vec<PeerInfo>> {
            if let Ok(mut queried) = self.queried.lock() {
                queried.push(peer.peer_id);
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;

            if self.stalled.contains(&peer.peer_id) {
                std::future::pending::<()>().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.dead.contains(&peer.peer_id) {
                return Err(DhtError::UnreachablePeer {
                    peer: peer.peer_id,
                    reason: "connection refused".to_string(),
                });
            }

            let mut known = self.neighbours.get(&peer.peer_id).cloned().unwrap_or_default();
            known.sort_by_key(|p| target.distance(&p.peer_id));
            known.truncate(K);
            Ok(known)
        }
    }

    fn expected_closest(ids: &[PeerId], target: &PeerId, local: &PeerId, k: usize) -> Vec<PeerId> {
        let mut sorted: Vec<PeerId> = ids.iter().filter(|id| *id != local).copied().collect();
        sorted.sort_by_key(|id| target.distance(id));
        sorted.truncate(k);
        sorted
    }

    #[tokio::test]
    async fn test_lookup_finds_closest() {
        let (network, ids) = StaticNetwork::complete(40);
        let local = ids[0];
        let target = PeerId::random();
        let seeds = vec![PeerInfo::new(ids[1])];

        let result = IterativeLookup::new(local, target, seeds, LookupConfig::default())
            .run(&network, Shutdown::new().signal())
            .await
            .unwrap();

        let found: Vec<PeerId> = result.peers.iter().map(|p| p.peer_id).collect();
        assert_eq!(found, expected_closest(&ids, &target, &local, K));
        assert!(result.stats.rounds <= LookupConfig::default().max_rounds);
        assert_eq!(result.stats.failed, 0);
    }

    #[tokio::test]
    async fn test_lookup_is_stable_on_static_network() {
        let (network, ids) = StaticNetwork::complete(30);
        let local = ids[0];
        let target = PeerId::random();
        let signal = Shutdown::new();

        let first = IterativeLookup::new(local, target, vec![PeerInfo::new(ids[5])], LookupConfig::default())
            .run(&network, signal.signal())
            .await
            .unwrap();
        let second = IterativeLookup::new(local, target, first.peers.clone(), LookupConfig::default())
            .run(&network, signal.signal())
            .await
            .unwrap();

        let a: HashSet<PeerId> = first.peers.iter().map(|p| p.peer_id).collect();
        let b: HashSet<PeerId> = second.peers.iter().map(|p| p.peer_id).collect();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_lookup_caps_parallelism_at_alpha() {
        let (network, ids) = StaticNetwork::complete(30);
        let seeds: Vec<PeerInfo> = ids[1..10].iter().map(|id| PeerInfo::new(*id)).collect();

        IterativeLookup::new(ids[0], PeerId::random(), seeds, LookupConfig::default())
            .run(&network, Shutdown::new().signal())
            .await
            .unwrap();

        let max = network.max_in_flight.load(Ordering::SeqCst);
        assert!(max >= 1 && max <= ALPHA);
    }

    #[tokio::test]
    async fn test_dead_peers_are_skipped() {
        let (mut network, ids) = StaticNetwork::complete(20);
        let local = ids[0];
        let target = PeerId::random();
        let dead = ids[1];
        network.dead.insert(dead);

        let seeds = vec![PeerInfo::new(dead), PeerInfo::new(ids[2])];
        let result = IterativeLookup::new(local, target, seeds, LookupConfig::default())
            .run(&network, Shutdown::new().signal())
            .await
            .unwrap();

        assert!(result.failed.contains(&dead));
        assert!(result.peers.iter().all(|p| p.peer_id != dead));
        assert!(!result.peers.is_empty());
        assert!(result.stats.failed >= 1);
    }

    #[tokio::test]
    async fn test_lookup_never_returns_local_peer() {
        let (network, ids) = StaticNetwork::complete(10);
        let local = ids[0];

        let result = IterativeLookup::new(local, local, vec![PeerInfo::new(ids[1])], LookupConfig::default())
            .run(&network, Shutdown::new().signal())
            .await
            .unwrap();

        assert!(result.peers.iter().all(|p| p.peer_id != local));
        assert_eq!(result.peers.len(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_times_out() {
        let (mut network, ids) = StaticNetwork::complete(10);
        network.stalled.insert(ids[1]);

        let config = LookupConfig {
            query_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let started = Instant::now();
        let result = IterativeLookup::new(ids[0], PeerId::random(), vec![PeerInfo::new(ids[1])], config)
            .run(&network, Shutdown::new().signal())
            .await
            .unwrap();

        assert_eq!(result.failed, vec![ids[1]]);
        assert!(result.peers.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_deadline_bounds_lookup() {
        let (mut network, ids) = StaticNetwork::complete(10);
        network.stalled.insert(ids[1]);

        let config = LookupConfig {
            query_timeout: Duration::from_secs(600),
            deadline: Duration::from_secs(5),
            ..Default::default()
        };
        let started = Instant::now();
        let result = IterativeLookup::new(ids[0], PeerId::random(), vec![PeerInfo::new(ids[1])], config)
            .run(&network, Shutdown::new().signal())
            .await
            .unwrap();

        assert!(result.stats.deadline_hit);
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_lookup() {
        let (mut network, ids) = StaticNetwork::complete(10);
        network.stalled.insert(ids[1]);
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();

        let lookup = tokio::spawn(async move {
            IterativeLookup::new(ids[0], PeerId::random(), vec![PeerInfo::new(ids[1])], LookupConfig::default())
                .run(&network, signal)
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.trigger();

        let result = lookup.await.unwrap();
        assert!(matches!(result, Err(DhtError::Cancelled)));
    }

    #[tokio::test]
    async fn test_round_cap() {
        let (network, ids) = StaticNetwork::complete(40);
        let config = LookupConfig {
            max_rounds: 1,
            ..Default::default()
        };

        let result = IterativeLookup::new(ids[0], PeerId::random(), vec![PeerInfo::new(ids[1])], config)
            .run(&network, Shutdown::new().signal())
            .await
            .unwrap();

        assert_eq!(result.stats.rounds, 1);
        assert_eq!(result.stats.queried, 1);
        assert_eq!(result.peers.len(), 1);
    }

    #[test]
    fn test_shortlist_merges_addresses() {
        let local = PeerId::from_bytes([0; 32]);
        let peer = PeerId::from_bytes([1; 32]);
        let mut lookup = IterativeLookup::new(local, peer, vec![PeerInfo::new(peer)], LookupConfig::default());

        let addr = peerlink_protocol::Address::Memory(7);
        assert!(!lookup.add_candidate(PeerInfo::with_addresses(peer, vec![addr.clone()])));
        assert!(!lookup.add_candidate(PeerInfo::new(local)));

        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].addresses, vec![addr]);
    }
}
