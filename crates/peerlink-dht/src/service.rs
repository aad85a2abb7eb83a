//! DHT service: lookup, bootstrap and periodic refresh over one routing table

use crate::entry::PeerEntry;
use crate::error::{DhtError, Result};
use crate::lookup::{IterativeLookup, LookupConfig, LookupResult, LookupStats, LookupTransport};
use crate::probe::{EvictionPolicy, LivenessProbe};
use crate::routing_table::{RoutingTable, TableConfig};
use peerlink_network::ShutdownSignal;
use peerlink_protocol::{DhtResponse, PeerId, PeerInfo};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// DHT configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub table: TableConfig,

    pub lookup: LookupConfig,

    /// How often stale buckets are refreshed
    pub refresh_interval: Duration,

    pub eviction: EvictionPolicy,
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            table: TableConfig::default(),
            lookup: LookupConfig::default(),
            refresh_interval: Duration::from_secs(600),
            eviction: EvictionPolicy::default(),
        }
    }
}

impl DhtConfig {
    /// Copy with every size at least one and every period at least 1ms
    pub fn normalized(mut self) -> Self {
        let min_period = Duration::from_millis(1);
        self.table.bucket_size = self.table.bucket_size.max(1);
        self.lookup.k = self.lookup.k.max(1);
        self.lookup.alpha = self.lookup.alpha.max(1);
        self.lookup.max_rounds = self.lookup.max_rounds.max(1);
        self.lookup.query_timeout = self.lookup.query_timeout.max(min_period);
        self.lookup.deadline = self.lookup.deadline.max(min_period);
        self.refresh_interval = self.refresh_interval.max(min_period);
        self
    }
}

/// Result of a successful bootstrap
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    /// Seeds that were tried (the local peer excluded)
    pub seeds_attempted: usize,

    /// Seeds that answered
    pub seeds_responded: usize,

    /// Routing table size afterwards
    pub table_size: usize,

    pub lookup: LookupStats,
}

/// Result of one refresh pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub buckets_refreshed: usize,
    pub peers_pruned: usize,
}

/// Peer routing capability consumed by the node
#[async_trait::async_trait]
pub trait PeerRouting: Send + Sync {
    /// Resolve a peer id to its addresses
    async fn find_peer(&self, peer_id: PeerId) -> Result<PeerInfo>;
}

struct DhtInner {
    local_peer_id: PeerId,
    config: DhtConfig,
    table: RwLock<RoutingTable>,
    rpc: Arc<dyn LookupTransport>,
    probe: Option<Arc<dyn LivenessProbe>>,
    shutdown: ShutdownSignal,
}

/// Kademlia DHT service
///
/// Cheap to clone; all clones share one routing table.
#[derive(Clone)]
pub struct DhtService {
    inner: Arc<DhtInner>,
}

impl DhtService {
    pub fn new(
        local_peer_id: PeerId,
        config: DhtConfig,
        rpc: Arc<dyn LookupTransport>,
        probe: Option<Arc<dyn LivenessProbe>>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let config = config.normalized();
        let table = RoutingTable::with_config(local_peer_id, config.table.clone());
        DhtService {
            inner: Arc::new(DhtInner {
                local_peer_id,
                config,
                table: RwLock::new(table),
                rpc,
                probe,
                shutdown,
            }),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local_peer_id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    /// Insert or refresh a peer, applying the eviction policy
    ///
    /// The liveness probe runs without holding the table lock. Returns
    /// whether the table changed.
    pub async fn insert_peer(&self, peer: PeerInfo) -> bool {
        let max_failures = self.inner.config.table.max_failures;
        let peer_expiry = self.inner.config.table.peer_expiry;
        let passive = move |entry: &PeerEntry| entry.should_evict(max_failures, peer_expiry);

        match (self.inner.config.eviction, &self.inner.probe) {
            (EvictionPolicy::ProbeOldest, Some(probe)) => {
                let (candidate, already_dead) = {
                    let table = self.inner.table.read().await;
                    let candidate = table.eviction_candidate(&peer.peer_id);
                    let already_dead = candidate
                        .as_ref()
                        .and_then(|c| table.entry(&c.peer_id))
                        .map(passive)
                        .unwrap_or(false);
                    (candidate, already_dead)
                };

                let Some(oldest) = candidate else {
                    let mut table = self.inner.table.write().await;
                    return self.insert_passive(&mut table, peer);
                };

                let alive = if already_dead {
                    None
                } else {
                    probe.probe(&oldest).await
                };

                let mut table = self.inner.table.write().await;
                match alive {
                    Some(rtt) => {
                        table.record_success(&oldest.peer_id, rtt);
                    }
                    None => {
                        debug!("evicting unresponsive {}", oldest.peer_id);
                    }
                }
                table
                    .insert_with(peer, |entry| {
                        if entry.peer_id == oldest.peer_id {
                            alive.is_none()
                        } else {
                            passive(entry)
                        }
                    })
                    .changed()
            }
            _ => {
                let mut table = self.inner.table.write().await;
                self.insert_passive(&mut table, peer)
            }
        }
    }

    /// Insert without contacting anyone: a full bucket only gives way to an
    /// entry that already failed or expired, or unconditionally under
    /// [`EvictionPolicy::EvictOldest`]
    fn insert_passive(&self, table: &mut RoutingTable, peer: PeerInfo) -> bool {
        let max_failures = self.inner.config.table.max_failures;
        let peer_expiry = self.inner.config.table.peer_expiry;
        match self.inner.config.eviction {
            EvictionPolicy::EvictOldest => table.insert_with(peer, |_| true).changed(),
            _ => table
                .insert_with(peer, |entry| entry.should_evict(max_failures, peer_expiry))
                .changed(),
        }
    }

    /// Remove a peer; no-op if absent
    pub async fn remove_peer(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.inner.table.write().await.remove(peer_id)
    }

    pub async fn contains(&self, peer_id: &PeerId) -> bool {
        self.inner.table.read().await.contains(peer_id)
    }

    pub async fn closest_peers(&self, target: &PeerId, count: usize) -> Vec<PeerInfo> {
        self.inner.table.read().await.closest_peers(target, count)
    }

    pub async fn node_count(&self) -> usize {
        self.inner.table.read().await.node_count()
    }

    pub async fn all_peers(&self) -> Vec<PeerInfo> {
        self.inner.table.read().await.all_peers()
    }

    /// Normalized snapshot of the routing table (see
    /// [`RoutingTable::normalized_buckets`])
    pub async fn normalized_buckets(&self) -> Vec<Vec<PeerInfo>> {
        let table = self.inner.table.read().await;
        table.normalized_buckets(&mut rand::thread_rng())
    }

    /// Answer an inbound FIND_NODE
    pub async fn handle_find_node(&self, target: &PeerId, requester: &PeerId) -> DhtResponse {
        let k = self.inner.config.table.bucket_size;
        let mut closer_peers = self.closest_peers(target, k + 1).await;
        closer_peers.retain(|p| &p.peer_id != requester);
        closer_peers.truncate(k);
        DhtResponse { closer_peers }
    }

    /// Closest reachable peers to `target`
    pub async fn lookup(&self, target: PeerId) -> Result<Vec<PeerInfo>> {
        Ok(self.lookup_with_stats(target).await?.peers)
    }

    /// Lookup returning the full result, with the routing table updated from
    /// what the lookup learned
    pub async fn lookup_with_stats(&self, target: PeerId) -> Result<LookupResult> {
        let span = info_span!("dht.lookup", target = %target);
        self.run_lookup(target, Vec::new()).instrument(span).await
    }

    async fn run_lookup(&self, target: PeerId, extra_seeds: Vec<PeerInfo>) -> Result<LookupResult> {
        let config = self.inner.config.lookup.clone();
        let mut seeds = self.closest_peers(&target, config.k).await;
        seeds.extend(extra_seeds);
        if seeds.is_empty() {
            return Err(DhtError::NoKnownPeers);
        }

        let lookup = IterativeLookup::new(self.inner.local_peer_id, target, seeds, config);
        let result = lookup
            .run(self.inner.rpc.as_ref(), self.inner.shutdown.clone())
            .await?;

        self.apply_feedback(&result).await;
        debug!(
            "lookup for {} found {} peers in {} rounds ({} failed queries)",
            target,
            result.peers.len(),
            result.stats.rounds,
            result.stats.failed
        );
        Ok(result)
    }

    /// Fold what a lookup learned into the table
    ///
    /// Responders go through the passive insert only, so a finished lookup
    /// never waits on liveness checks.
    async fn apply_feedback(&self, result: &LookupResult) {
        let mut table = self.inner.table.write().await;
        for (peer, rtt) in &result.responded {
            self.insert_passive(&mut table, peer.clone());
            table.record_success(&peer.peer_id, *rtt);
        }
        for peer_id in &result.failed {
            table.record_failure(peer_id);
        }
    }

    /// Join the network through `seeds`
    ///
    /// Inserts the seeds and looks up the local id. Individual seed failures
    /// are tolerated; if none of them answers the seeds are dropped again and
    /// [`DhtError::BootstrapFailed`] is returned. An empty seed list is not an
    /// error.
    pub async fn bootstrap(&self, seeds: Vec<PeerInfo>) -> Result<BootstrapReport> {
        let span = info_span!("dht.bootstrap", seeds = seeds.len());
        self.run_bootstrap(seeds).instrument(span).await
    }

    async fn run_bootstrap(&self, seeds: Vec<PeerInfo>) -> Result<BootstrapReport> {
        let local = self.inner.local_peer_id;
        let seeds: Vec<PeerInfo> = seeds.into_iter().filter(|s| s.peer_id != local).collect();
        if seeds.is_empty() {
            info!("no seed peers; starting with an empty routing table");
            return Ok(BootstrapReport::default());
        }

        for seed in &seeds {
            self.insert_peer(seed.clone()).await;
        }

        let result = self.run_lookup(local, seeds.clone()).await?;
        let responded: HashSet<PeerId> = result.responded.iter().map(|(p, _)| p.peer_id).collect();
        let seeds_responded = seeds.iter().filter(|s| responded.contains(&s.peer_id)).count();

        if seeds_responded == 0 {
            let mut table = self.inner.table.write().await;
            for seed in &seeds {
                table.remove(&seed.peer_id);
            }
            warn!("bootstrap failed: none of {} seeds responded", seeds.len());
            return Err(DhtError::BootstrapFailed {
                attempted: seeds.len(),
            });
        }

        let report = BootstrapReport {
            seeds_attempted: seeds.len(),
            seeds_responded,
            table_size: self.node_count().await,
            lookup: result.stats,
        };
        info!(
            "bootstrapped from {}/{} seeds, routing table holds {} peers",
            report.seeds_responded, report.seeds_attempted, report.table_size
        );
        Ok(report)
    }

    /// Prune expired peers and look up a random id in every stale bucket
    pub async fn refresh_once(&self) -> Result<RefreshReport> {
        let span = info_span!("dht.refresh");
        self.run_refresh().instrument(span).await
    }

    async fn run_refresh(&self) -> Result<RefreshReport> {
        let (pruned, targets) = {
            let mut table = self.inner.table.write().await;
            let pruned = table.prune_stale(self.inner.config.table.peer_expiry);
            let stale = table.stale_buckets(self.inner.config.refresh_interval);
            let mut rng = rand::thread_rng();
            let targets: Vec<(usize, PeerId)> = stale
                .into_iter()
                .map(|index| (index, table.random_id_in_bucket(index, &mut rng)))
                .collect();
            (pruned, targets)
        };

        let mut report = RefreshReport {
            buckets_refreshed: 0,
            peers_pruned: pruned.len(),
        };

        for (index, target) in targets {
            if self.inner.shutdown.is_triggered() {
                return Err(DhtError::Cancelled);
            }
            match self.run_lookup(target, Vec::new()).await {
                Ok(_) | Err(DhtError::NoKnownPeers) => {}
                Err(DhtError::Cancelled) => return Err(DhtError::Cancelled),
                Err(e) => debug!("refresh lookup for bucket {} failed: {}", index, e),
            }
            self.inner.table.write().await.mark_refreshed(index);
            report.buckets_refreshed += 1;
        }

        Ok(report)
    }

    /// Run [`refresh_once`](Self::refresh_once) every refresh interval until
    /// shutdown
    pub fn spawn_refresh(&self) -> JoinHandle<()> {
        let service = self.clone();
        let mut shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.inner.config.refresh_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match service.refresh_once().await {
                            Ok(report) => debug!(
                                "refreshed {} buckets, pruned {} peers",
                                report.buckets_refreshed, report.peers_pruned
                            ),
                            Err(DhtError::Cancelled) => break,
                            Err(e) => warn!("routing table refresh failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl PeerRouting for DhtService {
    async fn find_peer(&self, peer_id: PeerId) -> Result<PeerInfo> {
        if let Some(info) = self.inner.table.read().await.get(&peer_id) {
            return Ok(info);
        }

        let result = self.lookup_with_stats(peer_id).await?;
        result
            .peers
            .into_iter()
            .find(|p| p.peer_id == peer_id)
            .ok_or(DhtError::PeerNotFound(peer_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DhtRequestHandler;
    use crate::rpc::NetworkRpc;
    use peerlink_network::{
        MemoryNetwork, PingConfig, PingService, Shutdown, StreamDispatcher, Transport,
    };
    use peerlink_protocol::Address;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestNode {
        dht: DhtService,
        transport: Arc<dyn Transport>,
    }

    impl TestNode {
        fn info(&self) -> PeerInfo {
            self.transport.local_peer_info()
        }
    }

    fn create_test_node(network: &MemoryNetwork, shutdown: &Shutdown, config: DhtConfig) -> TestNode {
        let transport: Arc<dyn Transport> =
            Arc::new(network.bind(PeerId::random(), &Address::Memory(0)).unwrap());
        let ping = PingService::new(transport.clone(), PingConfig::default(), shutdown.signal());
        let dht = DhtService::new(
            transport.local_peer_id(),
            config,
            Arc::new(NetworkRpc::new(transport.clone())),
            Some(Arc::new(ping.clone())),
            shutdown.signal(),
        );

        let mut dispatcher = StreamDispatcher::new();
        dispatcher.register(Arc::new(ping));
        dispatcher.register(Arc::new(DhtRequestHandler::new(dht.clone())));
        dispatcher.spawn(transport.clone(), shutdown.signal());

        TestNode { dht, transport }
    }

    /// Let responders finish recording the requester after replying
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Network-free transport and probe for policy tests
    struct NoRpc;

    #[async_trait::async_trait]
    impl LookupTransport for NoRpc {
        async fn find_node(&self, peer: &PeerInfo, _target: PeerId) -> Result<Vec<PeerInfo>> {
            Err(DhtError::UnreachablePeer {
                peer: peer.peer_id,
                reason: "offline".to_string(),
            })
        }
    }

    struct FixedProbe {
        alive: bool,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LivenessProbe for FixedProbe {
        async fn probe(&self, _peer: &PeerInfo) -> Option<Duration> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.alive.then(|| Duration::from_millis(5))
        }
    }

    /// Liveness check that answers only after a long wait
    struct SlowLiveness {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LivenessProbe for SlowLiveness {
        async fn probe(&self, _peer: &PeerInfo) -> Option<Duration> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Some(self.delay)
        }
    }

    /// Every peer answers with the same fixed peer list
    struct StaticRpc {
        peers: Vec<PeerInfo>,
    }

    #[async_trait::async_trait]
    impl LookupTransport for StaticRpc {
        async fn find_node(&self, _peer: &PeerInfo, _target: PeerId) -> Result<Vec<PeerInfo>> {
            Ok(self.peers.clone())
        }
    }

    fn prefix_peer(first: u8) -> PeerInfo {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        PeerInfo::new(PeerId::from_bytes(bytes))
    }

    fn policy_service(policy: EvictionPolicy, probe: Arc<FixedProbe>) -> DhtService {
        let config = DhtConfig {
            table: TableConfig {
                bucket_size: 2,
                ..Default::default()
            },
            eviction: policy,
            ..Default::default()
        };
        DhtService::new(
            PeerId::from_bytes([0; 32]),
            config,
            Arc::new(NoRpc),
            Some(probe),
            ShutdownSignal::never(),
        )
    }

    #[tokio::test]
    async fn test_probe_alive_rejects_newcomer() {
        let probe = Arc::new(FixedProbe {
            alive: true,
            calls: AtomicUsize::new(0),
        });
        let service = policy_service(EvictionPolicy::ProbeOldest, probe.clone());

        assert!(service.insert_peer(prefix_peer(0b1000_0000)).await);
        assert!(service.insert_peer(prefix_peer(0b1100_0000)).await);
        assert!(!service.insert_peer(prefix_peer(0b1010_0000)).await);

        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.node_count().await, 2);
        assert!(!service.contains(&prefix_peer(0b1010_0000).peer_id).await);
    }

    #[tokio::test]
    async fn test_probe_dead_evicts_oldest() {
        let probe = Arc::new(FixedProbe {
            alive: false,
            calls: AtomicUsize::new(0),
        });
        let service = policy_service(EvictionPolicy::ProbeOldest, probe);

        service.insert_peer(prefix_peer(0b1000_0000)).await;
        service.insert_peer(prefix_peer(0b1100_0000)).await;
        assert!(service.insert_peer(prefix_peer(0b1010_0000)).await);

        assert!(!service.contains(&prefix_peer(0b1000_0000).peer_id).await);
        assert!(service.contains(&prefix_peer(0b1010_0000).peer_id).await);
    }

    #[tokio::test]
    async fn test_evict_oldest_policy_skips_probe() {
        let probe = Arc::new(FixedProbe {
            alive: true,
            calls: AtomicUsize::new(0),
        });
        let service = policy_service(EvictionPolicy::EvictOldest, probe.clone());

        service.insert_peer(prefix_peer(0b1000_0000)).await;
        service.insert_peer(prefix_peer(0b1100_0000)).await;
        assert!(service.insert_peer(prefix_peer(0b1010_0000)).await);

        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert!(!service.contains(&prefix_peer(0b1000_0000).peer_id).await);
    }

    #[tokio::test]
    async fn test_keep_oldest_policy() {
        let probe = Arc::new(FixedProbe {
            alive: false,
            calls: AtomicUsize::new(0),
        });
        let service = policy_service(EvictionPolicy::KeepOldest, probe.clone());

        service.insert_peer(prefix_peer(0b1000_0000)).await;
        service.insert_peer(prefix_peer(0b1100_0000)).await;
        assert!(!service.insert_peer(prefix_peer(0b1010_0000)).await);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_feedback_skips_liveness_checks() {
        let learned: Vec<PeerInfo> = [0b1100_0000, 0b1010_0000, 0b1001_0000, 0b1110_0000]
            .into_iter()
            .map(prefix_peer)
            .collect();
        let checker = Arc::new(SlowLiveness {
            delay: Duration::from_secs(10),
            calls: AtomicUsize::new(0),
        });
        let config = DhtConfig {
            table: TableConfig {
                bucket_size: 1,
                ..Default::default()
            },
            lookup: LookupConfig {
                deadline: Duration::from_secs(5),
                ..Default::default()
            },
            eviction: EvictionPolicy::ProbeOldest,
            ..Default::default()
        };
        let service = DhtService::new(
            PeerId::from_bytes([0; 32]),
            config,
            Arc::new(StaticRpc { peers: learned }),
            Some(checker.clone()),
            ShutdownSignal::never(),
        );
        assert!(service.insert_peer(prefix_peer(0b1000_0000)).await);

        let started = tokio::time::Instant::now();
        let result = service.lookup_with_stats(PeerId::random()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.responded.len(), 5);
        assert_eq!(checker.calls.load(Ordering::SeqCst), 0);
        assert_eq!(service.node_count().await, 1);
    }

    #[tokio::test]
    async fn test_lookup_with_empty_table() {
        let service = policy_service(
            EvictionPolicy::ProbeOldest,
            Arc::new(FixedProbe {
                alive: true,
                calls: AtomicUsize::new(0),
            }),
        );
        let result = service.lookup(PeerId::random()).await;
        assert!(matches!(result, Err(DhtError::NoKnownPeers)));
    }

    #[tokio::test]
    async fn test_bootstrap_without_seeds() {
        let network = MemoryNetwork::new();
        let shutdown = Shutdown::new();
        let node = create_test_node(&network, &shutdown, DhtConfig::default());

        let report = node.dht.bootstrap(Vec::new()).await.unwrap();
        assert_eq!(report.seeds_attempted, 0);
        assert_eq!(node.dht.node_count().await, 0);
    }

    #[tokio::test]
    async fn test_bootstrap_all_seeds_unreachable() {
        let network = MemoryNetwork::new();
        let shutdown = Shutdown::new();
        let node = create_test_node(&network, &shutdown, DhtConfig::default());

        let seeds = vec![
            PeerInfo::with_addresses(PeerId::random(), vec![Address::Memory(9001)]),
            PeerInfo::with_addresses(PeerId::random(), vec![Address::Memory(9002)]),
        ];
        let result = node.dht.bootstrap(seeds).await;

        assert!(matches!(result, Err(DhtError::BootstrapFailed { attempted: 2 })));
        assert_eq!(node.dht.node_count().await, 0);
    }

    #[tokio::test]
    async fn test_bootstrap_populates_both_tables() {
        let network = MemoryNetwork::new();
        let shutdown = Shutdown::new();
        let seed = create_test_node(&network, &shutdown, DhtConfig::default());
        let joiner = create_test_node(&network, &shutdown, DhtConfig::default());

        let report = joiner.dht.bootstrap(vec![seed.info()]).await.unwrap();
        assert_eq!(report.seeds_attempted, 1);
        assert_eq!(report.seeds_responded, 1);
        settle().await;

        assert!(joiner.dht.contains(&seed.info().peer_id).await);
        assert!(seed.dht.contains(&joiner.info().peer_id).await);
        assert_eq!(
            seed.dht.all_peers().await[0].addresses,
            joiner.info().addresses
        );
    }

    #[tokio::test]
    async fn test_nodes_discover_each_other() {
        let network = MemoryNetwork::new();
        let shutdown = Shutdown::new();
        let seed = create_test_node(&network, &shutdown, DhtConfig::default());

        let mut nodes = Vec::new();
        for _ in 0..8 {
            let node = create_test_node(&network, &shutdown, DhtConfig::default());
            node.dht.bootstrap(vec![seed.info()]).await.unwrap();
            nodes.push(node);
        }
        settle().await;

        let first = &nodes[0];
        let last = &nodes[7];
        let found = first.dht.find_peer(last.info().peer_id).await.unwrap();
        assert_eq!(found.peer_id, last.info().peer_id);
        assert_eq!(found.addresses, last.info().addresses);

        let peers = first.dht.lookup(PeerId::random()).await.unwrap();
        assert_eq!(peers.len(), 8);
        assert!(peers.iter().all(|p| p.peer_id != first.info().peer_id));
    }

    #[tokio::test]
    async fn test_find_node_excludes_requester() {
        let network = MemoryNetwork::new();
        let shutdown = Shutdown::new();
        let node = create_test_node(&network, &shutdown, DhtConfig::default());
        let requester = PeerId::random();
        let other = PeerId::random();
        node.dht.insert_peer(PeerInfo::new(requester)).await;
        node.dht.insert_peer(PeerInfo::new(other)).await;

        let response = node.dht.handle_find_node(&requester, &requester).await;
        assert_eq!(response.closer_peers.len(), 1);
        assert_eq!(response.closer_peers[0].peer_id, other);
    }

    #[tokio::test]
    async fn test_find_unknown_peer() {
        let network = MemoryNetwork::new();
        let shutdown = Shutdown::new();
        let seed = create_test_node(&network, &shutdown, DhtConfig::default());
        let node = create_test_node(&network, &shutdown, DhtConfig::default());
        node.dht.bootstrap(vec![seed.info()]).await.unwrap();
        settle().await;

        let missing = PeerId::random();
        let result = node.dht.find_peer(missing).await;
        assert!(matches!(result, Err(DhtError::PeerNotFound(id)) if id == missing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_prunes_and_refreshes() {
        let network = MemoryNetwork::new();
        let shutdown = Shutdown::new();
        let seed = create_test_node(&network, &shutdown, DhtConfig::default());
        let node = create_test_node(&network, &shutdown, DhtConfig::default());
        node.dht.bootstrap(vec![seed.info()]).await.unwrap();

        let nothing = node.dht.refresh_once().await.unwrap();
        assert_eq!(nothing, RefreshReport::default());

        tokio::time::advance(Duration::from_secs(601)).await;
        let report = node.dht.refresh_once().await.unwrap();
        assert_eq!(report.buckets_refreshed, 1);
        assert_eq!(report.peers_pruned, 0);

        tokio::time::advance(Duration::from_secs(3601)).await;
        seed.transport.close().await;
        let report = node.dht.refresh_once().await.unwrap();
        assert_eq!(report.peers_pruned, 1);
        assert_eq!(node.dht.node_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_task_stops_on_shutdown() {
        let network = MemoryNetwork::new();
        let shutdown = Shutdown::new();
        let node = create_test_node(&network, &shutdown, DhtConfig::default());

        let task = node.dht.spawn_refresh();
        tokio::time::sleep(Duration::from_secs(1300)).await;
        shutdown.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_config_values_are_clamped() {
        let shutdown = Shutdown::new();
        let config = DhtConfig {
            table: TableConfig {
                bucket_size: 0,
                ..Default::default()
            },
            lookup: LookupConfig {
                k: 0,
                alpha: 0,
                query_timeout: Duration::ZERO,
                deadline: Duration::ZERO,
                max_rounds: 0,
            },
            refresh_interval: Duration::ZERO,
            eviction: EvictionPolicy::ProbeOldest,
        };
        let service = DhtService::new(
            PeerId::from_bytes([0; 32]),
            config,
            Arc::new(NoRpc),
            None,
            shutdown.signal(),
        );

        let config = service.config();
        assert_eq!(config.table.bucket_size, 1);
        assert_eq!(config.lookup.alpha, 1);
        assert_eq!(config.lookup.k, 1);
        assert_eq!(config.lookup.max_rounds, 1);
        assert_eq!(config.refresh_interval, Duration::from_millis(1));
        assert!(service.insert_peer(prefix_peer(0b1000_0000)).await);

        let task = service.spawn_refresh();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        shutdown.trigger();
        task.await.unwrap();
    }
}
