//! End-to-end node tests over the in-process network and loopback TCP

use peerlink_dht::DhtError;
use peerlink_network::{MemoryNetwork, PingOutcome};
use peerlink_protocol::{Address, P2pAddr, PeerId};
use peerlink_telemetry::MemorySink;
use peerlinkd::config::SinkConfig;
use peerlinkd::{Config, Node, NodeError, StartReport};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;

fn create_test_config() -> Config {
    let mut config = Config::default();
    config.ping.timeout_ms = 2_000;
    config.ping.interval_ms = 0;
    config.telemetry.sink = SinkConfig::None;
    config
}

async fn start_memory_node(network: &MemoryNetwork, seeds: &[P2pAddr]) -> (Node, StartReport) {
    let mut node = Node::with_memory_network(create_test_config(), network.clone()).unwrap();
    let report = node.start(&[], seeds).await.unwrap();
    (node, report)
}

fn p2p_addr(report: &StartReport) -> P2pAddr {
    report.local.p2p_addrs()[0].clone()
}

/// Let responders finish recording the requester after replying
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_two_nodes_bootstrap_and_ping() {
    let network = MemoryNetwork::new();
    let (mut a, report_a) = start_memory_node(&network, &[]).await;
    let (mut b, report_b) = start_memory_node(&network, &[p2p_addr(&report_a)]).await;

    let bootstrap = report_b.bootstrap.as_ref().unwrap();
    assert_eq!(bootstrap.seeds_responded, 1);
    settle().await;

    assert!(b.dht().unwrap().contains(&a.peer_id()).await);
    assert!(a.dht().unwrap().contains(&b.peer_id()).await);

    let samples = b.connect_and_ping(&p2p_addr(&report_a), 3).await.unwrap();
    assert_eq!(samples.len(), 3);
    for sample in &samples {
        assert_eq!(sample.outcome, PingOutcome::Acked);
        assert_eq!(sample.peer_id, a.peer_id());
        assert!(sample.rtt.is_some());
    }

    let stats = b.stats().await;
    assert!(stats.running);
    assert_eq!(stats.routing_table_size, 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_refused_connection_is_an_error() {
    let network = MemoryNetwork::new();
    let (mut node, _) = start_memory_node(&network, &[]).await;

    let remote = Address::Memory(4242).with_peer(PeerId::random());
    let result = node.connect_and_ping(&remote, 3).await;
    assert!(matches!(result, Err(NodeError::Connect { peer, .. }) if peer == remote.peer_id));

    node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_address_times_out() {
    let network = MemoryNetwork::new();
    let (mut node, _) = start_memory_node(&network, &[]).await;
    let remote = network.add_blackhole().with_peer(PeerId::random());

    let started = tokio::time::Instant::now();
    let samples = node.connect_and_ping(&remote, 3).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(samples.len(), 3);
    for sample in &samples {
        assert_eq!(sample.outcome, PingOutcome::TimedOut);
        assert!(sample.rtt.is_none());
    }
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_millis(2100));

    node.stop().await;
}

#[tokio::test]
async fn test_failed_bootstrap_keeps_node_running() {
    let network = MemoryNetwork::new();
    let dead_seed = Address::Memory(9999).with_peer(PeerId::random());
    let (mut lonely, report) = start_memory_node(&network, &[dead_seed]).await;

    assert!(matches!(
        report.bootstrap,
        Err(DhtError::BootstrapFailed { attempted: 1 })
    ));
    assert!(lonely.is_running());
    assert_eq!(lonely.stats().await.routing_table_size, 0);

    let (mut other, _) = start_memory_node(&network, &[]).await;
    let samples = other.connect_and_ping(&p2p_addr(&report), 1).await.unwrap();
    assert!(samples[0].is_success());

    lonely.stop().await;
    other.stop().await;
}

#[tokio::test]
async fn test_listen_failure() {
    let network = MemoryNetwork::new();

    let mut node = Node::with_memory_network(create_test_config(), network.clone()).unwrap();
    let tcp: Address = "/ip4/127.0.0.1/tcp/0".parse().unwrap();
    assert!(matches!(node.start(&[tcp], &[]).await, Err(NodeError::Listen(_))));
    assert!(!node.is_running());

    let mut first = Node::with_memory_network(create_test_config(), network.clone()).unwrap();
    first.start(&[Address::Memory(50)], &[]).await.unwrap();
    let mut second = Node::with_memory_network(create_test_config(), network.clone()).unwrap();
    assert!(matches!(
        second.start(&[Address::Memory(50)], &[]).await,
        Err(NodeError::Listen(_))
    ));

    first.stop().await;
}

#[tokio::test]
async fn test_lifecycle_errors() {
    let network = MemoryNetwork::new();
    let mut node = Node::with_memory_network(create_test_config(), network.clone()).unwrap();
    let remote = Address::Memory(1).with_peer(PeerId::random());

    assert!(matches!(
        node.connect_and_ping(&remote, 1).await,
        Err(NodeError::NotRunning)
    ));

    node.start(&[], &[]).await.unwrap();
    assert!(matches!(node.start(&[], &[]).await, Err(NodeError::AlreadyStarted)));

    node.stop().await;
    node.stop().await;
    assert!(!node.is_running());
    assert!(node.local_peer_info().is_none());
    assert!(matches!(
        node.connect_and_ping(&remote, 1).await,
        Err(NodeError::NotRunning)
    ));
    assert!(matches!(node.start(&[], &[]).await, Err(NodeError::AlreadyStarted)));
}

#[tokio::test]
async fn test_stopped_node_is_unreachable() {
    let network = MemoryNetwork::new();
    let (mut a, report_a) = start_memory_node(&network, &[]).await;
    let (mut b, _) = start_memory_node(&network, &[]).await;

    a.stop().await;
    let result = b.connect_and_ping(&p2p_addr(&report_a), 1).await;
    assert!(matches!(result, Err(NodeError::Connect { .. })));

    b.stop().await;
}

#[tokio::test]
async fn test_spans_reach_the_sink() {
    let network = MemoryNetwork::new();
    let sink = Arc::new(MemorySink::new());
    let mut node = Node::with_memory_network(create_test_config(), network.clone())
        .unwrap()
        .with_sink(sink.clone());
    let _guard = tracing::subscriber::set_default(
        tracing_subscriber::registry().with(node.capture_layer()),
    );

    let (mut peer, report) = start_memory_node(&network, &[]).await;
    node.start(&[], &[p2p_addr(&report)]).await.unwrap();
    node.connect_and_ping(&p2p_addr(&report), 2).await.unwrap();

    let refused = Address::Memory(31337).with_peer(PeerId::random());
    assert!(node.connect_and_ping(&refused, 1).await.is_err());

    node.stop().await;
    peer.stop().await;

    let names = sink.span_names();
    for expected in [
        "node.start",
        "dht.bootstrap",
        "dht.find_node",
        "ping.respond",
        "node.connect_and_ping",
    ] {
        assert!(names.iter().any(|n| n == expected), "missing span {}", expected);
    }
    assert_eq!(names.iter().filter(|n| *n == "ping.exchange").count(), 2);

    let failed: Vec<_> = sink
        .batches()
        .into_iter()
        .flat_map(|b| b.spans)
        .filter(|s| s.name == "node.connect_and_ping" && s.is_error())
        .collect();
    assert_eq!(failed.len(), 1);

    let stats = node.stats().await;
    assert!(!stats.running);
    assert_eq!(stats.telemetry.failed_batches, 0);
    assert!(stats.telemetry.exported_spans >= names.len() as u64);
}

#[tokio::test]
async fn test_tcp_nodes_ping_each_other() {
    let listen: Vec<Address> = vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()];

    let mut a = Node::new(create_test_config()).unwrap();
    let report_a = a.start(&listen, &[]).await.unwrap();
    let addr_a = p2p_addr(&report_a);
    assert_ne!(addr_a.address.socket_addr().unwrap().port(), 0);

    let mut b = Node::new(create_test_config()).unwrap();
    let report_b = b.start(&listen, &[addr_a.clone()]).await.unwrap();
    assert!(report_b.bootstrap.is_ok());

    let samples = b.connect_and_ping(&addr_a, 2).await.unwrap();
    assert!(samples.iter().all(|s| s.is_success()));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_wildcard_listener_is_recorded_at_observed_ip() {
    let wildcard: Vec<Address> = vec!["/ip4/0.0.0.0/tcp/0".parse().unwrap()];

    let mut a = Node::new(create_test_config()).unwrap();
    let report_a = a.start(&wildcard, &[]).await.unwrap();
    let port_a = p2p_addr(&report_a).address.socket_addr().unwrap().port();
    let seed: P2pAddr = format!("/ip4/127.0.0.1/tcp/{}/p2p/{}", port_a, a.peer_id().to_hex())
        .parse()
        .unwrap();

    let mut b = Node::new(create_test_config()).unwrap();
    let report_b = b.start(&wildcard, &[seed]).await.unwrap();
    assert!(report_b.bootstrap.is_ok());
    let port_b = p2p_addr(&report_b).address.socket_addr().unwrap().port();
    settle().await;

    let peers = a.dht().unwrap().all_peers().await;
    assert_eq!(peers.len(), 1);
    let expected: Address = format!("/ip4/127.0.0.1/tcp/{}", port_b).parse().unwrap();
    assert_eq!(peers[0].addresses, vec![expected]);

    a.stop().await;
    b.stop().await;
}
