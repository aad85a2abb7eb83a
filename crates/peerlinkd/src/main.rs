//! PeerLink node daemon

use anyhow::{Context, Result};
use clap::Parser;
use peerlink_network::PingOutcome;
use peerlink_protocol::{Address, P2pAddr};
use peerlinkd::{init_logging, Config, Node};
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "peerlinkd")]
#[command(about = "PeerLink DHT node")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "peerlink.yaml", env = "PEERLINK_CONFIG")]
    config: PathBuf,

    /// Write a default configuration file and exit
    #[arg(long)]
    init: bool,

    /// Listen address, e.g. /ip4/0.0.0.0/tcp/4001 (repeatable)
    #[arg(short, long)]
    listen: Vec<String>,

    /// Bootstrap peer, e.g. /ip4/1.2.3.4/tcp/4001/p2p/<peer-id> (repeatable)
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Number of pings sent to the remote peer
    #[arg(short = 'n', long, default_value = "5")]
    count: usize,

    /// Peer to ping, then exit
    remote: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.init {
        let config = Config::create_default(&args.config)?;
        println!("Configuration written to {}", args.config.display());
        println!("Peer ID: {}", config.node.peer_id.unwrap_or_default());
        return Ok(());
    }

    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        Config::default()
    };
    if !args.listen.is_empty() {
        config.node.listen = args.listen.clone();
    }
    if !args.bootstrap.is_empty() {
        config.node.bootstrap = args.bootstrap.clone();
    }

    let listen: Vec<Address> = config.listen_addresses()?;
    let seeds: Vec<P2pAddr> = config.bootstrap_peers()?;
    let remote: Option<P2pAddr> = args
        .remote
        .as_deref()
        .map(str::parse::<P2pAddr>)
        .transpose()
        .context("Invalid remote address")?;

    let mut node = Node::new(config.clone())?;
    let _logging = init_logging(&config, Some(node.capture_layer()))?;

    let report = node.start(&listen, &seeds).await?;
    for addr in report.local.p2p_addrs() {
        println!("Listening on {}", addr);
    }
    match &report.bootstrap {
        Ok(bootstrap) if bootstrap.seeds_attempted > 0 => info!(
            "bootstrapped: {}/{} seeds answered, {} peers known",
            bootstrap.seeds_responded, bootstrap.seeds_attempted, bootstrap.table_size
        ),
        Ok(_) => {}
        Err(e) => warn!("bootstrap failed: {}", e),
    }

    let result = match remote {
        Some(remote) => ping_remote(&node, &remote, args.count).await,
        None => {
            signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C signal");
            Ok(())
        }
    };

    node.stop().await;
    result
}

async fn ping_remote(node: &Node, remote: &P2pAddr, count: usize) -> Result<()> {
    println!("PING {}", remote);
    let samples = node.connect_and_ping(remote, count).await?;

    for (seq, sample) in samples.iter().enumerate() {
        match (&sample.outcome, sample.rtt) {
            (PingOutcome::Acked, Some(rtt)) => {
                println!("seq={} rtt={:.3}ms", seq, rtt.as_secs_f64() * 1000.0)
            }
            (PingOutcome::TimedOut, _) => println!("seq={} timed out", seq),
            (PingOutcome::Failed(failure), _) => println!("seq={} failed: {}", seq, failure),
            (PingOutcome::Acked, None) => println!("seq={} acked", seq),
        }
    }

    let acked = samples.iter().filter(|s| s.is_success()).count();
    println!("{} sent, {} acked", samples.len(), acked);
    Ok(())
}
