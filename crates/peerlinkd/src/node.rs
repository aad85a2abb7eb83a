use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{Config, SinkConfig};
use crate::error::{NodeError, Result};

use peerlink_dht::{BootstrapReport, DhtError, DhtRequestHandler, DhtService, NetworkRpc};
use peerlink_network::{
    MemoryNetwork, NetworkError, PingSample, PingService, Shutdown, StreamDispatcher, TcpConfig,
    TcpTransport, Transport,
};
use peerlink_protocol::{Address, P2pAddr, PeerId, PeerInfo};
use peerlink_telemetry::{
    BatchExporter, BatchExporterHandle, ExporterSink, ExporterStats, JsonLinesSink, LogSink,
    NullSink, Resource, SpanBuffer, SpanCaptureLayer,
};

/// Transport the node binds on start
enum Backend {
    Tcp(TcpConfig),
    Memory(MemoryNetwork),
}

struct Running {
    info: PeerInfo,
    transport: Arc<dyn Transport>,
    dht: DhtService,
    ping: PingService,
    tasks: Vec<JoinHandle<()>>,
}

enum State {
    Idle,
    Running(Box<Running>),
    Stopped,
}

/// Result of [`Node::start`]
///
/// Bootstrap failure does not fail the start: the node stays up with
/// whatever routing table it has.
#[derive(Debug)]
pub struct StartReport {
    pub local: PeerInfo,
    pub bootstrap: std::result::Result<BootstrapReport, DhtError>,
}

/// Node counters
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub peer_id: PeerId,
    pub running: bool,
    pub routing_table_size: usize,
    pub buffered_spans: usize,
    pub telemetry: ExporterStats,
}

/// Main node orchestrator
///
/// Owns the routing table, the span buffer and the node-wide shutdown
/// signal, and wires them into the services on start.
pub struct Node {
    config: Config,
    peer_id: PeerId,
    backend: Backend,
    shutdown: Shutdown,
    buffer: Arc<SpanBuffer>,
    sink: Arc<dyn ExporterSink>,
    exporter: Option<BatchExporterHandle>,
    state: State,
}

impl Node {
    /// Node listening on TCP
    pub fn new(config: Config) -> Result<Self> {
        Self::with_backend(config, Backend::Tcp(TcpConfig::default()))
    }

    /// Node on an in-process network
    pub fn with_memory_network(config: Config, network: MemoryNetwork) -> Result<Self> {
        Self::with_backend(config, Backend::Memory(network))
    }

    fn with_backend(config: Config, backend: Backend) -> Result<Self> {
        config.validate()?;
        let peer_id = config.peer_id()?.unwrap_or_else(PeerId::random);
        let buffer = config.batch_config().create_buffer();
        let sink = create_sink(&config.telemetry.sink);

        Ok(Self {
            config,
            peer_id,
            backend,
            shutdown: Shutdown::new(),
            buffer,
            sink,
            exporter: None,
            state: State::Idle,
        })
    }

    /// Replace the span sink; only effective before `start`
    pub fn with_sink(mut self, sink: Arc<dyn ExporterSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    pub fn local_peer_info(&self) -> Option<PeerInfo> {
        match &self.state {
            State::Running(running) => Some(running.info.clone()),
            _ => None,
        }
    }

    pub fn dht(&self) -> Option<&DhtService> {
        match &self.state {
            State::Running(running) => Some(&running.dht),
            _ => None,
        }
    }

    pub fn span_buffer(&self) -> &Arc<SpanBuffer> {
        &self.buffer
    }

    /// Tracing layer feeding this node's span buffer
    pub fn capture_layer(&self) -> SpanCaptureLayer {
        SpanCaptureLayer::new(self.buffer.clone()).with_sampler(self.config.telemetry.sampler)
    }

    /// Bind the transport, start all services and bootstrap from `seeds`
    ///
    /// Only a listen failure is an error; seed failures are reported in the
    /// returned [`StartReport`].
    pub async fn start(&mut self, listen: &[Address], seeds: &[P2pAddr]) -> Result<StartReport> {
        if !matches!(self.state, State::Idle) {
            return Err(NodeError::AlreadyStarted);
        }

        let span = info_span!("node.start", peer = %self.peer_id, seeds = seeds.len());
        self.start_services(listen, seeds).instrument(span).await
    }

    async fn start_services(&mut self, listen: &[Address], seeds: &[P2pAddr]) -> Result<StartReport> {
        let transport = self.bind(listen).await.map_err(|e| {
            error!("listen failed: {}", e);
            NodeError::Listen(e)
        })?;

        let resource = Resource::new(self.config.telemetry.service_name.clone())
            .with_attribute("peer_id", self.peer_id.to_hex());
        self.exporter = Some(
            BatchExporter::new(self.buffer.clone(), self.sink.clone(), self.config.batch_config())
                .with_resource(resource)
                .spawn(),
        );

        let ping = PingService::new(
            transport.clone(),
            self.config.ping_config(),
            self.shutdown.signal(),
        );
        let dht = DhtService::new(
            self.peer_id,
            self.config.dht_config(),
            Arc::new(NetworkRpc::new(transport.clone())),
            Some(Arc::new(ping.clone())),
            self.shutdown.signal(),
        );

        let mut dispatcher =
            StreamDispatcher::new().with_handler_timeout(self.config.ping_config().timeout);
        dispatcher.register(Arc::new(ping.clone()));
        dispatcher.register(Arc::new(DhtRequestHandler::new(dht.clone())));
        info!("serving protocols {:?}", dispatcher.protocols());

        let tasks = vec![
            dispatcher.spawn(transport.clone(), self.shutdown.signal()),
            dht.spawn_refresh(),
        ];

        let info = transport.local_peer_info();
        for addr in info.p2p_addrs() {
            info!("listening on {}", addr);
        }

        self.state = State::Running(Box::new(Running {
            info: info.clone(),
            transport,
            dht: dht.clone(),
            ping,
            tasks,
        }));

        let seeds: Vec<PeerInfo> = seeds.iter().cloned().map(PeerInfo::from).collect();
        let bootstrap = dht.bootstrap(seeds).await;
        if let Err(e) = &bootstrap {
            warn!("bootstrap failed, continuing with an empty routing table: {}", e);
        }

        Ok(StartReport {
            local: info,
            bootstrap,
        })
    }

    async fn bind(&self, listen: &[Address]) -> std::result::Result<Arc<dyn Transport>, NetworkError> {
        match &self.backend {
            Backend::Tcp(config) => {
                let transport = TcpTransport::listen(self.peer_id, listen, config.clone()).await?;
                Ok(Arc::new(transport))
            }
            Backend::Memory(network) => {
                let address = listen.first().cloned().unwrap_or(Address::Memory(0));
                Ok(Arc::new(network.bind(self.peer_id, &address)?))
            }
        }
    }

    /// Connect to `remote` and ping it `count` times
    ///
    /// A refused or failed connection is an error. A connection attempt that
    /// does not finish within the ping timeout counts as every attempt timing
    /// out: `count` timed-out samples after a single wait.
    pub async fn connect_and_ping(&self, remote: &P2pAddr, count: usize) -> Result<Vec<PingSample>> {
        let State::Running(running) = &self.state else {
            return Err(NodeError::NotRunning);
        };

        let span = info_span!("node.connect_and_ping", peer = %remote.peer_id, count);
        async move {
            let peer = PeerInfo::from(remote.clone());
            let started = Utc::now();
            let deadline = running.ping.config().timeout;

            match timeout(deadline, running.transport.connect(&peer)).await {
                Ok(Ok(())) => {}
                Ok(Err(NetworkError::Timeout)) | Err(_) => {
                    warn!("no connection to {} within {:?}", remote, deadline);
                    return Ok(vec![PingSample::timed_out(peer.peer_id, started); count]);
                }
                Ok(Err(source)) => {
                    error!("connection to {} failed: {}", remote, source);
                    return Err(NodeError::Connect {
                        peer: peer.peer_id,
                        source,
                    });
                }
            }

            running.dht.insert_peer(peer.clone()).await;
            Ok(running.ping.ping_all(peer, count).await)
        }
        .instrument(span)
        .await
    }

    /// Stop all services; safe to call repeatedly
    ///
    /// Cancels in-flight lookups and pings, waits for the background tasks,
    /// closes the transport and runs the final span flush.
    pub async fn stop(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Stopped);
        self.shutdown.trigger();

        if let State::Running(running) = state {
            info!("stopping node {}", self.peer_id);
            for task in running.tasks {
                if let Err(e) = task.await {
                    warn!("background task ended abnormally: {}", e);
                }
            }
            running.transport.close().await;
        }

        if let Some(exporter) = &self.exporter {
            exporter.shutdown().await;
        }
    }

    pub async fn stats(&self) -> NodeStats {
        let routing_table_size = match self.dht() {
            Some(dht) => dht.node_count().await,
            None => 0,
        };
        NodeStats {
            peer_id: self.peer_id,
            running: self.is_running(),
            routing_table_size,
            buffered_spans: self.buffer.len(),
            telemetry: self
                .exporter
                .as_ref()
                .map(|e| e.stats())
                .unwrap_or_default(),
        }
    }
}

fn create_sink(config: &SinkConfig) -> Arc<dyn ExporterSink> {
    match config {
        SinkConfig::Log => Arc::new(LogSink),
        SinkConfig::JsonLines { path } => Arc::new(JsonLinesSink::new(path.clone())),
        SinkConfig::None => Arc::new(NullSink),
    }
}
