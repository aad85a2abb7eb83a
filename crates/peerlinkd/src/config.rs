use anyhow::{Context, Result};
use peerlink_dht::{DhtConfig, EvictionPolicy, LookupConfig, TableConfig, ALPHA, K};
use peerlink_network::{PingConfig, PING_PAYLOAD_SIZE};
use peerlink_protocol::{Address, P2pAddr, PeerId};
use peerlink_telemetry::{BatchConfig, Sampler, DEFAULT_SERVICE_NAME};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::NodeError;

/// Main application configuration
///
/// Every field has a default, so partial files are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub dht: DhtSection,
    pub ping: PingSection,
    pub telemetry: TelemetryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hex peer id; a random one is generated when absent
    pub peer_id: Option<String>,
    pub listen: Vec<String>,
    pub bootstrap: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            listen: vec!["/ip4/0.0.0.0/tcp/4001".to_string()],
            bootstrap: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSection {
    pub bucket_size: usize,
    pub alpha: usize,
    pub query_timeout_secs: u64,
    pub lookup_deadline_secs: u64,
    pub max_rounds: usize,
    pub refresh_interval_secs: u64,
    pub peer_expiry_secs: u64,
    pub max_failures: u32,
    pub eviction: EvictionPolicy,
}

impl Default for DhtSection {
    fn default() -> Self {
        Self {
            bucket_size: K,
            alpha: ALPHA,
            query_timeout_secs: 10,
            lookup_deadline_secs: 60,
            max_rounds: 16,
            refresh_interval_secs: 600,
            peer_expiry_secs: 3600,
            max_failures: 5,
            eviction: EvictionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingSection {
    pub payload_size: usize,
    pub timeout_ms: u64,
    pub interval_ms: u64,
}

impl Default for PingSection {
    fn default() -> Self {
        Self {
            payload_size: PING_PAYLOAD_SIZE,
            timeout_ms: 10_000,
            interval_ms: 1_000,
        }
    }
}

/// Where exported spans go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Summaries in the node log
    Log,
    /// One JSON object per span, appended to `path`
    JsonLines { path: PathBuf },
    /// Discard everything
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub max_queue_size: usize,
    pub max_batch_size: usize,
    pub flush_interval_ms: u64,
    pub export_timeout_secs: u64,
    pub sampler: Sampler,
    pub sink: SinkConfig,
    /// OTLP/gRPC collector receiving spans alongside the sink; needs the
    /// `otlp` build feature
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            max_queue_size: 2048,
            max_batch_size: 512,
            flush_interval_ms: 5_000,
            export_timeout_secs: 30,
            sampler: Sampler::AlwaysOn,
            sink: SinkConfig::Log,
            otlp_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Plain,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found: {}\nRun with --init to create a new configuration",
                path.display()
            );
        }

        let contents = fs::read_to_string(path).context("Failed to read configuration file")?;
        let config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;
        config
            .validate()
            .with_context(|| format!("Rejected configuration {}", path.display()))?;
        Ok(config)
    }

    /// Check values that would stall or crash a running node
    ///
    /// Sizes and periods must be non-zero and the sampling ratio must lie in
    /// `[0, 1]`. Peer id and addresses must parse.
    pub fn validate(&self) -> std::result::Result<(), NodeError> {
        let non_zero = [
            ("dht.bucket_size", self.dht.bucket_size as u64),
            ("dht.alpha", self.dht.alpha as u64),
            ("dht.max_rounds", self.dht.max_rounds as u64),
            ("dht.query_timeout_secs", self.dht.query_timeout_secs),
            ("dht.lookup_deadline_secs", self.dht.lookup_deadline_secs),
            ("dht.refresh_interval_secs", self.dht.refresh_interval_secs),
            ("ping.payload_size", self.ping.payload_size as u64),
            ("ping.timeout_ms", self.ping.timeout_ms),
            ("telemetry.max_queue_size", self.telemetry.max_queue_size as u64),
            ("telemetry.max_batch_size", self.telemetry.max_batch_size as u64),
            ("telemetry.flush_interval_ms", self.telemetry.flush_interval_ms),
            ("telemetry.export_timeout_secs", self.telemetry.export_timeout_secs),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(NodeError::Config(format!("{} must be greater than zero", field)));
        }

        if let Sampler::Ratio(ratio) = self.telemetry.sampler {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(NodeError::Config(format!(
                    "telemetry.sampler ratio {} is outside [0, 1]",
                    ratio
                )));
            }
        }

        match self.telemetry.otlp_endpoint.as_deref() {
            Some(endpoint) if endpoint.trim().is_empty() => {
                return Err(NodeError::Config("telemetry.otlp_endpoint is empty".into()));
            }
            Some(_) if !cfg!(feature = "otlp") => {
                return Err(NodeError::Config(
                    "telemetry.otlp_endpoint is set but peerlinkd was built without the otlp feature"
                        .into(),
                ));
            }
            _ => {}
        }

        self.peer_id()?;
        self.listen_addresses()?;
        self.bootstrap_peers()?;
        Ok(())
    }

    /// Write the configuration as YAML
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Create a default configuration with a fresh peer id and save it
    pub fn create_default(path: &Path) -> Result<Self> {
        let mut config = Config::default();
        config.node.peer_id = Some(PeerId::random().to_hex());
        config.save(path)?;
        Ok(config)
    }

    /// Configured peer id, if any
    pub fn peer_id(&self) -> std::result::Result<Option<PeerId>, NodeError> {
        self.node
            .peer_id
            .as_deref()
            .map(PeerId::from_hex)
            .transpose()
            .map_err(|e| NodeError::Config(format!("node.peer_id: {}", e)))
    }

    pub fn listen_addresses(&self) -> std::result::Result<Vec<Address>, NodeError> {
        parse_all(&self.node.listen, "node.listen")
    }

    pub fn bootstrap_peers(&self) -> std::result::Result<Vec<P2pAddr>, NodeError> {
        parse_all(&self.node.bootstrap, "node.bootstrap")
    }

    pub fn dht_config(&self) -> DhtConfig {
        let dht = &self.dht;
        DhtConfig {
            table: TableConfig {
                bucket_size: dht.bucket_size,
                max_failures: dht.max_failures,
                peer_expiry: Duration::from_secs(dht.peer_expiry_secs),
            },
            lookup: LookupConfig {
                k: dht.bucket_size,
                alpha: dht.alpha,
                query_timeout: Duration::from_secs(dht.query_timeout_secs),
                deadline: Duration::from_secs(dht.lookup_deadline_secs),
                max_rounds: dht.max_rounds,
            },
            refresh_interval: Duration::from_secs(dht.refresh_interval_secs),
            eviction: dht.eviction,
        }
    }

    pub fn ping_config(&self) -> PingConfig {
        PingConfig {
            payload_size: self.ping.payload_size,
            timeout: Duration::from_millis(self.ping.timeout_ms),
            interval: Duration::from_millis(self.ping.interval_ms),
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        let telemetry = &self.telemetry;
        BatchConfig {
            max_queue_size: telemetry.max_queue_size,
            max_batch_size: telemetry.max_batch_size,
            flush_interval: Duration::from_millis(telemetry.flush_interval_ms),
            export_timeout: Duration::from_secs(telemetry.export_timeout_secs),
        }
    }
}

fn parse_all<T>(values: &[String], field: &str) -> std::result::Result<Vec<T>, NodeError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    values
        .iter()
        .map(|v| {
            v.parse()
                .map_err(|e| NodeError::Config(format!("{}: {}", field, e)))
        })
        .collect()
}
