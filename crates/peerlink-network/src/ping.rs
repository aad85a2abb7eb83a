//! Ping protocol
//!
//! The initiator opens a stream, writes a random fixed-size payload and waits
//! for the responder to echo it verbatim. The responder echoes one payload per
//! stream and closes it.

use crate::dispatcher::ProtocolHandler;
use crate::error::{NetworkError, Result};
use crate::shutdown::ShutdownSignal;
use crate::transport::{Stream, Transport};
use chrono::{DateTime, Utc};
use peerlink_protocol::{PeerId, PeerInfo, PING_PROTOCOL};
use rand::RngCore;
use std::fmt;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, field, info_span, Instrument};

/// Default payload length in bytes
pub const PING_PAYLOAD_SIZE: usize = 32;

/// Ping configuration
#[derive(Debug, Clone)]
pub struct PingConfig {
    /// Payload length; both sides must agree
    pub payload_size: usize,

    /// Deadline for one whole exchange, stream setup included
    pub timeout: Duration,

    /// Pause between consecutive attempts of one `ping` call
    pub interval: Duration,
}

impl Default for PingConfig {
    fn default() -> Self {
        PingConfig {
            payload_size: PING_PAYLOAD_SIZE,
            timeout: Duration::from_secs(10),
            interval: Duration::from_secs(1),
        }
    }
}

/// Progress of a single exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingState {
    Idle,
    Sent,
    Acked,
    TimedOut,
}

/// Why an exchange failed without timing out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingFailure {
    /// Stream could not be opened or broke mid-exchange
    Unreachable(String),

    /// Echo was short or differed from the payload
    ProtocolViolation(String),

    /// Node shut down while the exchange was running
    Cancelled,
}

impl fmt::Display for PingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PingFailure::Unreachable(reason) => write!(f, "unreachable: {}", reason),
            PingFailure::ProtocolViolation(reason) => write!(f, "protocol violation: {}", reason),
            PingFailure::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingOutcome {
    Acked,
    TimedOut,
    Failed(PingFailure),
}

/// One ping attempt as delivered to the caller
#[derive(Debug, Clone)]
pub struct PingSample {
    pub peer_id: PeerId,

    /// Round-trip time; only set when acked
    pub rtt: Option<Duration>,

    /// When the attempt started
    pub timestamp: DateTime<Utc>,

    pub outcome: PingOutcome,
}

impl PingSample {
    /// Sample for an attempt that got no answer in time
    pub fn timed_out(peer_id: PeerId, timestamp: DateTime<Utc>) -> Self {
        PingSample {
            peer_id,
            rtt: None,
            timestamp,
            outcome: PingOutcome::TimedOut,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == PingOutcome::Acked
    }
}

/// Ping initiator and responder
#[derive(Clone)]
pub struct PingService {
    transport: Arc<dyn Transport>,
    config: PingConfig,
    shutdown: ShutdownSignal,
}

impl PingService {
    pub fn new(transport: Arc<dyn Transport>, config: PingConfig, shutdown: ShutdownSignal) -> Self {
        PingService {
            transport,
            config,
            shutdown,
        }
    }

    pub fn config(&self) -> &PingConfig {
        &self.config
    }

    /// Run one exchange against `peer`
    pub async fn ping_once(&self, peer: &PeerInfo) -> PingSample {
        let span = info_span!(
            "ping.exchange",
            peer = %peer.peer_id,
            rtt_us = field::Empty,
            outcome = field::Empty
        );
        self.run_exchange(peer).instrument(span).await
    }

    async fn run_exchange(&self, peer: &PeerInfo) -> PingSample {
        let timestamp = Utc::now();
        let mut state = PingState::Idle;
        let mut shutdown = self.shutdown.clone();

        let result = if shutdown.is_triggered() {
            Err(Some(PingFailure::Cancelled))
        } else {
            tokio::select! {
                _ = shutdown.cancelled() => Err(Some(PingFailure::Cancelled)),
                exchanged = timeout(self.config.timeout, self.exchange(peer, &mut state)) => {
                    match exchanged {
                        Ok(Ok(rtt)) => Ok(rtt),
                        Ok(Err(failure)) => Err(Some(failure)),
                        Err(_) => Err(None),
                    }
                }
            }
        };

        let span = tracing::Span::current();
        let (rtt, outcome) = match result {
            Ok(rtt) => {
                span.record("rtt_us", rtt.as_micros() as u64);
                (Some(rtt), PingOutcome::Acked)
            }
            Err(None) => {
                debug!("ping to {} timed out in state {:?}", peer.peer_id, state);
                (None, PingOutcome::TimedOut)
            }
            Err(Some(failure)) => {
                debug!("ping to {} failed: {}", peer.peer_id, failure);
                (None, PingOutcome::Failed(failure))
            }
        };
        span.record("outcome", field::debug(&outcome));

        PingSample {
            peer_id: peer.peer_id,
            rtt,
            timestamp,
            outcome,
        }
    }

    async fn exchange(
        &self,
        peer: &PeerInfo,
        state: &mut PingState,
    ) -> std::result::Result<Duration, PingFailure> {
        let mut stream = self
            .transport
            .open_stream(peer, PING_PROTOCOL)
            .await
            .map_err(|e| PingFailure::Unreachable(e.to_string()))?;

        let mut payload = vec![0u8; self.config.payload_size];
        rand::thread_rng().fill_bytes(&mut payload);

        let sent_at = Instant::now();
        stream
            .write_all(&payload)
            .await
            .map_err(|e| PingFailure::Unreachable(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| PingFailure::Unreachable(e.to_string()))?;
        *state = PingState::Sent;

        let mut echo = vec![0u8; payload.len()];
        stream.read_exact(&mut echo).await.map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                PingFailure::ProtocolViolation("stream closed before full echo".to_string())
            } else {
                PingFailure::Unreachable(e.to_string())
            }
        })?;
        let rtt = sent_at.elapsed();

        if echo != payload {
            return Err(PingFailure::ProtocolViolation("echo does not match payload".to_string()));
        }

        *state = PingState::Acked;
        let _ = stream.close().await;
        Ok(rtt)
    }

    /// Ping `peer` `count` times in sequence
    ///
    /// Samples arrive on the returned channel as attempts complete. The
    /// channel closes after the last attempt, on shutdown, or when the
    /// receiver is dropped.
    pub fn ping(&self, peer: PeerInfo, count: usize) -> mpsc::Receiver<PingSample> {
        let (tx, rx) = mpsc::channel(count.clamp(1, 64));
        let service = self.clone();

        tokio::spawn(async move {
            for attempt in 0..count {
                if service.shutdown.is_triggered() {
                    break;
                }
                if attempt > 0 && !service.config.interval.is_zero() {
                    let mut shutdown = service.shutdown.clone();
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(service.config.interval) => {}
                    }
                }

                let sample = service.ping_once(&peer).await;
                if tx.send(sample).await.is_err() {
                    break;
                }
            }
        });

        rx
    }

    /// Ping `peer` `count` times and collect every sample
    pub async fn ping_all(&self, peer: PeerInfo, count: usize) -> Vec<PingSample> {
        let mut rx = self.ping(peer, count);
        let mut samples = Vec::with_capacity(count);
        while let Some(sample) = rx.recv().await {
            samples.push(sample);
        }
        samples
    }

    async fn respond(&self, mut stream: Stream) -> Result<()> {
        let mut payload = vec![0u8; self.config.payload_size];
        stream.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                NetworkError::ProtocolViolation("short ping payload".to_string())
            } else {
                NetworkError::Io(e)
            }
        })?;
        stream.write_all(&payload).await?;
        stream.flush().await?;
        stream.close().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProtocolHandler for PingService {
    fn protocol_id(&self) -> &'static str {
        PING_PROTOCOL
    }

    async fn handle(&self, stream: Stream) -> Result<()> {
        let span = info_span!("ping.respond", peer = %stream.remote_peer());
        self.respond(stream).instrument(span).await
    }
}
