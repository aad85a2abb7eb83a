//! Batch export loop
//!
//! A single background task drains the [`SpanBuffer`] into batches and hands
//! them to an [`ExporterSink`]. It wakes when the buffer reaches the batch
//! size or when the flush interval elapses, whichever comes first. Exports
//! run inline in that task, so a sink never sees two concurrent calls and
//! triggers arriving meanwhile are handled once the call returns.

use crate::buffer::SpanBuffer;
use crate::error::{Result, TelemetryError};
use crate::resource::Resource;
use crate::span::SpanRecord;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Spans handed to a sink in one call
#[derive(Debug, Clone)]
pub struct Batch {
    pub resource: Resource,
    pub spans: Vec<SpanRecord>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Destination for exported spans
///
/// A batch whose export fails or times out is dropped and counted; the
/// exporter never retries it or puts its spans back into the buffer. Sinks
/// that need delivery guarantees must retry internally.
#[async_trait::async_trait]
pub trait ExporterSink: Send + Sync {
    async fn export(&self, batch: &Batch) -> Result<()>;

    /// Called once after the final flush
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Batching configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// SpanBuffer capacity
    pub max_queue_size: usize,

    /// Spans per export call, also the size trigger
    pub max_batch_size: usize,

    pub flush_interval: Duration,

    pub export_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_queue_size: 2048,
            max_batch_size: 512,
            flush_interval: Duration::from_secs(5),
            export_timeout: Duration::from_secs(30),
        }
    }
}

impl BatchConfig {
    /// Copy with every size at least one and every period at least 1ms
    pub fn normalized(mut self) -> Self {
        let min_period = Duration::from_millis(1);
        self.max_queue_size = self.max_queue_size.max(1);
        self.max_batch_size = self.max_batch_size.clamp(1, self.max_queue_size);
        self.flush_interval = self.flush_interval.max(min_period);
        self.export_timeout = self.export_timeout.max(min_period);
        self
    }

    /// A buffer sized for this configuration
    pub fn create_buffer(&self) -> Arc<SpanBuffer> {
        Arc::new(SpanBuffer::new(self.max_queue_size, self.max_batch_size))
    }
}

#[derive(Debug, Default)]
struct Counters {
    exported_spans: AtomicU64,
    exported_batches: AtomicU64,
    failed_batches: AtomicU64,
    failed_spans: AtomicU64,
}

/// Exporter counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExporterStats {
    pub exported_spans: u64,
    pub exported_batches: u64,
    pub failed_batches: u64,

    /// Buffer overflow plus spans of failed batches
    pub dropped_spans: u64,
}

enum Command {
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Background span exporter
pub struct BatchExporter {
    buffer: Arc<SpanBuffer>,
    sink: Arc<dyn ExporterSink>,
    config: BatchConfig,
    resource: Resource,
    counters: Arc<Counters>,
}

impl BatchExporter {
    pub fn new(buffer: Arc<SpanBuffer>, sink: Arc<dyn ExporterSink>, config: BatchConfig) -> Self {
        BatchExporter {
            buffer,
            sink,
            config: config.normalized(),
            resource: Resource::default(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = resource;
        self
    }

    /// Start the export task
    pub fn spawn(self) -> BatchExporterHandle {
        let (commands, rx) = mpsc::channel(8);
        let buffer = self.buffer.clone();
        let counters = self.counters.clone();
        let task = tokio::spawn(self.run(rx));

        BatchExporterHandle {
            commands,
            buffer,
            counters,
            task,
        }
    }

    async fn run(self, mut commands: mpsc::Receiver<Command>) {
        let period = self.config.flush_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.export_all().await;
                }
                _ = self.buffer.batch_ready() => {
                    self.export_full_batches().await;
                    ticker.reset();
                }
                command = commands.recv() => match command {
                    Some(Command::Flush(ack)) => {
                        self.export_all().await;
                        let _ = ack.send(());
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.finish().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.finish().await;
                        return;
                    }
                },
            }
        }
    }

    async fn finish(&self) {
        self.export_all().await;
        if let Err(e) = self.sink.shutdown().await {
            warn!("span sink shutdown failed: {}", e);
        }
        debug!("span exporter stopped");
    }

    async fn export_full_batches(&self) {
        while self.buffer.len() >= self.config.max_batch_size {
            let spans = self.buffer.drain(self.config.max_batch_size);
            self.export(spans).await;
        }
    }

    async fn export_all(&self) {
        loop {
            let spans = self.buffer.drain(self.config.max_batch_size);
            if spans.is_empty() {
                return;
            }
            self.export(spans).await;
        }
    }

    async fn export(&self, spans: Vec<SpanRecord>) {
        let count = spans.len() as u64;
        let batch = Batch {
            resource: self.resource.clone(),
            spans,
        };

        let result = match timeout(self.config.export_timeout, self.sink.export(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(TelemetryError::Timeout(self.config.export_timeout)),
        };

        match result {
            Ok(()) => {
                self.counters.exported_spans.fetch_add(count, Ordering::Relaxed);
                self.counters.exported_batches.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.counters.failed_spans.fetch_add(count, Ordering::Relaxed);
                warn!("dropping batch of {} spans: {}", count, e);
            }
        }
    }
}

/// Control handle for a running [`BatchExporter`]
pub struct BatchExporterHandle {
    commands: mpsc::Sender<Command>,
    buffer: Arc<SpanBuffer>,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl BatchExporterHandle {
    pub fn buffer(&self) -> &Arc<SpanBuffer> {
        &self.buffer
    }

    pub fn stats(&self) -> ExporterStats {
        ExporterStats {
            exported_spans: self.counters.exported_spans.load(Ordering::Relaxed),
            exported_batches: self.counters.exported_batches.load(Ordering::Relaxed),
            failed_batches: self.counters.failed_batches.load(Ordering::Relaxed),
            dropped_spans: self.buffer.dropped()
                + self.counters.failed_spans.load(Ordering::Relaxed),
        }
    }

    /// Export everything currently buffered and wait for it
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Flush(ack))
            .await
            .map_err(|_| TelemetryError::ShutDown)?;
        done.await.map_err(|_| TelemetryError::ShutDown)
    }

    /// Final best-effort flush, then sink shutdown; repeated calls are no-ops
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for BatchExporterHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
