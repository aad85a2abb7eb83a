//! Built-in exporter sinks

use crate::error::{Result, TelemetryError};
use crate::exporter::{Batch, ExporterSink};
use crate::resource::Resource;
use crate::span::SpanRecord;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Discards every batch
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait::async_trait]
impl ExporterSink for NullSink {
    async fn export(&self, _batch: &Batch) -> Result<()> {
        Ok(())
    }
}

/// Summarizes batches through the log
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait::async_trait]
impl ExporterSink for LogSink {
    async fn export(&self, batch: &Batch) -> Result<()> {
        let errors = batch.spans.iter().filter(|s| s.is_error()).count();
        info!(
            "{} exported {} spans ({} errors)",
            batch.resource.service_name,
            batch.len(),
            errors
        );
        for span in &batch.spans {
            debug!(
                "span {} {} took {}us {:?}",
                span.name,
                span.id,
                span.duration().num_microseconds().unwrap_or(i64::MAX),
                span.attributes
            );
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    resource: &'a Resource,
    span: &'a SpanRecord,
}

/// Appends one JSON object per span to a file
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonLinesSink { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl ExporterSink for JsonLinesSink {
    async fn export(&self, batch: &Batch) -> Result<()> {
        let mut out = Vec::new();
        for span in &batch.spans {
            serde_json::to_writer(
                &mut out,
                &JsonLine {
                    resource: &batch.resource,
                    span,
                },
            )?;
            out.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&out).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps exported batches in memory
///
/// Can be told to fail, stall, or slow down every export.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Batch>>,
    failing: AtomicBool,
    stalled: AtomicBool,
    delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    shut_down: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Never complete exports (until the exporter's timeout fires)
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Successfully exported batches
    pub fn batches(&self) -> Vec<Batch> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of all exported spans in export order
    pub fn span_names(&self) -> Vec<String> {
        self.batches()
            .iter()
            .flat_map(|b| b.spans.iter().map(|s| s.name.clone()))
            .collect()
    }

    /// Highest number of export calls seen running at once
    pub fn max_concurrent_exports(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    async fn export_inner(&self, batch: &Batch) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TelemetryError::Export("collector unavailable".to_string()));
        }

        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl ExporterSink for MemorySink {
    async fn export(&self, batch: &Batch) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.export_inner(batch).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}
