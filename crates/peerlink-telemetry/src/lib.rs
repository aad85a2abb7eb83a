//! PeerLink telemetry pipeline
//!
//! Spans produced anywhere in the node flow through:
//! - [`SpanCaptureLayer`]: turns closed `tracing` spans into [`SpanRecord`]s
//! - [`SpanBuffer`]: bounded queue, drops the oldest span on overflow
//! - [`BatchExporter`]: background task handing batches to an [`ExporterSink`]
//!
//! Failed batches are dropped, never retried.

pub mod buffer;
pub mod error;
pub mod exporter;
pub mod layer;
pub mod resource;
pub mod sinks;
pub mod span;

pub use buffer::SpanBuffer;
pub use error::{Result, TelemetryError};
pub use exporter::{Batch, BatchConfig, BatchExporter, BatchExporterHandle, ExporterSink, ExporterStats};
pub use layer::{Sampler, SpanCaptureLayer};
pub use resource::{Resource, DEFAULT_SERVICE_NAME};
pub use sinks::{JsonLinesSink, LogSink, MemorySink, NullSink};
pub use span::{SpanRecord, SpanStatus};
