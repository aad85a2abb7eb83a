//! `tracing` layer feeding closed spans into a [`SpanBuffer`]

use crate::buffer::SpanBuffer;
use crate::span::{next_span_id, SpanRecord, SpanStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Per-trace sampling decision, taken at the root span
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ratio", rename_all = "snake_case")]
pub enum Sampler {
    #[default]
    AlwaysOn,
    AlwaysOff,
    /// Keep roughly this fraction of traces
    Ratio(f64),
}

impl Sampler {
    pub fn should_sample(&self) -> bool {
        match self {
            Sampler::AlwaysOn => true,
            Sampler::AlwaysOff => false,
            Sampler::Ratio(ratio) => rand::random::<f64>() < *ratio,
        }
    }
}

struct OpenSpan {
    id: u64,
    parent_id: Option<u64>,
    start: DateTime<Utc>,
    attributes: BTreeMap<String, String>,
    status: SpanStatus,
    sampled: bool,
}

struct AttributeVisitor<'a>(&'a mut BTreeMap<String, String>);

impl Visit for AttributeVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{:?}", value));
    }
}

/// Captures every closed span of a sampled trace
///
/// An ERROR event recorded inside a span marks that span as failed.
#[derive(Clone)]
pub struct SpanCaptureLayer {
    buffer: Arc<SpanBuffer>,
    sampler: Sampler,
}

impl SpanCaptureLayer {
    pub fn new(buffer: Arc<SpanBuffer>) -> Self {
        SpanCaptureLayer {
            buffer,
            sampler: Sampler::AlwaysOn,
        }
    }

    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn buffer(&self) -> &Arc<SpanBuffer> {
        &self.buffer
    }
}

impl<S> Layer<S> for SpanCaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };

        let parent = span.parent().and_then(|parent| {
            let extensions = parent.extensions();
            let open = extensions.get::<OpenSpan>()?;
            Some((open.id, open.sampled))
        });
        let (parent_id, sampled) = match parent {
            Some((parent_id, sampled)) => (Some(parent_id), sampled),
            None => (None, self.sampler.should_sample()),
        };

        let mut attributes = BTreeMap::new();
        if sampled {
            attrs.record(&mut AttributeVisitor(&mut attributes));
        }

        span.extensions_mut().insert(OpenSpan {
            id: next_span_id(),
            parent_id,
            start: Utc::now(),
            attributes,
            status: SpanStatus::Unset,
            sampled,
        });
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        if let Some(open) = extensions.get_mut::<OpenSpan>() {
            if open.sampled {
                values.record(&mut AttributeVisitor(&mut open.attributes));
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::ERROR {
            return;
        }
        let Some(span) = ctx.event_span(event) else {
            return;
        };

        let mut fields = BTreeMap::new();
        event.record(&mut AttributeVisitor(&mut fields));
        let message = fields.remove("message").unwrap_or_default();

        let mut extensions = span.extensions_mut();
        if let Some(open) = extensions.get_mut::<OpenSpan>() {
            open.status = SpanStatus::Error(message);
        }
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(&id) else {
            return;
        };
        let Some(open) = span.extensions_mut().remove::<OpenSpan>() else {
            return;
        };
        if !open.sampled {
            return;
        }

        let metadata = span.metadata();
        self.buffer.push(SpanRecord {
            id: open.id,
            parent_id: open.parent_id,
            name: metadata.name().to_string(),
            target: metadata.target().to_string(),
            start: open.start,
            end: Utc::now(),
            attributes: open.attributes,
            status: open.status,
        });
    }
}
