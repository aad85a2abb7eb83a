//! Finished span records

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SPAN_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique span id
pub fn next_span_id() -> u64 {
    NEXT_SPAN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Outcome of the work a span describes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "code", content = "message", rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error(String),
}

/// One closed span
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanRecord {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub name: String,
    pub target: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attributes: BTreeMap<String, String>,
    pub status: SpanStatus,
}

impl SpanRecord {
    /// A zero-length span starting now
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        SpanRecord {
            id: next_span_id(),
            parent_id: None,
            name: name.into(),
            target: String::new(),
            start: now,
            end: now,
            attributes: BTreeMap::new(),
            status: SpanStatus::Unset,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: SpanStatus) -> Self {
        self.status = status;
        self
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, SpanStatus::Error(_))
    }
}
