//! Bounded span queue
//!
//! Pushing into a full buffer evicts the oldest span and counts it as
//! dropped. Dropped spans are gone for good.

use crate::span::SpanRecord;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Fixed-capacity FIFO of finished spans
#[derive(Debug)]
pub struct SpanBuffer {
    queue: Mutex<VecDeque<SpanRecord>>,
    capacity: usize,
    batch_size: usize,
    dropped: AtomicU64,
    batch_ready: Notify,
}

impl SpanBuffer {
    /// Create a buffer; `batch_size` is the fill level that wakes the exporter
    pub fn new(capacity: usize, batch_size: usize) -> Self {
        let capacity = capacity.max(1);
        SpanBuffer {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            batch_size: batch_size.clamp(1, capacity),
            dropped: AtomicU64::new(0),
            batch_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SpanRecord>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a span; returns false if the oldest span had to be evicted
    pub fn push(&self, span: SpanRecord) -> bool {
        let (evicted, len) = {
            let mut queue = self.lock();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(span);
            (evicted, queue.len())
        };

        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        if len >= self.batch_size {
            self.batch_ready.notify_one();
        }
        !evicted
    }

    /// Remove up to `max` spans, oldest first
    pub fn drain(&self, max: usize) -> Vec<SpanRecord> {
        let mut queue = self.lock();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Names of the queued spans, oldest first
    pub fn names(&self) -> Vec<String> {
        self.lock().iter().map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Spans evicted by overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until a push fills the buffer to the batch size
    ///
    /// A notification sent while nobody waits is kept for the next caller.
    pub async fn batch_ready(&self) {
        self.batch_ready.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn create_test_span(name: &str) -> SpanRecord {
        SpanRecord::new(name)
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let buffer = SpanBuffer::new(3, 3);
        for name in ["A", "B", "C", "D", "E"] {
            buffer.push(create_test_span(name));
        }

        assert_eq!(buffer.names(), vec!["C", "D", "E"]);
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_each_overflowing_push_counts_once() {
        let buffer = SpanBuffer::new(2, 2);
        assert!(buffer.push(create_test_span("a")));
        assert!(buffer.push(create_test_span("b")));

        for i in 1..=10u64 {
            assert!(!buffer.push(create_test_span("x")));
            assert_eq!(buffer.dropped(), i);
            assert!(buffer.len() <= buffer.capacity());
        }
    }

    #[test]
    fn test_drain_is_fifo_and_bounded() {
        let buffer = SpanBuffer::new(10, 5);
        for name in ["a", "b", "c", "d"] {
            buffer.push(create_test_span(name));
        }

        let first: Vec<String> = buffer.drain(3).into_iter().map(|s| s.name).collect();
        assert_eq!(first, vec!["a", "b", "c"]);
        assert_eq!(buffer.drain(3).len(), 1);
        assert!(buffer.drain(3).is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_batch_size_clamped_to_capacity() {
        let buffer = SpanBuffer::new(4, 100);
        assert_eq!(buffer.batch_size(), 4);
        assert_eq!(SpanBuffer::new(0, 0).capacity(), 1);
    }

    #[tokio::test]
    async fn test_batch_ready_fires_at_batch_size() {
        let buffer = Arc::new(SpanBuffer::new(10, 2));

        buffer.push(create_test_span("a"));
        let early = tokio::time::timeout(Duration::from_millis(20), buffer.batch_ready()).await;
        assert!(early.is_err());

        buffer.push(create_test_span("b"));
        tokio::time::timeout(Duration::from_secs(1), buffer.batch_ready())
            .await
            .unwrap();
    }
}
