//! Bounded per-kind buffers and the batching applied to them at flush time.

use crossbeam_queue::ArrayQueue;
use portable_atomic::{AtomicBool, Ordering};
use tracing::Level;

use crate::common::EntityKind;
use crate::dedup::MessageDedupingLogger;
use crate::registry::{EntityMetrics, SdkCounter};

/// One byte-capped group of records, delivered in a single transport call.
pub(crate) type Chunk = Vec<String>;

/// The queue, counters and disabled latch of a single entity kind.
///
/// Producers push from any thread; a single flush cycle at a time drains it.
pub(crate) struct EntityBuffer {
    pub kind: EntityKind,
    pub queue: ArrayQueue<String>,
    pub metrics: EntityMetrics,
    disabled: Option<AtomicBool>,
}

impl EntityBuffer {
    pub(crate) fn new(kind: EntityKind, capacity: usize, metrics: EntityMetrics) -> Self {
        Self {
            kind,
            queue: ArrayQueue::new(capacity),
            metrics,
            disabled: kind.can_be_disabled().then(|| AtomicBool::new(false)),
        }
    }

    /// Buffers an encoded record. Returns `false`, counting a drop, when the queue is full.
    pub(crate) fn offer(&self, record: String, logger: &MessageDedupingLogger) -> bool {
        match self.queue.push(record) {
            Ok(()) => true,
            Err(_) => {
                self.metrics.dropped.inc();
                logger.log(
                    Level::WARN,
                    &format!("Buffer full, dropping {}", self.kind),
                );
                false
            }
        }
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled
            .as_ref()
            .map_or(false, |d| d.load(Ordering::Acquire))
    }

    /// Latches the kind off. Returns `false` for kinds that cannot be disabled.
    pub(crate) fn disable(&self) -> bool {
        match &self.disabled {
            Some(d) => {
                d.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Puts a chunk back at the tail of the queue, in order.
    ///
    /// Stops at the first record that does not fit; it and everything after it are dropped.
    pub(crate) fn requeue(&self, items: Chunk, logger: &MessageDedupingLogger) {
        let total = items.len();
        for (requeued, item) in items.into_iter().enumerate() {
            if self.queue.push(item).is_err() {
                let num_dropped = total - requeued;
                self.metrics.dropped.inc_by(num_dropped as u64);
                logger.log_with_alternate_key(
                    Level::WARN,
                    &format!("Buffer full, dropping {} {}", num_dropped, self.kind),
                    &format!("Buffer full, dropping {}", self.kind),
                );
                break;
            }
        }
    }
}

/// Dequeues at most `batch_size` records and splits them into chunks of at most
/// `message_size_bytes` bytes each.
///
/// A record that is larger than `message_size_bytes` on its own is dropped, counted on
/// `dropped` and logged through `logger`, and does not count towards `batch_size`. Chunk boundaries depend only on
/// record sizes, so the same queue contents always batch the same way.
pub(crate) fn get_batch(
    queue: &ArrayQueue<String>,
    batch_size: usize,
    message_size_bytes: usize,
    dropped: &SdkCounter,
    logger: &MessageDedupingLogger,
) -> Vec<Chunk> {
    let batch_size = batch_size.min(queue.len());
    let mut batch = Vec::new();
    let mut chunk = Vec::new();
    let mut bytes_in_chunk = 0usize;
    let mut count = 0;

    while count < batch_size {
        let item = match queue.pop() {
            Some(item) => item,
            None => break,
        };
        let num_bytes = item.len();
        if num_bytes > message_size_bytes {
            logger.log_with_alternate_key(
                Level::WARN,
                &format!(
                    "Dropping data larger than {} bytes: {}",
                    message_size_bytes,
                    item.trim_end()
                ),
                "Dropping data larger than message size",
            );
            dropped.inc();
            continue;
        }
        if bytes_in_chunk.saturating_add(num_bytes) > message_size_bytes {
            if !chunk.is_empty() {
                batch.push(std::mem::take(&mut chunk));
            }
            bytes_in_chunk = 0;
        }
        chunk.push(item);
        bytes_in_chunk += num_bytes;
        count += 1;
    }
    if !chunk.is_empty() {
        batch.push(chunk);
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn record(size: usize) -> String {
        "a".repeat(size)
    }

    fn queue_of(sizes: &[usize]) -> ArrayQueue<String> {
        let queue = ArrayQueue::new(sizes.len().max(1));
        for size in sizes {
            queue.push(record(*size)).unwrap();
        }
        queue
    }

    fn logger() -> MessageDedupingLogger {
        MessageDedupingLogger::new(Duration::from_secs(5))
    }

    #[test]
    fn test_get_batch() {
        let queue = queue_of(&[50, 50, 50, 100, 250, 100, 200, 50, 50, 50]);
        let dropped = SdkCounter::detached();

        let batch = get_batch(&queue, 8, 200, &dropped, &logger());

        let sizes: Vec<usize> = batch.iter().map(Vec::len).collect();
        assert_eq!(sizes, [3, 2, 1, 2]);
        assert_eq!(dropped.count(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_get_batch_unbounded_message_size() {
        let queue = queue_of(&[10, 20, 30]);
        let dropped = SdkCounter::detached();

        let batch = get_batch(&queue, 10_000, usize::MAX, &dropped, &logger());

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].len(), 3);
        assert_eq!(dropped.count(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_get_batch_empty_queue() {
        let queue = ArrayQueue::new(4);
        let dropped = SdkCounter::detached();
        assert!(get_batch(&queue, 10, 100, &dropped, &logger()).is_empty());
    }

    #[test]
    fn offer_on_full_queue_counts_drop() {
        let buffer = EntityBuffer::new(
            EntityKind::Point,
            3,
            EntityMetrics::new("test", EntityKind::Point),
        );
        let logger = logger();

        assert!(buffer.offer("a\n".to_string(), &logger));
        assert!(buffer.offer("b\n".to_string(), &logger));
        assert!(buffer.offer("c\n".to_string(), &logger));
        assert!(!buffer.offer("d\n".to_string(), &logger));

        assert_eq!(buffer.metrics.dropped.count(), 1);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn requeue_drops_remainder_when_full() {
        let buffer = EntityBuffer::new(
            EntityKind::Span,
            3,
            EntityMetrics::new("test", EntityKind::Span),
        );
        let logger = logger();
        buffer.offer("live\n".to_string(), &logger);

        let chunk = vec!["1\n", "2\n", "3\n", "4\n"]
            .into_iter()
            .map(String::from)
            .collect();
        buffer.requeue(chunk, &logger);

        assert_eq!(buffer.metrics.dropped.count(), 2);
        assert_eq!(buffer.queue.pop().as_deref(), Some("live\n"));
        assert_eq!(buffer.queue.pop().as_deref(), Some("1\n"));
        assert_eq!(buffer.queue.pop().as_deref(), Some("2\n"));
        assert!(buffer.queue.pop().is_none());
    }

    #[test]
    fn only_disableable_kinds_latch() {
        let points = EntityBuffer::new(
            EntityKind::Point,
            1,
            EntityMetrics::new("test", EntityKind::Point),
        );
        assert!(!points.disable());
        assert!(!points.is_disabled());

        let spans = EntityBuffer::new(
            EntityKind::Span,
            1,
            EntityMetrics::new("test", EntityKind::Span),
        );
        assert!(spans.disable());
        assert!(spans.is_disabled());
    }

    proptest! {
        #[test]
        fn batches_preserve_order_and_respect_limits(
            sizes in proptest::collection::vec(1usize..300, 0..60),
            batch_size in 1usize..80,
            max_bytes in 1usize..400,
        ) {
            let queue = queue_of(&sizes);
            let dropped = SdkCounter::detached();

            let batch = get_batch(&queue, batch_size, max_bytes, &dropped, &logger());

            for chunk in &batch {
                prop_assert!(!chunk.is_empty());
                prop_assert!(chunk.iter().map(String::len).sum::<usize>() <= max_bytes);
            }

            // Replay the consumed prefix: everything that fits arrives in order.
            let consumed = sizes.len() - queue.len();
            let expected: Vec<usize> = sizes[..consumed]
                .iter()
                .copied()
                .filter(|s| *s <= max_bytes)
                .collect();
            let delivered: Vec<usize> = batch.iter().flatten().map(String::len).collect();
            prop_assert_eq!(&delivered, &expected);
            prop_assert!(delivered.len() <= batch_size);
            prop_assert_eq!(dropped.count() as usize, consumed - expected.len());
        }
    }
}
