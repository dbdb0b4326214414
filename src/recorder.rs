#![allow(clippy::too_many_arguments)]
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{warn, Level};
use uuid::Uuid;

use crate::buffer::{get_batch, Chunk, EntityBuffer};
use crate::common::{EntityKind, ReportError, ValidationError};
use crate::dedup::MessageDedupingLogger;
use crate::entities::{Centroid, HistogramGranularity, SpanLog, Tags};
use crate::formatting::{
    histogram_to_line_data, metric_to_line_data, span_logs_to_line_data,
    tracing_span_to_line_data,
};
use crate::registry::EntityMetrics;
use crate::transport::TransportBoxed;

pub(crate) struct Inner {
    pub client_id: String,
    pub default_source: String,
    pub batch_size: usize,
    pub message_size_bytes: usize,
    pub points: EntityBuffer,
    pub histograms: EntityBuffer,
    pub spans: EntityBuffer,
    pub span_logs: EntityBuffer,
    pub transport: Box<dyn TransportBoxed>,
    pub logger: MessageDedupingLogger,
    /// Held for the duration of a flush cycle so that only one cycle drains the buffers.
    pub flush_lock: Mutex<()>,
    pub shutdown: watch::Sender<bool>,
}

/// Window during which identical log messages from the sender are suppressed.
const LOG_DEDUP_WINDOW: Duration = Duration::from_secs(5);

impl Inner {
    pub(crate) fn new(
        transport: Box<dyn TransportBoxed>,
        client_id: String,
        default_source: String,
        max_queue_size: usize,
        batch_size: usize,
        message_size_bytes: usize,
    ) -> Self {
        let transport_name = transport.name();
        let buffer = |kind| {
            EntityBuffer::new(kind, max_queue_size, EntityMetrics::new(transport_name, kind))
        };
        let (shutdown, _) = watch::channel(false);

        Inner {
            client_id,
            default_source,
            batch_size,
            message_size_bytes,
            points: buffer(EntityKind::Point),
            histograms: buffer(EntityKind::Histogram),
            spans: buffer(EntityKind::Span),
            span_logs: buffer(EntityKind::SpanLog),
            transport,
            logger: MessageDedupingLogger::new(LOG_DEDUP_WINDOW),
            flush_lock: Mutex::new(()),
            shutdown,
        }
    }

    fn buffer(&self, kind: EntityKind) -> &EntityBuffer {
        match kind {
            EntityKind::Point => &self.points,
            EntityKind::Histogram => &self.histograms,
            EntityKind::Span => &self.spans,
            EntityKind::SpanLog => &self.span_logs,
        }
    }

    fn send_span_logs(&self, trace_id: Uuid, span_id: Uuid, span_logs: &[SpanLog], span: &str) {
        match span_logs_to_line_data(trace_id, span_id, span_logs, Some(span)) {
            Ok(json) => {
                self.span_logs.metrics.valid.inc();
                self.span_logs.offer(json, &self.logger);
            }
            Err(e) => {
                self.span_logs.metrics.invalid.inc();
                warn!(
                    "{}: traceId:{} spanId:{} spanLogs:{:?}",
                    ReportError::from(e),
                    trace_id,
                    span_id,
                    span_logs
                );
            }
        }
    }

    /// Runs one cycle over every kind. A scheduled cycle that gets the lock after shutdown was
    /// signalled does nothing, so no connection is reopened behind `close`.
    async fn flush_all(&self, scheduled: bool) -> Result<(), ReportError> {
        let _cycle = self.flush_lock.lock().await;
        if scheduled && *self.shutdown.borrow() {
            return Ok(());
        }
        let mut first_error = None;
        for kind in EntityKind::ALL {
            if let Err(e) = self.flush_buffer(self.buffer(kind)).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn flush_buffer(&self, buffer: &EntityBuffer) -> Result<(), ReportError> {
        buffer.metrics.record_queue(buffer.len(), buffer.capacity());
        let result = self.deliver_batch(buffer).await;
        buffer.metrics.record_queue(buffer.len(), buffer.capacity());
        result
    }

    async fn deliver_batch(&self, buffer: &EntityBuffer) -> Result<(), ReportError> {
        let kind = buffer.kind;
        let batch = get_batch(
            &buffer.queue,
            self.batch_size,
            self.message_size_bytes,
            &buffer.metrics.dropped,
            &self.logger,
        );
        let mut chunks = batch.into_iter();
        while let Some(items) = chunks.next() {
            if buffer.is_disabled() {
                self.logger.log(
                    Level::ERROR,
                    &format!(
                        "Please verify that {0} is enabled for your account! All {0} will be \
                         discarded until the service is restarted.",
                        kind
                    ),
                );
                buffer.metrics.dropped.inc_by(items.len() as u64);
                continue;
            }

            let payload = items.concat().into_bytes();
            match self.transport.report_boxed(kind.format(), payload).await {
                Ok(status) => {
                    buffer.metrics.record_status(status);
                    self.handle_status(buffer, status, items);
                }
                Err(source) => {
                    // A broken connection fails every remaining chunk the same way, so the
                    // rest of this cycle's batch is dropped instead of retried.
                    let remaining: usize = chunks.map(|chunk| chunk.len()).sum();
                    buffer
                        .metrics
                        .dropped
                        .inc_by((items.len() + remaining) as u64);
                    buffer.metrics.report_errors.inc();
                    return Err(ReportError::Transport { kind, source });
                }
            }
        }
        Ok(())
    }

    fn handle_status(&self, buffer: &EntityBuffer, status: u16, items: Chunk) {
        if !(400..=599).contains(&status) {
            return;
        }
        let kind = buffer.kind;
        match status {
            401 | 403 => {
                if buffer.disable() {
                    self.logger.log(
                        Level::ERROR,
                        &format!(
                            "Error sending {0} to Wavefront (HTTP {1}). Please verify that {0} is \
                             enabled for your account! All {0} will be discarded until the \
                             service is restarted.",
                            kind, status
                        ),
                    );
                    buffer.metrics.dropped.inc_by(items.len() as u64);
                } else {
                    self.logger.log(
                        Level::WARN,
                        &format!(
                            "Permission error sending {} to Wavefront (HTTP {})",
                            kind, status
                        ),
                    );
                    buffer.requeue(items, &self.logger);
                }
            }
            _ => {
                self.logger.log(
                    Level::WARN,
                    &format!("Error sending {} to Wavefront (HTTP {})", kind, status),
                );
                buffer.requeue(items, &self.logger);
            }
        }
    }
}

/// Point-in-time counts for one entity kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntityStats {
    pub valid: u64,
    pub invalid: u64,
    pub dropped: u64,
    pub report_errors: u64,
    pub queue_size: usize,
    pub remaining_capacity: usize,
}

/// Buffers metrics, distributions, spans and span logs and delivers them in batches.
///
/// Send calls never block: an entity is validated, encoded and queued, or counted as dropped
/// when its queue is full. Delivery happens on [`flush`][WavefrontSender::flush], which the
/// exporter future built by [`WavefrontBuilder`][crate::WavefrontBuilder] calls periodically.
///
/// The sender is cheap to clone; clones share the same buffers.
#[derive(Clone)]
pub struct WavefrontSender {
    inner: Arc<Inner>,
}

impl From<Inner> for WavefrontSender {
    fn from(inner: Inner) -> Self {
        WavefrontSender {
            inner: Arc::new(inner),
        }
    }
}

impl WavefrontSender {
    /// Identifies the destination this sender reports to.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// The source written for entities sent without one.
    pub fn default_source(&self) -> &str {
        &self.inner.default_source
    }

    /// Queues a metric point.
    ///
    /// ## Errors
    ///
    /// Returns a validation error, and counts the point invalid, when the name, the resolved
    /// source, or any tag is blank. A full buffer is not an error.
    pub fn send_metric(
        &self,
        name: &str,
        value: f64,
        timestamp: Option<i64>,
        source: Option<&str>,
        tags: Option<&Tags>,
    ) -> Result<(), ValidationError> {
        let points = &self.inner.points;
        let point = metric_to_line_data(
            name,
            value,
            timestamp,
            source,
            tags,
            &self.inner.default_source,
        )
        .map_err(|e| {
            points.metrics.invalid.inc();
            e
        })?;
        points.metrics.valid.inc();
        points.offer(point, &self.inner.logger);
        Ok(())
    }

    /// Queues a metric point that is already in the Wavefront data format.
    pub fn send_formatted_metric(&self, point: &str) -> Result<(), ValidationError> {
        let points = &self.inner.points;
        if point.trim().is_empty() {
            points.metrics.invalid.inc();
            return Err(ValidationError::BlankPoint);
        }
        points.metrics.valid.inc();
        let mut point = point.to_string();
        if !point.ends_with('\n') {
            point.push('\n');
        }
        points.offer(point, &self.inner.logger);
        Ok(())
    }

    /// Queues a distribution, written once for each requested granularity.
    pub fn send_distribution(
        &self,
        name: &str,
        centroids: &[Centroid],
        granularities: &[HistogramGranularity],
        timestamp: Option<i64>,
        source: Option<&str>,
        tags: Option<&Tags>,
    ) -> Result<(), ValidationError> {
        let histograms = &self.inner.histograms;
        let lines = histogram_to_line_data(
            name,
            centroids,
            granularities,
            timestamp,
            source,
            tags,
            &self.inner.default_source,
        )
        .map_err(|e| {
            histograms.metrics.invalid.inc();
            e
        })?;
        histograms.metrics.valid.inc();
        histograms.offer(lines, &self.inner.logger);
        Ok(())
    }

    /// Queues a tracing span, followed by its span logs if there are any.
    ///
    /// Span logs are only queued once the span itself was accepted; if the span is dropped,
    /// its logs are counted dropped without being encoded.
    pub fn send_span<K, V>(
        &self,
        name: &str,
        start_millis: i64,
        duration_millis: i64,
        source: Option<&str>,
        trace_id: Uuid,
        span_id: Uuid,
        parents: &[Uuid],
        follows_from: &[Uuid],
        tags: &[(K, V)],
        span_logs: &[SpanLog],
    ) -> Result<(), ValidationError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let inner = &self.inner;
        let span = tracing_span_to_line_data(
            name,
            start_millis,
            duration_millis,
            source,
            trace_id,
            span_id,
            parents,
            follows_from,
            tags,
            span_logs,
            &inner.default_source,
        )
        .map_err(|e| {
            inner.spans.metrics.invalid.inc();
            e
        })?;
        inner.spans.metrics.valid.inc();

        let span_line = (!span_logs.is_empty()).then(|| span.clone());
        if inner.spans.offer(span, &inner.logger) {
            if let Some(span_line) = span_line {
                inner.send_span_logs(trace_id, span_id, span_logs, &span_line);
            }
        } else if span_line.is_some() {
            inner.span_logs.metrics.dropped.inc();
        }
        Ok(())
    }

    /// Runs one flush cycle over every entity kind.
    ///
    /// Each kind is flushed even if an earlier one failed; the first transport error is
    /// returned once the cycle completes.
    pub async fn flush(&self) -> Result<(), ReportError> {
        self.inner.flush_all(false).await
    }

    /// A flush cycle started by the exporter loop; skipped once the sender is closed.
    pub(crate) async fn scheduled_flush(&self) -> Result<(), ReportError> {
        self.inner.flush_all(true).await
    }

    /// Number of deliveries that failed at the transport level, across all kinds.
    ///
    /// Rejections by the backend (4xx/5xx) are not failures in this sense.
    pub fn failure_count(&self) -> u64 {
        EntityKind::ALL
            .iter()
            .map(|kind| self.inner.buffer(*kind).metrics.report_errors.count())
            .sum()
    }

    /// Current counters and queue occupancy for `kind`.
    pub fn stats(&self, kind: EntityKind) -> EntityStats {
        let buffer = self.inner.buffer(kind);
        let queue_size = buffer.len();
        EntityStats {
            valid: buffer.metrics.valid.count(),
            invalid: buffer.metrics.invalid.count(),
            dropped: buffer.metrics.dropped.count(),
            report_errors: buffer.metrics.report_errors.count(),
            queue_size,
            remaining_capacity: buffer.capacity().saturating_sub(queue_size),
        }
    }

    /// Whether a 401/403 from the backend has latched `kind` off.
    pub fn is_disabled(&self, kind: EntityKind) -> bool {
        self.inner.buffer(kind).is_disabled()
    }

    /// Stops the periodic exporter, flushes what is buffered and releases the transport.
    ///
    /// Errors are logged rather than returned.
    pub async fn close(&self) {
        self.inner.shutdown.send_replace(true);
        if let Err(e) = self.flush().await {
            warn!("error flushing buffer: {}", e);
        }
        if let Err(e) = self.inner.transport.close_boxed().await {
            warn!("error closing {} transport: {}", self.inner.transport.name(), e);
        }
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }
}
