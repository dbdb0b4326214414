use metrics::{Counter, Gauge};
use portable_atomic::{AtomicU64, Ordering};

use crate::common::EntityKind;

/// Prefix shared by every self-metric the sender reports.
pub(crate) const SDK_METRIC_PREFIX: &str = "~sdk.rust.core.sender";

/// A monotonic counter that can be read back in-process and is mirrored to the installed
/// `metrics` recorder, if any.
pub struct SdkCounter {
    value: AtomicU64,
    handle: Counter,
}

impl SdkCounter {
    pub(crate) fn register(name: String, pid: &str) -> Self {
        Self {
            value: AtomicU64::new(0),
            handle: metrics::register_counter!(name, "pid" => pid.to_string()),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            value: AtomicU64::new(0),
            handle: Counter::noop(),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.value.fetch_add(n, Ordering::Relaxed);
        self.handle.increment(n);
    }

    pub fn count(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge whose last value can be read back in-process, mirrored to the `metrics` recorder.
pub struct SdkGauge {
    value: AtomicU64,
    handle: Gauge,
}

impl SdkGauge {
    pub(crate) fn register(name: String, pid: &str) -> Self {
        Self {
            value: AtomicU64::new(0),
            handle: metrics::register_gauge!(name, "pid" => pid.to_string()),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
        self.handle.set(value as f64);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters and gauges tracked for one entity kind.
pub(crate) struct EntityMetrics {
    pub valid: SdkCounter,
    pub invalid: SdkCounter,
    pub dropped: SdkCounter,
    pub report_errors: SdkCounter,
    pub queue_size: SdkGauge,
    pub remaining_capacity: SdkGauge,
    status_prefix: String,
    pid: String,
}

impl EntityMetrics {
    pub(crate) fn new(transport: &str, kind: EntityKind) -> Self {
        let prefix = format!("{}.{}.{}", SDK_METRIC_PREFIX, transport, kind.metric_prefix());
        let pid = std::process::id().to_string();
        let name = |suffix: &str| format!("{}.{}", prefix, suffix);

        Self {
            valid: SdkCounter::register(name("valid"), &pid),
            invalid: SdkCounter::register(name("invalid"), &pid),
            dropped: SdkCounter::register(name("dropped"), &pid),
            report_errors: SdkCounter::register(name("report.errors"), &pid),
            queue_size: SdkGauge::register(name("queue.size"), &pid),
            remaining_capacity: SdkGauge::register(name("queue.remaining_capacity"), &pid),
            status_prefix: name("report"),
            pid,
        }
    }

    pub(crate) fn record_queue(&self, size: usize, capacity: usize) {
        self.queue_size.set(size as u64);
        self.remaining_capacity
            .set(capacity.saturating_sub(size) as u64);
    }

    /// Counts one delivery that came back with `status`.
    pub(crate) fn record_status(&self, status: u16) {
        metrics::increment_counter!(
            format!("{}.{}", self.status_prefix, status),
            "pid" => self.pid.clone()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_reads_back_increments() {
        let counter = SdkCounter::detached();
        counter.inc();
        counter.inc_by(0);
        counter.inc_by(4);
        assert_eq!(counter.count(), 5);
    }

    #[test]
    fn metrics_register_without_a_recorder() {
        let metrics = EntityMetrics::new("direct", EntityKind::SpanLog);
        assert_eq!(
            metrics.status_prefix,
            "~sdk.rust.core.sender.direct.span_logs.report"
        );
        metrics.valid.inc();
        metrics.record_queue(3, 10);
        metrics.record_status(202);
        assert_eq!(metrics.valid.count(), 1);
        assert_eq!(metrics.queue_size.value(), 3);
        assert_eq!(metrics.remaining_capacity.value(), 7);
    }
}
