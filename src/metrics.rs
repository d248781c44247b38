//! Process-wide metrics sink.
//!
//! spec.md §9 "Global state" treats the metrics client as a process-wide
//! sink initialized before the run loop and never mutated afterward. This
//! trims `siem_clickhouse_ingestion::metrics::MetricsCollector`'s sprawling
//! performance/health/business/tenant metric structs down to the three
//! operations the spec actually calls for (`increment`, `gauge`, `timing`),
//! mirroring `snuba.utils.metrics.backends.abstract.MetricsBackend`.

use std::collections::HashMap;
use std::sync::Mutex;

pub trait MetricsBackend: Send + Sync {
    fn increment(&self, name: &str, value: i64, tags: &[(&str, &str)]);
    fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]);
    fn timing(&self, name: &str, value_ms: i64, tags: &[(&str, &str)]);
}

/// Logs every call through `tracing`, matching the rest of the pack's
/// preference for structured log fields over a bespoke wire protocol to a
/// metrics daemon (the concrete metrics backend is an external collaborator
/// per spec.md §1).
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsBackend for TracingMetrics {
    fn increment(&self, name: &str, value: i64, tags: &[(&str, &str)]) {
        tracing::debug!(metric = name, value, ?tags, "increment");
    }

    fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        tracing::debug!(metric = name, value, ?tags, "gauge");
    }

    fn timing(&self, name: &str, value_ms: i64, tags: &[(&str, &str)]) {
        tracing::debug!(metric = name, value_ms, ?tags, "timing");
    }
}

#[derive(Debug, Clone)]
pub enum RecordedMetric {
    Increment { name: String, value: i64 },
    Gauge { name: String, value: f64 },
    Timing { name: String, value_ms: i64 },
}

/// In-memory recorder for assertions in tests, in place of mocking a real
/// metrics daemon.
#[derive(Debug, Default)]
pub struct TestMetrics {
    recorded: Mutex<Vec<RecordedMetric>>,
}

impl TestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<RecordedMetric> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn count_of(&self, name: &str) -> usize {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .filter(|m| match m {
                RecordedMetric::Increment { name: n, .. } => n == name,
                RecordedMetric::Gauge { name: n, .. } => n == name,
                RecordedMetric::Timing { name: n, .. } => n == name,
            })
            .count()
    }
}

impl MetricsBackend for TestMetrics {
    fn increment(&self, name: &str, value: i64, _tags: &[(&str, &str)]) {
        self.recorded.lock().unwrap().push(RecordedMetric::Increment {
            name: name.to_string(),
            value,
        });
    }

    fn gauge(&self, name: &str, value: f64, _tags: &[(&str, &str)]) {
        self.recorded.lock().unwrap().push(RecordedMetric::Gauge {
            name: name.to_string(),
            value,
        });
    }

    fn timing(&self, name: &str, value_ms: i64, _tags: &[(&str, &str)]) {
        self.recorded.lock().unwrap().push(RecordedMetric::Timing {
            name: name.to_string(),
            value_ms,
        });
    }
}

/// Tags a metrics backend with a fixed prefix/tag set, matching
/// `snuba.utils.metrics.backends.wrapper.MetricsWrapper`.
pub struct TaggedMetrics<'a> {
    inner: &'a dyn MetricsBackend,
    prefix: String,
    tags: HashMap<String, String>,
}

impl<'a> TaggedMetrics<'a> {
    pub fn new(inner: &'a dyn MetricsBackend, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            tags: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    fn scoped(&self, name: &str) -> String {
        format!("{}.{}", self.prefix, name)
    }

    fn tag_pairs(&self) -> Vec<(&str, &str)> {
        self.tags
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }
}

impl MetricsBackend for TaggedMetrics<'_> {
    fn increment(&self, name: &str, value: i64, _tags: &[(&str, &str)]) {
        self.inner.increment(&self.scoped(name), value, &self.tag_pairs());
    }

    fn gauge(&self, name: &str, value: f64, _tags: &[(&str, &str)]) {
        self.inner.gauge(&self.scoped(name), value, &self.tag_pairs());
    }

    fn timing(&self, name: &str, value_ms: i64, _tags: &[(&str, &str)]) {
        self.inner.timing(&self.scoped(name), value_ms, &self.tag_pairs());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_for_assertion() {
        let metrics = TestMetrics::new();
        metrics.increment("consumer.processed", 1, &[]);
        metrics.increment("consumer.processed", 1, &[]);
        metrics.timing("flush.duration", 42, &[]);

        assert_eq!(metrics.count_of("consumer.processed"), 2);
        assert_eq!(metrics.count_of("flush.duration"), 1);
    }

    #[test]
    fn tagged_metrics_prefixes_names() {
        let inner = TestMetrics::new();
        {
            let tagged = TaggedMetrics::new(&inner, "subscriptions").with_tag("group", "g1");
            tagged.gauge("executor.workers", 4.0, &[]);
        }
        assert_eq!(inner.count_of("subscriptions.executor.workers"), 1);
    }
}
