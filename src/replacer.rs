//! C5: replacer worker, spec.md §4.4, grounded directly in
//! `examples/original_source/snuba/replacer.py`'s `ReplacerWorker`: decode
//! a versioned JSON replacement record, skip if the matching row count is
//! zero, otherwise run a `pre_replacement` hook, the replacement query
//! itself, then a `post_replacement` hook, timed and reported to metrics.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::batching::Worker;
use crate::broker::{KafkaPayload, Message};
use crate::columnstore::{ColumnStore, Stopwatch};
use crate::metrics::MetricsBackend;
use crate::{Error, Result};

/// The `[version, action_type, data]` wire shape. Only `version == 2` is
/// accepted; anything else is an `Error::InvalidMessageVersion`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplacementMessage {
    pub action_type: String,
    pub data: Value,
}

/// A fully-built replacement ready to run: a row-count check, then an
/// insert/mutation, templated with `{placeholder}` substitution against
/// `query_args` plus the table names the worker fills in.
#[derive(Debug, Clone, Serialize)]
pub struct Replacement {
    pub count_query_template: String,
    pub insert_query_template: String,
    pub query_args: HashMap<String, String>,
}

impl Replacement {
    fn render(&self, template: &str, extra: &HashMap<String, String>) -> String {
        let mut rendered = template.to_string();
        for (key, value) in self.query_args.iter().chain(extra.iter()) {
            rendered = rendered.replace(&format!("{{{key}}}"), value);
        }
        rendered
    }
}

/// Storage-specific decoding and side-effect hooks. One implementation
/// per storage that supports replacements, mirroring
/// `WritableTableStorage.get_table_writer().get_replacer_processor()`.
pub trait ReplacementProcessor: Send + Sync {
    fn process_message(&self, message: ReplacementMessage) -> Result<Option<Replacement>>;
    fn pre_replacement(&self, replacement: &Replacement, count: u64);
    fn post_replacement(&self, replacement: &Replacement, duration_ms: u64, count: u64);
    fn read_table_name(&self) -> &str;
    fn write_table_name(&self) -> &str;
}

pub struct ReplacerWorker {
    columnstore: Arc<dyn ColumnStore>,
    processor: Arc<dyn ReplacementProcessor>,
    metrics: Arc<dyn MetricsBackend>,
}

impl ReplacerWorker {
    pub fn new(
        columnstore: Arc<dyn ColumnStore>,
        processor: Arc<dyn ReplacementProcessor>,
        metrics: Arc<dyn MetricsBackend>,
    ) -> Self {
        ReplacerWorker {
            columnstore,
            processor,
            metrics,
        }
    }

    fn table_args(&self) -> HashMap<String, String> {
        let mut args = HashMap::new();
        args.insert(
            "dist_read_table_name".to_string(),
            self.processor.read_table_name().to_string(),
        );
        args.insert(
            "dist_write_table_name".to_string(),
            self.processor.write_table_name().to_string(),
        );
        args
    }
}

#[async_trait]
impl Worker<KafkaPayload, Replacement> for ReplacerWorker {
    fn process_message(&mut self, message: Message<KafkaPayload>) -> Result<Option<Replacement>> {
        let parsed: Value = serde_json::from_slice(&message.payload.value)?;
        let array = parsed
            .as_array()
            .ok_or_else(|| Error::InvalidMessageVersion("replacement record is not a JSON array".to_string()))?;
        let version = array
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::InvalidMessageVersion("missing version field".to_string()))?;

        if version != 2 {
            return Err(Error::InvalidMessageVersion(format!(
                "unknown replacement message format: {version}"
            )));
        }

        let action_type = array
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidMessageVersion("missing action_type field".to_string()))?
            .to_string();
        let data = array.get(2).cloned().unwrap_or(Value::Null);

        self.processor
            .process_message(ReplacementMessage { action_type, data })
    }

    async fn flush_batch(&mut self, batch: Vec<Replacement>) -> Result<()> {
        let table_args = self.table_args();

        for replacement in batch {
            let count_query = replacement.render(&replacement.count_query_template, &table_args);
            let count = self.columnstore.scalar_robust(&count_query).await?;
            if count == 0 {
                continue;
            }

            self.processor.pre_replacement(&replacement, count);

            let insert_query = replacement.render(&replacement.insert_query_template, &table_args);
            tracing::debug!(query = %insert_query, "executing replacement query");
            let stopwatch = Stopwatch::start();
            self.columnstore.execute_robust(&insert_query).await?;
            let duration_ms = stopwatch.elapsed_ms();

            self.processor.post_replacement(&replacement, duration_ms, count);
            tracing::info!(rows = count, duration_ms, "replacement applied");
            self.metrics.timing("replacements.count", count as i64, &[]);
            self.metrics.timing("replacements.duration", duration_ms as i64, &[]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::TestMetrics;
    use std::sync::Mutex;

    /// A column store fake that always reports a fixed scalar and records
    /// every statement it is asked to run, so the "skip when count is zero"
    /// property can be asserted without a live ClickHouse.
    struct FakeColumnStore {
        scalar: Scalar,
        executed: Mutex<Vec<String>>,
    }

    impl FakeColumnStore {
        fn returning(scalar: Scalar) -> Self {
            FakeColumnStore {
                scalar,
                executed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ColumnStore for FakeColumnStore {
        async fn execute_robust(&self, statement: &str) -> Result<()> {
            self.executed.lock().unwrap().push(statement.to_string());
            Ok(())
        }

        async fn scalar_robust(&self, _statement: &str) -> Result<Scalar> {
            Ok(self.scalar)
        }
    }

    struct RecordingProcessor {
        pre_calls: Mutex<Vec<u64>>,
        post_calls: Mutex<Vec<(u64, u64)>>,
    }

    impl ReplacementProcessor for RecordingProcessor {
        fn process_message(&self, message: ReplacementMessage) -> Result<Option<Replacement>> {
            if message.action_type == "noop" {
                return Ok(None);
            }
            let mut query_args = HashMap::new();
            query_args.insert("project_id".to_string(), "1".to_string());
            Ok(Some(Replacement {
                count_query_template: "SELECT count() FROM {dist_read_table_name} WHERE project_id = {project_id}".to_string(),
                insert_query_template: "INSERT INTO {dist_write_table_name} SELECT * FROM {dist_read_table_name} WHERE project_id = {project_id}".to_string(),
                query_args,
            }))
        }

        fn pre_replacement(&self, _replacement: &Replacement, count: u64) {
            self.pre_calls.lock().unwrap().push(count);
        }

        fn post_replacement(&self, _replacement: &Replacement, duration_ms: u64, count: u64) {
            self.post_calls.lock().unwrap().push((duration_ms, count));
        }

        fn read_table_name(&self) -> &str {
            "events_local"
        }

        fn write_table_name(&self) -> &str {
            "events_dist"
        }
    }

    #[test]
    fn unversioned_message_is_rejected() {
        let array = serde_json::json!([1, "delete_groups", {}]);
        let parsed: Result<u64> = (|| {
            let version = array
                .as_array()
                .and_then(|a| a.first())
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::InvalidMessageVersion("missing".to_string()))?;
            if version != 2 {
                return Err(Error::InvalidMessageVersion("bad version".to_string()));
            }
            Ok(version)
        })();
        assert!(parsed.is_err());
    }

    #[test]
    fn replacement_template_renders_placeholders() {
        let mut query_args = HashMap::new();
        query_args.insert("project_id".to_string(), "42".to_string());
        let replacement = Replacement {
            count_query_template: "SELECT count() FROM {dist_read_table_name} WHERE project_id = {project_id}".to_string(),
            insert_query_template: String::new(),
            query_args,
        };
        let mut extra = HashMap::new();
        extra.insert("dist_read_table_name".to_string(), "events_local".to_string());
        let rendered = replacement.render(&replacement.count_query_template, &extra);
        assert_eq!(rendered, "SELECT count() FROM events_local WHERE project_id = 42");
    }

    fn replacement() -> Replacement {
        let mut query_args = HashMap::new();
        query_args.insert("project_id".to_string(), "1".to_string());
        Replacement {
            count_query_template: "SELECT count() FROM {dist_read_table_name} WHERE project_id = {project_id}".to_string(),
            insert_query_template: "INSERT INTO {dist_write_table_name} SELECT * FROM {dist_read_table_name} WHERE project_id = {project_id}".to_string(),
            query_args,
        }
    }

    #[tokio::test]
    async fn zero_count_skips_insert_and_hooks() {
        let columnstore = Arc::new(FakeColumnStore::returning(0));
        let processor = Arc::new(RecordingProcessor {
            pre_calls: Mutex::new(Vec::new()),
            post_calls: Mutex::new(Vec::new()),
        });
        let metrics = Arc::new(TestMetrics::new());
        let mut worker = ReplacerWorker::new(columnstore.clone(), processor.clone(), metrics.clone());

        worker.flush_batch(vec![replacement()]).await.unwrap();

        assert!(columnstore.executed.lock().unwrap().is_empty());
        assert!(processor.pre_calls.lock().unwrap().is_empty());
        assert!(processor.post_calls.lock().unwrap().is_empty());
        assert_eq!(metrics.count_of("replacements.count"), 0);
    }

    #[tokio::test]
    async fn nonzero_count_runs_insert_and_hooks() {
        let columnstore = Arc::new(FakeColumnStore::returning(3));
        let processor = Arc::new(RecordingProcessor {
            pre_calls: Mutex::new(Vec::new()),
            post_calls: Mutex::new(Vec::new()),
        });
        let metrics = Arc::new(TestMetrics::new());
        let mut worker = ReplacerWorker::new(columnstore.clone(), processor.clone(), metrics.clone());

        worker.flush_batch(vec![replacement()]).await.unwrap();

        assert_eq!(columnstore.executed.lock().unwrap().len(), 1);
        assert_eq!(processor.pre_calls.lock().unwrap().as_slice(), &[3]);
        assert_eq!(processor.post_calls.lock().unwrap().len(), 1);
        assert_eq!(metrics.count_of("replacements.count"), 1);
    }
}
