//! Ingest-side `Worker` for the `ingest-consumer` binary: decodes raw
//! event records into column-store rows and writes them in a batch.
//! The row shape and the column-store schema itself are external
//! collaborators (spec.md §1 Non-goals: "dataset schemas and query
//! planners"), so this worker is generic over a `RowProcessor` the
//! concrete dataset supplies.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::batching::Worker;
use crate::broker::{KafkaPayload, Message};
use crate::columnstore::ColumnStore;
use crate::metrics::MetricsBackend;
use crate::Result;

/// Decodes one raw event record into a column-store row (an opaque JSON
/// document ready for insertion) and builds the INSERT statement for a
/// batch of them. Kept as a trait so the wire format and target table are
/// supplied by the dataset, not hard-coded here.
pub trait RowProcessor: Send + Sync {
    fn process(&self, payload: &KafkaPayload) -> Result<Option<Value>>;
    fn build_insert(&self, rows: &[Value]) -> String;
}

pub struct IngestWorker {
    columnstore: Arc<dyn ColumnStore>,
    processor: Arc<dyn RowProcessor>,
    metrics: Arc<dyn MetricsBackend>,
}

impl IngestWorker {
    pub fn new(columnstore: Arc<dyn ColumnStore>, processor: Arc<dyn RowProcessor>, metrics: Arc<dyn MetricsBackend>) -> Self {
        IngestWorker {
            columnstore,
            processor,
            metrics,
        }
    }
}

#[async_trait]
impl Worker<KafkaPayload, Value> for IngestWorker {
    fn process_message(&mut self, message: Message<KafkaPayload>) -> Result<Option<Value>> {
        self.processor.process(&message.payload)
    }

    async fn flush_batch(&mut self, batch: Vec<Value>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let statement = self.processor.build_insert(&batch);
        self.columnstore.execute_robust(&statement).await?;
        self.metrics.timing("ingest.rows_written", batch.len() as i64, &[]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct PassthroughProcessor {
        built: Mutex<Vec<String>>,
    }

    impl RowProcessor for PassthroughProcessor {
        fn process(&self, payload: &KafkaPayload) -> Result<Option<Value>> {
            if payload.value.is_empty() {
                return Ok(None);
            }
            Ok(Some(serde_json::from_slice(&payload.value)?))
        }

        fn build_insert(&self, rows: &[Value]) -> String {
            let statement = format!("INSERT INTO events VALUES ({} rows)", rows.len());
            self.built.lock().unwrap().push(statement.clone());
            statement
        }
    }

    #[test]
    fn empty_payload_is_filtered() {
        let processor = PassthroughProcessor { built: Mutex::new(vec![]) };
        let payload = KafkaPayload::new(None, vec![]);
        assert!(processor.process(&payload).unwrap().is_none());
    }
}
