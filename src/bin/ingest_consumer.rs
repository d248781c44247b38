//! `ingest-consumer`: consumes the raw events topic into the column
//! store, producing a commit-log record after each successful offset
//! commit. CLI surface mirrors
//! `examples/original_source/snuba/cli/snapshot_consumer.py`'s options,
//! one-for-one, minus the snapshot coordination itself.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colstream::batching::BatchingConsumer;
use colstream::broker::{Codec, CommitLogConsumer, Consumer, KafkaConsumer, KafkaPayload, KafkaProducer, PassthroughCodec, Topic};
use colstream::columnstore::{ColumnStoreClient, ColumnStoreConfig};
use colstream::config::{exit_code_for, require_nonempty, IngestConfig};
use colstream::ingest::{IngestWorker, RowProcessor};
use colstream::metrics::TracingMetrics;
use rdkafka::config::ClientConfig;
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Minimal pass-through row processor: accepts any JSON object as a row
/// and inserts it verbatim. The real per-dataset processor (schema
/// validation, column mapping) is an external collaborator, spec.md §1.
struct PassthroughRowProcessor {
    table: String,
}

impl RowProcessor for PassthroughRowProcessor {
    fn process(&self, payload: &KafkaPayload) -> colstream::Result<Option<Value>> {
        if payload.value.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&payload.value)?))
    }

    fn build_insert(&self, rows: &[Value]) -> String {
        let values: Vec<String> = rows.iter().map(|r| r.to_string()).collect();
        format!("INSERT INTO {} FORMAT JSONEachRow {}", self.table, values.join("\n"))
    }
}

fn client_config(config: &IngestConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.bootstrap_servers.join(","))
        .set("group.id", &config.consumer_group)
        .set("queued.max.messages.kbytes", config.queued_max_messages_kbytes.to_string())
        .set("queued.min.messages", config.queued_min_messages.to_string());
    client_config
}

async fn run(config: IngestConfig) -> colstream::Result<()> {
    require_nonempty(&config.bootstrap_servers, "bootstrap_servers")?;

    let codec: Arc<dyn Codec<KafkaPayload, KafkaPayload> + Send + Sync> = Arc::new(PassthroughCodec);
    let primary = KafkaConsumer::new(
        client_config(&config),
        config.auto_offset_reset,
        config.enable_end_of_partition,
        codec.clone(),
    )?;

    let commit_log_producer = Arc::new(KafkaProducer::new(client_config(&config), codec.clone())?);
    let mut consumer = CommitLogConsumer::new(
        Box::new(primary),
        config.consumer_group.clone(),
        Topic::new(config.commit_log_topic.clone()),
        commit_log_producer,
    );
    consumer
        .subscribe(&[Topic::new(config.raw_events_topic.clone())])
        .map_err(|e| colstream::Error::InvariantViolation(e.to_string()))?;

    let columnstore: Arc<dyn colstream::columnstore::ColumnStore> = Arc::new(ColumnStoreClient::new(ColumnStoreConfig {
        url: config.clickhouse_url.clone(),
        database: config.clickhouse_database.clone(),
        username: config.clickhouse_user.clone(),
        password: config.clickhouse_password.clone(),
        max_retries: 5,
    }));
    let processor = Arc::new(PassthroughRowProcessor {
        table: "events_local".to_string(),
    });
    let metrics = Arc::new(TracingMetrics);
    let worker = IngestWorker::new(columnstore, processor, metrics.clone());

    let mut harness = BatchingConsumer::new(
        Box::new(consumer),
        worker,
        config.max_batch_size,
        Duration::from_millis(config.max_batch_time_ms),
        metrics,
    );

    let shutdown = harness.shutdown_handle();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        shutdown.signal();
    });

    harness.run().await
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() {
    let config = IngestConfig::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("colstream={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(config).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, "ingest consumer exited with a fatal error");
            std::process::exit(exit_code_for(&e));
        }
    }
}
