//! `replacer-consumer`: consumes the replacements topic, applying
//! idempotent rewrites to the column store.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colstream::batching::BatchingConsumer;
use colstream::broker::{Codec, Consumer, KafkaConsumer, KafkaPayload, PassthroughCodec, Topic};
use colstream::columnstore::ColumnStoreConfig;
use colstream::columnstore::ColumnStoreClient;
use colstream::config::{exit_code_for, require_nonempty, ReplacerConfig};
use colstream::metrics::TracingMetrics;
use colstream::replacer::{Replacement, ReplacementMessage, ReplacementProcessor, ReplacerWorker};
use rdkafka::config::ClientConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Pass-through replacement processor: treats the message's `data` field
/// as already-built query templates. The actual per-dataset replacer
/// (e.g. "delete_groups", "merge") is an external collaborator, spec.md §1.
struct PassthroughReplacementProcessor {
    read_table: String,
    write_table: String,
}

impl ReplacementProcessor for PassthroughReplacementProcessor {
    fn process_message(&self, message: ReplacementMessage) -> colstream::Result<Option<Replacement>> {
        let count_query_template = message
            .data
            .get("count_query_template")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let insert_query_template = message
            .data
            .get("insert_query_template")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let (count_query_template, insert_query_template) = match (count_query_template, insert_query_template) {
            (Some(c), Some(i)) => (c, i),
            _ => {
                tracing::warn!(action_type = %message.action_type, "replacement message missing query templates");
                return Ok(None);
            }
        };

        let mut query_args = std::collections::HashMap::new();
        if let Some(object) = message.data.get("query_args").and_then(|v| v.as_object()) {
            for (key, value) in object {
                if let Some(s) = value.as_str() {
                    query_args.insert(key.clone(), s.to_string());
                } else {
                    query_args.insert(key.clone(), value.to_string());
                }
            }
        }

        Ok(Some(Replacement {
            count_query_template,
            insert_query_template,
            query_args,
        }))
    }

    fn pre_replacement(&self, _replacement: &Replacement, count: u64) {
        tracing::debug!(count, "pre_replacement hook");
    }

    fn post_replacement(&self, _replacement: &Replacement, duration_ms: u64, count: u64) {
        tracing::info!(count, duration_ms, "replacement applied");
    }

    fn read_table_name(&self) -> &str {
        &self.read_table
    }

    fn write_table_name(&self) -> &str {
        &self.write_table
    }
}

fn client_config(config: &ReplacerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.bootstrap_servers.join(","))
        .set("group.id", &config.consumer_group);
    client_config
}

async fn run(config: ReplacerConfig) -> colstream::Result<()> {
    require_nonempty(&config.bootstrap_servers, "bootstrap_servers")?;

    let codec: Arc<dyn Codec<KafkaPayload, KafkaPayload> + Send + Sync> = Arc::new(PassthroughCodec);
    let mut consumer = KafkaConsumer::new(client_config(&config), config.auto_offset_reset, true, codec)?;
    consumer
        .subscribe(&[Topic::new(config.replacements_topic.clone())])
        .map_err(|e| colstream::Error::InvariantViolation(e.to_string()))?;

    let columnstore: Arc<dyn colstream::columnstore::ColumnStore> = Arc::new(ColumnStoreClient::new(ColumnStoreConfig {
        url: config.clickhouse_url.clone(),
        database: config.clickhouse_database.clone(),
        username: config.clickhouse_user.clone(),
        password: config.clickhouse_password.clone(),
        max_retries: 5,
    }));
    let processor = Arc::new(PassthroughReplacementProcessor {
        read_table: "events_local".to_string(),
        write_table: "events_local".to_string(),
    });
    let metrics = Arc::new(TracingMetrics);
    let worker = ReplacerWorker::new(columnstore, processor, metrics.clone());

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
    let config = ReplacerConfig::parse();

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
            tracing::error!(error = %e, "replacer consumer exited with a fatal error");
            std::process::exit(exit_code_for(&e));
        }
    }
}
