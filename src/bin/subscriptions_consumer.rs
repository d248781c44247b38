//! `subscriptions-consumer`: converts primary-topic offset progress into
//! ticks, schedules due subscriptions per tick, dispatches their queries
//! through a bounded pool, and republishes results.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colstream::broker::{AutoOffsetReset, Codec, Consumer, KafkaConsumer, KafkaPayload, KafkaProducer, PassthroughCodec, Topic};
use colstream::columnstore::{ColumnStore, ColumnStoreClient, ColumnStoreConfig};
use colstream::config::{exit_code_for, require_nonempty, SubscriptionsConfig};
use colstream::metrics::TracingMetrics;
use colstream::subscriptions::{QueryRunner, RedisSubscriptionStore, Subscription, SubscriptionExecutor, SubscriptionScheduler, SubscriptionWorker};
use colstream::synchronized::SynchronizedConsumer;
use colstream::ticks::TickConsumer;
use rdkafka::config::ClientConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Executes a subscription's query by treating `conditions.query` as an
/// already-built statement against the column store. The concrete query
/// builder is an external collaborator, spec.md §1.
struct ColumnStoreQueryRunner {
    columnstore: ColumnStoreClient,
}

#[async_trait::async_trait]
impl QueryRunner for ColumnStoreQueryRunner {
    async fn run_query(&self, subscription: &Subscription) -> colstream::Result<serde_json::Value> {
        let query = subscription
            .conditions
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| colstream::Error::Decode("subscription missing conditions.query".to_string()))?;
        let count = self.columnstore.scalar_robust(query).await?;
        Ok(serde_json::json!({ "count": count }))
    }
}

fn client_config(config: &SubscriptionsConfig, group_id: &str) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.bootstrap_servers.join(","))
        .set("group.id", group_id);
    client_config
}

async fn run(config: SubscriptionsConfig) -> colstream::Result<()> {
    require_nonempty(&config.bootstrap_servers, "bootstrap_servers")?;

    let codec: Arc<dyn Codec<KafkaPayload, KafkaPayload> + Send + Sync> = Arc::new(PassthroughCodec);

    // Primary data consumer gated by commit-log progress (C3), per spec.md
    // §4.3 — a slow snapshot load must never let the tick stream outrun what
    // has actually landed in the column store.
    let primary = KafkaConsumer::new(
        client_config(&config, &config.consumer_group),
        AutoOffsetReset::Earliest,
        true,
        codec.clone(),
    )?;
    let commit_log_group = format!("{}-commit-log-watcher", config.consumer_group);
    let commit_log = KafkaConsumer::new(
        client_config(&config, &commit_log_group),
        AutoOffsetReset::Earliest,
        false,
        codec.clone(),
    )?;
    let mut synced = SynchronizedConsumer::new(
        Box::new(primary),
        Box::new(commit_log),
        Topic::new(config.commit_log_topic.clone()),
    );
    synced
        .subscribe(&[Topic::new(config.raw_events_topic.clone())])
        .map_err(|e| colstream::Error::InvariantViolation(e.to_string()))?;
    let ticks = TickConsumer::new(Box::new(synced));

    let redis_client = redis::Client::open(config.redis_url.clone())?;
    let connection = redis::aio::ConnectionManager::new(redis_client).await?;
    let store = Arc::new(RedisSubscriptionStore::new(connection));
    let scheduler = SubscriptionScheduler::new(store, Duration::from_secs(config.schedule_ttl_seconds));

    let columnstore = ColumnStoreClient::new(ColumnStoreConfig {
        url: config.clickhouse_url.clone(),
        database: config.clickhouse_database.clone(),
        username: config.clickhouse_user.clone(),
        password: config.clickhouse_password.clone(),
        max_retries: 5,
    });
    let runner = Arc::new(ColumnStoreQueryRunner { columnstore });
    let executor = SubscriptionExecutor::new(runner, config.max_query_workers, Duration::from_millis(config.query_timeout_ms));

    let producer = Arc::new(KafkaProducer::new(client_config(&config, &config.consumer_group), codec)?);
    let metrics = Arc::new(TracingMetrics);

    let mut worker = SubscriptionWorker::new(
        ticks,
        scheduler,
        executor,
        producer,
        Topic::new(config.result_topic.clone()),
        metrics,
    );

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        shutdown.signal();
    });

    worker.run().await
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
    let config = SubscriptionsConfig::parse();

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
            tracing::error!(error = %e, "subscriptions consumer exited with a fatal error");
            std::process::exit(exit_code_for(&e));
        }
    }
}
