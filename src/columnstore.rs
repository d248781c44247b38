//! `ColumnStoreClient`: a thin, retrying wrapper around a native
//! column-store driver connection, grounded in
//! `siem_clickhouse_ingestion::clickhouse::ClickHouseWriter` (client setup,
//! compression) and `siem_clickhouse_ingestion::pool::ChPool` (connection
//! reuse); the retry policy is `siem_unified_pipeline`'s
//! `retry::retry_idempotent`, bounded rather than infinite because a
//! replacement or tick query is not safe to retry forever without an
//! upper bound on how long a batch flush may block.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use clickhouse::Client;
use rand::Rng;

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ColumnStoreConfig {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_retries: u8,
}

impl Default for ColumnStoreConfig {
    fn default() -> Self {
        ColumnStoreConfig {
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            username: "default".to_string(),
            password: String::new(),
            max_retries: 5,
        }
    }
}

/// A single-row, single-column scalar result, the shape every call in this
/// module needs: a row count for a replacement, or a tick boundary.
pub type Scalar = u64;

/// The two retrying operations a column store backend must support,
/// pulled out behind a trait the same way `QueryRunner`
/// (`subscriptions::executor`) and `SubscriptionStore`
/// (`subscriptions::store`) sit in front of their own external
/// dependencies, so callers like `ReplacerWorker` can be exercised against
/// a fake without a live ClickHouse.
#[async_trait]
pub trait ColumnStore: Send + Sync {
    /// Runs a statement that returns no rows (an INSERT ... SELECT or a
    /// mutation), retrying on failure with exponential backoff and jitter.
    async fn execute_robust(&self, statement: &str) -> Result<()>;

    /// Runs a statement expected to return exactly one row with one
    /// `u64` column — the `count(*)` queries the replacer and scheduler
    /// both issue.
    async fn scalar_robust(&self, statement: &str) -> Result<Scalar>;
}

#[derive(Clone)]
pub struct ColumnStoreClient {
    client: Client,
    config: ColumnStoreConfig,
}

impl ColumnStoreClient {
    pub fn new(config: ColumnStoreConfig) -> Self {
        let client = Client::default()
            .with_url(&config.url)
            .with_user(&config.username)
            .with_password(&config.password)
            .with_database(&config.database)
            .with_compression(clickhouse::Compression::Lz4);
        ColumnStoreClient { client, config }
    }

    async fn retrying<F, Fut, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;
        for attempt in 0..self.config.max_retries {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "column store call failed, retrying");
                    last_error = Some(e);
                    if attempt + 1 < self.config.max_retries {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }
        Err(last_error.unwrap())
    }
}

#[async_trait]
impl ColumnStore for ColumnStoreClient {
    async fn execute_robust(&self, statement: &str) -> Result<()> {
        self.retrying(|| {
            let client = self.client.clone();
            let statement = statement.to_string();
            async move {
                client
                    .query(&statement)
                    .execute()
                    .await
                    .map_err(|e| Error::ColumnStore(e.to_string()))
            }
        })
        .await
    }

    async fn scalar_robust(&self, statement: &str) -> Result<Scalar> {
        self.retrying(|| {
            let client = self.client.clone();
            let statement = statement.to_string();
            async move {
                client
                    .query(&statement)
                    .fetch_one::<Scalar>()
                    .await
                    .map_err(|e| Error::ColumnStore(e.to_string()))
            }
        })
        .await
    }
}

fn backoff_delay(attempt: u8) -> Duration {
    let base_ms = 50u64.saturating_mul(1u64 << attempt.min(10));
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis((base_ms + jitter).min(5_000))
}

/// A cheap stopwatch for the "replacement took Nms" timing the replacer
/// worker reports to metrics.
pub struct Stopwatch(Instant);

impl Stopwatch {
    pub fn start() -> Self {
        Stopwatch(Instant::now())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_is_capped() {
        for attempt in 0..12 {
            assert!(backoff_delay(attempt).as_millis() <= 5_000);
        }
    }
}
