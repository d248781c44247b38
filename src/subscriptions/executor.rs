//! C8: subscription executor, spec.md §4.7 — a bounded concurrency pool
//! dispatching query evaluations, standing in for the Python
//! `ThreadPoolExecutor` of `max_query_workers` workers with a
//! `tokio::sync::Semaphore`-gated task spawn, the idiomatic async
//! equivalent for a thread-pool-bounded concurrent dispatch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::subscriptions::data::{ScheduledTask, Subscription};
use crate::{Error, Result};

/// Runs a single subscription's query against the column store. One
/// implementation per dataset's query builder; kept external to the
/// executor so the executor itself stays storage-agnostic.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn run_query(&self, subscription: &Subscription) -> Result<serde_json::Value>;
}

#[derive(Clone)]
pub struct SubscriptionExecutor {
    runner: Arc<dyn QueryRunner>,
    semaphore: Arc<Semaphore>,
    query_timeout: Duration,
}

impl SubscriptionExecutor {
    pub fn new(runner: Arc<dyn QueryRunner>, max_query_workers: usize, query_timeout: Duration) -> Self {
        SubscriptionExecutor {
            runner,
            semaphore: Arc::new(Semaphore::new(max_query_workers.max(1))),
            query_timeout,
        }
    }

    /// Dispatches one scheduled task, returning the task alongside its
    /// outcome rather than propagating an error — per spec.md §4.7, a
    /// single subscription's failure must not abort the batch.
    pub async fn dispatch(
        &self,
        task: ScheduledTask<Subscription>,
    ) -> (ScheduledTask<Subscription>, Result<serde_json::Value>) {
        let permit = self.semaphore.clone().acquire_owned().await;
        let outcome = match permit {
            Ok(_permit) => match timeout(self.query_timeout, self.runner.run_query(&task.task)).await {
                Ok(result) => result,
                Err(_) => Err(Error::ColumnStore("subscription query timed out".to_string())),
            },
            Err(_) => Err(Error::InvariantViolation("executor semaphore closed".to_string())),
        };
        (task, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;
    use uuid::Uuid;

    struct SlowRunner {
        concurrent: Arc<AtomicUsize>,
        max_concurrent: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl QueryRunner for SlowRunner {
        async fn run_query(&self, _subscription: &Subscription) -> Result<serde_json::Value> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(serde_json::json!({"count": 1}))
        }
    }

    fn task() -> ScheduledTask<Subscription> {
        ScheduledTask {
            timestamp: SystemTime::now(),
            task: Subscription {
                id: Uuid::new_v4(),
                project_id: 1,
                conditions: serde_json::json!({}),
                aggregations: serde_json::json!({}),
                time_window: Duration::from_secs(60),
                resolution: Duration::from_secs(60),
            },
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_pool_size() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let runner = Arc::new(SlowRunner {
            concurrent: concurrent.clone(),
            max_concurrent: max_concurrent.clone(),
        });
        let executor = SubscriptionExecutor::new(runner, 2, Duration::from_secs(1));

        let futures: Vec<_> = (0..6).map(|_| executor.dispatch(task())).collect();
        let results = futures::future::join_all(futures).await;

        assert_eq!(results.len(), 6);
        assert!(max_concurrent.load(Ordering::SeqCst) <= 2);
    }
}
