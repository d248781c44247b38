//! C7: subscription scheduler, spec.md §4.6 — per-partition subscription
//! set cached with a TTL, enumerating due tasks within a tick interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::broker::PartitionId;
use crate::subscriptions::data::{ScheduledTask, Subscription};
use crate::subscriptions::store::SubscriptionStore;
use crate::ticks::Tick;
use crate::Result;

struct CacheEntry {
    fetched_at: Instant,
    subscriptions: Vec<Subscription>,
}

pub struct SubscriptionScheduler {
    store: Arc<dyn SubscriptionStore>,
    cache_ttl: Duration,
    cache: HashMap<PartitionId, CacheEntry>,
}

fn to_epoch_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

impl SubscriptionScheduler {
    pub fn new(store: Arc<dyn SubscriptionStore>, cache_ttl: Duration) -> Self {
        SubscriptionScheduler {
            store,
            cache_ttl,
            cache: HashMap::new(),
        }
    }

    async fn subscriptions_for(&mut self, partition: PartitionId) -> Result<Vec<Subscription>> {
        if let Some(entry) = self.cache.get(&partition) {
            if entry.fetched_at.elapsed() < self.cache_ttl {
                return Ok(entry.subscriptions.clone());
            }
        }
        let subscriptions = self.store.list(partition).await?;
        self.cache.insert(
            partition,
            CacheEntry {
                fetched_at: Instant::now(),
                subscriptions: subscriptions.clone(),
            },
        );
        Ok(subscriptions)
    }

    /// Enumerates, for every cached subscription on `tick.partition`, every
    /// multiple of its resolution that falls within `[t0, t1)`; ties in
    /// `t` are broken by ascending subscription id, per spec.md §4.6 step 3.
    pub async fn schedule(&mut self, partition: PartitionId, tick: &Tick) -> Result<Vec<ScheduledTask<Subscription>>> {
        let subscriptions = self.subscriptions_for(partition).await?;
        let t0 = to_epoch_secs(tick.timestamps.lower);
        let t1 = to_epoch_secs(tick.timestamps.upper);

        let mut tasks: Vec<ScheduledTask<Subscription>> = Vec::new();
        for subscription in subscriptions {
            let resolution = subscription.resolution.as_secs_f64();
            if resolution <= 0.0 {
                continue;
            }
            let first_multiple = (t0 / resolution).ceil() * resolution;
            let mut t = first_multiple;
            while t < t1 {
                tasks.push(ScheduledTask {
                    timestamp: UNIX_EPOCH + Duration::from_secs_f64(t),
                    task: subscription.clone(),
                });
                t += resolution;
            }
        }

        tasks.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.task.id.cmp(&b.task.id))
        });
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Partition, Topic};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct FixedStore(Vec<Subscription>);

    #[async_trait]
    impl SubscriptionStore for FixedStore {
        async fn add(&self, _partition: PartitionId, _subscription: Subscription) -> Result<()> {
            Ok(())
        }
        async fn remove(&self, _partition: PartitionId, _id: Uuid) -> Result<()> {
            Ok(())
        }
        async fn list(&self, _partition: PartitionId) -> Result<Vec<Subscription>> {
            Ok(self.0.clone())
        }
    }

    fn tick_spanning(secs: u64, span_secs: u64) -> Tick {
        let lower = UNIX_EPOCH + Duration::from_secs(secs);
        let upper = UNIX_EPOCH + Duration::from_secs(secs + span_secs);
        Tick {
            partition: Partition::new(Topic::new("events"), 0),
            offsets: crate::ticks::Interval::new(0, 1),
            timestamps: crate::ticks::Interval::new(lower, upper),
        }
    }

    #[tokio::test]
    async fn emits_three_tasks_for_a_three_minute_tick_at_one_minute_resolution() {
        let subscription = Subscription {
            id: Uuid::new_v4(),
            project_id: 1,
            conditions: serde_json::json!({}),
            aggregations: serde_json::json!({}),
            time_window: Duration::from_secs(600),
            resolution: Duration::from_secs(60),
        };
        let store = Arc::new(FixedStore(vec![subscription]));
        let mut scheduler = SubscriptionScheduler::new(store, Duration::from_secs(300));

        let tick = tick_spanning(120 * 60, 180);
        let tasks = scheduler.schedule(PartitionId(0), &tick).await.unwrap();

        assert_eq!(tasks.len(), 3);
        let expected = [120 * 60, 120 * 60 + 60, 120 * 60 + 120];
        for (task, expected_secs) in tasks.iter().zip(expected.iter()) {
            assert_eq!(task.timestamp, UNIX_EPOCH + Duration::from_secs(*expected_secs));
        }
    }

    #[tokio::test]
    async fn cache_is_reused_within_ttl() {
        let subscription = Subscription {
            id: Uuid::new_v4(),
            project_id: 1,
            conditions: serde_json::json!({}),
            aggregations: serde_json::json!({}),
            time_window: Duration::from_secs(600),
            resolution: Duration::from_secs(3600),
        };
        let store = Arc::new(FixedStore(vec![subscription]));
        let mut scheduler = SubscriptionScheduler::new(store, Duration::from_secs(300));

        let tick = tick_spanning(0, 60);
        let first = scheduler.subscriptions_for(PartitionId(1)).await.unwrap();
        let second = scheduler.subscriptions_for(PartitionId(1)).await.unwrap();
        assert_eq!(first.len(), second.len());
        let _ = tick;
    }
}
