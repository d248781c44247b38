//! Durable subscription set storage, spec.md §4.6, §6 "Persisted state":
//! keyed `subscriptions:<partition>:<uuid>`. Grounded in the
//! `redis::Client` + `ConnectionManager` pairing used throughout
//! `siem_unified_pipeline`'s `v2::util::rate_limit` and
//! `v2::collectors::redis_collector` for a cloneable async connection
//! handle.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::broker::PartitionId;
use crate::subscriptions::data::Subscription;
use crate::Result;

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn add(&self, partition: PartitionId, subscription: Subscription) -> Result<()>;
    async fn remove(&self, partition: PartitionId, id: Uuid) -> Result<()>;
    async fn list(&self, partition: PartitionId) -> Result<Vec<Subscription>>;
}

fn set_key(partition: PartitionId) -> String {
    format!("subscriptions:{}:__set__", partition.0)
}

fn entry_key(partition: PartitionId, id: Uuid) -> String {
    format!("subscriptions:{}:{}", partition.0, id)
}

pub struct RedisSubscriptionStore {
    connection: ConnectionManager,
}

impl RedisSubscriptionStore {
    pub fn new(connection: ConnectionManager) -> Self {
        RedisSubscriptionStore { connection }
    }
}

#[async_trait]
impl SubscriptionStore for RedisSubscriptionStore {
    async fn add(&self, partition: PartitionId, subscription: Subscription) -> Result<()> {
        let mut conn = self.connection.clone();
        let key = entry_key(partition, subscription.id);
        let payload = serde_json::to_string(&subscription)?;
        let () = conn.set(&key, payload).await?;
        let () = conn.sadd(set_key(partition), subscription.id.to_string()).await?;
        Ok(())
    }

    async fn remove(&self, partition: PartitionId, id: Uuid) -> Result<()> {
        let mut conn = self.connection.clone();
        let key = entry_key(partition, id);
        let () = conn.del(&key).await?;
        let () = conn.srem(set_key(partition), id.to_string()).await?;
        Ok(())
    }

    async fn list(&self, partition: PartitionId) -> Result<Vec<Subscription>> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn.smembers(set_key(partition)).await?;
        let mut subscriptions = Vec::with_capacity(ids.len());
        for id in ids {
            let key = format!("subscriptions:{}:{}", partition.0, id);
            let raw: Option<String> = conn.get(&key).await?;
            if let Some(raw) = raw {
                match serde_json::from_str(&raw) {
                    Ok(subscription) => subscriptions.push(subscription),
                    Err(e) => {
                        tracing::warn!(error = %e, key = %key, "dropping unparseable subscription entry");
                    }
                }
            }
        }
        Ok(subscriptions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_scoped_per_partition() {
        assert_eq!(set_key(PartitionId(3)), "subscriptions:3:__set__");
        let id = Uuid::nil();
        assert_eq!(entry_key(PartitionId(3), id), format!("subscriptions:3:{id}"));
    }
}
