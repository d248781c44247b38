//! Data model for the subscription pipeline, spec.md §3.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::Partition;
use crate::ticks::Tick;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub project_id: u64,
    pub conditions: serde_json::Value,
    pub aggregations: serde_json::Value,
    #[serde(with = "duration_secs")]
    pub time_window: Duration,
    #[serde(with = "duration_secs")]
    pub resolution: Duration,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// A subscription scheduled for evaluation at a point within a tick
/// interval, spec.md §3 `ScheduledTask<T>`.
#[derive(Debug, Clone)]
pub struct ScheduledTask<T> {
    pub timestamp: SystemTime,
    pub task: T,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionResult {
    pub subscription_id: Uuid,
    pub partition: Partition,
    pub offsets: (u64, u64),
    pub request: serde_json::Value,
    pub result: serde_json::Value,
}

impl SubscriptionResult {
    pub fn new(subscription_id: Uuid, tick: &Tick, request: serde_json::Value, result: serde_json::Value) -> Self {
        SubscriptionResult {
            subscription_id,
            partition: tick.partition.clone(),
            offsets: (tick.offsets.lower, tick.offsets.upper),
            request,
            result,
        }
    }
}
