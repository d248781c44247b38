//! C7 + C8: subscription scheduler/store and executor/worker, spec.md §4.6-4.7.

pub mod data;
pub mod executor;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use data::{ScheduledTask, Subscription, SubscriptionResult};
pub use executor::{QueryRunner, SubscriptionExecutor};
pub use scheduler::SubscriptionScheduler;
pub use store::{RedisSubscriptionStore, SubscriptionStore};
pub use worker::{SubscriptionResultCodec, SubscriptionWorker};
