//! C8 continued: the subscription worker's run loop, driven by a
//! `TickConsumer` rather than the generic `Worker<TIn, TOut>` harness in
//! `batching.rs` — its input is already a derived tick stream, not raw
//! broker messages, so it gets its own small poll loop in the same shape.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::batching::ShutdownHandle;
use crate::broker::{ConsumerError, Destination, KafkaPayload, Producer, Topic};
use crate::metrics::MetricsBackend;
use crate::subscriptions::data::SubscriptionResult;
use crate::subscriptions::executor::SubscriptionExecutor;
use crate::subscriptions::scheduler::SubscriptionScheduler;
use crate::ticks::TickConsumer;
use crate::{Error, Result};

/// Versioned result encoding, per spec.md §6: "first byte of value =
/// version". Version 1 is a plain JSON body.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubscriptionResultCodec;

impl SubscriptionResultCodec {
    pub fn encode(&self, result: &SubscriptionResult) -> Result<KafkaPayload> {
        let mut value = vec![1u8];
        value.extend_from_slice(&serde_json::to_vec(result)?);
        Ok(KafkaPayload::new(None, value))
    }
}

pub struct SubscriptionWorker {
    ticks: TickConsumer<KafkaPayload>,
    scheduler: SubscriptionScheduler,
    executor: SubscriptionExecutor,
    producer: Arc<dyn Producer<KafkaPayload>>,
    result_topic: Topic,
    codec: SubscriptionResultCodec,
    metrics: Arc<dyn MetricsBackend>,
    poll_timeout: Duration,
    shutdown: ShutdownHandle,
}

impl SubscriptionWorker {
    pub fn new(
        ticks: TickConsumer<KafkaPayload>,
        scheduler: SubscriptionScheduler,
        executor: SubscriptionExecutor,
        producer: Arc<dyn Producer<KafkaPayload>>,
        result_topic: Topic,
        metrics: Arc<dyn MetricsBackend>,
    ) -> Self {
        SubscriptionWorker {
            ticks,
            scheduler,
            executor,
            producer,
            result_topic,
            codec: SubscriptionResultCodec,
            metrics,
            poll_timeout: Duration::from_secs(1),
            shutdown: ShutdownHandle::new(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.shutdown.is_signaled() {
                self.ticks.close();
                return Ok(());
            }

            match self.ticks.poll(self.poll_timeout) {
                Ok(Some(tick)) => {
                    self.process_tick(&tick).await?;

                    let mut offsets = std::collections::HashMap::new();
                    offsets.insert(tick.partition.clone(), tick.offsets.upper);
                    self.ticks
                        .stage_offsets(offsets)
                        .map_err(|e| Error::InvariantViolation(e.to_string()))?;
                    self.ticks
                        .commit_offsets()
                        .map_err(|e| Error::InvariantViolation(e.to_string()))?;
                }
                Ok(None) => {}
                Err(ConsumerError::Transient(msg)) => {
                    tracing::warn!(error = %msg, "transient error polling tick consumer");
                }
                Err(ConsumerError::Fatal(msg)) => {
                    self.ticks.close();
                    return Err(Error::InvariantViolation(msg));
                }
            }
        }
    }

    async fn process_tick(&mut self, tick: &crate::ticks::Tick) -> Result<()> {
        let partition_id = crate::broker::PartitionId(tick.partition.index);
        let tasks = self.scheduler.schedule(partition_id, tick).await?;
        if tasks.is_empty() {
            return Ok(());
        }

        let dispatches = tasks.into_iter().map(|task| self.executor.dispatch(task));
        let outcomes = join_all(dispatches).await;

        for (task, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    let subscription_result = SubscriptionResult::new(
                        task.task.id,
                        tick,
                        serde_json::json!({
                            "conditions": task.task.conditions,
                            "aggregations": task.task.aggregations,
                        }),
                        result,
                    );
                    let payload = self.codec.encode(&subscription_result)?;
                    if let Err(e) = self
                        .producer
                        .produce(Destination::Topic(self.result_topic.clone()), payload)
                        .await
                    {
                        tracing::warn!(error = %e, "failed to produce subscription result");
                        self.metrics.increment("subscriptions.produce_error", 1, &[]);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        subscription_id = %task.task.id,
                        "subscription evaluation failed, skipping"
                    );
                    self.metrics.increment("subscriptions.evaluation_error", 1, &[]);
                }
            }
        }
        Ok(())
    }
}
