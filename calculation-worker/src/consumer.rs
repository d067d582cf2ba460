use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::config::{ConsumerConfig, KafkaConfig};
use common_kafka::kafka_consumer::ManualCommitConsumer;
use health::HealthHandle;
use rdkafka::error::KafkaError;
use rdkafka::Message;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ConsumeError;
use crate::metrics::{OFFSETS_COMMITTED, PULL_ERRORS, RESUBSCRIPTIONS};
use crate::step::Processor;

const PULL_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// One record pulled from a subscription, detached from the client.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

/// A live, manually committed subscription to one topic.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Must be cancel-safe: a dropped call loses no record.
    async fn recv(&self) -> Result<InboundRecord, KafkaError>;

    /// Mark `offset` and everything before it on `partition` as consumed.
    fn commit(&self, partition: i32, offset: i64) -> Result<(), KafkaError>;

    fn close(&self);
}

pub trait Subscriber: Send + Sync {
    /// Opens a fresh subscription, resuming from the group's last commit.
    fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, KafkaError>;
}

pub struct KafkaSubscriber {
    kafka: KafkaConfig,
    consumer: ConsumerConfig,
}

impl KafkaSubscriber {
    pub fn new(kafka: KafkaConfig, consumer: ConsumerConfig) -> Self {
        Self { kafka, consumer }
    }
}

impl Subscriber for KafkaSubscriber {
    fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, KafkaError> {
        let consumer = ManualCommitConsumer::subscribe(&self.kafka, &self.consumer, topic)?;
        Ok(Box::new(consumer))
    }
}

#[async_trait]
impl Subscription for ManualCommitConsumer {
    async fn recv(&self) -> Result<InboundRecord, KafkaError> {
        let message = ManualCommitConsumer::recv(self).await?;
        Ok(InboundRecord {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec),
        })
    }

    fn commit(&self, partition: i32, offset: i64) -> Result<(), KafkaError> {
        ManualCommitConsumer::commit(self, partition, offset)
    }

    fn close(&self) {
        ManualCommitConsumer::close(self)
    }
}

/// Pulls one topic record by record into its processor, committing each
/// record only after the processor accepted it. Any unabsorbed failure
/// tears the subscription down and opens a fresh one, so uncommitted
/// records are redelivered.
pub struct ConsumeLoop {
    topic: String,
    subscriber: Arc<dyn Subscriber>,
    processor: Arc<dyn Processor>,
    liveness: HealthHandle,
    liveness_tick: Duration,
    resubscribe_backoff: Duration,
}

impl ConsumeLoop {
    pub fn new(
        topic: &str,
        subscriber: Arc<dyn Subscriber>,
        processor: Arc<dyn Processor>,
        liveness: HealthHandle,
        liveness_deadline: Duration,
        resubscribe_backoff: Duration,
    ) -> Self {
        Self {
            topic: topic.to_owned(),
            subscriber,
            processor,
            liveness,
            liveness_tick: (liveness_deadline / 3).max(Duration::from_millis(10)),
            resubscribe_backoff,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Runs until `cancel` fires. Only returns an error for subscriptions
    /// that can never succeed.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ConsumeError> {
        let labels = [("topic", self.topic.clone())];

        loop {
            let error = match self.consume(&cancel).await {
                Ok(()) => break,
                Err(error) => error,
            };
            // Shutdown won the race against a record already pulled
            if error.is_cancellation() {
                break;
            }

            error!(
                topic = %self.topic,
                processor = self.processor.name(),
                critical = true,
                %error,
                "consume loop crashed"
            );
            if error.is_unrecoverable() {
                return Err(error);
            }
            if cancel.is_cancelled() {
                break;
            }

            metrics::counter!(RESUBSCRIPTIONS, &labels).increment(1);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.resubscribe_backoff) => {}
            }
            info!(topic = %self.topic, "resubscribing");
        }

        warn!(topic = %self.topic, "stopped consuming");
        Ok(())
    }

    /// One subscription's lifetime. `Ok` only on cancellation.
    async fn consume(&self, cancel: &CancellationToken) -> Result<(), ConsumeError> {
        let subscription =
            self.subscriber
                .subscribe(&self.topic)
                .map_err(|error| ConsumeError::Subscribe {
                    topic: self.topic.clone(),
                    error,
                })?;
        info!(topic = %self.topic, "subscribed");

        let result = self.pull(subscription.as_ref(), cancel).await;
        subscription.close();
        result
    }

    async fn pull(
        &self,
        subscription: &dyn Subscription,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumeError> {
        let labels = [("topic", self.topic.clone())];
        let mut idle = tokio::time::interval(self.liveness_tick);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let pulled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = idle.tick() => {
                    self.liveness.report_healthy();
                    continue;
                }
                pulled = subscription.recv() => pulled,
            };
            self.liveness.report_healthy();

            let record = match pulled {
                Ok(record) => record,
                Err(error) => {
                    warn!(topic = %self.topic, %error, "failed to pull record");
                    metrics::counter!(PULL_ERRORS, &labels).increment(1);
                    tokio::time::sleep(PULL_ERROR_PAUSE).await;
                    continue;
                }
            };

            info!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "received record"
            );

            // Never raced against cancellation: a claimed step runs to its end
            match &record.payload {
                Some(payload) => self
                    .processor
                    .process(payload, cancel)
                    .await
                    .map_err(|error| ConsumeError::Step {
                        topic: record.topic.clone(),
                        partition: record.partition,
                        offset: record.offset,
                        error,
                    })?,
                None => warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "skipping record without payload"
                ),
            }

            subscription
                .commit(record.partition, record.offset)
                .map_err(|error| ConsumeError::Commit {
                    topic: record.topic.clone(),
                    partition: record.partition,
                    offset: record.offset,
                    error,
                })?;
            metrics::counter!(OFFSETS_COMMITTED, &labels).increment(1);
        }
    }
}
