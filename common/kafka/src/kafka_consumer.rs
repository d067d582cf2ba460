use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    message::OwnedMessage,
    Offset, TopicPartitionList,
};
use tracing::debug;

use crate::config::{ConsumerConfig, KafkaConfig};

/// A subscription to a single topic whose offsets are only ever committed
/// explicitly, one record at a time.
///
/// Auto commit and auto offset store are both disabled: a record is
/// considered consumed only once `commit` has been called for it, so a
/// consumer that goes away without committing gets the record redelivered
/// to the next subscription of its group.
pub struct ManualCommitConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl ManualCommitConsumer {
    pub fn subscribe(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        topic: &str,
    ) -> Result<Self, KafkaError> {
        let mut client_config = common_config.client_config();
        client_config
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set(
                "isolation.level",
                &consumer_config.kafka_consumer_isolation_level,
            )
            .set("allow.auto.create.topics", "true");

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[topic])?;

        Ok(Self {
            consumer,
            topic: topic.to_owned(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next record. Cancel-safe: dropping the future loses
    /// nothing, the record stays queued in librdkafka.
    pub async fn recv(&self) -> Result<OwnedMessage, KafkaError> {
        let message = self.consumer.recv().await?;
        Ok(message.detach())
    }

    /// Synchronously commit the position right after `offset`, so the next
    /// subscription of the group resumes with the following record.
    pub fn commit(&self, partition: i32, offset: i64) -> Result<(), KafkaError> {
        let mut positions = TopicPartitionList::new();
        positions.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))?;
        self.consumer.commit(&positions, CommitMode::Sync)
    }

    /// Leave the group; uncommitted records go back to the next subscriber.
    pub fn close(&self) {
        self.consumer.unsubscribe();
    }
}
