use std::time::Duration;

use crate::config::KafkaConfig;

use health::HealthHandle;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientContext;
use serde::Serialize;
use serde_json::error::Error as SerdeError;
use thiserror::Error;
use tracing::{debug, error, info};

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = config.client_config();
    client_config
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set("compression.codec", &config.kafka_compression_codec)
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(liveness.into())?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to serialize: {error}")]
    SerializationError { error: SerdeError },
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// Serialize `item` as JSON and wait until the broker acknowledged it.
///
/// `queue_timeout` bounds how long we wait for room in the producer queue;
/// delivery itself is bounded by `message.timeout.ms`.
pub async fn send_keyed_to_kafka<T, C>(
    kafka_producer: &FutureProducer<C>,
    topic: &str,
    key: Option<&str>,
    item: &T,
    queue_timeout: Duration,
) -> Result<(), KafkaProduceError>
where
    T: Serialize + ?Sized,
    C: ClientContext + 'static,
{
    let payload = serde_json::to_string(item)
        .map_err(|e| KafkaProduceError::SerializationError { error: e })?;

    let record = FutureRecord {
        topic,
        key,
        payload: Some(&payload),
        timestamp: None,
        partition: None,
        headers: None,
    };

    match kafka_producer
        .send(record, Timeout::After(queue_timeout))
        .await
    {
        Ok(_) => Ok(()),
        Err((KafkaError::Canceled, _)) => Err(KafkaProduceError::KafkaProduceCanceled),
        Err((e, _)) => Err(KafkaProduceError::KafkaProduceError { error: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produce_errors_render_their_cause() {
        let err = KafkaProduceError::KafkaProduceError {
            error: KafkaError::Canceled,
        };
        assert!(err.to_string().starts_with("failed to produce to kafka"));
        assert_eq!(
            KafkaProduceError::KafkaProduceCanceled.to_string(),
            "failed to produce to kafka (timeout)"
        );
    }
}
