use common_kafka::kafka_producer::KafkaProduceError;
use common_redis::CustomRedisError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Failures of the dedup/checkpoint store. Never swallowed: every one of
/// them turns the current step into an `Error` outcome.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("checkpoint store unavailable for key {key}: {error}")]
    Redis {
        key: String,
        error: CustomRedisError,
    },
    #[error("malformed value under key {key}: {error}")]
    Malformed {
        key: String,
        error: serde_json::Error,
    },
    #[error("failed to encode value for key {key}: {error}")]
    Encode {
        key: String,
        error: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("failed to publish to {topic}: {error}")]
    Produce {
        topic: String,
        error: KafkaProduceError,
    },
    #[error("outbound channel {0} is unavailable")]
    Unavailable(String),
}

/// An unabsorbed step failure. The record it came from must not be
/// committed, so that it is redelivered and retried.
#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("malformed message: {0}")]
    Malformed(serde_json::Error),
    #[error("domain logic raised: {0:#}")]
    Domain(anyhow::Error),
    #[error("cancelled before the step was claimed")]
    Cancelled,
}

/// Why a subscription was torn down.
#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("failed to subscribe to {topic}: {error}")]
    Subscribe { topic: String, error: KafkaError },
    #[error("failed to commit offset {offset} of {topic}[{partition}]: {error}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        error: KafkaError,
    },
    #[error("processing {topic}[{partition}]@{offset} failed: {error}")]
    Step {
        topic: String,
        partition: i32,
        offset: i64,
        error: StepError,
    },
}

impl ConsumeError {
    /// Subscriptions that can never succeed, because the client itself
    /// cannot be built. Retrying those only hides a broken deployment.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            ConsumeError::Subscribe {
                error: KafkaError::ClientCreation(_) | KafkaError::ClientConfig(..),
                ..
            }
        )
    }

    /// A record turned away because shutdown had begun. It stays
    /// uncommitted and nothing about it was recorded.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            ConsumeError::Step {
                error: StepError::Cancelled,
                ..
            }
        )
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("consume loop for {topic} stopped: {error}")]
    LoopStopped { topic: String, error: ConsumeError },
    #[error("consume loop panicked: {0}")]
    LoopPanicked(String),
}
