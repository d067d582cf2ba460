use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::kafka_producer::{send_keyed_to_kafka, KafkaContext};
use rdkafka::producer::FutureProducer;

use crate::envelope::Envelope;
use crate::error::SendError;

/// Publishes status envelopes downstream. A returned `Ok` means the broker
/// acknowledged the envelope.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(&self, topic: &str, envelope: &Envelope) -> Result<(), SendError>;
}

pub struct KafkaSender {
    producer: FutureProducer<KafkaContext>,
    queue_timeout: Duration,
}

impl KafkaSender {
    pub fn new(producer: FutureProducer<KafkaContext>, queue_timeout: Duration) -> Self {
        Self {
            producer,
            queue_timeout,
        }
    }
}

#[async_trait]
impl OutboundSender for KafkaSender {
    async fn send(&self, topic: &str, envelope: &Envelope) -> Result<(), SendError> {
        // Keyed by transaction so every status of one trxId lands on one partition
        let key = envelope.trx_id.to_string();
        send_keyed_to_kafka(
            &self.producer,
            topic,
            Some(&key),
            envelope,
            self.queue_timeout,
        )
        .await
        .map_err(|error| SendError::Produce {
            topic: topic.to_owned(),
            error,
        })
    }
}

/// Records every envelope it is handed. Topics marked unavailable reject
/// sends until restored.
#[derive(Clone, Default)]
pub struct MockSender {
    state: Arc<Mutex<MockSenderState>>,
}

#[derive(Default)]
struct MockSenderState {
    sent: Vec<(String, Envelope)>,
    unavailable: HashSet<String>,
}

impl MockSender {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockSenderState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn make_unavailable(&self, topic: &str) {
        self.lock().unavailable.insert(topic.to_owned());
    }

    pub fn restore(&self, topic: &str) {
        self.lock().unavailable.remove(topic);
    }

    pub fn sent(&self) -> Vec<(String, Envelope)> {
        self.lock().sent.clone()
    }

    pub fn clear(&self) {
        self.lock().sent.clear();
    }
}

#[async_trait]
impl OutboundSender for MockSender {
    async fn send(&self, topic: &str, envelope: &Envelope) -> Result<(), SendError> {
        let mut state = self.lock();
        if state.unavailable.contains(topic) {
            return Err(SendError::Unavailable(topic.to_owned()));
        }
        state.sent.push((topic.to_owned(), envelope.clone()));
        Ok(())
    }
}
