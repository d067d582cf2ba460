#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use calculation_worker::consumer::{InboundRecord, Subscriber, Subscription};
use calculation_worker::envelope::{Envelope, NettingMessage, Status};
use calculation_worker::sender::MockSender;
use calculation_worker::step::StepProcessor;
use calculation_worker::steps::{NettingCalculator, NettingStep, ValidationRule, ValidationStep};
use calculation_worker::store::CheckpointStore;
use calculation_worker::time::FixedTime;
use chrono::{DateTime, TimeZone, Utc};
use common_redis::MockRedisClient;
use health::{HealthHandle, HealthRegistry};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use uuid::Uuid;

pub const NETTING_OUTPUT: &str = "NettingPartTwoStatus";
pub const VALIDATION_OUTPUT: &str = "ValidationPartTwoComplete";

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

pub fn trx(n: u8) -> Uuid {
    Uuid::from_bytes([n; 16])
}

pub fn netting_message(
    trx_id: Uuid,
    investor: &str,
    contract: &str,
    price: f64,
) -> NettingMessage {
    NettingMessage {
        envelope: Envelope::new(trx_id, "Netting", now(), Status::Started, None),
        investor_id: investor.to_owned(),
        contract_id: contract.to_owned(),
        price,
    }
}

pub fn netting_payload(trx_id: Uuid, investor: &str, contract: &str, price: f64) -> Vec<u8> {
    serde_json::to_vec(&netting_message(trx_id, investor, contract, price)).unwrap()
}

pub fn validation_payload(trx_id: Uuid) -> Vec<u8> {
    serde_json::to_vec(&Envelope::new(
        trx_id,
        "Validation",
        now(),
        Status::Started,
        None,
    ))
    .unwrap()
}

pub fn netting_processor(
    redis: &MockRedisClient,
    sender: &MockSender,
    calculator: Arc<dyn NettingCalculator>,
) -> StepProcessor<NettingStep> {
    StepProcessor::new(
        NettingStep::new(calculator),
        CheckpointStore::new(Arc::new(redis.clone())),
        Arc::new(sender.clone()),
        NETTING_OUTPUT,
        Arc::new(FixedTime { time: now() }),
    )
}

pub fn validation_processor(
    redis: &MockRedisClient,
    sender: &MockSender,
    rule: Arc<dyn ValidationRule>,
) -> StepProcessor<ValidationStep> {
    StepProcessor::new(
        ValidationStep::new(rule, "PropagateNettingPartTwo"),
        CheckpointStore::new(Arc::new(redis.clone())),
        Arc::new(sender.clone()),
        VALIDATION_OUTPUT,
        Arc::new(FixedTime { time: now() }),
    )
}

pub fn liveness_handle(component: &str) -> HealthHandle {
    HealthRegistry::new("liveness").register(component.to_owned(), Duration::from_secs(30))
}

/// Polls `condition` until it holds, panicking after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Single-partition, single-group broker held in memory. Subscriptions
/// resume from the last committed offset, like a consumer group would.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<String, Vec<Option<Vec<u8>>>>,
    committed: HashMap<String, i64>,
    subscriptions: HashMap<String, usize>,
    subscribe_failures: HashMap<String, VecDeque<KafkaError>>,
    pull_failures: HashMap<String, usize>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn publish(&self, topic: &str, payload: Option<Vec<u8>>) {
        self.lock()
            .logs
            .entry(topic.to_owned())
            .or_default()
            .push(payload);
    }

    /// Next offset the group would resume from.
    pub fn committed(&self, topic: &str) -> i64 {
        self.lock().committed.get(topic).copied().unwrap_or(0)
    }

    pub fn subscriptions(&self, topic: &str) -> usize {
        self.lock().subscriptions.get(topic).copied().unwrap_or(0)
    }

    pub fn fail_subscribe(&self, topic: &str, error: KafkaError) {
        self.lock()
            .subscribe_failures
            .entry(topic.to_owned())
            .or_default()
            .push_back(error);
    }

    pub fn fail_pulls(&self, topic: &str, count: usize) {
        self.lock().pull_failures.insert(topic.to_owned(), count);
    }
}

impl Subscriber for MemoryBroker {
    fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, KafkaError> {
        let mut state = self.lock();
        if let Some(error) = state
            .subscribe_failures
            .get_mut(topic)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        *state.subscriptions.entry(topic.to_owned()).or_default() += 1;
        let position = state.committed.get(topic).copied().unwrap_or(0);

        Ok(Box::new(MemorySubscription {
            broker: self.clone(),
            topic: topic.to_owned(),
            position: Mutex::new(position),
        }))
    }
}

struct MemorySubscription {
    broker: MemoryBroker,
    topic: String,
    position: Mutex<i64>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&self) -> Result<InboundRecord, KafkaError> {
        loop {
            {
                let mut state = self.broker.lock();
                if let Some(remaining) = state.pull_failures.get_mut(&self.topic) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(KafkaError::MessageConsumption(
                            RDKafkaErrorCode::BrokerTransportFailure,
                        ));
                    }
                }

                let mut position = self.position.lock().unwrap();
                let log = state.logs.get(&self.topic);
                if let Some(payload) = log.and_then(|log| log.get(*position as usize)) {
                    let record = InboundRecord {
                        topic: self.topic.clone(),
                        partition: 0,
                        offset: *position,
                        payload: payload.clone(),
                    };
                    *position += 1;
                    return Ok(record);
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn commit(&self, _: i32, offset: i64) -> Result<(), KafkaError> {
        self.broker
            .lock()
            .committed
            .insert(self.topic.clone(), offset + 1);
        Ok(())
    }

    fn close(&self) {}
}
