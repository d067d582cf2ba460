use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::envelope::{Envelope, NettingMessage, Status};
use crate::error::StepError;
use crate::keys::{open_state_key, state_key, EntityKey};
use crate::step::{StateWrite, Step, StepOutcome};
use crate::store::CheckpointStore;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Current (today) and open (carried over from yesterday) position of one
/// investor/contract pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Positions {
    pub current: NettingMessage,
    pub open: NettingMessage,
}

/// Folds an incoming position into the stored ones. `Ok(Err(reason))` is a
/// business rejection; `Err` means the calculation itself broke.
#[async_trait]
pub trait NettingCalculator: Send + Sync {
    async fn net(
        &self,
        incoming: &NettingMessage,
        positions: Positions,
    ) -> anyhow::Result<Result<Positions, String>>;
}

/// Adds the incoming price to both positions.
pub struct PriceAccumulator;

#[async_trait]
impl NettingCalculator for PriceAccumulator {
    async fn net(
        &self,
        incoming: &NettingMessage,
        mut positions: Positions,
    ) -> anyhow::Result<Result<Positions, String>> {
        positions.current.price += incoming.price;
        positions.open.price += incoming.price;
        Ok(Ok(positions))
    }
}

pub struct NettingStep {
    calculator: Arc<dyn NettingCalculator>,
}

impl NettingStep {
    pub fn new(calculator: Arc<dyn NettingCalculator>) -> Self {
        Self { calculator }
    }

    fn entity_of(message: &NettingMessage) -> EntityKey {
        EntityKey::new([message.investor_id.as_str(), message.contract_id.as_str()])
    }
}

#[async_trait]
impl Step for NettingStep {
    type Message = NettingMessage;

    fn name(&self) -> &'static str {
        "netting"
    }

    fn envelope<'a>(&self, message: &'a NettingMessage) -> &'a Envelope {
        &message.envelope
    }

    fn entity(&self, message: &NettingMessage) -> Option<EntityKey> {
        Some(Self::entity_of(message))
    }

    async fn execute(
        &self,
        message: &NettingMessage,
        store: &CheckpointStore,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, StepError> {
        let entity = Self::entity_of(message);
        let today = now.format(DATE_FORMAT).to_string();
        let yesterday = (now - Duration::days(1)).format(DATE_FORMAT).to_string();
        let current_key = state_key(&today, &entity);
        let open_key = open_state_key(&yesterday, &entity);

        // First sighting of this pair: the message itself is the position
        let current = store
            .get::<NettingMessage>(&current_key)
            .await?
            .unwrap_or_else(|| message.clone());
        let open = store
            .get::<NettingMessage>(&open_key)
            .await?
            .unwrap_or_else(|| message.clone());

        let netted = self
            .calculator
            .net(message, Positions { current, open })
            .await
            .map_err(StepError::Domain)?;

        match netted {
            Ok(positions) => Ok(StepOutcome::Completed {
                state: vec![
                    StateWrite::new(current_key, &positions.current)?,
                    StateWrite::new(open_key, &positions.open)?,
                ],
            }),
            Err(reason) => Ok(StepOutcome::Failed { reason }),
        }
    }

    fn status_envelope(
        &self,
        trx_id: Uuid,
        activity: &str,
        status: Status,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> Envelope {
        Envelope::new(trx_id, activity, now, status, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common_redis::MockRedisClient;

    fn message(price: f64) -> NettingMessage {
        NettingMessage {
            envelope: Envelope::new(
                Uuid::new_v4(),
                "Netting",
                Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
                Status::Started,
                None,
            ),
            investor_id: "I1".to_owned(),
            contract_id: "C1".to_owned(),
            price,
        }
    }

    #[tokio::test]
    async fn state_keys_follow_the_processing_date() {
        let store = CheckpointStore::new(Arc::new(MockRedisClient::new()));
        let step = NettingStep::new(Arc::new(PriceAccumulator));
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 30, 0).unwrap();

        let outcome = step.execute(&message(10.0), &store, now).await.unwrap();
        let state = match outcome {
            StepOutcome::Completed { state } => state,
            other => panic!("expected completion, got {other:?}"),
        };
        let keys: Vec<&str> = state.iter().map(|write| write.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["DATA_2024-03-01_I1_C1", "DATA_OPEN_2024-02-29_I1_C1"]
        );
    }

    #[tokio::test]
    async fn stored_positions_are_accumulated() {
        let seen = message(25.0);
        let redis = MockRedisClient::new().with_value(
            "DATA_2024-03-01_I1_C1",
            &serde_json::to_string(&seen).unwrap(),
        );
        let store = CheckpointStore::new(Arc::new(redis));
        let step = NettingStep::new(Arc::new(PriceAccumulator));
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();

        let outcome = step.execute(&message(10.0), &store, now).await.unwrap();
        let state = match outcome {
            StepOutcome::Completed { state } => state,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(state[0].value["price"], 35.0);
        // no open position yet, so it is seeded from the message
        assert_eq!(state[1].value["price"], 20.0);
    }

    struct RejectAll;

    #[async_trait]
    impl NettingCalculator for RejectAll {
        async fn net(
            &self,
            _: &NettingMessage,
            _: Positions,
        ) -> anyhow::Result<Result<Positions, String>> {
            Ok(Err("contract is suspended".to_owned()))
        }
    }

    #[tokio::test]
    async fn rejections_are_outcomes() {
        let store = CheckpointStore::new(Arc::new(MockRedisClient::new()));
        let step = NettingStep::new(Arc::new(RejectAll));
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();

        let outcome = step.execute(&message(10.0), &store, now).await.unwrap();
        assert!(
            matches!(outcome, StepOutcome::Failed { reason } if reason == "contract is suspended")
        );
    }
}
