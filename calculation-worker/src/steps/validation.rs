use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::envelope::{Envelope, Status};
use crate::error::StepError;
use crate::keys::EntityKey;
use crate::step::{Step, StepOutcome};
use crate::store::CheckpointStore;

pub enum Verdict {
    Valid,
    Invalid(String),
}

/// Business validation of one whole transaction. Returning `Err` means the
/// check itself could not run and the transaction will be retried.
#[async_trait]
pub trait ValidationRule: Send + Sync {
    async fn validate(&self, envelope: &Envelope) -> anyhow::Result<Verdict>;
}

pub struct AcceptAll;

#[async_trait]
impl ValidationRule for AcceptAll {
    async fn validate(&self, _: &Envelope) -> anyhow::Result<Verdict> {
        Ok(Verdict::Valid)
    }
}

/// Validates a transaction as a whole and announces the stage that follows.
pub struct ValidationStep {
    rule: Arc<dyn ValidationRule>,
    next_activity: String,
}

impl ValidationStep {
    pub fn new(rule: Arc<dyn ValidationRule>, next_activity: &str) -> Self {
        Self {
            rule,
            next_activity: next_activity.to_owned(),
        }
    }
}

#[async_trait]
impl Step for ValidationStep {
    type Message = Envelope;

    fn name(&self) -> &'static str {
        "validation"
    }

    fn envelope<'a>(&self, message: &'a Envelope) -> &'a Envelope {
        message
    }

    fn entity(&self, _: &Envelope) -> Option<EntityKey> {
        None
    }

    async fn execute(
        &self,
        message: &Envelope,
        _: &CheckpointStore,
        _: DateTime<Utc>,
    ) -> Result<StepOutcome, StepError> {
        match self.rule.validate(message).await.map_err(StepError::Domain)? {
            Verdict::Valid => Ok(StepOutcome::Completed { state: Vec::new() }),
            Verdict::Invalid(reason) => Ok(StepOutcome::Failed { reason }),
        }
    }

    fn status_envelope(
        &self,
        trx_id: Uuid,
        _: &str,
        status: Status,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> Envelope {
        let text = match (status, detail) {
            (Status::Error, Some(error)) => format!("Validation process failed because: {error}"),
            (_, Some(detail)) => detail,
            (_, None) => "Validation process completed".to_owned(),
        };
        Envelope::new(
            trx_id,
            self.next_activity.as_str(),
            now,
            status,
            Some(text),
        )
    }
}
