use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all, BoxFuture, FutureExt, TryFutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::envelope::{Envelope, EnvelopeIdentity, Status};
use crate::error::{StepError, StoreError};
use crate::keys::{completed_set_key, failed_set_key, progress_key, EntityKey};
use crate::metrics::{STEP_DURATION, STEP_OUTCOMES};
use crate::sender::OutboundSender;
use crate::store::CheckpointStore;
use crate::time::TimeSource;

/// One derived-state record to persist once the step succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct StateWrite {
    pub key: String,
    pub value: serde_json::Value,
}

impl StateWrite {
    pub fn new<T: Serialize + ?Sized>(key: String, value: &T) -> Result<Self, StoreError> {
        let value = serde_json::to_value(value).map_err(|error| StoreError::Encode {
            key: key.clone(),
            error,
        })?;
        Ok(Self { key, value })
    }
}

/// What the domain logic decided. A rejection is a value, not an error:
/// it is recorded and the record is committed.
#[derive(Debug)]
pub enum StepOutcome {
    Completed { state: Vec<StateWrite> },
    Failed { reason: String },
}

/// The part of a processing stage that differs between stages: message
/// shape, entity key derivation, derived state and status envelopes.
#[async_trait]
pub trait Step: Send + Sync + 'static {
    type Message: DeserializeOwned + Send + Sync;

    fn name(&self) -> &'static str;

    fn envelope<'a>(&self, message: &'a Self::Message) -> &'a Envelope;

    /// `None` for stages that handle a whole transaction at once.
    fn entity(&self, message: &Self::Message) -> Option<EntityKey>;

    /// Read the derived state this message needs and run the domain logic.
    /// Nothing may be written here; writes happen through `StepOutcome`.
    async fn execute(
        &self,
        message: &Self::Message,
        store: &CheckpointStore,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, StepError>;

    /// Outbound envelope for a message of `activity`. Only identity is
    /// taken, so that messages which failed to decode can be reported.
    fn status_envelope(
        &self,
        trx_id: Uuid,
        activity: &str,
        status: Status,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> Envelope;
}

/// What a consume loop hands its records to.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok` means the record may be committed, `Err` means it must be
    /// redelivered.
    async fn process(&self, payload: &[u8], cancel: &CancellationToken) -> Result<(), StepError>;
}

pub struct StepProcessor<S: Step> {
    step: S,
    store: CheckpointStore,
    sender: Arc<dyn OutboundSender>,
    output_topic: String,
    time: Arc<dyn TimeSource + Send + Sync>,
}

impl<S: Step> StepProcessor<S> {
    pub fn new(
        step: S,
        store: CheckpointStore,
        sender: Arc<dyn OutboundSender>,
        output_topic: &str,
        time: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            step,
            store,
            sender,
            output_topic: output_topic.to_owned(),
            time,
        }
    }

    fn count(&self, outcome: &'static str) {
        let labels = [("step", self.step.name()), ("outcome", outcome)];
        metrics::counter!(STEP_OUTCOMES, &labels).increment(1);
    }

    /// Claim the key, run the domain logic and persist its outcome.
    async fn run(
        &self,
        message: &S::Message,
        key: &str,
        entity: Option<&EntityKey>,
        begin: DateTime<Utc>,
    ) -> Result<&'static str, StepError> {
        let envelope = self.step.envelope(message);
        self.store.log_begin(key, envelope, begin).await?;

        let outcome = self.step.execute(message, &self.store, begin).await?;
        let finish = self.time.now();

        match outcome {
            StepOutcome::Failed { reason } => {
                warn!(
                    step = self.step.name(),
                    trx_id = %envelope.trx_id,
                    key,
                    reason = %reason,
                    "step rejected"
                );
                let status = self.step.status_envelope(
                    envelope.trx_id,
                    &envelope.activity,
                    Status::Failed,
                    Some(reason.clone()),
                    finish,
                );
                let failed = entity.map(|entity| {
                    (
                        failed_set_key(&envelope.activity, &envelope.trx_id),
                        entity.member(),
                    )
                });

                let mut writes: Vec<BoxFuture<'_, Result<(), StepError>>> = vec![
                    self.store
                        .log_failed(key, envelope, begin, finish, &reason)
                        .err_into::<StepError>()
                        .boxed(),
                    self.sender
                        .send(&self.output_topic, &status)
                        .err_into::<StepError>()
                        .boxed(),
                ];
                if let Some((set_key, member)) = &failed {
                    writes.push(
                        self.store
                            .add_to_set(set_key, member)
                            .err_into::<StepError>()
                            .boxed(),
                    );
                }
                try_join_all(writes).await?;
                Ok("failed")
            }
            StepOutcome::Completed { state } => {
                let status = self.step.status_envelope(
                    envelope.trx_id,
                    &envelope.activity,
                    Status::Completed,
                    None,
                    finish,
                );
                let completed = entity.map(|entity| {
                    (
                        completed_set_key(&envelope.activity, &envelope.trx_id),
                        entity.member(),
                    )
                });

                let mut writes: Vec<BoxFuture<'_, Result<(), StepError>>> = state
                    .iter()
                    .map(|write| {
                        self.store
                            .save(&write.key, &write.value)
                            .err_into::<StepError>()
                            .boxed()
                    })
                    .collect();
                writes.push(
                    self.store
                        .log_finish(key, envelope, begin, finish)
                        .err_into::<StepError>()
                        .boxed(),
                );
                if let Some((set_key, member)) = &completed {
                    writes.push(
                        self.store
                            .add_to_set(set_key, member)
                            .err_into::<StepError>()
                            .boxed(),
                    );
                }
                writes.push(
                    self.sender
                        .send(&self.output_topic, &status)
                        .err_into::<StepError>()
                        .boxed(),
                );
                try_join_all(writes).await?;
                Ok("completed")
            }
        }
    }

    /// Best effort: the original error is what the caller sees, whatever
    /// happens here.
    async fn report_error(
        &self,
        trx_id: Uuid,
        activity: &str,
        entity: Option<&EntityKey>,
        record: Option<ErrorRecord<'_>>,
        cause: &StepError,
    ) {
        let finish = self.time.now();
        let detail = cause.to_string();
        let status = self.step.status_envelope(
            trx_id,
            activity,
            Status::Error,
            Some(detail.clone()),
            finish,
        );
        let failed = entity.map(|entity| (failed_set_key(activity, &trx_id), entity.member()));

        let mut writes: Vec<BoxFuture<'_, Result<(), StepError>>> = vec![self
            .sender
            .send(&self.output_topic, &status)
            .err_into::<StepError>()
            .boxed()];
        if let Some(record) = &record {
            writes.push(
                self.store
                    .log_error(record.key, record.envelope, record.begin, finish, &detail)
                    .err_into::<StepError>()
                    .boxed(),
            );
        }
        if let Some((set_key, member)) = &failed {
            writes.push(
                self.store
                    .add_to_set(set_key, member)
                    .err_into::<StepError>()
                    .boxed(),
            );
        }

        for result in join_all(writes).await {
            if let Err(error) = result {
                error!(
                    step = self.step.name(),
                    trx_id = %trx_id,
                    activity,
                    %error,
                    "failed to record step error"
                );
            }
        }
    }

    /// Drops the payload only when it does not even name its transaction.
    /// Otherwise the transaction is told about the error and the record is
    /// redelivered.
    async fn reject_undecodable(
        &self,
        payload: &[u8],
        error: serde_json::Error,
    ) -> Result<(), StepError> {
        let step = self.step.name();
        let identity: EnvelopeIdentity = match serde_json::from_slice(payload) {
            Ok(identity) => identity,
            Err(_) => {
                warn!(step, %error, "dropping undecodable payload");
                self.count("undecodable");
                return Ok(());
            }
        };

        let error = StepError::Malformed(error);
        error!(
            step,
            trx_id = %identity.trx_id,
            activity = %identity.activity,
            %error,
            "step errored"
        );
        self.count("error");
        self.report_error(identity.trx_id, &identity.activity, None, None, &error)
            .await;
        Err(error)
    }
}

/// Progress record to overwrite with `Error`.
struct ErrorRecord<'a> {
    key: &'a str,
    envelope: &'a Envelope,
    begin: DateTime<Utc>,
}

#[async_trait]
impl<S: Step> Processor for StepProcessor<S> {
    fn name(&self) -> &str {
        self.step.name()
    }

    async fn process(&self, payload: &[u8], cancel: &CancellationToken) -> Result<(), StepError> {
        let started = Instant::now();
        let step = self.step.name();

        let message: S::Message = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(error) => return self.reject_undecodable(payload, error).await,
        };

        let envelope = self.step.envelope(&message);
        let entity = self.step.entity(&message);
        let key = progress_key(&envelope.activity, &envelope.trx_id, entity.as_ref());

        let progress = match self.store.progress(&key).await {
            Ok(progress) => progress,
            Err(error) => {
                let error = StepError::from(error);
                error!(
                    step,
                    trx_id = %envelope.trx_id,
                    key = %key,
                    %error,
                    "failed to read progress"
                );
                self.count("error");
                // Its state is unknown, so the progress record is left alone
                self.report_error(
                    envelope.trx_id,
                    &envelope.activity,
                    entity.as_ref(),
                    None,
                    &error,
                )
                .await;
                return Err(error);
            }
        };

        if let Some(record) = progress {
            if !record.is_retryable() {
                debug!(step, key = %key, status = %record.status, "already handled, skipping");
                self.count("skipped");
                return Ok(());
            }
            info!(step, key = %key, "retrying after a previous error");
        }

        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let begin = self.time.now();
        let result = self.run(&message, &key, entity.as_ref(), begin).await;
        let labels = [("step", step)];
        metrics::histogram!(STEP_DURATION, &labels).record(started.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => {
                info!(
                    step,
                    key = %key,
                    outcome,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "step finished"
                );
                self.count(outcome);
                Ok(())
            }
            Err(error) => {
                error!(
                    step,
                    trx_id = %envelope.trx_id,
                    activity = %envelope.activity,
                    entity = ?entity.as_ref().map(EntityKey::member),
                    %error,
                    "step errored"
                );
                self.count("error");
                let record = ErrorRecord {
                    key: &key,
                    envelope,
                    begin,
                };
                self.report_error(
                    envelope.trx_id,
                    &envelope.activity,
                    entity.as_ref(),
                    Some(record),
                    &error,
                )
                .await;
                Err(error)
            }
        }
    }
}
