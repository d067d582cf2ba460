use std::sync::Arc;

use chrono::{DateTime, Utc};
use common_redis::{Client, CustomRedisError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::envelope::{Envelope, Status};
use crate::error::StoreError;

/// How far one `(activity, trxId[, entity])` has gotten. Overwritten on
/// every transition, never appended to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub trx_id: Uuid,
    pub activity: String,
    pub status: Status,
    pub begin: Option<DateTime<Utc>>,
    pub finish: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ProgressRecord {
    /// Only `Error` may be picked up again; any other status means someone
    /// already handled, or is handling, this key.
    pub fn is_retryable(&self) -> bool {
        self.status == Status::Error
    }
}

/// JSON-over-Redis adapter for progress records, derived state and
/// outcome sets. Read-your-write per key is all it promises.
#[derive(Clone)]
pub struct CheckpointStore {
    client: Arc<dyn Client + Send + Sync>,
}

impl CheckpointStore {
    pub fn new(client: Arc<dyn Client + Send + Sync>) -> Self {
        Self { client }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let raw = match self.client.get(key.to_owned()).await {
            Ok(raw) => raw,
            Err(CustomRedisError::NotFound) => return Ok(None),
            Err(error) => {
                return Err(StoreError::Redis {
                    key: key.to_owned(),
                    error,
                })
            }
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|error| StoreError::Malformed {
                key: key.to_owned(),
                error,
            })
    }

    pub async fn save<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|error| StoreError::Encode {
            key: key.to_owned(),
            error,
        })?;

        self.client
            .set(key.to_owned(), raw)
            .await
            .map_err(|error| StoreError::Redis {
                key: key.to_owned(),
                error,
            })
    }

    pub async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.client
            .sadd(key.to_owned(), member.to_owned())
            .await
            .map_err(|error| StoreError::Redis {
                key: key.to_owned(),
                error,
            })
    }

    pub async fn progress(&self, key: &str) -> Result<Option<ProgressRecord>, StoreError> {
        self.get(key).await
    }

    pub async fn log_begin(
        &self,
        key: &str,
        envelope: &Envelope,
        begin: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.log(key, envelope, Status::Started, begin, None, None)
            .await
    }

    pub async fn log_finish(
        &self,
        key: &str,
        envelope: &Envelope,
        begin: DateTime<Utc>,
        finish: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.log(key, envelope, Status::Completed, begin, Some(finish), None)
            .await
    }

    pub async fn log_failed(
        &self,
        key: &str,
        envelope: &Envelope,
        begin: DateTime<Utc>,
        finish: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.log(
            key,
            envelope,
            Status::Failed,
            begin,
            Some(finish),
            Some(reason.to_owned()),
        )
        .await
    }

    pub async fn log_error(
        &self,
        key: &str,
        envelope: &Envelope,
        begin: DateTime<Utc>,
        finish: DateTime<Utc>,
        detail: &str,
    ) -> Result<(), StoreError> {
        self.log(
            key,
            envelope,
            Status::Error,
            begin,
            Some(finish),
            Some(detail.to_owned()),
        )
        .await
    }

    async fn log(
        &self,
        key: &str,
        envelope: &Envelope,
        status: Status,
        begin: DateTime<Utc>,
        finish: Option<DateTime<Utc>>,
        message: Option<String>,
    ) -> Result<(), StoreError> {
        let record = ProgressRecord {
            trx_id: envelope.trx_id,
            activity: envelope.activity.clone(),
            status,
            begin: Some(begin),
            finish,
            message,
        };
        debug!(key, status = %status, "writing progress record");
        self.save(key, &record).await
    }
}
