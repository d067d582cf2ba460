use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Processing status, both on the wire and in progress records.
///
/// Always written by name. Reading also accepts any casing of the name and
/// the numeric codes 0 to 3, in declaration order.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Started,
    Error,
    Failed,
    Completed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Started => "Started",
            Status::Error => "Error",
            Status::Failed => "Failed",
            Status::Completed => "Completed",
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStatus {
    Code(u64),
    Name(String),
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let status = match RawStatus::deserialize(deserializer)? {
            RawStatus::Code(0) => Status::Started,
            RawStatus::Code(1) => Status::Error,
            RawStatus::Code(2) => Status::Failed,
            RawStatus::Code(3) => Status::Completed,
            RawStatus::Code(code) => {
                return Err(de::Error::custom(format!("unknown status code {code}")))
            }
            RawStatus::Name(name) => match name.to_ascii_lowercase().as_str() {
                "started" => Status::Started,
                "error" => Status::Error,
                "failed" => Status::Failed,
                "completed" => Status::Completed,
                _ => return Err(de::Error::custom(format!("unknown status {name:?}"))),
            },
        };
        Ok(status)
    }
}

/// RFC 3339, or an ISO-8601 local date-time without offset taken as UTC.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|error| de::Error::custom(format!("invalid timestamp {raw:?}: {error}")))
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one unit of work at one stage. `trx_id` is stable across
/// retries and stages; a new `activity` for the same `trx_id` is the next
/// stage of the same business transaction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub trx_id: Uuid,
    pub activity: String,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub status: Status,
    #[serde(default)]
    pub message: Option<String>,
}

impl Envelope {
    pub fn new(
        trx_id: Uuid,
        activity: impl Into<String>,
        timestamp: DateTime<Utc>,
        status: Status,
        message: Option<String>,
    ) -> Self {
        Self {
            trx_id,
            activity: activity.into(),
            timestamp,
            status,
            message,
        }
    }
}

/// What can still be read from a message that does not decode as a whole:
/// enough to address a status envelope to its transaction.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeIdentity {
    pub trx_id: Uuid,
    pub activity: String,
}

/// Inbound message of the Netting step: the envelope plus one position.
/// It doubles as the shape of the position state kept in the store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NettingMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub investor_id: String,
    pub contract_id: String,
    pub price: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn envelope_wire_shape() {
        let trx_id = Uuid::parse_str("5f0c7b8e-0d7d-4a7e-9a53-2b0b3a4c1d11").unwrap();
        let envelope = Envelope::new(
            trx_id,
            "Netting",
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap(),
            Status::Completed,
            None,
        );

        assert_json_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "trxId": "5f0c7b8e-0d7d-4a7e-9a53-2b0b3a4c1d11",
                "activity": "Netting",
                "timestamp": "2024-03-01T08:30:00Z",
                "status": "Completed",
                "message": null,
            })
        );
    }

    #[test]
    fn netting_message_is_flat() {
        let raw = json!({
            "trxId": "5f0c7b8e-0d7d-4a7e-9a53-2b0b3a4c1d11",
            "activity": "Netting",
            "timestamp": "2024-03-01T08:30:00.123Z",
            "status": "Started",
            "investorId": "I1",
            "contractId": "C1",
            "price": 10,
            "somethingUpstreamAdded": true,
        });

        let message: NettingMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(message.envelope.activity, "Netting");
        assert_eq!(message.envelope.message, None);
        assert_eq!(message.investor_id, "I1");
        assert_eq!(message.contract_id, "C1");
        assert_eq!(message.price, 10.0);
    }

    #[test]
    fn timestamps_without_offset_are_utc() {
        let raw = json!({
            "trxId": "5f0c7b8e-0d7d-4a7e-9a53-2b0b3a4c1d11",
            "activity": "Validation",
            "timestamp": "2024-03-01T08:30:00.1234567",
            "status": "Started",
        });
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(
            envelope.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap()
                + chrono::Duration::nanoseconds(123_456_700)
        );

        let offset = json!({
            "trxId": "5f0c7b8e-0d7d-4a7e-9a53-2b0b3a4c1d11",
            "activity": "Validation",
            "timestamp": "2024-03-01T10:30:00+02:00",
            "status": "Started",
        });
        let envelope: Envelope = serde_json::from_value(offset).unwrap();
        assert_eq!(
            envelope.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap()
        );
    }

    #[test]
    fn numeric_and_lowercase_statuses_are_read() {
        let codes: Vec<Status> = serde_json::from_value(json!([0, 1, 2, 3])).unwrap();
        assert_eq!(
            codes,
            vec![
                Status::Started,
                Status::Error,
                Status::Failed,
                Status::Completed
            ]
        );
        let named: Status = serde_json::from_value(json!("completed")).unwrap();
        assert_eq!(named, Status::Completed);
        assert!(serde_json::from_value::<Status>(json!(7)).is_err());
    }

    #[test]
    fn flattened_netting_message_accepts_numeric_status() {
        let raw = json!({
            "trxId": "5f0c7b8e-0d7d-4a7e-9a53-2b0b3a4c1d11",
            "activity": "Netting",
            "timestamp": "2024-03-01T08:30:00",
            "status": 0,
            "investorId": "I1",
            "contractId": "C1",
            "price": 10.5,
        });
        let message: NettingMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(message.envelope.status, Status::Started);
        assert_eq!(message.price, 10.5);
    }

    #[test]
    fn identity_survives_a_broken_payload() {
        let raw = json!({
            "trxId": "5f0c7b8e-0d7d-4a7e-9a53-2b0b3a4c1d11",
            "activity": "Netting",
            "price": "ten",
        });
        assert!(serde_json::from_value::<NettingMessage>(raw.clone()).is_err());

        let identity: EnvelopeIdentity = serde_json::from_value(raw).unwrap();
        assert_eq!(identity.activity, "Netting");
    }

    #[test]
    fn unknown_status_is_rejected() {
        let raw = json!({
            "trxId": "5f0c7b8e-0d7d-4a7e-9a53-2b0b3a4c1d11",
            "activity": "Validation",
            "timestamp": "2024-03-01T08:30:00Z",
            "status": "Pending",
        });
        assert!(serde_json::from_value::<Envelope>(raw).is_err());
    }
}
