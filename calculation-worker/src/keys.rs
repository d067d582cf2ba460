//! Key layout of the dedup/checkpoint store. These formats are shared with
//! every other deployment reading the same Redis, so they must not change.

use uuid::Uuid;

/// Business-entity key parts of a multi-entity step, in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityKey {
    parts: Vec<String>,
}

impl EntityKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Member recorded in the outcome sets: the parts concatenated.
    pub fn member(&self) -> String {
        self.parts.concat()
    }
}

fn with_parts(mut key: String, parts: &[String]) -> String {
    for part in parts {
        key.push('_');
        key.push_str(part);
    }
    key
}

/// `LOG_{activity}_{trxId}[_{part}...]`
pub fn progress_key(activity: &str, trx_id: &Uuid, entity: Option<&EntityKey>) -> String {
    let parts = entity.map(EntityKey::parts).unwrap_or_default();
    with_parts(format!("LOG_{activity}_{trx_id}"), parts)
}

/// `DATA_{date}_{part}...`
pub fn state_key(date: &str, entity: &EntityKey) -> String {
    with_parts(format!("DATA_{date}"), entity.parts())
}

/// `DATA_OPEN_{prevDate}_{part}...`
pub fn open_state_key(previous_date: &str, entity: &EntityKey) -> String {
    with_parts(format!("DATA_OPEN_{previous_date}"), entity.parts())
}

/// `FAILED_{activity}_{trxId}`
pub fn failed_set_key(activity: &str, trx_id: &Uuid) -> String {
    format!("FAILED_{activity}_{trx_id}")
}

/// `COMPLETED_{activity}_{trxId}`
pub fn completed_set_key(activity: &str, trx_id: &Uuid) -> String {
    format!("COMPLETED_{activity}_{trx_id}")
}
