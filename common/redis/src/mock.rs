use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{Client, CustomRedisError};

/// In-memory stand-in for Redis with read-your-write semantics.
///
/// Every command is recorded, values and sets can be seeded up front, and
/// failures can be injected per `(op, key)` either for the next call only
/// or for every call.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    values: HashMap<String, String>,
    sets: HashMap<String, BTreeSet<String>>,
    failures: HashMap<(String, String), Failure>,
    calls: Vec<MockRedisCall>,
}

struct Failure {
    error: CustomRedisError,
    remaining: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub value: Option<String>,
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn with_value(self, key: &str, value: &str) -> Self {
        self.lock().values.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Fail the next `op` ("get", "set", "sadd") on `key`, then behave normally.
    pub fn fail_next(self, op: &str, key: &str, error: CustomRedisError) -> Self {
        self.lock().failures.insert(
            (op.to_owned(), key.to_owned()),
            Failure {
                error,
                remaining: Some(1),
            },
        );
        self
    }

    /// Fail every `op` on `key` until `heal` is called.
    pub fn fail_always(self, op: &str, key: &str, error: CustomRedisError) -> Self {
        self.lock().failures.insert(
            (op.to_owned(), key.to_owned()),
            Failure {
                error,
                remaining: None,
            },
        );
        self
    }

    pub fn heal(&self, op: &str, key: &str) {
        self.lock()
            .failures
            .remove(&(op.to_owned(), key.to_owned()));
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().values.get(key).cloned()
    }

    pub fn members(&self, key: &str) -> BTreeSet<String> {
        self.lock().sets.get(key).cloned().unwrap_or_default()
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Records the call, then returns the injected failure if one is armed.
    fn intercept(
        state: &mut MockState,
        op: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), CustomRedisError> {
        state.calls.push(MockRedisCall {
            op: op.to_owned(),
            key: key.to_owned(),
            value: value.map(str::to_owned),
        });

        let id = (op.to_owned(), key.to_owned());
        let Some(failure) = state.failures.get_mut(&id) else {
            return Ok(());
        };
        let error = failure.error.clone();
        let remaining = failure.remaining.map(|n| n.saturating_sub(1));
        failure.remaining = remaining;
        if remaining == Some(0) {
            state.failures.remove(&id);
        }
        Err(error)
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, key: String) -> Result<String, CustomRedisError> {
        let mut state = self.lock();
        Self::intercept(&mut state, "get", &key, None)?;

        state
            .values
            .get(&key)
            .cloned()
            .ok_or(CustomRedisError::NotFound)
    }

    async fn set(&self, key: String, value: String) -> Result<(), CustomRedisError> {
        let mut state = self.lock();
        Self::intercept(&mut state, "set", &key, Some(&value))?;

        state.values.insert(key, value);
        Ok(())
    }

    async fn sadd(&self, key: String, member: String) -> Result<(), CustomRedisError> {
        let mut state = self.lock();
        Self::intercept(&mut state, "sadd", &key, Some(&member))?;

        state.sets.entry(key).or_default().insert(member);
        Ok(())
    }
}
