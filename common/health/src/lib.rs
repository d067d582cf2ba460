use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::OffsetDateTime;
use tracing::{debug, warn};

/// Liveness of every long-running loop of a worker.
///
/// Each consume loop, and the producer's statistics callback, registers a
/// component and must report healthy before its deadline elapses. The
/// process is healthy only while every registered component is.
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, body).into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, never reported
    Starting,
    HealthyUntil(OffsetDateTime),
    Unhealthy,
    /// Reported healthy once, then missed its deadline
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

fn write(components: &Components) -> RwLockWriteGuard<'_, HashMap<String, ComponentStatus>> {
    match components.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read(components: &Components) -> RwLockReadGuard<'_, HashMap<String, ComponentStatus>> {
    match components.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Reporting side of one component. Cheap to clone and usable from any
/// thread, including librdkafka's callback threads.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Must be called more often than the deadline given at registration.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() + self.deadline,
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        if status == ComponentStatus::Unhealthy {
            warn!(component = %self.component, "component reported unhealthy");
        }
        write(&self.components).insert(self.component.clone(), status);
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = read(&self.components);
        let now = OffsetDateTime::now_utc();

        let components: HashMap<String, ComponentStatus> = components
            .iter()
            .map(|(name, status)| {
                let status = match status {
                    ComponentStatus::HealthyUntil(until) if *until <= now => {
                        ComponentStatus::Stalled
                    }
                    other => other.clone(),
                };
                (name.clone(), status)
            })
            .collect();

        // Nothing registered yet means nothing is running
        let healthy = !components.is_empty()
            && components
                .values()
                .all(|status| matches!(status, ComponentStatus::HealthyUntil(_)));

        if healthy {
            debug!(registry = %self.name, "health check ok");
        } else {
            warn!(registry = %self.name, ?components, "health check failed");
        }
        HealthStatus {
            healthy,
            components,
        }
    }
}
