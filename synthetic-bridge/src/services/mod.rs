//! External collaborators of a station
//!
//! - `LookupService`: position -> collection-service endpoint
//! - `CollectionService`: register, submit readings, deregister
//!
//! Stations only see these traits; `http` holds the reqwest implementations and the
//! devkit crate provides scripted in-memory ones.

pub mod http;

use crate::station::{ClientConfig, Endpoint, Position, SessionHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    /// Connection problems, timeouts, 5xx and 429 responses
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no collection service is responsible for this position")]
    NotFound,
    /// Explicit refusal by the remote service
    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Transport(_) | ServiceError::NotFound)
    }
}

/// Station description sent on registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub position: Position,
    pub k: u32,
    pub max_depth: u32,
    pub sensor_accuracy: Option<f64>,
    pub client_class: String,
}

impl RegistrationRequest {
    pub fn for_station(config: &ClientConfig) -> Self {
        Self {
            position: config.position,
            k: config.k,
            max_depth: config.max_depth,
            sensor_accuracy: config.sensor_accuracy,
            client_class: config.generator.class_name().to_string(),
        }
    }
}

#[async_trait]
pub trait LookupService: Send + Sync {
    /// Ask the lookup service at `service` which collection endpoint owns `position`
    async fn lookup(&self, service: &Endpoint, position: &Position) -> Result<Endpoint, ServiceError>;
}

#[async_trait]
pub trait CollectionService: Send + Sync {
    async fn register(&self, endpoint: &Endpoint, request: &RegistrationRequest) -> Result<SessionHandle, ServiceError>;

    async fn submit_reading(
        &self,
        endpoint: &Endpoint,
        session: &SessionHandle,
        timestamp: DateTime<Utc>,
        value: f64,
    ) -> Result<(), ServiceError>;

    async fn deregister(&self, endpoint: &Endpoint, session: &SessionHandle) -> Result<(), ServiceError>;
}

/// Service handles shared by every station of a fleet
#[derive(Clone)]
pub struct Services {
    pub lookup: Arc<dyn LookupService>,
    pub collection: Arc<dyn CollectionService>,
}

impl Services {
    pub fn new(lookup: Arc<dyn LookupService>, collection: Arc<dyn CollectionService>) -> Self {
        Self { lookup, collection }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ServiceError::Transport("connection refused".into()).is_retryable());
        assert!(ServiceError::NotFound.is_retryable());
        assert!(!ServiceError::Rejected { status: 400, body: String::new() }.is_retryable());
    }
}
