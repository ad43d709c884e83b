//! Station identity, configuration and runtime status
//!
//! A station is one simulated sensor:
//! - `ClientConfig`: identity, position, generator and network parameters (fixed at creation)
//! - `RuntimeStatus`: lifecycle state, session handle and failure counters (owned by its client)
//! - `ClientState`: both halves, the unit stored in the pool

use crate::config::NetworkParams;
use crate::generator::models::GeneratorKind;
use crate::generator::sampler::ValueDistribution;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable, never reused station identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(Uuid);

impl StationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Geographic coordinate in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.5}, {:.5})", self.latitude, self.longitude)
    }
}

/// Everything needed to recreate a station, persisted verbatim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub id: StationId,
    pub position: Position,
    /// Anonymity parameter handed to the collection service on registration
    pub k: u32,
    pub max_depth: u32,
    pub sensor_accuracy: Option<f64>,
    pub generator: GeneratorKind,
    pub noise: Option<ValueDistribution>,
    pub network: NetworkParams,
}

/// Lifecycle states of a station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StationState {
    New,
    Discovering,
    Registering,
    Active,
    Retrying,
    Failed,
    Deleting,
    Deleted,
}

impl StationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StationState::Failed | StationState::Deleted)
    }
}

impl fmt::Display for StationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StationState::New => "NEW",
            StationState::Discovering => "DISCOVERING",
            StationState::Registering => "REGISTERING",
            StationState::Active => "ACTIVE",
            StationState::Retrying => "RETRYING",
            StationState::Failed => "FAILED",
            StationState::Deleting => "DELETING",
            StationState::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// Lifecycle step that performs a remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Discover,
    Register,
    Poll,
    Deregister,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Discover => "discover",
            Step::Register => "register",
            Step::Poll => "poll",
            Step::Deregister => "deregister",
        };
        f.write_str(name)
    }
}

/// Collection-service endpoint resolved by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub use_tls: bool,
}

impl Endpoint {
    pub fn base_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}", scheme, self.host.trim_end_matches('/'))
    }
}

/// Credential returned by the collection service on registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub station_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub state: StationState,
    pub session: Option<SessionHandle>,
    pub endpoint: Option<Endpoint>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Step that was failing when the station entered RETRYING or FAILED
    pub failed_step: Option<Step>,
}

impl Default for RuntimeStatus {
    fn default() -> Self {
        Self {
            state: StationState::New,
            session: None,
            endpoint: None,
            last_success_at: None,
            consecutive_failures: 0,
            failed_step: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    pub config: ClientConfig,
    pub status: RuntimeStatus,
}

impl ClientState {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            status: RuntimeStatus::default(),
        }
    }

    pub fn id(&self) -> StationId {
        self.config.id
    }

    /// Reset the runtime status for a fresh process run.
    ///
    /// Registrations are not assumed to survive a restart: the station registers again in a
    /// normal run, and the kept session handle only lets delete mode deregister it.
    pub fn rehydrate(&mut self) {
        self.status = RuntimeStatus {
            session: self.status.session.take(),
            ..RuntimeStatus::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_ids_are_unique() {
        let a = StationId::new();
        let b = StationId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_terminal_states() {
        assert!(StationState::Failed.is_terminal());
        assert!(StationState::Deleted.is_terminal());
        assert!(!StationState::Retrying.is_terminal());
        assert!(!StationState::Deleting.is_terminal());
    }

    #[test]
    fn test_endpoint_base_url() {
        let endpoint = Endpoint { host: "tms.local:8443/".to_string(), use_tls: true };
        assert_eq!(endpoint.base_url(), "https://tms.local:8443");
        let plain = Endpoint { host: "127.0.0.1:5000".to_string(), use_tls: false };
        assert_eq!(plain.base_url(), "http://127.0.0.1:5000");
    }

    #[test]
    fn test_state_serializes_screaming_case() {
        let json = serde_json::to_string(&StationState::Deleting).unwrap();
        assert_eq!(json, "\"DELETING\"");
    }

    #[test]
    fn test_rehydrate_resets_status_keeps_session() {
        use crate::generator::models::BlankParams;

        let mut state = ClientState::new(ClientConfig {
            id: StationId::new(),
            position: Position::new(46.95, 7.45),
            k: 3,
            max_depth: 24,
            sensor_accuracy: None,
            generator: GeneratorKind::Blank(BlankParams { value: 0.0 }),
            noise: None,
            network: NetworkParams::default(),
        });
        let session = SessionHandle { station_id: "station-7".to_string(), token: "t".to_string() };
        state.status = RuntimeStatus {
            state: StationState::Active,
            session: Some(session.clone()),
            endpoint: Some(Endpoint { host: "tms.local".to_string(), use_tls: true }),
            last_success_at: Some(Utc::now()),
            consecutive_failures: 2,
            failed_step: Some(Step::Poll),
        };

        state.rehydrate();
        assert_eq!(
            state.status,
            RuntimeStatus {
                session: Some(session),
                ..RuntimeStatus::default()
            }
        );
    }
}
