//! Synthetic Bridge - a fleet of simulated sensor stations
//!
//! Keeps a persistent pool of virtual stations and drives each of them through
//! discovery, registration and periodic reporting against a measurement-collection
//! service, or through graceful deregistration when the fleet is deleted.
//!
//! - `config`    : TOML configuration and the station template
//! - `generator` : synthetic value models
//! - `station`   : identity, configuration and runtime status of one station
//! - `pool`      : pool persistence and reconciliation
//! - `services`  : lookup / collection service traits and HTTP implementations
//! - `client`    : per-station lifecycle state machine
//! - `manager`   : fleet orchestration

pub mod client;
pub mod config;
pub mod generator;
pub mod manager;
pub mod pool;
pub mod services;
pub mod state;
pub mod station;

pub use client::{ClientReport, FleetCommand, SimulationClient};
pub use config::{BridgeConfig, ConfigError, NetworkParams, SimulationTemplate};
pub use manager::{run, FleetError, FleetManager, RunOptions, RunSummary};
pub use pool::{reconcile, Pool, PoolError, PoolStore};
pub use services::{CollectionService, LookupService, RegistrationRequest, ServiceError, Services};
pub use station::{ClientConfig, ClientState, Endpoint, Position, RuntimeStatus, SessionHandle, StationId, StationState};
