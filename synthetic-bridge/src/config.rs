//! Bridge configuration loaded from TOML
//!
//! Handles:
//! - General settings (log level, pool file location, target station count)
//! - The station template: network parameters plus how new stations are generated
//! - Validation, so bad configuration fails at startup rather than mid-run

use crate::generator::models::GeneratorTemplate;
use crate::generator::sampler::{LocationTemplate, ValueDistribution};
use crate::station::Endpoint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration syntax: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Longest accepted interval (30 days)
pub const MAX_INTERVAL_SECS: f64 = 30.0 * 86_400.0;

/// Seconds as a `Duration`, clamped to `[0, MAX_INTERVAL_SECS]`
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.min(MAX_INTERVAL_SECS)).unwrap_or(Duration::ZERO)
}

fn check_interval(name: &str, secs: f64, allow_zero: bool) -> Result<(), ConfigError> {
    let lower_ok = if allow_zero { secs >= 0.0 } else { secs > 0.0 };
    if secs.is_finite() && lower_ok && secs <= MAX_INTERVAL_SECS {
        return Ok(());
    }
    let lower = if allow_zero { "[0" } else { "(0" };
    Err(ConfigError::Invalid(format!(
        "{name} must be within {lower}, {MAX_INTERVAL_SECS}] seconds, got {secs}"
    )))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pool_file_path() -> PathBuf {
    PathBuf::from("config/pool.json")
}

fn default_target_client_count() -> usize {
    1
}

fn default_spawn_delay() -> Option<f64> {
    Some(0.1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_pool_file_path")]
    pub pool_file_path: PathBuf,
    #[serde(default = "default_target_client_count")]
    pub target_client_count: usize,
    /// Pause between starting two stations
    #[serde(default = "default_spawn_delay")]
    pub client_spawn_delay_secs: Option<f64>,
    /// Periodic pool save while running
    pub checkpoint_interval_secs: Option<f64>,
    pub client_simulation: SimulationTemplate,
}

/// Network settings shared by every station created from one template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkParams {
    /// Lookup (discovery) service address
    #[serde(default)]
    pub lookup_host: String,
    #[serde(default = "default_true")]
    pub lookup_use_tls: bool,
    #[serde(default = "default_true")]
    pub collection_use_tls: bool,
    /// Fixed collection service address, bypasses discovery
    pub collection_address_override: Option<String>,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: f64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: f64,
}

fn default_true() -> bool {
    true
}

fn default_retry_interval() -> f64 {
    30.0
}

fn default_max_retries() -> u32 {
    10
}

fn default_polling_interval() -> f64 {
    60.0
}

fn default_request_timeout() -> f64 {
    10.0
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            lookup_host: "localhost:5001".to_string(),
            lookup_use_tls: true,
            collection_use_tls: true,
            collection_address_override: None,
            retry_interval_secs: default_retry_interval(),
            max_retries: default_max_retries(),
            polling_interval_secs: default_polling_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl NetworkParams {
    pub fn retry_interval(&self) -> Duration {
        seconds(self.retry_interval_secs)
    }

    pub fn polling_interval(&self) -> Duration {
        seconds(self.polling_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        seconds(self.request_timeout_secs)
    }

    pub fn lookup_endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.lookup_host.clone(),
            use_tls: self.lookup_use_tls,
        }
    }

    /// Fixed collection endpoint, when discovery is bypassed
    pub fn collection_override(&self) -> Option<Endpoint> {
        self.collection_address_override
            .as_deref()
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .map(|address| Endpoint {
                host: address.to_string(),
                use_tls: self.collection_use_tls,
            })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let has_override = self.collection_address_override.as_deref().is_some_and(|a| !a.trim().is_empty());
        if self.lookup_host.trim().is_empty() && !has_override {
            return Err(ConfigError::Invalid(
                "lookup_host is required unless collection_address_override is set".to_string(),
            ));
        }
        let intervals = [
            ("retry_interval_secs", self.retry_interval_secs),
            ("polling_interval_secs", self.polling_interval_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ];
        for (name, secs) in intervals {
            check_interval(name, secs, false)?;
        }
        Ok(())
    }
}

fn default_k_generation() -> ValueDistribution {
    ValueDistribution::fixed(3.0)
}

fn default_max_depth_generation() -> ValueDistribution {
    ValueDistribution::fixed(24.0)
}

/// Template from which new stations are minted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationTemplate {
    #[serde(flatten)]
    pub network: NetworkParams,
    #[serde(default)]
    pub location_generation: LocationTemplate,
    #[serde(default = "default_k_generation")]
    pub k_generation: ValueDistribution,
    #[serde(default = "default_max_depth_generation")]
    pub max_depth_generation: ValueDistribution,
    pub sensor_accuracy_generation: Option<ValueDistribution>,
    pub sensor_undefined_accuracy_chance: Option<f64>,
    /// Noise added on top of every generated reading
    pub noise: Option<ValueDistribution>,
    pub generator: GeneratorTemplate,
}

impl SimulationTemplate {
    pub fn new(network: NetworkParams, generator: GeneratorTemplate) -> Self {
        Self {
            network,
            location_generation: LocationTemplate::default(),
            k_generation: default_k_generation(),
            max_depth_generation: default_max_depth_generation(),
            sensor_accuracy_generation: None,
            sensor_undefined_accuracy_chance: None,
            noise: None,
            generator,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        let invalid = |context: &str, reason: String| ConfigError::Invalid(format!("{context}: {reason}"));

        self.location_generation.validate().map_err(|e| invalid("location_generation", e))?;
        self.k_generation.validate().map_err(|e| invalid("k_generation", e))?;
        self.max_depth_generation.validate().map_err(|e| invalid("max_depth_generation", e))?;
        if let Some(accuracy) = &self.sensor_accuracy_generation {
            accuracy.validate().map_err(|e| invalid("sensor_accuracy_generation", e))?;
        }
        if let Some(chance) = self.sensor_undefined_accuracy_chance {
            if !(0.0..=1.0).contains(&chance) {
                return Err(invalid("sensor_undefined_accuracy_chance", format!("must be within [0, 1], got {chance}")));
            }
        }
        if let Some(noise) = &self.noise {
            noise.validate().map_err(|e| invalid("noise", e))?;
        }
        self.generator
            .validate()
            .map_err(|e| invalid(self.generator.class_name(), e))
    }
}

impl BridgeConfig {
    pub fn new(pool_file_path: impl Into<PathBuf>, target_client_count: usize, client_simulation: SimulationTemplate) -> Self {
        Self {
            log_level: default_log_level(),
            pool_file_path: pool_file_path.into(),
            target_client_count,
            client_spawn_delay_secs: None,
            checkpoint_interval_secs: None,
            client_simulation,
        }
    }

    /// Load and validate the configuration file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(secs) = self.client_spawn_delay_secs {
            check_interval("client_spawn_delay_secs", secs, true)?;
        }
        if let Some(secs) = self.checkpoint_interval_secs {
            check_interval("checkpoint_interval_secs", secs, false)?;
        }
        self.client_simulation.validate()
    }

    pub fn client_spawn_delay(&self) -> Option<Duration> {
        self.client_spawn_delay_secs
            .filter(|secs| *secs > 0.0)
            .map(seconds)
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        self.checkpoint_interval_secs.map(seconds).filter(|period| !period.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::models::GeneratorTemplate;

    const SAMPLE: &str = r#"
        log_level = "debug"
        pool_file_path = "state/pool.json"
        target_client_count = 25
        checkpoint_interval_secs = 120

        [client_simulation]
        lookup_host = "tls.example:5001"
        lookup_use_tls = false
        retry_interval_secs = 5
        max_retries = 3
        polling_interval_secs = 15.5
        location_generation = { type = "uniform_random", area = [{ latitude = 47.0, longitude = 9.0 }, { latitude = 49.0, longitude = 12.0 }] }
        k_generation = { type = "normal_random", mean = 4, deviation = 1 }
        noise = { type = "normal_random", mean = 0.0, deviation = 0.5 }

        [client_simulation.generator]
        client_class = "coordinate_gradient"
        use_latitude = false
        decimal_accuracy = 1
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config = BridgeConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.target_client_count, 25);
        assert_eq!(config.pool_file_path, PathBuf::from("state/pool.json"));
        assert_eq!(config.client_simulation.network.max_retries, 3);
        assert!(!config.client_simulation.network.lookup_use_tls);
        assert!(config.client_simulation.network.collection_use_tls);
        assert_eq!(config.client_simulation.network.polling_interval(), Duration::from_millis(15_500));
        assert_eq!(config.checkpoint_interval(), Some(Duration::from_secs(120)));
        assert!(matches!(
            config.client_simulation.generator,
            GeneratorTemplate::CoordinateGradient(ref p) if !p.use_latitude && p.decimal_accuracy == 1
        ));
    }

    #[test]
    fn test_unknown_generator_kind_fails_fast() {
        let broken = SAMPLE.replace("\"coordinate_gradient\"", "\"perlin_noise\"");
        assert!(matches!(BridgeConfig::from_toml(&broken), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_lookup_host_is_invalid() {
        let broken = SAMPLE.replace("lookup_host = \"tls.example:5001\"", "");
        assert!(matches!(BridgeConfig::from_toml(&broken), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_override_replaces_lookup_host() {
        let with_override = SAMPLE.replace(
            "lookup_host = \"tls.example:5001\"",
            "collection_address_override = \"tms.example:5002\"",
        );
        let config = BridgeConfig::from_toml(&with_override).unwrap();
        assert_eq!(
            config.client_simulation.network.collection_override(),
            Some(Endpoint {
                host: "tms.example:5002".to_string(),
                use_tls: true,
            })
        );
    }

    #[test]
    fn test_non_positive_polling_interval_is_invalid() {
        let broken = SAMPLE.replace("polling_interval_secs = 15.5", "polling_interval_secs = 0");
        assert!(matches!(BridgeConfig::from_toml(&broken), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_oversized_intervals_are_invalid() {
        let retry = SAMPLE.replace("retry_interval_secs = 5", "retry_interval_secs = 1e30");
        assert!(matches!(BridgeConfig::from_toml(&retry), Err(ConfigError::Invalid(_))));
        let checkpoint = SAMPLE.replace("checkpoint_interval_secs = 120", "checkpoint_interval_secs = 1e30");
        assert!(matches!(BridgeConfig::from_toml(&checkpoint), Err(ConfigError::Invalid(_))));
        let spawn = SAMPLE.replace("target_client_count = 25", "target_client_count = 25\nclient_spawn_delay_secs = 1e300");
        assert!(matches!(BridgeConfig::from_toml(&spawn), Err(ConfigError::Invalid(_))));

        let longest = SAMPLE.replace("polling_interval_secs = 15.5", &format!("polling_interval_secs = {MAX_INTERVAL_SECS:.1}"));
        assert!(BridgeConfig::from_toml(&longest).is_ok());
    }

    #[test]
    fn test_interval_accessors_clamp_unvalidated_values() {
        let network = NetworkParams {
            retry_interval_secs: 1e30,
            polling_interval_secs: -1.0,
            request_timeout_secs: f64::NAN,
            ..NetworkParams::default()
        };
        assert_eq!(network.retry_interval(), Duration::from_secs(30 * 86_400));
        assert_eq!(network.polling_interval(), Duration::ZERO);
        assert_eq!(network.request_timeout(), Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = BridgeConfig::from_toml(include_str!("../../config/config.toml")).unwrap();
        assert_eq!(config.client_simulation.generator.class_name(), "skewed_diurnal_approximation");
        assert_eq!(config.client_spawn_delay(), Some(Duration::from_millis(100)));
        assert!(config.client_simulation.network.collection_override().is_none());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let result = BridgeConfig::load("/nonexistent/bridge.toml").await;
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
