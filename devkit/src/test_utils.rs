/*!
# Test harness for fleet runs

Bundles a temporary pool file, mock services and a configuration builder so a
test can run the fleet, stop it and inspect what was persisted.
*/

use crate::service_stub::MockServices;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use synthetic_bridge::config::{BridgeConfig, NetworkParams, SimulationTemplate};
use synthetic_bridge::generator::models::{BlankTemplate, GeneratorTemplate};
use synthetic_bridge::manager::{FleetError, FleetManager, RunOptions, RunSummary};
use synthetic_bridge::pool::{Pool, PoolStore};
use tempfile::TempDir;

pub struct TestHarness {
    pub mocks: MockServices,
    pub config: BridgeConfig,
    dir: TempDir,
}

/// Network parameters tuned for paused-clock tests
pub fn fast_network() -> NetworkParams {
    NetworkParams {
        lookup_host: "lookup.test:5001".to_string(),
        retry_interval_secs: 1.0,
        max_retries: 3,
        polling_interval_secs: 10.0,
        request_timeout_secs: 5.0,
        ..NetworkParams::default()
    }
}

impl TestHarness {
    pub fn new() -> anyhow::Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let dir = tempfile::tempdir()?;
        let template = SimulationTemplate::new(fast_network(), GeneratorTemplate::Blank(BlankTemplate::default()));
        let config = BridgeConfig::new(dir.path().join("pool.json"), 3, template);
        Ok(Self {
            mocks: MockServices::new(),
            config,
            dir,
        })
    }

    pub fn with_target(mut self, count: usize) -> Self {
        self.config.target_client_count = count;
        self
    }

    pub fn with_generator(mut self, generator: GeneratorTemplate) -> Self {
        self.config.client_simulation.generator = generator;
        self
    }

    pub fn with_network(mut self, network: NetworkParams) -> Self {
        self.config.client_simulation.network = network;
        self
    }

    pub fn pool_path(&self) -> PathBuf {
        self.dir.path().join("pool.json")
    }

    pub fn store(&self) -> PoolStore {
        PoolStore::new(self.pool_path())
    }

    pub async fn stored_pool(&self) -> anyhow::Result<Pool> {
        Ok(self.store().load().await?)
    }

    /// Run the fleet until `shutdown` resolves
    pub async fn run_until(&self, options: RunOptions, shutdown: impl Future<Output = ()>) -> Result<RunSummary, FleetError> {
        tracing::info!("🧪 Fleet run {:?}, target {}", options, self.config.target_client_count);
        FleetManager::new(self.config.clone(), self.mocks.services())
            .run(options, shutdown)
            .await
    }

    /// Run the fleet for `duration` of (usually paused) tokio time, then stop it.
    ///
    /// The timer starts once the manager first polls it, after the stations were spawned.
    pub async fn run_for(&self, options: RunOptions, duration: Duration) -> Result<RunSummary, FleetError> {
        self.run_until(options, async move { tokio::time::sleep(duration).await })
            .await
    }

    /// Run without a stop signal; only returns once every station is terminal
    pub async fn run_to_completion(&self, options: RunOptions) -> Result<RunSummary, FleetError> {
        self.run_until(options, std::future::pending()).await
    }
}
