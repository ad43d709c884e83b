//! Fleet manager - reconciles the pool and supervises one task per station
//!
//! Run sequence:
//! 1. optional reset of the pool file, then load (missing = empty, corrupt = fatal)
//! 2. reconcile to `target_client_count` and persist the new identities right away
//!    (skipped in delete mode, which never mints stations)
//! 3. rehydrate and spawn one `SimulationClient` per selected station
//! 4. supervise: collect reports, checkpoint, forward the shutdown request
//! 5. persist a snapshot of every status cell once all tasks are done

use crate::client::{ClientReport, FleetCommand, SimulationClient};
use crate::config::{BridgeConfig, ConfigError};
use crate::pool::{reconcile, Pool, PoolError, PoolStore};
use crate::services::Services;
use crate::state::{new_state, snapshot, Shared};
use crate::station::{RuntimeStatus, StationId, StationState};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Errors that abort a whole run
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Discard the persisted pool before reconciling
    pub reset: bool,
    /// Deregister and remove every pooled station instead of running them
    pub delete: bool,
}

/// Where every station ended up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub active: usize,
    pub failed: usize,
    pub deleted: usize,
    /// Subset of `deleted` never confirmed by the collection service
    pub forced_deletions: usize,
    /// Stopped before reaching ACTIVE or a terminal state
    pub stopped: usize,
}

impl RunSummary {
    fn record(&mut self, report: &ClientReport) {
        match report.state {
            StationState::Failed => self.failed += 1,
            StationState::Deleted => {
                self.deleted += 1;
                if report.forced_deletion {
                    self.forced_deletions += 1;
                }
            }
            StationState::Active => self.active += 1,
            _ => self.stopped += 1,
        }
    }
}

pub struct FleetManager {
    config: BridgeConfig,
    store: PoolStore,
    services: Services,
}

async fn checkpoint_tick(checkpoint: &mut Option<Interval>) {
    match checkpoint {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl FleetManager {
    pub fn new(config: BridgeConfig, services: Services) -> Self {
        let store = PoolStore::new(&config.pool_file_path);
        Self { config, store, services }
    }

    /// Load, reconcile and persist the pool; delete mode only works on what is stored
    async fn prepare_pool(&self, options: RunOptions) -> Result<Pool, FleetError> {
        if options.reset {
            info!("Reset requested, discarding stored pool");
            self.store.reset().await?;
        }
        let stored = self.store.load().await?;
        if options.delete {
            debug!(stored = stored.len(), "Delete mode, skipping reconciliation");
            return Ok(stored);
        }
        let pool = {
            let mut rng = rand::thread_rng();
            reconcile(stored, self.config.target_client_count, &self.config.client_simulation, &mut rng)
        };
        self.store.save(&pool).await?;
        Ok(pool)
    }

    /// Copy every live status cell back into the pool
    fn collect(pool: &mut Pool, cells: &BTreeMap<StationId, Shared<RuntimeStatus>>) {
        for (id, cell) in cells {
            if let Some(state) = pool.get_mut(id) {
                state.status = snapshot(cell);
            }
        }
    }

    /// Run the fleet until `shutdown` resolves (or every station has terminated)
    pub async fn run(&self, options: RunOptions, shutdown: impl Future<Output = ()>) -> Result<RunSummary, FleetError> {
        self.config.validate()?;
        let mut pool = self.prepare_pool(options).await?;

        // Normal runs use the first target_client_count stations, deletion covers all of them
        let selected: Vec<StationId> = if options.delete {
            pool.ids()
        } else {
            pool.ids().into_iter().take(self.config.target_client_count).collect()
        };
        info!(
            "Starting {} of {} pooled stations ({} mode)",
            selected.len(),
            pool.len(),
            if options.delete { "delete" } else { "run" }
        );

        let initial = if options.delete { FleetCommand::Delete } else { FleetCommand::Run };
        let (command_tx, command_rx) = watch::channel(initial);
        let spawn_delay = self.config.client_spawn_delay().unwrap_or(Duration::ZERO);

        let mut cells: BTreeMap<StationId, Shared<RuntimeStatus>> = BTreeMap::new();
        let mut tasks = JoinSet::new();
        for (index, id) in selected.iter().enumerate() {
            let Some(state) = pool.get_mut(id) else { continue };
            state.rehydrate();
            let cell = new_state(state.status.clone());
            cells.insert(*id, cell.clone());

            let client = SimulationClient::new(state.config.clone(), cell, self.services.clone())
                .with_start_delay(spawn_delay.mul_f64(index as f64));
            tasks.spawn(client.run(command_rx.clone()));
        }
        drop(command_rx);

        let mut checkpoint = self.config.checkpoint_interval().map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let mut summary = RunSummary::default();
        let mut shutdown = std::pin::pin!(shutdown);
        let mut stopping = false;

        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok(report) => {
                            summary.record(&report);
                            if report.state == StationState::Deleted {
                                cells.remove(&report.id);
                                pool.remove(&report.id);
                                Self::collect(&mut pool, &cells);
                                self.store.save(&pool).await?;
                                debug!(station = %report.id, remaining = pool.len(), "Removed station from pool");
                            }
                        }
                        Err(e) => error!("Station task aborted: {}", e),
                    }
                }
                _ = &mut shutdown, if !stopping => {
                    info!("Stop requested, waiting for {} stations to settle", tasks.len());
                    stopping = true;
                    command_tx.send_replace(FleetCommand::Stop);
                }
                _ = checkpoint_tick(&mut checkpoint) => {
                    Self::collect(&mut pool, &cells);
                    if let Err(e) = self.store.save(&pool).await {
                        warn!("Checkpoint failed: {}", e);
                    }
                }
            }
        }

        if !stopping && !options.delete && !selected.is_empty() {
            warn!("Every station reached a terminal state, nothing left to run");
        }

        Self::collect(&mut pool, &cells);
        self.store.save(&pool).await?;
        info!(
            active = summary.active,
            failed = summary.failed,
            deleted = summary.deleted,
            forced_deletions = summary.forced_deletions,
            stopped = summary.stopped,
            remaining = pool.len(),
            "Fleet run finished"
        );
        if summary.forced_deletions > 0 {
            warn!(
                "{} stations were removed locally without confirmation from the collection service",
                summary.forced_deletions
            );
        }
        Ok(summary)
    }
}

/// Build a manager for `config` and run it once
pub async fn run(
    config: BridgeConfig,
    options: RunOptions,
    services: Services,
    shutdown: impl Future<Output = ()>,
) -> Result<RunSummary, FleetError> {
    FleetManager::new(config, services).run(options, shutdown).await
}
