//! Station pool persistence
//!
//! The pool is the full set of stations managed by one bridge instance. It is
//! stored as a single JSON document and written atomically (temp file + rename).
//!
//! - missing file  -> empty pool
//! - corrupt file  -> fatal `PoolError::Corrupt`, never silently replaced: a fresh
//!   pool would orphan every registration held by the old one

use crate::config::SimulationTemplate;
use crate::station::{ClientConfig, ClientState, StationId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const POOL_FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to access pool file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("pool file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("failed to serialize pool: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// In-memory pool, keyed by station id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pool {
    stations: BTreeMap<StationId, ClientState>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn get(&self, id: &StationId) -> Option<&ClientState> {
        self.stations.get(id)
    }

    pub fn get_mut(&mut self, id: &StationId) -> Option<&mut ClientState> {
        self.stations.get_mut(id)
    }

    pub fn contains(&self, id: &StationId) -> bool {
        self.stations.contains_key(id)
    }

    pub fn insert(&mut self, state: ClientState) -> Option<ClientState> {
        self.stations.insert(state.id(), state)
    }

    pub fn remove(&mut self, id: &StationId) -> Option<ClientState> {
        self.stations.remove(id)
    }

    pub fn ids(&self) -> Vec<StationId> {
        self.stations.keys().copied().collect()
    }

    pub fn iter(&self) -> btree_map::Values<'_, StationId, ClientState> {
        self.stations.values()
    }

    pub fn iter_mut(&mut self) -> btree_map::ValuesMut<'_, StationId, ClientState> {
        self.stations.values_mut()
    }
}

impl FromIterator<ClientState> for Pool {
    fn from_iter<I: IntoIterator<Item = ClientState>>(iter: I) -> Self {
        let mut pool = Pool::new();
        for state in iter {
            pool.insert(state);
        }
        pool
    }
}

/// On-disk layout
#[derive(Serialize, Deserialize)]
struct PoolFile {
    version: u32,
    stations: BTreeMap<StationId, ClientState>,
}

/// Owner of the pool file
#[derive(Debug, Clone)]
pub struct PoolStore {
    path: PathBuf,
}

impl PoolStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> PoolError {
        PoolError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> PoolError {
        PoolError::Corrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    /// Read the persisted pool; a missing file is an empty pool
    pub async fn load(&self) -> Result<Pool, PoolError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("No pool file at {}, starting with an empty pool", self.path.display());
                return Ok(Pool::new());
            }
            Err(e) if e.kind() == ErrorKind::InvalidData => return Err(self.corrupt(e.to_string())),
            Err(e) => return Err(self.io_error(e)),
        };

        let file: PoolFile = serde_json::from_str(&content).map_err(|e| self.corrupt(e.to_string()))?;
        if file.version != POOL_FORMAT_VERSION {
            return Err(self.corrupt(format!(
                "unsupported format version {} (expected {})",
                file.version, POOL_FORMAT_VERSION
            )));
        }
        if let Some((key, state)) = file.stations.iter().find(|(key, state)| **key != state.id()) {
            return Err(self.corrupt(format!("entry {} holds station {}", key, state.id())));
        }

        let mut per_class: BTreeMap<&str, usize> = BTreeMap::new();
        for state in file.stations.values() {
            *per_class.entry(state.config.generator.class_name()).or_insert(0) += 1;
        }
        info!("Loaded {} stations from {}: {:?}", file.stations.len(), self.path.display(), per_class);

        Ok(Pool {
            stations: file.stations,
        })
    }

    /// Atomically replace the pool file with `pool`
    pub async fn save(&self, pool: &Pool) -> Result<(), PoolError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| self.io_error(e))?;
        }

        let file = PoolFile {
            version: POOL_FORMAT_VERSION,
            stations: pool.stations.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let mut tmp_name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        tokio::fs::write(&tmp_path, content).await.map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| self.io_error(e))?;

        debug!("Stored {} stations in {}", pool.len(), self.path.display());
        Ok(())
    }

    /// Discard the persisted pool entirely
    pub async fn reset(&self) -> Result<(), PoolError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Discarded existing pool file {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

/// Fill the pool up to `target_count` fresh stations.
///
/// Existing stations are never removed or modified, even if the template changed
/// since they were created, so one pool can hold stations of several kinds.
pub fn reconcile<R: Rng + ?Sized>(mut pool: Pool, target_count: usize, template: &SimulationTemplate, rng: &mut R) -> Pool {
    let existing = pool.len();
    if existing >= target_count {
        return pool;
    }

    debug!("Generating {} new stations", target_count - existing);
    for index in existing..target_count {
        let config = mint_station(template, index, target_count, rng);
        pool.insert(ClientState::new(config));
    }
    info!(
        "Pool reconciled: {} existing + {} new {} stations",
        existing,
        target_count - existing,
        template.generator.class_name()
    );
    pool
}

/// Sample the configuration of station number `index` out of `max_index`
pub fn mint_station<R: Rng + ?Sized>(template: &SimulationTemplate, index: usize, max_index: usize, rng: &mut R) -> ClientConfig {
    let position = template.location_generation.sample(rng, index, max_index);
    // k < 2 would let a single station populate a region on its own
    let k = template.k_generation.sample(rng).round().max(2.0) as u32;
    let max_depth = template.max_depth_generation.sample(rng).round().clamp(1.0, 24.0) as u32;

    let sensor_accuracy = template.sensor_accuracy_generation.as_ref().and_then(|generation| {
        let undefined = template
            .sensor_undefined_accuracy_chance
            .is_some_and(|chance| rng.gen::<f64>() < chance);
        if undefined {
            None
        } else {
            Some((generation.sample(rng).max(0.0) * 100.0).round() / 100.0)
        }
    });

    ClientConfig {
        id: StationId::new(),
        position,
        k,
        max_depth,
        sensor_accuracy,
        generator: template.generator.resolve(rng),
        noise: template.noise.clone(),
        network: template.network.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkParams;
    use crate::generator::models::{BlankTemplate, DiurnalTemplate, GeneratorTemplate};
    use crate::generator::sampler::{LocationTemplate, ValueDistribution};
    use crate::station::{SessionHandle, StationState};
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn blank_template() -> SimulationTemplate {
        SimulationTemplate::new(NetworkParams::default(), GeneratorTemplate::Blank(BlankTemplate::default()))
    }

    fn diurnal_template() -> SimulationTemplate {
        let mut template = SimulationTemplate::new(
            NetworkParams::default(),
            GeneratorTemplate::DiurnalApproximation(DiurnalTemplate::default()),
        );
        template.location_generation = LocationTemplate::Grid {
            area: [
                crate::station::Position::new(40.0, 0.0),
                crate::station::Position::new(50.0, 10.0),
            ],
        };
        template.noise = Some(ValueDistribution::normal(0.0, 0.25));
        template
    }

    #[test]
    fn test_reconcile_fills_empty_pool() {
        let mut rng = StdRng::seed_from_u64(1);
        let pool = reconcile(Pool::new(), 3, &blank_template(), &mut rng);
        assert_eq!(pool.len(), 3);
        assert!(pool.iter().all(|s| s.status.state == StationState::New));
        let ids: HashSet<_> = pool.ids().into_iter().collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(1);
        let pool = reconcile(Pool::new(), 4, &blank_template(), &mut rng);
        let again = reconcile(pool.clone(), 4, &blank_template(), &mut rng);
        assert_eq!(pool, again);
    }

    #[test]
    fn test_reconcile_never_shrinks() {
        let mut rng = StdRng::seed_from_u64(1);
        let pool = reconcile(Pool::new(), 5, &blank_template(), &mut rng);
        let smaller = reconcile(pool.clone(), 2, &blank_template(), &mut rng);
        assert_eq!(smaller.len(), 5);
        assert_eq!(pool, smaller);
    }

    #[test]
    fn test_reconcile_keeps_existing_configuration() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut pool = reconcile(Pool::new(), 3, &blank_template(), &mut rng);
        for state in pool.iter_mut() {
            state.status.state = StationState::Active;
        }
        let before = pool.clone();

        let grown = reconcile(pool, 5, &diurnal_template(), &mut rng);
        assert_eq!(grown.len(), 5);
        for state in before.iter() {
            assert_eq!(grown.get(&state.id()), Some(state));
        }
        let new: Vec<_> = grown.iter().filter(|s| !before.contains(&s.id())).collect();
        assert_eq!(new.len(), 2);
        assert!(new.iter().all(|s| s.status.state == StationState::New));
        assert!(new.iter().all(|s| s.config.generator.class_name() == "diurnal_approximation"));
    }

    #[test]
    fn test_mint_station_clamps_privacy_parameters() {
        let mut template = blank_template();
        template.k_generation = ValueDistribution::fixed(0.4);
        template.max_depth_generation = ValueDistribution::fixed(40.0);
        let mut rng = StdRng::seed_from_u64(2);
        let config = mint_station(&template, 0, 1, &mut rng);
        assert_eq!(config.k, 2);
        assert_eq!(config.max_depth, 24);
        assert_eq!(config.sensor_accuracy, None);
    }

    #[test]
    fn test_mint_station_sensor_accuracy() {
        let mut template = blank_template();
        template.sensor_accuracy_generation = Some(ValueDistribution::fixed(0.256));
        let mut rng = StdRng::seed_from_u64(2);
        assert_eq!(mint_station(&template, 0, 1, &mut rng).sensor_accuracy, Some(0.26));

        template.sensor_undefined_accuracy_chance = Some(1.0);
        assert_eq!(mint_station(&template, 0, 1, &mut rng).sensor_accuracy, None);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let store = PoolStore::new(dir.path().join("absent.json"));
        let pool = store.load().await.unwrap();
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PoolStore::new(dir.path().join("nested").join("pool.json"));
        let mut rng = StdRng::seed_from_u64(3);
        let mut pool = reconcile(Pool::new(), 4, &diurnal_template(), &mut rng);
        if let Some(state) = pool.iter_mut().next() {
            state.status.state = StationState::Active;
            state.status.session = Some(SessionHandle {
                station_id: "remote-17".to_string(),
                token: "secret".to_string(),
            });
            state.status.last_success_at = Some(Utc::now());
            state.status.consecutive_failures = 2;
        }

        store.save(&pool).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(pool, loaded);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        let result = PoolStore::new(&path).load().await;
        assert!(matches!(result, Err(PoolError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_unknown_version_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        tokio::fs::write(&path, r#"{"version": 99, "stations": {}}"#).await.unwrap();
        let result = PoolStore::new(&path).load().await;
        assert!(matches!(result, Err(PoolError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_reset_discards_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = PoolStore::new(dir.path().join("pool.json"));
        let mut rng = StdRng::seed_from_u64(4);
        store.save(&reconcile(Pool::new(), 2, &blank_template(), &mut rng)).await.unwrap();
        store.reset().await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
        // resetting twice is fine
        store.reset().await.unwrap();
    }

    #[test]
    fn test_rehydrate_keeps_session_only() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut state = ClientState::new(mint_station(&blank_template(), 0, 1, &mut rng));
        state.status.state = StationState::Failed;
        state.status.consecutive_failures = 11;
        state.status.session = Some(SessionHandle {
            station_id: "7".to_string(),
            token: "t".to_string(),
        });
        state.rehydrate();
        assert_eq!(state.status.state, StationState::New);
        assert_eq!(state.status.consecutive_failures, 0);
        assert!(state.status.session.is_some());
    }
}
