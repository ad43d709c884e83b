/*!
# In-memory lookup and collection services for tests without a network

Both mocks record every call and can be scripted to fail: a queue of one-shot
failures per operation, or a persistent failure until cleared.
*/

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use synthetic_bridge::services::{CollectionService, LookupService, RegistrationRequest, ServiceError, Services};
use synthetic_bridge::station::{Endpoint, Position, SessionHandle};
use tracing::debug;

/// Failure script for one operation
#[derive(Debug, Default)]
struct Script {
    queued: VecDeque<ServiceError>,
    always: Option<ServiceError>,
}

impl Script {
    fn next_failure(&mut self) -> Option<ServiceError> {
        self.queued.pop_front().or_else(|| self.always.clone())
    }
}

pub struct MockLookupService {
    endpoint: Endpoint,
    script: Mutex<Script>,
    calls: Mutex<Vec<Position>>,
}

impl MockLookupService {
    /// Answers every lookup with `endpoint`
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next(&self, count: usize, error: ServiceError) {
        let mut script = self.script.lock();
        script.queued.extend(std::iter::repeat(error).take(count));
    }

    pub fn fail_always(&self, error: ServiceError) {
        self.script.lock().always = Some(error);
    }

    pub fn recover(&self) {
        let mut script = self.script.lock();
        script.queued.clear();
        script.always = None;
    }

    pub fn calls(&self) -> Vec<Position> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LookupService for MockLookupService {
    async fn lookup(&self, _service: &Endpoint, position: &Position) -> Result<Endpoint, ServiceError> {
        self.calls.lock().push(*position);
        if let Some(error) = self.script.lock().next_failure() {
            debug!("💥 [MOCK] lookup for {} fails: {}", position, error);
            return Err(error);
        }
        Ok(self.endpoint.clone())
    }
}

/// Collection service operation, for failure scripting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Register,
    Submit,
    Deregister,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedReading {
    pub station_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Default)]
pub struct MockCollectionService {
    scripts: Mutex<HashMap<Operation, Script>>,
    registrations: Mutex<Vec<RegistrationRequest>>,
    readings: Mutex<Vec<RecordedReading>>,
    deregistrations: Mutex<Vec<String>>,
    /// station_id -> token of stations currently registered
    sessions: Mutex<HashMap<String, String>>,
    attempts: Mutex<HashMap<Operation, usize>>,
    next_id: AtomicU64,
}

impl MockCollectionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, operation: Operation, count: usize, error: ServiceError) {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(operation).or_default();
        script.queued.extend(std::iter::repeat(error).take(count));
    }

    pub fn fail_always(&self, operation: Operation, error: ServiceError) {
        self.scripts.lock().entry(operation).or_default().always = Some(error);
    }

    pub fn recover(&self, operation: Operation) {
        self.scripts.lock().remove(&operation);
    }

    /// Pretend `session` was registered in an earlier run
    pub fn preload_session(&self, session: &SessionHandle) {
        self.sessions.lock().insert(session.station_id.clone(), session.token.clone());
    }

    pub fn registrations(&self) -> Vec<RegistrationRequest> {
        self.registrations.lock().clone()
    }

    pub fn readings(&self) -> Vec<RecordedReading> {
        self.readings.lock().clone()
    }

    pub fn readings_for(&self, station_id: &str) -> Vec<RecordedReading> {
        self.readings.lock().iter().filter(|r| r.station_id == station_id).cloned().collect()
    }

    pub fn deregistrations(&self) -> Vec<String> {
        self.deregistrations.lock().clone()
    }

    pub fn registered_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Calls made for `operation`, failed ones included
    pub fn attempts(&self, operation: Operation) -> usize {
        self.attempts.lock().get(&operation).copied().unwrap_or(0)
    }

    fn begin(&self, operation: Operation) -> Result<(), ServiceError> {
        *self.attempts.lock().entry(operation).or_insert(0) += 1;
        match self.scripts.lock().get_mut(&operation).and_then(Script::next_failure) {
            Some(error) => {
                debug!("💥 [MOCK] {:?} fails: {}", operation, error);
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn authorize(&self, session: &SessionHandle) -> Result<(), ServiceError> {
        match self.sessions.lock().get(&session.station_id) {
            Some(token) if *token == session.token => Ok(()),
            _ => Err(ServiceError::Rejected {
                status: 401,
                body: format!("unknown station {}", session.station_id),
            }),
        }
    }
}

#[async_trait]
impl CollectionService for MockCollectionService {
    async fn register(&self, _endpoint: &Endpoint, request: &RegistrationRequest) -> Result<SessionHandle, ServiceError> {
        self.begin(Operation::Register)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let session = SessionHandle {
            station_id: format!("station-{}", id),
            token: uuid::Uuid::new_v4().to_string(),
        };
        self.registrations.lock().push(request.clone());
        self.sessions.lock().insert(session.station_id.clone(), session.token.clone());
        debug!("📥 [MOCK] Registered {} at {}", session.station_id, request.position);
        Ok(session)
    }

    async fn submit_reading(
        &self,
        _endpoint: &Endpoint,
        session: &SessionHandle,
        timestamp: DateTime<Utc>,
        value: f64,
    ) -> Result<(), ServiceError> {
        self.begin(Operation::Submit)?;
        self.authorize(session)?;
        self.readings.lock().push(RecordedReading {
            station_id: session.station_id.clone(),
            timestamp,
            value,
        });
        Ok(())
    }

    async fn deregister(&self, _endpoint: &Endpoint, session: &SessionHandle) -> Result<(), ServiceError> {
        self.begin(Operation::Deregister)?;
        self.authorize(session)?;
        self.sessions.lock().remove(&session.station_id);
        self.deregistrations.lock().push(session.station_id.clone());
        debug!("📤 [MOCK] Deregistered {}", session.station_id);
        Ok(())
    }
}

/// Both mocks plus the `Services` bundle wired to them
pub struct MockServices {
    pub lookup: Arc<MockLookupService>,
    pub collection: Arc<MockCollectionService>,
}

impl MockServices {
    pub fn new() -> Self {
        Self {
            lookup: Arc::new(MockLookupService::new(Endpoint {
                host: "collection.test:443".to_string(),
                use_tls: true,
            })),
            collection: Arc::new(MockCollectionService::new()),
        }
    }

    pub fn services(&self) -> Services {
        Services::new(self.lookup.clone(), self.collection.clone())
    }
}

impl Default for MockServices {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "collection.test".to_string(),
            use_tls: false,
        }
    }

    fn request() -> RegistrationRequest {
        RegistrationRequest {
            position: Position::new(1.0, 2.0),
            k: 3,
            max_depth: 24,
            sensor_accuracy: None,
            client_class: "blank".to_string(),
        }
    }

    #[tokio::test]
    async fn test_scripted_failures_run_out() {
        let collection = MockCollectionService::new();
        collection.fail_next(Operation::Register, 2, ServiceError::Transport("down".into()));

        assert!(collection.register(&endpoint(), &request()).await.is_err());
        assert!(collection.register(&endpoint(), &request()).await.is_err());
        let session = collection.register(&endpoint(), &request()).await.unwrap();

        assert_eq!(session.station_id, "station-1");
        assert_eq!(collection.attempts(Operation::Register), 3);
        assert_eq!(collection.registered_count(), 1);
    }

    #[tokio::test]
    async fn test_readings_require_valid_session() {
        let collection = MockCollectionService::new();
        let session = collection.register(&endpoint(), &request()).await.unwrap();
        collection.submit_reading(&endpoint(), &session, Utc::now(), 1.5).await.unwrap();

        let forged = SessionHandle {
            token: "forged".to_string(),
            ..session.clone()
        };
        let result = collection.submit_reading(&endpoint(), &forged, Utc::now(), 2.0).await;
        assert!(matches!(result, Err(ServiceError::Rejected { status: 401, .. })));
        assert_eq!(collection.readings_for(&session.station_id).len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_failure_until_recovered() {
        let lookup = MockLookupService::new(endpoint());
        lookup.fail_always(ServiceError::NotFound);
        let position = Position::new(0.0, 0.0);
        assert_eq!(lookup.lookup(&endpoint(), &position).await, Err(ServiceError::NotFound));
        lookup.recover();
        assert_eq!(lookup.lookup(&endpoint(), &position).await, Ok(endpoint()));
        assert_eq!(lookup.calls().len(), 2);
    }
}
