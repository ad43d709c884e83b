/*!
# Axum stub speaking the lookup + collection wire contract

One server plays both roles: `/lookup` points every position back at the server
itself, `/stations` accepts registrations, readings and deregistrations. State is
kept in memory and exposed for assertions.
*/

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use synthetic_bridge::services::RegistrationRequest;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct StubReading {
    pub station_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Default)]
pub struct StubState {
    pub stations: HashMap<String, String>,
    pub registrations: Vec<RegistrationRequest>,
    pub readings: Vec<StubReading>,
    pub deregistered: Vec<String>,
    /// Answer `/lookup` with 404
    pub lookup_not_found: bool,
    /// Status returned instead of accepting readings
    pub reading_status: Option<u16>,
    next_id: u64,
}

#[derive(Clone)]
struct AppState {
    inner: Arc<Mutex<StubState>>,
    addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
struct LookupParams {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct ReadingBody {
    timestamp: DateTime<Utc>,
    value: f64,
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn authorized(state: &StubState, station_id: &str, headers: &HeaderMap) -> Result<(), StatusCode> {
    match (state.stations.get(station_id), bearer(headers)) {
        (Some(token), Some(given)) if token == given => Ok(()),
        (None, _) => Err(StatusCode::NOT_FOUND),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

// GET /lookup?latitude=..&longitude=..
async fn lookup(
    State(app): State<AppState>,
    Query(params): Query<LookupParams>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    debug!("🔍 [STUB] lookup ({}, {})", params.latitude, params.longitude);
    if app.inner.lock().lookup_not_found {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(serde_json::json!({ "host": app.addr.to_string(), "use_tls": false })))
}

// POST /stations
async fn register(
    State(app): State<AppState>,
    Json(request): Json<RegistrationRequest>,
) -> Json<serde_json::Value> {
    let mut state = app.inner.lock();
    state.next_id += 1;
    let station_id = format!("station-{}", state.next_id);
    let token = uuid::Uuid::new_v4().to_string();
    state.stations.insert(station_id.clone(), token.clone());
    state.registrations.push(request);
    Json(serde_json::json!({ "station_id": station_id, "token": token }))
}

// POST /stations/{id}/readings
async fn submit_reading(
    State(app): State<AppState>,
    Path(station_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ReadingBody>,
) -> StatusCode {
    let mut state = app.inner.lock();
    if let Err(status) = authorized(&state, &station_id, &headers) {
        return status;
    }
    if let Some(code) = state.reading_status {
        return StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    }
    state.readings.push(StubReading {
        station_id,
        timestamp: body.timestamp,
        value: body.value,
    });
    StatusCode::NO_CONTENT
}

// DELETE /stations/{id}
async fn deregister(
    State(app): State<AppState>,
    Path(station_id): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    let mut state = app.inner.lock();
    if let Err(status) = authorized(&state, &station_id, &headers) {
        return status;
    }
    state.stations.remove(&station_id);
    state.deregistered.push(station_id);
    StatusCode::NO_CONTENT
}

pub struct StubServer {
    addr: SocketAddr,
    state: Arc<Mutex<StubState>>,
    handle: JoinHandle<()>,
}

impl StubServer {
    /// Serve on an ephemeral localhost port
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(StubState::default()));

        let app = Router::new()
            .route("/lookup", get(lookup))
            .route("/stations", post(register))
            .route("/stations/{id}/readings", post(submit_reading))
            .route("/stations/{id}", delete(deregister))
            .with_state(AppState {
                inner: state.clone(),
                addr,
            });

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("❌ Stub server stopped: {}", e);
            }
        });
        info!("🚀 Stub collection service listening on {}", addr);
        Ok(Self { addr, state, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port`, as written in `lookup_host` or an address override
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// Inspect or script the stub
    pub fn state(&self) -> parking_lot::MutexGuard<'_, StubState> {
        self.state.lock()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
