//! reqwest implementations of the lookup and collection services
//!
//! Wire contract (JSON):
//! - `GET  /lookup?latitude=..&longitude=..`  -> `{"host", "use_tls"}`, 404 when no service covers the position
//! - `POST /stations`                          -> `{"station_id", "token"}`
//! - `POST /stations/{station_id}/readings`    `{"timestamp", "value"}`, bearer token
//! - `DELETE /stations/{station_id}`           bearer token

use super::{CollectionService, LookupService, RegistrationRequest, ServiceError, Services};
use crate::station::{Endpoint, Position, SessionHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct LookupResponse {
    host: String,
    use_tls: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    station_id: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct ReadingPayload {
    timestamp: DateTime<Utc>,
    value: f64,
}

impl From<reqwest::Error> for ServiceError {
    fn from(error: reqwest::Error) -> Self {
        ServiceError::Transport(error.to_string())
    }
}

/// Build both services on one shared connection pool
pub fn http_services() -> Result<Services, ServiceError> {
    let client = Client::builder()
        .user_agent(concat!("synthetic-bridge/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(Services::new(
        Arc::new(HttpLookupService::new(client.clone())),
        Arc::new(HttpCollectionService::new(client)),
    ))
}

/// Map non-success statuses onto the retry taxonomy
async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(ServiceError::Transport(format!("{}: {}", status, body)))
    } else {
        Err(ServiceError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
    let status = response.status().as_u16();
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| ServiceError::Rejected {
        status,
        body: format!("malformed response ({}): {}", e, body),
    })
}

pub struct HttpLookupService {
    client: Client,
}

impl HttpLookupService {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LookupService for HttpLookupService {
    async fn lookup(&self, service: &Endpoint, position: &Position) -> Result<Endpoint, ServiceError> {
        let url = format!("{}/lookup", service.base_url());
        let response = self
            .client
            .get(&url)
            .query(&[("latitude", position.latitude), ("longitude", position.longitude)])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ServiceError::NotFound);
        }

        let found: LookupResponse = decode(check_status(response).await?).await?;
        debug!("Lookup for {} resolved to {}", position, found.host);
        Ok(Endpoint {
            host: found.host,
            use_tls: found.use_tls.unwrap_or(true),
        })
    }
}

pub struct HttpCollectionService {
    client: Client,
}

impl HttpCollectionService {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn station_url(endpoint: &Endpoint, session: &SessionHandle) -> String {
        format!("{}/stations/{}", endpoint.base_url(), session.station_id)
    }
}

#[async_trait]
impl CollectionService for HttpCollectionService {
    async fn register(&self, endpoint: &Endpoint, request: &RegistrationRequest) -> Result<SessionHandle, ServiceError> {
        let url = format!("{}/stations", endpoint.base_url());
        let response = self.client.post(&url).json(request).send().await?;
        let registered: RegistrationResponse = decode(check_status(response).await?).await?;
        Ok(SessionHandle {
            station_id: registered.station_id,
            token: registered.token,
        })
    }

    async fn submit_reading(
        &self,
        endpoint: &Endpoint,
        session: &SessionHandle,
        timestamp: DateTime<Utc>,
        value: f64,
    ) -> Result<(), ServiceError> {
        let url = format!("{}/readings", Self::station_url(endpoint, session));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&session.token)
            .json(&ReadingPayload { timestamp, value })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn deregister(&self, endpoint: &Endpoint, session: &SessionHandle) -> Result<(), ServiceError> {
        let response = self
            .client
            .delete(Self::station_url(endpoint, session))
            .bearer_auth(&session.token)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}
