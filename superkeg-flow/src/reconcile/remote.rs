//! HTTP clients for the keg web application
//!
//! [`KegApiClient`] records finished pours (`POST /api/flow/{keg_id}`).
//! [`HttpDisplayPublisher`] pushes live progress (`POST /api/volume-update`).

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use superkeg_common::events::ProgressSnapshot;
use tracing::debug;

const USER_AGENT: &str = concat!("superkeg-flow/", env!("CARGO_PKG_VERSION"));

/// Answer from the keg API for a recorded pour
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// Pour recorded; remaining liters when reported
    Recorded { volume_remaining: Option<f64> },
    /// Keg missing or not tapped (authoritative)
    NotFound,
}

/// Remote keg state owner
#[async_trait]
pub trait KegApi: Send + Sync {
    /// Record `volume` liters against `keg_id`
    ///
    /// `Err` means the outcome is unknown (transport failure or an
    /// unexpected answer).
    async fn record_pour(&self, keg_id: i64, volume: f64) -> Result<RemoteOutcome>;
}

/// Sink for live pour progress
#[async_trait]
pub trait DisplayPublisher: Send + Sync {
    async fn publish(&self, snapshot: &ProgressSnapshot) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct FlowRequest {
    volume_dispensed: f64,
}

/// Body of a successful `/api/flow/{keg_id}` answer
#[derive(Debug, Deserialize)]
pub struct FlowResponse {
    pub success: bool,
    #[serde(default)]
    pub keg_id: Option<i64>,
    #[serde(default)]
    pub volume_remaining: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))
}

/// Keg API client
pub struct KegApiClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl KegApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http_client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn flow_url(&self, keg_id: i64) -> String {
        format!("{}/api/flow/{}", self.base_url, keg_id)
    }
}

#[async_trait]
impl KegApi for KegApiClient {
    async fn record_pour(&self, keg_id: i64, volume: f64) -> Result<RemoteOutcome> {
        let url = self.flow_url(keg_id);
        debug!(keg_id, volume, "POST {}", url);

        let response = self
            .http_client
            .post(&url)
            .json(&FlowRequest {
                volume_dispensed: volume,
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body: FlowResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::Transport(format!("Unreadable keg API response: {}", e)))?;
                if !body.success {
                    return Err(Error::RemoteApi {
                        status: 200,
                        body: body.message.unwrap_or_else(|| "success=false".to_string()),
                    });
                }
                if let Some(reported) = body.keg_id {
                    if reported != keg_id {
                        return Err(Error::RemoteApi {
                            status: 200,
                            body: format!("acknowledged keg {} instead of {}", reported, keg_id),
                        });
                    }
                }
                Ok(RemoteOutcome::Recorded {
                    volume_remaining: body.volume_remaining,
                })
            }
            StatusCode::NOT_FOUND => Ok(RemoteOutcome::NotFound),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::RemoteApi {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

/// Pushes progress snapshots to `{base}/api/volume-update`
pub struct HttpDisplayPublisher {
    http_client: reqwest::Client,
    url: String,
}

impl HttpDisplayPublisher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http_client: build_client(timeout)?,
            url: format!("{}/api/volume-update", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl DisplayPublisher for HttpDisplayPublisher {
    async fn publish(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        let response = self.http_client.post(&self.url).json(snapshot).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::RemoteApi {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}
