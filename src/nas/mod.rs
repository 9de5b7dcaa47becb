//! Edge-router management API capability interface (§6, §9 "dynamic
//! dispatch over vendor routers"). One `HttpNasAdapter` per NAS, held in a
//! pool with idle-eviction and health-ping on checkout, mirroring the
//! teacher's `reqwest::Client`-per-adapter shape (`borsa-yfinance`'s
//! `RealAdapter`) generalized across many concurrently-managed routers
//! instead of one.

pub mod pool;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::db::models::NasDevice;

#[derive(Debug, Clone, Deserialize)]
pub struct ActiveSession {
    pub username: String,
    pub framed_ip: Option<String>,
    pub bytes_up: i64,
    pub bytes_down: i64,
    pub session_id: String,
}

#[derive(Debug, Error)]
pub enum NasError {
    #[error("request to NAS failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("NAS returned an error status: {0}")]
    Status(u16),
    #[error("session {0:?} not found on NAS")]
    SessionNotFound(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NasAdapter: Send + Sync {
    async fn list_active_sessions(&self) -> Result<Vec<ActiveSession>, NasError>;
    async fn update_session_rate(
        &self,
        session_key: &str,
        down_kbps: i64,
        up_kbps: i64,
    ) -> Result<(), NasError>;
    async fn disconnect_session(&self, session_key: &str) -> Result<(), NasError>;
    async fn ping(&self) -> Result<(), NasError>;
}

/// A generic HTTPS JSON adapter. Vendor-specific adapters with a different
/// wire contract implement `NasAdapter` directly instead of going through
/// this type; this one covers the common case.
pub struct HttpNasAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNasAdapter {
    pub fn new(nas: &NasDevice) -> Result<Self, NasError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(std::time::Duration::from_secs(5))
            .basic_auth(&nas.api_username, Some(&nas.api_password))
            .build()?;
        Ok(Self { client, base_url: nas.api_endpoint.clone() })
    }

    fn check_status(status: reqwest::StatusCode) -> Result<(), NasError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(NasError::Status(status.as_u16()))
        }
    }
}

#[async_trait]
impl NasAdapter for HttpNasAdapter {
    async fn list_active_sessions(&self) -> Result<Vec<ActiveSession>, NasError> {
        let resp = self
            .client
            .get(format!("{}/sessions", self.base_url))
            .send()
            .await?;
        Self::check_status(resp.status())?;
        Ok(resp.json::<Vec<ActiveSession>>().await?)
    }

    async fn update_session_rate(
        &self,
        session_key: &str,
        down_kbps: i64,
        up_kbps: i64,
    ) -> Result<(), NasError> {
        let resp = self
            .client
            .post(format!("{}/sessions/{}/rate", self.base_url, session_key))
            .json(&serde_json::json!({ "down_kbps": down_kbps, "up_kbps": up_kbps }))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(NasError::SessionNotFound(session_key.to_owned()));
        }
        Self::check_status(resp.status())
    }

    async fn disconnect_session(&self, session_key: &str) -> Result<(), NasError> {
        let resp = self
            .client
            .delete(format!("{}/sessions/{}", self.base_url, session_key))
            .send()
            .await?;
        Self::check_status(resp.status())
    }

    async fn ping(&self) -> Result<(), NasError> {
        let resp = self.client.get(format!("{}/ping", self.base_url)).send().await?;
        Self::check_status(resp.status())
    }
}
