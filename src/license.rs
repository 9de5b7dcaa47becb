//! Licensing collaborator contract (§6). Polls an external validator,
//! caches the returned encryption key for 24h, and exposes a grace-period
//! gate the RADIUS server consults before accepting new sessions. Modeled
//! as an `async_trait` capability interface the same way `src/nas` models
//! vendor routers, continuing the teacher's own `#[async_trait] pub trait
//! Reporter` convention in `reporter.rs`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Active,
    Expired,
    Blocked,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LicenseState {
    pub status: LicenseStatus,
    pub max_subscribers: u64,
    pub encryption_key: String,
}

#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("license endpoint request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("no license endpoint configured")]
    Unconfigured,
}

#[async_trait]
pub trait LicenseValidator: Send + Sync {
    async fn check(&self) -> Result<LicenseState, LicenseError>;
}

pub struct HttpLicenseValidator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLicenseValidator {
    pub fn new(endpoint: String) -> Result<Self, LicenseError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl LicenseValidator for HttpLicenseValidator {
    async fn check(&self) -> Result<LicenseState, LicenseError> {
        let state = self
            .client
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?
            .json::<LicenseState>()
            .await?;
        Ok(state)
    }
}

/// Tracks when `blocked` status first started persisting, the cached
/// decryption key (TTL 24h per §6), and exposes `should_reject_new_auth`
/// for the RADIUS server's Access-Request path.
pub struct LicenseGate {
    validator: Arc<dyn LicenseValidator>,
    grace_period: Duration,
    blocked_since: RwLock<Option<DateTime<Utc>>>,
    cached_key: RwLock<Option<(String, DateTime<Utc>)>>,
    max_subscribers: AtomicI64,
    log: slog::Logger,
}

impl LicenseGate {
    pub fn new(validator: Arc<dyn LicenseValidator>, grace_period: Duration, log: slog::Logger) -> Self {
        Self {
            validator,
            grace_period,
            blocked_since: RwLock::new(None),
            cached_key: RwLock::new(None),
            max_subscribers: AtomicI64::new(i64::MAX),
            log,
        }
    }

    pub async fn poll_once(&self) {
        match self.validator.check().await {
            Ok(state) => {
                self.max_subscribers
                    .store(state.max_subscribers as i64, Ordering::Relaxed);

                if matches!(state.status, LicenseStatus::Blocked) {
                    let mut blocked_since = self.blocked_since.write().await;
                    if blocked_since.is_none() {
                        *blocked_since = Some(Utc::now());
                    }
                } else {
                    *self.blocked_since.write().await = None;
                }

                let mut cached_key = self.cached_key.write().await;
                let needs_refresh = match cached_key.as_ref() {
                    Some((_, fetched_at)) => Utc::now() - *fetched_at > chrono::Duration::hours(24),
                    None => true,
                };
                if needs_refresh {
                    *cached_key = Some((state.encryption_key, Utc::now()));
                }
            }
            Err(e) => {
                slog::warn!(self.log, "license poll failed, keeping previous state"; "err" => %e);
            }
        }
    }

    pub async fn should_reject_new_auth(&self) -> bool {
        match *self.blocked_since.read().await {
            Some(since) => Utc::now() - since > chrono::Duration::from_std(self.grace_period).unwrap(),
            None => false,
        }
    }

    pub async fn encryption_key(&self) -> Option<String> {
        self.cached_key.read().await.as_ref().map(|(k, _)| k.clone())
    }

    pub fn max_subscribers(&self) -> i64 {
        self.max_subscribers.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedValidator(LicenseStatus);

    #[async_trait]
    impl LicenseValidator for FixedValidator {
        async fn check(&self) -> Result<LicenseState, LicenseError> {
            Ok(LicenseState {
                status: self.0,
                max_subscribers: 30_000,
                encryption_key: "k".into(),
            })
        }
    }

    #[tokio::test]
    async fn active_never_rejects() {
        let gate = LicenseGate::new(
            Arc::new(FixedValidator(LicenseStatus::Active)),
            Duration::from_secs(3600),
            slog::Logger::root(slog::Discard, slog::o!()),
        );
        gate.poll_once().await;
        assert!(!gate.should_reject_new_auth().await);
    }

    #[tokio::test]
    async fn blocked_within_grace_does_not_reject() {
        let gate = LicenseGate::new(
            Arc::new(FixedValidator(LicenseStatus::Blocked)),
            Duration::from_secs(3600),
            slog::Logger::root(slog::Discard, slog::o!()),
        );
        gate.poll_once().await;
        assert!(!gate.should_reject_new_auth().await);
    }

    #[tokio::test]
    async fn blocked_past_grace_rejects() {
        let gate = LicenseGate::new(
            Arc::new(FixedValidator(LicenseStatus::Blocked)),
            Duration::from_millis(0),
            slog::Logger::root(slog::Discard, slog::o!()),
        );
        gate.poll_once().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(gate.should_reject_new_auth().await);
    }
}
