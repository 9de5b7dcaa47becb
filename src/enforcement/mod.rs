//! Enforcement Dispatcher (§4.5). Three-tier strategy -- vendor API, CoA
//! update, Disconnect -- with per-tier retry/timeout semantics and a
//! one-slot mailbox per subscriber so a newer resolved rate supersedes an
//! older pending one. Grounded on the teacher's `Iptables` actor in
//! `enforcer.rs`: a `dispatch_channel` into a `tokio::select!` loop that
//! applies `PolicyUpdateMessage`s, generalized here from local netfilter
//! rules to the vendor-API/CoA/Disconnect tiers and from one global actor
//! to one spawned worker task per subscriber.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;

use crate::alerts::AlertSink;
use crate::db::models::{NasDevice, SubscriberId};
use crate::db::{Store, StoreError};
use crate::nas::pool::NasPool;
use crate::nas::NasError;
use crate::radius::coa::{self, CoaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyHint {
    /// Start at tier A as usual.
    Auto,
    /// Skip straight to tier B (CoA update).
    ForceCoaUpdate,
    /// Skip straight to tier C (Disconnect); always used for service
    /// changes and admin-triggered disconnects.
    ForceDisconnect,
}

#[derive(Debug, Clone, Copy)]
struct EnforcementJob {
    down_kbps: i64,
    up_kbps: i64,
    strategy_hint: StrategyHint,
}

#[derive(Debug, Error)]
pub enum EnforcementError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("subscriber has no associated NAS")]
    NoNas,
    #[error("all enforcement tiers failed")]
    AllTiersFailed,
}

/// Coalesces concurrent jobs for the same subscriber into a single-slot
/// mailbox via `tokio::sync::watch`: a newer `send` silently replaces an
/// older one the worker hasn't consumed yet.
pub struct Dispatcher {
    mailboxes: DashMap<SubscriberId, watch::Sender<Option<EnforcementJob>>>,
    store: Arc<Store>,
    nas_pool: Arc<NasPool>,
    alerts: AlertSink,
    log: slog::Logger,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>, nas_pool: Arc<NasPool>, alerts: AlertSink, log: slog::Logger) -> Self {
        Self { mailboxes: DashMap::new(), store, nas_pool, alerts, log }
    }

    pub async fn enqueue(
        &self,
        subscriber_id: SubscriberId,
        down_kbps: i64,
        up_kbps: i64,
        strategy_hint: StrategyHint,
    ) {
        let job = EnforcementJob { down_kbps, up_kbps, strategy_hint };

        if let Some(tx) = self.mailboxes.get(&subscriber_id) {
            let _ = tx.send(Some(job));
            return;
        }

        let (tx, rx) = watch::channel(Some(job));
        self.mailboxes.insert(subscriber_id, tx);
        let store = self.store.clone();
        let nas_pool = self.nas_pool.clone();
        let alerts = self.alerts.clone();
        let log = self.log.clone();
        tokio::spawn(worker_loop(subscriber_id, rx, store, nas_pool, alerts, log));
    }
}

async fn worker_loop(
    subscriber_id: SubscriberId,
    mut rx: watch::Receiver<Option<EnforcementJob>>,
    store: Arc<Store>,
    nas_pool: Arc<NasPool>,
    alerts: AlertSink,
    log: slog::Logger,
) {
    loop {
        let job = {
            let job = *rx.borrow_and_update();
            job
        };

        if let Some(job) = job {
            if let Err(e) = apply_job(&store, &nas_pool, subscriber_id, job, &alerts, &log).await {
                slog::error!(log, "enforcement job failed on all tiers"; "subscriber_id" => subscriber_id, "err" => %e);
            }
        }

        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn apply_job(
    store: &Arc<Store>,
    nas_pool: &Arc<NasPool>,
    subscriber_id: SubscriberId,
    job: EnforcementJob,
    alerts: &AlertSink,
    log: &slog::Logger,
) -> Result<(), EnforcementError> {
    let subscriber = store.get_subscriber_by_id(subscriber_id).await?;

    // Suspension point: the subscriber may have disconnected between
    // enqueue and dequeue (e.g. during mailbox coalescing), in which case
    // there is no live session left to apply a rate or disconnect against.
    if !subscriber.is_online {
        slog::debug!(log, "skipping enforcement job for offline subscriber"; "subscriber_id" => subscriber_id);
        return Ok(());
    }

    let nas_id = subscriber.nas_id.ok_or(EnforcementError::NoNas)?;
    let nas = store.nas_by_id(nas_id).await?.ok_or(EnforcementError::NoNas)?;
    let session_id = subscriber.username.clone();

    let mut attempts = 0u32;

    if job.strategy_hint == StrategyHint::Auto {
        attempts += 1;
        if try_tier_a(nas_pool, &nas, &session_id, job.down_kbps, job.up_kbps).await {
            return Ok(());
        }
    }

    if job.strategy_hint != StrategyHint::ForceDisconnect {
        attempts += 1;
        if coa::update_rate(&nas, &session_id, job.down_kbps, job.up_kbps).await.is_ok() {
            return Ok(());
        }
    }

    attempts += 1;
    if coa::disconnect(&nas, &session_id).await.is_ok() {
        return Ok(());
    }

    let _ = alerts.enforcement_failed(subscriber_id, "C", attempts).await;
    Err(EnforcementError::AllTiersFailed)
}

/// Tier A: vendor management API. One retry with a 500ms backoff per §4.5.
async fn try_tier_a(
    nas_pool: &Arc<NasPool>,
    nas: &NasDevice,
    session_id: &str,
    down_kbps: i64,
    up_kbps: i64,
) -> bool {
    for attempt in 0..2 {
        if attempt > 0 {
            sleep(Duration::from_millis(500)).await;
        }
        match nas_pool.checkout(nas).await {
            Ok(adapter) => match adapter.update_session_rate(session_id, down_kbps, up_kbps).await {
                Ok(()) => return true,
                Err(NasError::SessionNotFound(_)) => return false,
                Err(_) => continue,
            },
            Err(_) => continue,
        }
    }
    false
}
