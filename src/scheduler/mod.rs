//! Control-Loop Scheduler (§4.6). Six independently-scheduled jobs, each
//! its own spawned task with IANA-timezone-aware wall-clock semantics.
//! Grounded on the teacher's `async_aggregator.rs` periodic-tick shape
//! (`tokio::time::interval_at` plus a `tokio::select!` against shutdown)
//! and `enforcer.rs`'s re-enable poll loop for the "re-resolve and
//! enforce" pattern.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use tokio::time::sleep;

use crate::alerts::AlertSink;
use crate::db::Store;
use crate::enforcement::{Dispatcher, StrategyHint};
use crate::policy;

pub struct Scheduler {
    store: Arc<Store>,
    dispatcher: Arc<Dispatcher>,
    alerts: AlertSink,
    timezone: chrono_tz::Tz,
    daily_reset_time: (u32, u32),
    accounting_archival_time: (u32, u32),
    sharing_detection_time: (u32, u32),
    sharing_detection_enabled: bool,
    sharing_detection_ttl_threshold: u32,
    accounting_retention_days: u32,
    boost_stacks_on_override: bool,
    log: slog::Logger,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        dispatcher: Arc<Dispatcher>,
        alerts: AlertSink,
        timezone: chrono_tz::Tz,
        daily_reset_time: (u32, u32),
        accounting_archival_time: (u32, u32),
        sharing_detection_time: (u32, u32),
        sharing_detection_enabled: bool,
        sharing_detection_ttl_threshold: u32,
        accounting_retention_days: u32,
        boost_stacks_on_override: bool,
        log: slog::Logger,
    ) -> Self {
        Self {
            store,
            dispatcher,
            alerts,
            timezone,
            daily_reset_time,
            accounting_archival_time,
            sharing_detection_time,
            sharing_detection_enabled,
            sharing_detection_ttl_threshold,
            accounting_retention_days,
            boost_stacks_on_override,
            log,
        }
    }

    pub fn spawn_all(self: Arc<Self>) {
        tokio::spawn(self.clone().run_daily_reset());
        tokio::spawn(self.clone().run_accounting_archival());
        tokio::spawn(self.clone().run_cache_warm());
        tokio::spawn(self.clone().run_sharing_detection());
    }

    async fn run_daily_reset(self: Arc<Self>) {
        loop {
            sleep_until_next(self.timezone, self.daily_reset_time).await;
            slog::info!(self.log, "running daily quota reset");
            match self.store.reset_daily_counters(Utc::now()).await {
                Ok(ids) => {
                    slog::info!(self.log, "daily reset complete"; "subscribers_reset" => ids.len());
                    for id in ids {
                        self.reresolve_and_enforce(id).await;
                    }
                }
                Err(e) => slog::error!(self.log, "daily reset failed"; "err" => %e),
            }
        }
    }

    /// Monthly renewal is driven by an explicit subscriber action per §4.6,
    /// not a standalone timer; this entry point is called by that action.
    pub async fn renew_monthly(&self, subscriber_id: crate::db::models::SubscriberId) {
        if let Err(e) = self.store.reset_monthly_counters(subscriber_id, Utc::now()).await {
            slog::error!(self.log, "monthly renewal failed"; "subscriber_id" => subscriber_id, "err" => %e);
            return;
        }
        self.reresolve_and_enforce(subscriber_id).await;
    }

    /// Called by the RADIUS/quota-sync paths whenever a service's
    /// time-window boundary is crossed for an online subscriber, per the
    /// "Time-window boost transitions" job row.
    pub async fn on_time_window_transition(&self, subscriber_id: crate::db::models::SubscriberId) {
        self.reresolve_and_enforce(subscriber_id).await;
    }

    async fn reresolve_and_enforce(&self, subscriber_id: crate::db::models::SubscriberId) {
        let subscriber = match self.store.get_subscriber_by_id(subscriber_id).await {
            Ok(s) => s,
            Err(e) => {
                slog::warn!(self.log, "failed to reload subscriber for re-resolution"; "subscriber_id" => subscriber_id, "err" => %e);
                return;
            }
        };
        let service = match subscriber.service_id {
            Some(id) => self.store.get_service_by_id(id).await.unwrap_or(None),
            None => None,
        };

        let rules = self.store.active_bandwidth_rules(subscriber_id).await.unwrap_or_default();
        let global_rules = self.store.global_bandwidth_rules().await.unwrap_or_default();
        let now = Utc::now().with_timezone(&self.timezone);
        let resolved = policy::resolve(
            &subscriber,
            service.as_ref(),
            &rules,
            &global_rules,
            &now,
            self.boost_stacks_on_override,
        );

        self.dispatcher
            .enqueue(subscriber_id, resolved.down_kbps, resolved.up_kbps, StrategyHint::Auto)
            .await;
    }

    async fn run_accounting_archival(self: Arc<Self>) {
        loop {
            sleep_until_next(self.timezone, self.accounting_archival_time).await;
            let cutoff = Utc::now() - chrono::Duration::days(self.accounting_retention_days as i64);
            match self.store.archive_accounting_older_than(cutoff).await {
                Ok(moved) => slog::info!(self.log, "accounting archival complete"; "rows_moved" => moved),
                Err(e) => slog::error!(self.log, "accounting archival failed"; "err" => %e),
            }
        }
    }

    async fn run_cache_warm(self: Arc<Self>) {
        self.warm_cache_once().await;
        loop {
            sleep(Duration::from_secs(30 * 60)).await;
            self.warm_cache_once().await;
        }
    }

    async fn warm_cache_once(&self) {
        let nas_devices = match self.store.all_nas_devices().await {
            Ok(v) => v,
            Err(e) => {
                slog::warn!(self.log, "cache warm failed to list NAS devices"; "err" => %e);
                return;
            }
        };
        let mut warmed = 0usize;
        for nas in nas_devices {
            match self.store.online_subscribers_by_nas(nas.id).await {
                Ok(subs) => {
                    for sub in subs {
                        if self.store.get_subscriber_by_username(&sub.username).await.is_ok() {
                            warmed += 1;
                        }
                    }
                }
                Err(e) => slog::warn!(self.log, "cache warm failed to list online subscribers"; "nas_id" => nas.id, "err" => %e),
            }
        }
        slog::info!(self.log, "subscriber cache warm complete"; "warmed" => warmed);
    }

    async fn run_sharing_detection(self: Arc<Self>) {
        loop {
            sleep_until_next(self.timezone, self.sharing_detection_time).await;
            if !self.sharing_detection_enabled {
                continue;
            }
            slog::info!(self.log, "running sharing-detection scan");
            match self
                .store
                .subscribers_with_concurrent_sessions(self.sharing_detection_ttl_threshold as i64)
                .await
            {
                Ok(flagged) => {
                    for (subscriber_id, session_count) in flagged {
                        self.alerts.sharing_suspected(subscriber_id, session_count as u32).await;
                    }
                }
                Err(e) => slog::error!(self.log, "sharing-detection scan failed"; "err" => %e),
            }
        }
    }
}

/// Sleeps until the next local wall-clock occurrence of `(hour, minute)` in
/// `tz`. Idempotent on double-execution: a crash-restart that straddles the
/// target time simply fires once more on the next computed occurrence,
/// which is always strictly in the future.
async fn sleep_until_next(tz: chrono_tz::Tz, target: (u32, u32)) {
    let now = Utc::now().with_timezone(&tz);
    let mut next = tz
        .with_ymd_and_hms(now.year(), now.month(), now.day(), target.0, target.1, 0)
        .single()
        .unwrap_or(now);
    if next <= now {
        next += chrono::Duration::days(1);
    }
    let delta = (next - now).to_std().unwrap_or(Duration::from_secs(1));
    sleep(delta).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_occurrence_is_strictly_in_the_future() {
        let tz = chrono_tz::UTC;
        let now = Utc::now().with_timezone(&tz);
        let target = ((now.hour() + 23) % 24, now.minute());
        let mut next = tz
            .with_ymd_and_hms(now.year(), now.month(), now.day(), target.0, target.1, 0)
            .single()
            .unwrap();
        if next <= now {
            next += chrono::Duration::days(1);
        }
        assert!(next > now);
    }
}
