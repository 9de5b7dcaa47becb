//! Datastore Layer (§4.1). Wraps a single `sqlx::PgPool`, exactly as the
//! teacher threads `std::sync::Arc<sqlx::PgPool>` into every subsystem
//! constructor. Every query follows the teacher's pattern: open a
//! transaction, `sqlx::query_as` into a `#[derive(sqlx::FromRow)]` struct,
//! commit. On top of that the store adds the hot cache, the invalidation
//! pub/sub channel, and a bounded overflow buffer for accounting records
//! queued while the database is unreachable (§4.1 Failure).

pub mod cache;
pub mod models;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use thiserror::Error;

use cache::{CacheAge, CacheEntry, SubscriberCache};
use models::*;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database operation failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("subscriber not found")]
    SubscriberNotFound,
    #[error("subscriber lookup was not unique")]
    SubscriberNotUnique,
    #[error("stale counter update discarded")]
    StaleCounterUpdate,
}

/// Accounting records queued in memory while the database is unreachable.
/// Bounded per §4.1; overflow drops the oldest record and increments a loss
/// counter rather than blocking the caller.
pub struct AccountingOverflowBuffer {
    capacity: usize,
    queue: Mutex<VecDeque<PendingAccountingWrite>>,
    dropped: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct PendingAccountingWrite {
    pub session_id: String,
    pub subscriber_id: SubscriberId,
    pub nas_id: NasId,
    pub framed_ip: Option<IpNetwork>,
    pub bytes_up: i64,
    pub bytes_down: i64,
    pub event: AccountingEvent,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountingEvent {
    Start,
    Interim,
    Stop { cause: &'static str },
}

impl AccountingOverflowBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, write: PendingAccountingWrite) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(write);
    }

    pub fn drain(&self) -> Vec<PendingAccountingWrite> {
        let mut queue = self.queue.lock().unwrap();
        queue.drain(..).collect()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[derive(Debug, Clone)]
pub enum Invalidation {
    Subscriber(SubscriberId),
}

pub struct Store {
    pub pool: Arc<sqlx::PgPool>,
    cache: SubscriberCache,
    invalidation_tx: tokio::sync::broadcast::Sender<Invalidation>,
    pub overflow: Arc<AccountingOverflowBuffer>,
    log: slog::Logger,
}

impl Store {
    pub fn new(pool: Arc<sqlx::PgPool>, cache_ttl: Duration, log: slog::Logger) -> Self {
        let (invalidation_tx, _rx) = tokio::sync::broadcast::channel(256);
        Self {
            pool,
            cache: SubscriberCache::new(cache_ttl),
            invalidation_tx,
            overflow: Arc::new(AccountingOverflowBuffer::new(10_000)),
            log,
        }
    }

    pub fn subscribe_invalidations(&self) -> tokio::sync::broadcast::Receiver<Invalidation> {
        self.invalidation_tx.subscribe()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// §4.1: `GetSubscriberByUsername`. The realm suffix (`user@realm`) is
    /// part of the key and is never split -- lookups compare the whole
    /// string, matching §4.2 step 3's authentication-flow requirement.
    pub async fn get_subscriber_by_username(
        &self,
        username: &str,
    ) -> Result<(Subscriber, Option<Service>, CacheAge), StoreError> {
        if let Some((entry, age)) = self.cache.get(username) {
            return Ok((entry.subscriber.clone(), entry.service.clone(), age));
        }

        let (subscriber, service) = self.fetch_subscriber_from_db(username).await?;
        self.cache
            .put(username.to_owned(), subscriber.clone(), service.clone());
        Ok((subscriber, service, CacheAge(Duration::from_secs(0))))
    }

    async fn fetch_subscriber_from_db(
        &self,
        username: &str,
    ) -> Result<(Subscriber, Option<Service>), StoreError> {
        let mut tx = self.pool.begin().await?;

        let subscriber: Option<Subscriber> = sqlx::query_as(
            r#"SELECT id, username, credential, service_id, nas_id, mac_binding, expires_at,
                      is_online, daily_bytes_down, daily_bytes_up, monthly_bytes_down,
                      monthly_bytes_up, fup_level_daily, fup_level_monthly, last_daily_reset,
                      last_monthly_reset, framed_ip
               FROM subscribers WHERE username = $1"#,
        )
        .bind(username)
        .fetch_optional(&mut tx)
        .await?;

        let subscriber = subscriber.ok_or(StoreError::SubscriberNotFound)?;

        let service: Option<Service> = match subscriber.service_id {
            Some(service_id) => {
                sqlx::query_as(
                    r#"SELECT id, name, download_speed_kbps, upload_speed_kbps,
                              burst_download_kbps, burst_upload_kbps, daily_fup_tiers,
                              monthly_fup_tiers, time_based_speed_enabled,
                              time_window_start_min, time_window_end_min,
                              time_download_boost_pct, time_upload_boost_pct
                       FROM services WHERE id = $1"#,
                )
                .bind(service_id)
                .fetch_optional(&mut tx)
                .await?
            }
            None => None,
        };

        tx.commit().await?;
        Ok((subscriber, service))
    }

    /// §4.1: `UpsertAccountingRecord`, idempotent on session-id.
    pub async fn upsert_accounting_record(
        &self,
        write: &PendingAccountingWrite,
    ) -> Result<(), StoreError> {
        match write.event {
            AccountingEvent::Start => {
                sqlx::query(
                    r#"INSERT INTO rad_acct
                         (session_id, subscriber_id, nas_id, framed_ip, start_time,
                          last_update_time, bytes_up, bytes_down)
                       VALUES ($1, $2, $3, $4, $5, $5, $6, $7)
                       ON CONFLICT (session_id) DO UPDATE SET
                         last_update_time = EXCLUDED.last_update_time"#,
                )
                .bind(&write.session_id)
                .bind(write.subscriber_id)
                .bind(write.nas_id)
                .bind(write.framed_ip)
                .bind(write.timestamp)
                .bind(write.bytes_up)
                .bind(write.bytes_down)
                .execute(self.pool.as_ref())
                .await?;

                sqlx::query("UPDATE subscribers SET is_online = true, nas_id = $2 WHERE id = $1")
                    .bind(write.subscriber_id)
                    .bind(write.nas_id)
                    .execute(self.pool.as_ref())
                    .await?;
                self.invalidate_subscriber(write.subscriber_id);
            }
            AccountingEvent::Interim => {
                let updated = sqlx::query(
                    r#"UPDATE rad_acct SET last_update_time = $2, bytes_up = $3, bytes_down = $4
                       WHERE session_id = $1 AND last_update_time < $2"#,
                )
                .bind(&write.session_id)
                .bind(write.timestamp)
                .bind(write.bytes_up)
                .bind(write.bytes_down)
                .execute(self.pool.as_ref())
                .await?;

                if updated.rows_affected() == 0 {
                    slog::debug!(self.log, "discarded out-of-order interim update";
                        "session_id" => &write.session_id);
                }
            }
            AccountingEvent::Stop { cause } => {
                sqlx::query(
                    r#"UPDATE rad_acct SET stop_time = $2, last_update_time = $2,
                         bytes_up = $3, bytes_down = $4, termination_cause = $5
                       WHERE session_id = $1"#,
                )
                .bind(&write.session_id)
                .bind(write.timestamp)
                .bind(write.bytes_up)
                .bind(write.bytes_down)
                .bind(cause)
                .execute(self.pool.as_ref())
                .await?;

                sqlx::query("UPDATE subscribers SET is_online = false WHERE id = $1")
                    .bind(write.subscriber_id)
                    .execute(self.pool.as_ref())
                    .await?;
                self.invalidate_subscriber(write.subscriber_id);
            }
        }
        Ok(())
    }

    /// §4.1: `UpdateSubscriberCounters`. A single compare-and-swap style
    /// update: adds deltas, floors at the previously stored value (counters
    /// are monotonic non-decreasing within a reset window, per the
    /// invariant), and returns any FUP tiers newly crossed in this call. All
    /// performed inside one transaction so the crossing detection is atomic
    /// with the write.
    pub async fn update_subscriber_counters(
        &self,
        subscriber_id: SubscriberId,
        delta_down: i64,
        delta_up: i64,
        _now: DateTime<Utc>,
    ) -> Result<(Subscriber, FupCrossing), StoreError> {
        if delta_down < 0 || delta_up < 0 {
            return Err(StoreError::StaleCounterUpdate);
        }

        let mut tx = self.pool.begin().await?;

        let before: Subscriber = sqlx::query_as(
            r#"SELECT id, username, credential, service_id, nas_id, mac_binding, expires_at,
                      is_online, daily_bytes_down, daily_bytes_up, monthly_bytes_down,
                      monthly_bytes_up, fup_level_daily, fup_level_monthly, last_daily_reset,
                      last_monthly_reset, framed_ip
               FROM subscribers WHERE id = $1 FOR UPDATE"#,
        )
        .bind(subscriber_id)
        .fetch_optional(&mut tx)
        .await?
        .ok_or(StoreError::SubscriberNotFound)?;

        let service: Option<Service> = match before.service_id {
            Some(sid) => sqlx::query_as(
                r#"SELECT id, name, download_speed_kbps, upload_speed_kbps,
                          burst_download_kbps, burst_upload_kbps, daily_fup_tiers,
                          monthly_fup_tiers, time_based_speed_enabled,
                          time_window_start_min, time_window_end_min,
                          time_download_boost_pct, time_upload_boost_pct
                   FROM services WHERE id = $1"#,
            )
            .bind(sid)
            .fetch_optional(&mut tx)
            .await?,
            None => None,
        };

        let new_daily_down = before.daily_bytes_down + delta_down;
        let new_daily_up = before.daily_bytes_up + delta_up;
        let new_monthly_down = before.monthly_bytes_down + delta_down;
        let new_monthly_up = before.monthly_bytes_up + delta_up;

        let mut crossing = FupCrossing::default();

        let new_daily_level = if let Some(service) = &service {
            let level = advanced_fup_level(
                before.fup_level_daily,
                new_daily_down + new_daily_up,
                &service.daily_fup_tiers.0,
            );
            if level > before.fup_level_daily {
                crossing.daily_level = Some(level);
            }
            level
        } else {
            before.fup_level_daily
        };

        let new_monthly_level = if let Some(service) = &service {
            let level = advanced_fup_level(
                before.fup_level_monthly,
                new_monthly_down + new_monthly_up,
                &service.monthly_fup_tiers.0,
            );
            if level > before.fup_level_monthly {
                crossing.monthly_level = Some(level);
            }
            level
        } else {
            before.fup_level_monthly
        };

        let after: Subscriber = sqlx::query_as(
            r#"UPDATE subscribers SET
                 daily_bytes_down = $2, daily_bytes_up = $3,
                 monthly_bytes_down = $4, monthly_bytes_up = $5,
                 fup_level_daily = $6, fup_level_monthly = $7
               WHERE id = $1
               RETURNING id, username, credential, service_id, nas_id, mac_binding, expires_at,
                         is_online, daily_bytes_down, daily_bytes_up, monthly_bytes_down,
                         monthly_bytes_up, fup_level_daily, fup_level_monthly, last_daily_reset,
                         last_monthly_reset, framed_ip"#,
        )
        .bind(subscriber_id)
        .bind(new_daily_down)
        .bind(new_daily_up)
        .bind(new_monthly_down)
        .bind(new_monthly_up)
        .bind(new_daily_level)
        .bind(new_monthly_level)
        .fetch_one(&mut tx)
        .await?;

        tx.commit().await?;

        self.invalidate_subscriber(subscriber_id);
        Ok((after, crossing))
    }

    /// §4.1: `InvalidateSubscriber`, propagated via the pub/sub channel.
    pub fn invalidate_subscriber(&self, id: SubscriberId) {
        self.cache.invalidate_id(id);
        let _ = self.invalidation_tx.send(Invalidation::Subscriber(id));
    }

    pub async fn get_subscriber_by_id(&self, id: SubscriberId) -> Result<Subscriber, StoreError> {
        let subscriber: Option<Subscriber> = sqlx::query_as(
            r#"SELECT id, username, credential, service_id, nas_id, mac_binding, expires_at,
                      is_online, daily_bytes_down, daily_bytes_up, monthly_bytes_down,
                      monthly_bytes_up, fup_level_daily, fup_level_monthly, last_daily_reset,
                      last_monthly_reset, framed_ip
               FROM subscribers WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        subscriber.ok_or(StoreError::SubscriberNotFound)
    }

    pub async fn get_service_by_id(&self, id: ServiceId) -> Result<Option<Service>, StoreError> {
        let service: Option<Service> = sqlx::query_as(
            r#"SELECT id, name, download_speed_kbps, upload_speed_kbps,
                      burst_download_kbps, burst_upload_kbps, daily_fup_tiers,
                      monthly_fup_tiers, time_based_speed_enabled,
                      time_window_start_min, time_window_end_min,
                      time_download_boost_pct, time_upload_boost_pct
               FROM services WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(service)
    }

    pub async fn nas_by_ip(&self, ip: std::net::IpAddr) -> Result<Option<NasDevice>, StoreError> {
        let nas: Option<NasDevice> = sqlx::query_as(
            r#"SELECT id, name, management_ip, shared_secret, api_endpoint, api_username,
                      api_password, coa_port, online, last_seen
               FROM nas_devices WHERE management_ip = $1"#,
        )
        .bind(IpNetwork::from(ip))
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(nas)
    }

    pub async fn nas_by_id(&self, id: NasId) -> Result<Option<NasDevice>, StoreError> {
        let nas: Option<NasDevice> = sqlx::query_as(
            r#"SELECT id, name, management_ip, shared_secret, api_endpoint, api_username,
                      api_password, coa_port, online, last_seen
               FROM nas_devices WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(nas)
    }

    pub async fn online_subscribers_by_nas(
        &self,
        nas_id: NasId,
    ) -> Result<Vec<Subscriber>, StoreError> {
        let rows: Vec<Subscriber> = sqlx::query_as(
            r#"SELECT id, username, credential, service_id, nas_id, mac_binding, expires_at,
                      is_online, daily_bytes_down, daily_bytes_up, monthly_bytes_down,
                      monthly_bytes_up, fup_level_daily, fup_level_monthly, last_daily_reset,
                      last_monthly_reset, framed_ip
               FROM subscribers WHERE is_online = true AND nas_id = $1"#,
        )
        .bind(nas_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    pub async fn all_nas_devices(&self) -> Result<Vec<NasDevice>, StoreError> {
        let rows: Vec<NasDevice> = sqlx::query_as(
            r#"SELECT id, name, management_ip, shared_secret, api_endpoint, api_username,
                      api_password, coa_port, online, last_seen
               FROM nas_devices"#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    /// Active accounting rows, used by the static-IP conflict check (§4.2
    /// step 7): scans for any other session currently holding a given IP.
    pub async fn active_sessions_holding_ip(
        &self,
        framed_ip: IpNetwork,
        exclude_subscriber: SubscriberId,
    ) -> Result<Vec<AccountingRecord>, StoreError> {
        let rows: Vec<AccountingRecord> = sqlx::query_as(
            r#"SELECT session_id, subscriber_id, nas_id, framed_ip, start_time,
                      last_update_time, stop_time, bytes_up, bytes_down, termination_cause
               FROM rad_acct
               WHERE framed_ip = $1 AND subscriber_id != $2 AND stop_time IS NULL"#,
        )
        .bind(framed_ip)
        .bind(exclude_subscriber)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    /// §4.6 sharing-detection: subscribers holding more than `min_sessions`
    /// concurrently open `rad_acct` rows. Per-session TTL/packet-diversity
    /// sampling is vendor-specific NAS telemetry this generic capability
    /// interface doesn't carry (§6), so concurrent-open-session count is
    /// used as the diversity signal instead.
    pub async fn subscribers_with_concurrent_sessions(
        &self,
        min_sessions: i64,
    ) -> Result<Vec<(SubscriberId, i64)>, StoreError> {
        let rows: Vec<(SubscriberId, i64)> = sqlx::query_as(
            r#"SELECT subscriber_id, COUNT(*) AS session_count
               FROM rad_acct
               WHERE stop_time IS NULL
               GROUP BY subscriber_id
               HAVING COUNT(*) > $1"#,
        )
        .bind(min_sessions)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    pub async fn mark_subscriber_offline(&self, id: SubscriberId) -> Result<(), StoreError> {
        sqlx::query("UPDATE subscribers SET is_online = false WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        self.invalidate_subscriber(id);
        Ok(())
    }

    pub async fn active_bandwidth_rules(
        &self,
        subscriber_id: SubscriberId,
    ) -> Result<Vec<SubscriberBandwidthRule>, StoreError> {
        let rows: Vec<SubscriberBandwidthRule> = sqlx::query_as(
            r#"SELECT id, subscriber_id, kind, window_start_min, window_end_min,
                      override_download_kbps, override_upload_kbps
               FROM subscriber_bandwidth_rules WHERE subscriber_id = $1"#,
        )
        .bind(subscriber_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    pub async fn global_bandwidth_rules(&self) -> Result<Vec<BandwidthRule>, StoreError> {
        let rows: Vec<BandwidthRule> = sqlx::query_as(
            r#"SELECT id, window_start_min, window_end_min, days_of_week_mask,
                      download_boost_pct, upload_boost_pct, target_service_ids
               FROM bandwidth_rules"#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    pub async fn reset_daily_counters(&self, now: DateTime<Utc>) -> Result<Vec<SubscriberId>, StoreError> {
        let rows: Vec<(SubscriberId,)> = sqlx::query_as(
            r#"UPDATE subscribers SET
                 daily_bytes_down = 0, daily_bytes_up = 0,
                 fup_level_daily = 0, last_daily_reset = $1
               WHERE last_daily_reset < $1::date
               RETURNING id"#,
        )
        .bind(now)
        .fetch_all(self.pool.as_ref())
        .await?;
        let ids: Vec<SubscriberId> = rows.into_iter().map(|(id,)| id).collect();
        for id in &ids {
            self.invalidate_subscriber(*id);
        }
        Ok(ids)
    }

    pub async fn reset_monthly_counters(
        &self,
        subscriber_id: SubscriberId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE subscribers SET
                 monthly_bytes_down = 0, monthly_bytes_up = 0,
                 fup_level_monthly = 0, last_monthly_reset = $2
               WHERE id = $1"#,
        )
        .bind(subscriber_id)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;
        self.invalidate_subscriber(subscriber_id);
        Ok(())
    }

    pub async fn archive_accounting_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"INSERT INTO rad_acct_archive
                 SELECT * FROM rad_acct WHERE stop_time IS NOT NULL AND stop_time < $1"#,
        )
        .bind(cutoff)
        .execute(&mut tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM rad_acct WHERE stop_time IS NOT NULL AND stop_time < $1")
            .bind(cutoff)
            .execute(&mut tx)
            .await?;

        tx.commit().await?;
        Ok(moved)
    }

    pub async fn insert_alert(
        &self,
        kind: AlertKind,
        severity: AlertSeverity,
        subscriber_id: Option<SubscriberId>,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO alerts (kind, severity, subscriber_id, metadata, resolved)
               VALUES ($1, $2, $3, $4, false)"#,
        )
        .bind(serde_json::to_value(kind).unwrap().as_str().unwrap_or("unknown"))
        .bind(serde_json::to_value(severity).unwrap().as_str().unwrap_or("info"))
        .bind(subscriber_id)
        .bind(metadata)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }
}

/// Advance a FUP level monotonically against an ordered tier list. Never
/// decreases -- that is the FUP-monotonicity invariant (§8 property 2).
fn advanced_fup_level(current: i16, total_bytes: i64, tiers: &[FupTier]) -> i16 {
    let mut level = current;
    for (i, tier) in tiers.iter().enumerate() {
        let tier_level = (i + 1) as i16;
        if total_bytes >= tier.threshold_bytes && tier_level > level {
            level = tier_level;
        }
    }
    level
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers() -> Vec<FupTier> {
        vec![
            FupTier { threshold_bytes: 5_000_000_000, reduced_down_kbps: 1000, reduced_up_kbps: 500 },
            FupTier { threshold_bytes: 10_000_000_000, reduced_down_kbps: 500, reduced_up_kbps: 250 },
            FupTier { threshold_bytes: 20_000_000_000, reduced_down_kbps: 100, reduced_up_kbps: 50 },
        ]
    }

    #[test]
    fn fup_level_advances_monotonically() {
        let t = tiers();
        assert_eq!(advanced_fup_level(0, 4_000_000_000, &t), 0);
        assert_eq!(advanced_fup_level(0, 5_200_000_000, &t), 1);
        assert_eq!(advanced_fup_level(1, 10_100_000_000, &t), 2);
    }

    #[test]
    fn fup_level_never_decreases() {
        let t = tiers();
        // Already at level 2; a smaller observed total (e.g. stale re-read)
        // must not regress the level.
        assert_eq!(advanced_fup_level(2, 1_000_000_000, &t), 2);
    }

    #[test]
    fn overflow_buffer_drops_oldest() {
        let buf = AccountingOverflowBuffer::new(2);
        let mk = |i: i32| PendingAccountingWrite {
            session_id: format!("s{i}"),
            subscriber_id: i,
            nas_id: 1,
            framed_ip: None,
            bytes_up: 0,
            bytes_down: 0,
            event: AccountingEvent::Interim,
            timestamp: Utc::now(),
        };
        buf.push(mk(1));
        buf.push(mk(2));
        buf.push(mk(3));
        assert_eq!(buf.dropped_count(), 1);
        let drained = buf.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].session_id, "s2");
    }
}
