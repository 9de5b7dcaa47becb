//! Quota-Sync Loop (§4.4). Every tick, polls each NAS's active sessions,
//! computes deltas against previously observed counters, serializes the
//! per-subscriber counter update, and enqueues enforcement on FUP
//! crossings. Grounded on `accounter.rs`'s dispatcher/per-key-worker
//! pattern: here the dispatcher fans out per NAS (bounded by a semaphore
//! instead of one task per destination) and applies a per-subscriber lock
//! shard instead of per-destination channels, since the work per
//! subscriber is a single request-response DB call rather than a stream of
//! packets.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ipnetwork::IpNetwork;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{interval, timeout};

use crate::db::models::{NasDevice, NasId, SubscriberId};
use crate::db::{AccountingEvent, PendingAccountingWrite, Store};
use crate::enforcement::{Dispatcher, StrategyHint};
use crate::nas::pool::NasPool;
use crate::nas::ActiveSession;
use crate::policy;

const NAS_POLL_DEADLINE: Duration = Duration::from_secs(10);
const TICK_DEADLINE: Duration = Duration::from_secs(25);

/// Previously observed cumulative counters per subscriber, used to compute
/// deltas and detect router counter resets (§4.4 step 2c).
#[derive(Default)]
struct ObservedCounters {
    by_subscriber: DashMap<SubscriberId, (i64, i64)>,
}

/// The last session a subscriber was actually seen on, kept so a missing
/// subscriber's synthetic Stop (§4.4 step 2e) carries the right session id,
/// NAS and final byte counts instead of a blank record.
#[derive(Debug, Clone)]
struct SessionSnapshot {
    session_id: String,
    nas_id: NasId,
    framed_ip: Option<IpNetwork>,
    bytes_up: i64,
    bytes_down: i64,
}

pub struct QuotaSyncLoop {
    store: Arc<Store>,
    nas_pool: Arc<NasPool>,
    dispatcher: Arc<Dispatcher>,
    observed: ObservedCounters,
    last_session: DashMap<SubscriberId, SessionSnapshot>,
    pending_offline: DashMap<SubscriberId, ()>,
    subscriber_locks: DashMap<SubscriberId, Arc<Mutex<()>>>,
    max_concurrent_nas: usize,
    timezone: chrono_tz::Tz,
    boost_stacks_on_override: bool,
    log: slog::Logger,
}

impl QuotaSyncLoop {
    pub fn new(
        store: Arc<Store>,
        nas_pool: Arc<NasPool>,
        dispatcher: Arc<Dispatcher>,
        max_concurrent_nas: usize,
        timezone: chrono_tz::Tz,
        boost_stacks_on_override: bool,
        log: slog::Logger,
    ) -> Self {
        Self {
            store,
            nas_pool,
            dispatcher,
            observed: ObservedCounters::default(),
            last_session: DashMap::new(),
            pending_offline: DashMap::new(),
            subscriber_locks: DashMap::new(),
            max_concurrent_nas,
            timezone,
            boost_stacks_on_override,
            log,
        }
    }

    pub async fn run(self: Arc<Self>, tick_period: Duration) {
        let mut ticker = interval(tick_period);
        loop {
            ticker.tick().await;
            let this = self.clone();
            if timeout(TICK_DEADLINE, this.run_tick()).await.is_err() {
                slog::warn!(self.log, "quota-sync tick exceeded global deadline");
            }
        }
    }

    async fn run_tick(self: Arc<Self>) {
        let nas_devices = match self.store.all_nas_devices().await {
            Ok(v) => v,
            Err(e) => {
                slog::warn!(self.log, "quota-sync failed to list NAS devices"; "err" => %e);
                return;
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_nas));
        let mut handles = Vec::with_capacity(nas_devices.len());

        for nas in nas_devices {
            let semaphore = semaphore.clone();
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.unwrap();
                this.poll_one_nas(&nas).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn poll_one_nas(&self, nas: &NasDevice) {
        let result = timeout(NAS_POLL_DEADLINE, self.poll_nas_inner(nas)).await;
        if result.is_err() {
            slog::warn!(self.log, "NAS poll exceeded deadline, skipped this tick"; "nas_id" => nas.id);
        }
    }

    async fn poll_nas_inner(&self, nas: &NasDevice) {
        let adapter = match self.nas_pool.checkout(nas).await {
            Ok(a) => a,
            Err(e) => {
                slog::warn!(self.log, "failed to check out NAS adapter"; "nas_id" => nas.id, "err" => %e);
                return;
            }
        };

        let sessions = match adapter.list_active_sessions().await {
            Ok(s) => s,
            Err(e) => {
                slog::warn!(self.log, "failed to list active sessions"; "nas_id" => nas.id, "err" => %e);
                return;
            }
        };

        let online = match self.store.online_subscribers_by_nas(nas.id).await {
            Ok(v) => v,
            Err(e) => {
                slog::warn!(self.log, "failed to list online subscribers"; "nas_id" => nas.id, "err" => %e);
                return;
            }
        };

        let seen_usernames: std::collections::HashSet<&str> =
            sessions.iter().map(|s| s.username.as_str()).collect();

        for subscriber in &online {
            if seen_usernames.contains(subscriber.username.as_str()) {
                self.pending_offline.remove(&subscriber.id);
                continue;
            }

            // §4.4 step 2e: give a subscriber one further tick before
            // declaring them offline, in case this was just a transient gap
            // in the NAS's session listing.
            if self.pending_offline.remove(&subscriber.id).is_some() {
                self.finalize_missing_subscriber(subscriber.id).await;
            } else {
                self.pending_offline.insert(subscriber.id, ());
            }
        }

        for session in &sessions {
            self.apply_session(nas, session).await;
        }
    }

    /// Marks a subscriber offline after they've been missing from their
    /// NAS's session list for two consecutive ticks, synthesizing the Stop
    /// record the NAS never sent so `rad_acct` still gets a closed session.
    async fn finalize_missing_subscriber(&self, subscriber_id: SubscriberId) {
        self.observed.by_subscriber.remove(&subscriber_id);

        let snapshot = match self.last_session.remove(&subscriber_id) {
            Some((_, s)) => s,
            None => {
                if let Err(e) = self.store.mark_subscriber_offline(subscriber_id).await {
                    slog::warn!(self.log, "failed to mark subscriber offline"; "subscriber_id" => subscriber_id, "err" => %e);
                }
                return;
            }
        };

        let write = PendingAccountingWrite {
            session_id: snapshot.session_id,
            subscriber_id,
            nas_id: snapshot.nas_id,
            framed_ip: snapshot.framed_ip,
            bytes_up: snapshot.bytes_up,
            bytes_down: snapshot.bytes_down,
            event: AccountingEvent::Stop { cause: "lost-carrier" },
            timestamp: chrono::Utc::now(),
        };

        match self.store.upsert_accounting_record(&write).await {
            Ok(()) => {}
            Err(e) => {
                slog::warn!(self.log, "failed to write synthetic accounting stop, queuing to overflow"; "subscriber_id" => subscriber_id, "err" => %e);
                self.store.overflow.push(write);
            }
        }
    }

    async fn apply_session(&self, nas: &NasDevice, session: &ActiveSession) {
        let (subscriber, service, _age) = match self.store.get_subscriber_by_username(&session.username).await {
            Ok(v) => v,
            Err(e) => {
                slog::debug!(self.log, "quota-sync saw unknown username"; "nas_id" => nas.id, "username" => %session.username, "err" => %e);
                return;
            }
        };

        self.pending_offline.remove(&subscriber.id);
        self.last_session.insert(
            subscriber.id,
            SessionSnapshot {
                session_id: session.session_id.clone(),
                nas_id: nas.id,
                framed_ip: session
                    .framed_ip
                    .as_deref()
                    .and_then(|ip| ip.parse::<std::net::IpAddr>().ok())
                    .map(IpNetwork::from),
                bytes_up: session.bytes_up,
                bytes_down: session.bytes_down,
            },
        );

        let lock = self
            .subscriber_locks
            .entry(subscriber.id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let (delta_down, delta_up) = self.compute_delta(subscriber.id, session.bytes_down, session.bytes_up);
        if delta_down == 0 && delta_up == 0 {
            return;
        }

        let (updated, crossing) = match self
            .store
            .update_subscriber_counters(subscriber.id, delta_down, delta_up, chrono::Utc::now())
            .await
        {
            Ok(v) => v,
            Err(e) => {
                slog::warn!(self.log, "failed to update subscriber counters"; "subscriber_id" => subscriber.id, "err" => %e);
                return;
            }
        };

        if !crossing.is_empty() {
            let now = chrono::Utc::now().with_timezone(&self.timezone);
            let rules = self
                .store
                .active_bandwidth_rules(updated.id)
                .await
                .unwrap_or_default();
            let global_rules = self.store.global_bandwidth_rules().await.unwrap_or_default();
            let resolved = policy::resolve(
                &updated,
                service.as_ref(),
                &rules,
                &global_rules,
                &now,
                self.boost_stacks_on_override,
            );
            self.dispatcher
                .enqueue(updated.id, resolved.down_kbps, resolved.up_kbps, StrategyHint::Auto)
                .await;
        }
    }

    fn compute_delta(&self, subscriber_id: SubscriberId, observed_down: i64, observed_up: i64) -> (i64, i64) {
        let mut entry = self
            .observed
            .by_subscriber
            .entry(subscriber_id)
            .or_insert((0, 0));
        let (prev_down, prev_up) = *entry;

        // A counter-reset tolerance: if the router-observed value regressed
        // by more than 1% of the previous value (allowing for jitter in a
        // router's own reporting), treat it as a counter reset rather than
        // a stale poll.
        let reset_tolerance = |prev: i64| (prev / 100).max(4096);

        let delta_down = if observed_down + reset_tolerance(prev_down) < prev_down {
            observed_down
        } else {
            (observed_down - prev_down).max(0)
        };
        let delta_up = if observed_up + reset_tolerance(prev_up) < prev_up {
            observed_up
        } else {
            (observed_up - prev_up).max(0)
        };

        *entry = (observed_down, observed_up);
        (delta_down, delta_up)
    }
}
