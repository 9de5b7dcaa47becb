//! Subscriber hot cache. Lock-free reads via `dashmap`, bounded staleness via
//! a per-entry TTL, invalidated early by the pub/sub channel in
//! [`super::invalidation`]. This generalizes the teacher's single-writer
//! worker-owned state (each `accounting_worker` in `accounter.rs` holds its
//! own `balance` variable, refreshed only by its own DB round trips) to a
//! cache shared for reads across the RADIUS server and Quota-Sync loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::models::{Service, Subscriber};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub subscriber: Subscriber,
    pub service: Option<Service>,
    pub fetched_at: Instant,
}

/// How long ago (relative to now) a cache hit was fetched from the database.
#[derive(Debug, Clone, Copy)]
pub struct CacheAge(pub Duration);

pub struct SubscriberCache {
    ttl: Duration,
    by_username: DashMap<String, Arc<CacheEntry>>,
    by_id: DashMap<i32, String>,
}

impl SubscriberCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            by_username: DashMap::new(),
            by_id: DashMap::new(),
        }
    }

    /// Returns a cache hit if present and not older than the configured TTL.
    pub fn get(&self, username: &str) -> Option<(Arc<CacheEntry>, CacheAge)> {
        let entry = self.by_username.get(username)?;
        let age = entry.fetched_at.elapsed();
        if age > self.ttl {
            return None;
        }
        Some((Arc::clone(&entry), CacheAge(age)))
    }

    pub fn put(&self, username: String, subscriber: Subscriber, service: Option<Service>) {
        let id = subscriber.id;
        let entry = Arc::new(CacheEntry {
            subscriber,
            service,
            fetched_at: Instant::now(),
        });
        self.by_id.insert(id, username.clone());
        self.by_username.insert(username, entry);
    }

    /// Drops any cached entry for `subscriber_id`, forcing the next lookup
    /// to go to the datastore. Called when an invalidation is received.
    pub fn invalidate_id(&self, subscriber_id: i32) {
        if let Some((_, username)) = self.by_id.remove(&subscriber_id) {
            self.by_username.remove(&username);
        }
    }

    pub fn len(&self) -> usize {
        self.by_username.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_username.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::*;
    use chrono::Utc;

    fn dummy_subscriber(id: i32) -> Subscriber {
        Subscriber {
            id,
            username: format!("user{id}@isp.net"),
            credential: vec![],
            service_id: None,
            nas_id: None,
            mac_binding: None,
            expires_at: None,
            is_online: false,
            daily_bytes_down: 0,
            daily_bytes_up: 0,
            monthly_bytes_down: 0,
            monthly_bytes_up: 0,
            fup_level_daily: 0,
            fup_level_monthly: 0,
            last_daily_reset: Utc::now(),
            last_monthly_reset: Utc::now(),
            framed_ip: None,
        }
    }

    #[test]
    fn hit_within_ttl() {
        let cache = SubscriberCache::new(Duration::from_secs(300));
        let sub = dummy_subscriber(1);
        cache.put(sub.username.clone(), sub.clone(), None);
        assert!(cache.get(&sub.username).is_some());
    }

    #[test]
    fn miss_past_ttl() {
        let cache = SubscriberCache::new(Duration::from_millis(0));
        let sub = dummy_subscriber(1);
        cache.put(sub.username.clone(), sub.clone(), None);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&sub.username).is_none());
    }

    #[test]
    fn invalidate_drops_entry() {
        let cache = SubscriberCache::new(Duration::from_secs(300));
        let sub = dummy_subscriber(7);
        cache.put(sub.username.clone(), sub.clone(), None);
        cache.invalidate_id(7);
        assert!(cache.get(&sub.username).is_none());
    }
}
