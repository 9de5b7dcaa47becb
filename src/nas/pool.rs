//! Per-NAS connection pool (§5): capped at `nas_pool_size` (default 10),
//! idle-evicted after 5 minutes, force-recycled after 30 minutes, with a
//! health-ping on checkout. Grounded on the teacher's `dispatch_channel:
//! HashMap<IpAddr, Sender<WorkerMessage>>` directory in `accounter.rs` --
//! here the map holds pooled adapters per NAS instead of per-destination
//! worker handles.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::{NasAdapter, NasError};
use crate::db::models::{NasDevice, NasId};

struct PooledAdapter {
    adapter: Arc<dyn NasAdapter>,
    created_at: Instant,
    last_used: Instant,
}

const IDLE_EVICT: Duration = Duration::from_secs(5 * 60);
const FORCE_RECYCLE: Duration = Duration::from_secs(30 * 60);

pub struct NasPool {
    cap_per_nas: usize,
    slots: DashMap<NasId, Mutex<Vec<PooledAdapter>>>,
    builder: Box<dyn Fn(&NasDevice) -> Result<Arc<dyn NasAdapter>, NasError> + Send + Sync>,
}

impl NasPool {
    pub fn new(
        cap_per_nas: usize,
        builder: impl Fn(&NasDevice) -> Result<Arc<dyn NasAdapter>, NasError> + Send + Sync + 'static,
    ) -> Self {
        Self { cap_per_nas, slots: DashMap::new(), builder: Box::new(builder) }
    }

    /// Checks out an adapter for `nas`, reusing a pooled one if it passes a
    /// health ping and hasn't exceeded its recycle age; otherwise builds and
    /// returns a fresh one. The returned `Arc` may be shared across
    /// concurrent callers; HTTP adapters are safe to use that way.
    pub async fn checkout(&self, nas: &NasDevice) -> Result<Arc<dyn NasAdapter>, NasError> {
        let entry = self.slots.entry(nas.id).or_insert_with(|| Mutex::new(Vec::new()));
        let mut guard = entry.lock().await;

        while let Some(mut pooled) = guard.pop() {
            let age = pooled.created_at.elapsed();
            let idle = pooled.last_used.elapsed();
            if age > FORCE_RECYCLE || idle > IDLE_EVICT {
                continue;
            }
            if pooled.adapter.ping().await.is_ok() {
                pooled.last_used = Instant::now();
                let adapter = pooled.adapter.clone();
                guard.push(pooled);
                return Ok(adapter);
            }
        }

        let adapter = (self.builder)(nas)?;
        guard.push(PooledAdapter {
            adapter: adapter.clone(),
            created_at: Instant::now(),
            last_used: Instant::now(),
        });
        while guard.len() > self.cap_per_nas {
            guard.remove(0);
        }
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::MockNasAdapter;
    use ipnetwork::IpNetwork;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixture_nas() -> NasDevice {
        NasDevice {
            id: 1,
            name: "n1".into(),
            management_ip: IpNetwork::from(std::net::IpAddr::from([10, 0, 0, 1])),
            shared_secret: vec![],
            api_endpoint: "http://n1".into(),
            api_username: "admin".into(),
            api_password: "pw".into(),
            coa_port: 3799,
            online: true,
            last_seen: None,
        }
    }

    #[tokio::test]
    async fn reuses_a_healthy_pooled_adapter_instead_of_rebuilding() {
        let builds = Arc::new(AtomicUsize::new(0));
        let builds_for_closure = builds.clone();
        let pool = NasPool::new(4, move |_nas| {
            builds_for_closure.fetch_add(1, Ordering::SeqCst);
            let mut mock = MockNasAdapter::new();
            mock.expect_ping().returning(|| Ok(()));
            Ok(Arc::new(mock) as Arc<dyn NasAdapter>)
        });

        let nas = fixture_nas();
        pool.checkout(&nas).await.unwrap();
        pool.checkout(&nas).await.unwrap();
        pool.checkout(&nas).await.unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rebuilds_when_the_pooled_adapter_fails_its_health_ping() {
        let builds = Arc::new(AtomicUsize::new(0));
        let builds_for_closure = builds.clone();
        let pool = NasPool::new(4, move |_nas| {
            let build_no = builds_for_closure.fetch_add(1, Ordering::SeqCst);
            let mut mock = MockNasAdapter::new();
            if build_no == 0 {
                mock.expect_ping().returning(|| Err(NasError::Status(503)));
            } else {
                mock.expect_ping().returning(|| Ok(()));
            }
            Ok(Arc::new(mock) as Arc<dyn NasAdapter>)
        });

        let nas = fixture_nas();
        pool.checkout(&nas).await.unwrap();
        pool.checkout(&nas).await.unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }
}
