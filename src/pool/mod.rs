//! Pool management: origin-keyed pools with a global cap.

pub(crate) mod key;
pub(crate) mod per_origin;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::PoolConfig;
use crate::conn::Conn;
use crate::error::Result;

pub(crate) use key::Origin;
pub(crate) use per_origin::{Checkout, PerOriginPool, Poolable};

/// How a borrow ended, from the response surface's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Body fully consumed; the connection may be reused.
    Clean,
    /// Body abandoned; multiplexed streams are reset, HTTP/1 transports
    /// are spent.
    Canceled,
    /// The transport or stream faulted; never reuse.
    Broken,
}

impl Poolable for Conn {
    fn is_acquirable(&self, now: Instant) -> bool {
        Conn::is_acquirable(self, now)
    }

    fn is_multiplexed(&self) -> bool {
        Conn::is_multiplexed(self)
    }

    fn available_streams(&self) -> usize {
        Conn::available_streams(self)
    }

    fn in_flight(&self) -> usize {
        Conn::in_flight(self)
    }

    fn last_activity(&self) -> Instant {
        Conn::last_activity(self)
    }

    fn reserve_stream(&self) -> bool {
        Conn::reserve_stream(self)
    }

    fn finish_stream(&self) {
        Conn::finish_stream(self)
    }

    fn close(&self, reason: &'static str) {
        Conn::close(self, reason)
    }

    fn on_idle(self: &Arc<Self>) {
        self.set_keepalive_task(crate::keepalive::arm(self.clone()));
    }

    fn on_acquire(&self) {
        self.set_keepalive_task(None);
    }
}

/// Map a release outcome onto pool reusability for a given connection.
pub(crate) fn reusable_after(conn: &Conn, outcome: Outcome) -> bool {
    match outcome {
        Outcome::Clean => true,
        // The stream was reset under a multiplexed connection, which
        // survives; an HTTP/1 transport with an unread body does not.
        Outcome::Canceled => conn.is_multiplexed(),
        Outcome::Broken => false,
    }
}

struct PoolEntry {
    pool: Arc<PerOriginPool<Conn>>,
    last_used: u64,
}

/// Origin → per-origin pool, with LRU eviction of quiescent pools once
/// `num_pools` is exceeded. Pools holding connections are never evicted.
pub(crate) struct PoolManager {
    config: PoolConfig,
    clock: AtomicU64,
    pools: Mutex<HashMap<Origin, PoolEntry>>,
}

impl PoolManager {
    pub(crate) fn new(config: PoolConfig) -> PoolManager {
        PoolManager {
            config,
            clock: AtomicU64::new(0),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The pool for `origin`, created on first use.
    pub(crate) fn pool_for(&self, origin: &Origin) -> Result<Arc<PerOriginPool<Conn>>> {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut pools = self.pools.lock().expect("manager lock");

        if let Some(entry) = pools.get_mut(origin) {
            entry.last_used = stamp;
            return Ok(entry.pool.clone());
        }

        if pools.len() >= self.config.num_pools {
            evict_lru_empty(&mut pools);
        }

        let pool = PerOriginPool::new(self.config.clone());
        tracing::debug!(target: "weft::pool", origin = %origin, "pool created");
        pools.insert(
            origin.clone(),
            PoolEntry {
                pool: pool.clone(),
                last_used: stamp,
            },
        );
        Ok(pool)
    }

    /// Shut down every pool. Idle connections close now; borrowed ones
    /// close as they are released.
    pub(crate) fn shutdown(&self) {
        let pools = self.pools.lock().expect("manager lock");
        for entry in pools.values() {
            entry.pool.shutdown();
        }
    }

    #[cfg(test)]
    pub(crate) fn pool_count(&self) -> usize {
        self.pools.lock().expect("manager lock").len()
    }
}

fn evict_lru_empty(pools: &mut HashMap<Origin, PoolEntry>) {
    let victim = pools
        .iter()
        .filter(|(_, entry)| entry.pool.is_empty())
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(origin, _)| origin.clone());
    if let Some(origin) = victim {
        tracing::debug!(target: "weft::pool", origin = %origin, "evicting empty pool");
        if let Some(entry) = pools.remove(&origin) {
            entry.pool.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::url::parse_target;

    fn origin(target: &str) -> Origin {
        let (url, scheme) = parse_target(target).unwrap();
        Origin::new(&url, scheme, 0, None)
    }

    fn manager(num_pools: usize) -> PoolManager {
        PoolManager::new(PoolConfig {
            num_pools,
            ..PoolConfig::default()
        })
    }

    #[test]
    fn pools_are_cached_per_origin() {
        let manager = manager(4);
        let a1 = manager.pool_for(&origin("http://a.example/")).unwrap();
        let a2 = manager.pool_for(&origin("http://a.example/other")).unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(manager.pool_count(), 1);
    }

    #[test]
    fn lru_empty_pool_is_evicted_at_cap() {
        let manager = manager(2);
        manager.pool_for(&origin("http://a.example/")).unwrap();
        manager.pool_for(&origin("http://b.example/")).unwrap();
        // Touch a so b becomes the LRU.
        manager.pool_for(&origin("http://a.example/")).unwrap();
        manager.pool_for(&origin("http://c.example/")).unwrap();

        assert_eq!(manager.pool_count(), 2);
        let pools = manager.pools.lock().unwrap();
        assert!(pools.contains_key(&origin("http://a.example/")));
        assert!(pools.contains_key(&origin("http://c.example/")));
    }
}
