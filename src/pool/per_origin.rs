//! The per-origin connection pool.
//!
//! Bookkeeping only: every mutation happens under one short mutex, with
//! connection I/O strictly outside it. The pool is generic over
//! [`Poolable`] so the scheduling policy is testable without sockets.
//!
//! Acquisition policy: an unsaturated multiplexed connection is shared
//! straight from the idle set (it moves to active only once saturated);
//! otherwise the most recently parked HTTP/1 connection is popped (LIFO,
//! warm TCP/TLS); otherwise a new connection is opened if capacity allows;
//! otherwise the caller fails fast or joins the FIFO waiter queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::config::PoolConfig;
use crate::error::{self, PoolReason, Result, TimeoutPhase};

/// Pool-visible surface of a connection.
pub(crate) trait Poolable: Send + Sync + 'static {
    fn is_acquirable(&self, now: Instant) -> bool;
    fn is_multiplexed(&self) -> bool;
    fn available_streams(&self) -> usize;
    fn in_flight(&self) -> usize;
    fn last_activity(&self) -> Instant;
    /// Reserve one stream slot; false when saturated or not acquirable.
    fn reserve_stream(&self) -> bool;
    fn finish_stream(&self);
    fn close(&self, reason: &'static str);
    /// Entered the idle set with no in-flight streams.
    fn on_idle(self: &Arc<Self>) {}
    /// Left the idle set for a borrow.
    fn on_acquire(&self) {}
}

pub(crate) struct PerOriginPool<P: Poolable> {
    config: PoolConfig,
    inner: Mutex<PoolInner<P>>,
}

struct PoolInner<P> {
    idle: VecDeque<Arc<P>>,
    active: Vec<Arc<P>>,
    /// Slots reserved for connections currently being opened.
    opening: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
    shutdown: bool,
}

/// A reserved capacity slot: the holder may open one connection and must
/// register it or drop the permit.
pub(crate) struct OpenPermit<P: Poolable> {
    pool: Arc<PerOriginPool<P>>,
    armed: bool,
}

pub(crate) enum Checkout<P: Poolable> {
    /// An existing connection with a stream slot already reserved.
    Reuse(Arc<P>),
    /// Capacity to open a fresh connection.
    Open(OpenPermit<P>),
}

impl<P: Poolable> std::fmt::Debug for Checkout<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Checkout::Reuse(_) => f.write_str("Checkout::Reuse"),
            Checkout::Open(_) => f.write_str("Checkout::Open"),
        }
    }
}

enum Decision<P> {
    Reuse(Arc<P>),
    Open,
    Full,
    Wait(oneshot::Receiver<()>),
}

impl<P: Poolable> PerOriginPool<P> {
    pub(crate) fn new(config: PoolConfig) -> Arc<PerOriginPool<P>> {
        Arc::new(PerOriginPool {
            config,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                active: Vec::new(),
                opening: 0,
                waiters: VecDeque::new(),
                shutdown: false,
            }),
        })
    }

    /// Borrow a connection or a permit to open one.
    ///
    /// `shareable` allows joining an unsaturated multiplexed connection;
    /// without it the connection is held exclusively.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        deadline: Option<Instant>,
        shareable: bool,
    ) -> Result<Checkout<P>> {
        loop {
            let decision = self.decide(shareable);
            match decision {
                Ok(Decision::Reuse(conn)) => return Ok(Checkout::Reuse(conn)),
                Ok(Decision::Open) => {
                    return Ok(Checkout::Open(OpenPermit {
                        pool: self.clone(),
                        armed: true,
                    }))
                }
                Ok(Decision::Full) => return Err(error::pool(PoolReason::Full)),
                Ok(Decision::Wait(rx)) => {
                    let woken = match deadline {
                        Some(at) => tokio::time::timeout_at(at.into(), rx).await.ok(),
                        None => Some(rx.await),
                    };
                    if woken.is_none() {
                        return Err(error::timeout(TimeoutPhase::Connect));
                    }
                    // Woken (or the sender vanished); re-evaluate.
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn decide(&self, shareable: bool) -> Result<Decision<P>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("pool lock");
        if inner.shutdown {
            return Err(error::pool(PoolReason::Shutdown));
        }
        prune_idle(&mut inner, now);

        if shareable {
            if let Some(conn) = best_shared(&inner, now) {
                if conn.reserve_stream() {
                    conn.on_acquire();
                    if conn.available_streams() == 0 {
                        promote_to_active(&mut inner, &conn);
                    } else {
                        // Remaining stream capacity can serve a waiter too.
                        wake_one(&mut inner);
                    }
                    return Ok(Decision::Reuse(conn));
                }
            }
        }

        // Exclusive checkout: most recently idle connection with no
        // in-flight streams.
        while let Some(conn) = inner.idle.front().cloned() {
            if !conn.is_acquirable(now) {
                inner.idle.pop_front();
                conn.close("stale");
                continue;
            }
            if conn.in_flight() == 0 && conn.reserve_stream() {
                inner.idle.pop_front();
                conn.on_acquire();
                inner.active.push(conn.clone());
                return Ok(Decision::Reuse(conn));
            }
            break;
        }

        if inner.idle.len() + inner.active.len() + inner.opening < self.config.max_per_origin {
            inner.opening += 1;
            return Ok(Decision::Open);
        }
        if !self.config.block_if_full {
            return Ok(Decision::Full);
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.push_back(tx);
        Ok(Decision::Wait(rx))
    }

    /// Install a freshly opened connection under a permit.
    pub(crate) fn register(
        self: &Arc<Self>,
        mut permit: OpenPermit<P>,
        conn: Arc<P>,
    ) -> Arc<P> {
        permit.armed = false;
        let mut inner = self.inner.lock().expect("pool lock");
        inner.opening = inner.opening.saturating_sub(1);
        let reserved = conn.reserve_stream();
        debug_assert!(reserved, "fresh connection must accept a stream");
        // A late registration into a shut-down pool stays usable for this
        // one borrow and is destroyed on release.
        inner.active.push(conn.clone());
        if conn.is_multiplexed() && conn.available_streams() > 0 {
            // A fresh multiplexed connection can serve every waiter.
            wake_all(&mut inner);
        }
        conn
    }

    /// Return a borrowed connection.
    ///
    /// `reusable` is false for broken connections; they are closed, and a
    /// waiter is woken so it can open a replacement.
    pub(crate) fn release(&self, conn: &Arc<P>, reusable: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("pool lock");
        conn.finish_stream();

        if inner.shutdown {
            remove_everywhere(&mut inner, conn);
            if conn.in_flight() == 0 {
                conn.close("shutdown");
            }
            wake_one(&mut inner);
            return;
        }

        if !reusable || !conn.is_acquirable(now) {
            let draining_with_streams = conn.in_flight() > 0 && reusable;
            if !draining_with_streams {
                remove_everywhere(&mut inner, conn);
                conn.close("discarded by pool");
                wake_one(&mut inner);
            }
            return;
        }

        if conn.is_multiplexed() {
            if conn.available_streams() > 0 {
                demote_to_idle(&mut inner, conn);
            }
            if conn.in_flight() == 0 {
                conn.on_idle();
            }
        } else {
            // LIFO parking keeps the warmest transport on top.
            remove_everywhere(&mut inner, conn);
            inner.idle.push_front(conn.clone());
            conn.on_idle();
            while inner.idle.len() > self.config.max_idle_per_origin {
                if let Some(oldest) = inner.idle.pop_back() {
                    oldest.close("idle overflow");
                }
            }
        }
        wake_one(&mut inner);
    }

    /// Close idle connections now; in-flight ones are destroyed as they
    /// are released. Subsequent acquires fail with a shutdown error.
    pub(crate) fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("pool lock");
        inner.shutdown = true;
        while let Some(conn) = inner.idle.pop_front() {
            conn.close("shutdown");
        }
        while let Some(waiter) = inner.waiters.pop_front() {
            let _ = waiter.send(());
        }
    }

    /// Total connections this pool accounts for (idle, borrowed, opening).
    pub(crate) fn size(&self) -> usize {
        let inner = self.inner.lock().expect("pool lock");
        inner.idle.len() + inner.active.len() + inner.opening
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.inner.lock().expect("pool lock").idle.len()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.inner.lock().expect("pool lock").active.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl<P: Poolable> Drop for OpenPermit<P> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.pool.inner.lock().expect("pool lock");
            inner.opening = inner.opening.saturating_sub(1);
            wake_one(&mut inner);
        }
    }
}

fn prune_idle<P: Poolable>(inner: &mut PoolInner<P>, now: Instant) {
    inner.idle.retain(|conn| {
        if conn.is_acquirable(now) {
            true
        } else {
            conn.close("pruned");
            false
        }
    });
    inner
        .active
        .retain(|conn| conn.is_acquirable(now) || conn.in_flight() > 0);
}

/// Best multiplexed connection to share: most free streams, then the
/// freshest activity.
fn best_shared<P: Poolable>(inner: &PoolInner<P>, now: Instant) -> Option<Arc<P>> {
    inner
        .idle
        .iter()
        .chain(inner.active.iter())
        .filter(|c| c.is_multiplexed() && c.is_acquirable(now) && c.available_streams() > 0)
        .max_by_key(|c| (c.available_streams(), c.last_activity()))
        .cloned()
}

fn promote_to_active<P: Poolable>(inner: &mut PoolInner<P>, conn: &Arc<P>) {
    if let Some(pos) = inner.idle.iter().position(|c| Arc::ptr_eq(c, conn)) {
        inner.idle.remove(pos);
        inner.active.push(conn.clone());
    }
}

fn demote_to_idle<P: Poolable>(inner: &mut PoolInner<P>, conn: &Arc<P>) {
    if let Some(pos) = inner.active.iter().position(|c| Arc::ptr_eq(c, conn)) {
        inner.active.remove(pos);
        inner.idle.push_front(conn.clone());
    } else if !inner.idle.iter().any(|c| Arc::ptr_eq(c, conn)) {
        inner.idle.push_front(conn.clone());
    }
}

fn remove_everywhere<P: Poolable>(inner: &mut PoolInner<P>, conn: &Arc<P>) {
    if let Some(pos) = inner.idle.iter().position(|c| Arc::ptr_eq(c, conn)) {
        inner.idle.remove(pos);
    }
    if let Some(pos) = inner.active.iter().position(|c| Arc::ptr_eq(c, conn)) {
        inner.active.remove(pos);
    }
}

fn wake_one<P>(inner: &mut PoolInner<P>) {
    while let Some(waiter) = inner.waiters.pop_front() {
        if waiter.send(()).is_ok() {
            return;
        }
    }
}

fn wake_all<P>(inner: &mut PoolInner<P>) {
    while let Some(waiter) = inner.waiters.pop_front() {
        let _ = waiter.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeConn {
        multiplexed: bool,
        max_streams: usize,
        in_flight: AtomicUsize,
        open: AtomicBool,
        last_activity: Mutex<Instant>,
    }

    impl FakeConn {
        fn h1() -> Arc<FakeConn> {
            Arc::new(FakeConn {
                multiplexed: false,
                max_streams: 1,
                in_flight: AtomicUsize::new(0),
                open: AtomicBool::new(true),
                last_activity: Mutex::new(Instant::now()),
            })
        }

        fn h2(max_streams: usize) -> Arc<FakeConn> {
            Arc::new(FakeConn {
                multiplexed: true,
                max_streams,
                in_flight: AtomicUsize::new(0),
                open: AtomicBool::new(true),
                last_activity: Mutex::new(Instant::now()),
            })
        }
    }

    impl Poolable for FakeConn {
        fn is_acquirable(&self, _now: Instant) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        fn is_multiplexed(&self) -> bool {
            self.multiplexed
        }
        fn available_streams(&self) -> usize {
            self.max_streams
                .saturating_sub(self.in_flight.load(Ordering::SeqCst))
        }
        fn in_flight(&self) -> usize {
            self.in_flight.load(Ordering::SeqCst)
        }
        fn last_activity(&self) -> Instant {
            *self.last_activity.lock().unwrap()
        }
        fn reserve_stream(&self) -> bool {
            if !self.open.load(Ordering::SeqCst) {
                return false;
            }
            let prev = self.in_flight.fetch_add(1, Ordering::SeqCst);
            if prev >= self.max_streams {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                false
            } else {
                true
            }
        }
        fn finish_stream(&self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        fn close(&self, _reason: &'static str) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    fn config(max: usize, block: bool) -> PoolConfig {
        PoolConfig {
            num_pools: 4,
            max_per_origin: max,
            max_idle_per_origin: max,
            block_if_full: block,
        }
    }

    async fn open_and_register(pool: &Arc<PerOriginPool<FakeConn>>, conn: Arc<FakeConn>) {
        match pool.acquire(None, true).await.unwrap() {
            Checkout::Open(permit) => {
                pool.register(permit, conn);
            }
            Checkout::Reuse(_) => panic!("expected open permit"),
        }
    }

    #[tokio::test]
    async fn empty_pool_hands_out_open_permit() {
        let pool = PerOriginPool::<FakeConn>::new(config(2, true));
        open_and_register(&pool, FakeConn::h1()).await;
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.active_count(), 1);
    }

    #[tokio::test]
    async fn h1_release_parks_lifo_and_is_reused() {
        let pool = PerOriginPool::<FakeConn>::new(config(2, true));
        let conn = FakeConn::h1();
        open_and_register(&pool, conn.clone()).await;
        pool.release(&conn, true);
        assert_eq!(pool.idle_count(), 1);

        match pool.acquire(None, true).await.unwrap() {
            Checkout::Reuse(reused) => assert!(Arc::ptr_eq(&reused, &conn)),
            Checkout::Open(_) => panic!("expected reuse of idle h1"),
        }
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.active_count(), 1);
    }

    #[tokio::test]
    async fn multiplexed_connection_is_shared_until_saturated() {
        let pool = PerOriginPool::<FakeConn>::new(config(1, false));
        let conn = FakeConn::h2(2);
        open_and_register(&pool, conn.clone()).await;
        pool.release(&conn, true);
        assert_eq!(pool.idle_count(), 1);

        // Two borrows share the one connection; it stays idle-listed
        // until it saturates.
        let first = pool.acquire(None, true).await.unwrap();
        assert!(matches!(first, Checkout::Reuse(_)));
        assert_eq!(pool.idle_count(), 1);

        let second = pool.acquire(None, true).await.unwrap();
        assert!(matches!(second, Checkout::Reuse(_)));
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.active_count(), 1);

        // Saturated and at max_per_origin: non-blocking acquire fails.
        let err = pool.acquire(None, true).await.unwrap_err();
        assert!(err.is_pool_full());
    }

    #[tokio::test]
    async fn broken_release_discards_and_frees_capacity() {
        let pool = PerOriginPool::<FakeConn>::new(config(1, false));
        let conn = FakeConn::h1();
        open_and_register(&pool, conn.clone()).await;

        pool.release(&conn, false);
        assert_eq!(pool.size(), 0);
        assert!(!conn.open.load(Ordering::SeqCst));

        // Capacity is available again.
        assert!(matches!(
            pool.acquire(None, true).await.unwrap(),
            Checkout::Open(_)
        ));
    }

    #[tokio::test]
    async fn waiter_is_woken_fifo_on_release() {
        let pool = PerOriginPool::<FakeConn>::new(config(1, true));
        let conn = FakeConn::h1();
        open_and_register(&pool, conn.clone()).await;

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire(None, true).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(&conn, true);
        let checkout = waiter.await.unwrap().unwrap();
        assert!(matches!(checkout, Checkout::Reuse(_)));
    }

    #[tokio::test]
    async fn waiter_times_out_at_deadline() {
        let pool = PerOriginPool::<FakeConn>::new(config(1, true));
        let conn = FakeConn::h1();
        open_and_register(&pool, conn).await;

        let deadline = Instant::now() + Duration::from_millis(30);
        let err = pool.acquire(Some(deadline), true).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn shutdown_closes_idle_and_rejects_acquires() {
        let pool = PerOriginPool::<FakeConn>::new(config(2, true));
        let conn = FakeConn::h1();
        open_and_register(&pool, conn.clone()).await;
        pool.release(&conn, true);

        pool.shutdown();
        assert!(!conn.open.load(Ordering::SeqCst));
        let err = pool.acquire(None, true).await.unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::Kind::Pool(PoolReason::Shutdown)
        ));
    }

    #[tokio::test]
    async fn dropped_permit_frees_its_slot() {
        let pool = PerOriginPool::<FakeConn>::new(config(1, false));
        let permit = match pool.acquire(None, true).await.unwrap() {
            Checkout::Open(permit) => permit,
            Checkout::Reuse(_) => panic!("expected permit"),
        };
        assert_eq!(pool.size(), 1);
        drop(permit);
        assert_eq!(pool.size(), 0);
        assert!(matches!(
            pool.acquire(None, true).await.unwrap(),
            Checkout::Open(_)
        ));
    }

    #[tokio::test]
    async fn pool_never_exceeds_max_size() {
        let pool = PerOriginPool::<FakeConn>::new(config(2, false));
        let a = FakeConn::h1();
        let b = FakeConn::h1();
        open_and_register(&pool, a.clone()).await;
        open_and_register(&pool, b.clone()).await;
        assert_eq!(pool.size(), 2);
        assert!(pool.acquire(None, true).await.unwrap_err().is_pool_full());

        pool.release(&a, true);
        pool.release(&b, true);
        assert_eq!(pool.size(), 2);
        assert!(pool.idle_count() + pool.active_count() <= 2);
    }
}
