//! Idle-connection liveness probing.
//!
//! One task per idle multiplexed connection, armed when the connection
//! enters the idle set and aborted on acquisition. After `idle_window` of
//! silence a PING goes out; an unanswered PING closes the connection with
//! `ping_timeout` and the pool discards it on its next pass. Pinging stops
//! once `delay` has elapsed (unless `ping_forever` is set): the connection
//! then remains acquirable without verified liveness, trading a possible
//! doomed first attempt after a partition for fewer wakeups.

use std::sync::Arc;
use std::time::Instant;

use crate::conn::Conn;

/// Arm the keepalive watcher for a connection entering idle.
///
/// Returns `None` when the runtime is unavailable (release from a sync
/// drop outside tokio) or the connection is not multiplexed.
pub(crate) fn arm(conn: Arc<Conn>) -> Option<tokio::task::AbortHandle> {
    if !conn.is_multiplexed() {
        return None;
    }
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let task = runtime.spawn(watch(conn));
    Some(task.abort_handle())
}

async fn watch(conn: Arc<Conn>) {
    let cfg = conn.keepalive_cfg().clone();
    let window = cfg.effective_idle_window();
    let armed_at = Instant::now();

    loop {
        // Wake when the idle window would elapse relative to the last
        // observed traffic; any activity pushes the wakeup out.
        let due = conn.last_activity() + window;
        tokio::time::sleep_until(due.into()).await;

        if !matches!(
            conn.state(),
            crate::conn::State::Idle | crate::conn::State::Active
        ) {
            return;
        }
        if conn.in_flight() > 0 {
            // Someone acquired a stream without disarming; traffic will
            // reset the timer.
            return;
        }
        if conn.last_activity() + window > Instant::now() {
            continue;
        }
        if !cfg.ping_forever && armed_at.elapsed() >= cfg.delay {
            tracing::trace!(
                target: "weft::keepalive",
                id = conn.id,
                "keepalive delay elapsed, entering best-effort phase"
            );
            return;
        }

        match conn.ping(window).await {
            Ok(()) => {
                tracing::trace!(target: "weft::keepalive", id = conn.id, "ping acknowledged");
            }
            Err(e) => {
                tracing::debug!(
                    target: "weft::keepalive",
                    id = conn.id,
                    error = %e,
                    "ping unanswered, closing connection"
                );
                conn.close("ping_timeout");
                return;
            }
        }
    }
}
