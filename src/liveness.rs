//! Liveness monitor: ping/pong (§4.4).
//!
//! Active iff `ping_interval_ms > 0`; the invariant `ping_timeout_ms <
//! ping_interval_ms` is enforced by [`crate::settings::ServerSettings::validate`]
//! before a server ever spawns this loop.

use crate::codec::{DataType, Package, PackageType};
use crate::error::HandlerErrorKind;
use crate::handler::{PackageCallbacks, PackageHandler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Tracks whether the remote peer has shown signs of life since the last
/// ping was sent (§4.4: "Server sets `pong_status = true` on `Pong` or any
/// data package").
pub struct PongTracker {
    pong_status: AtomicBool,
}

impl PongTracker {
    /// Starts "not yet confirmed alive": the first idle cycle after join
    /// always pings rather than assuming liveness from the join itself.
    pub fn new() -> Self {
        Self {
            pong_status: AtomicBool::new(false),
        }
    }

    /// Called from the obtain loop's `on_internal`/`on_data` handling
    /// whenever a `Pong` or any data package arrives.
    pub fn mark_alive(&self) {
        self.pong_status.store(true, Ordering::Release);
    }

    fn clear(&self) {
        self.pong_status.store(false, Ordering::Release);
    }

    fn is_alive(&self) -> bool {
        self.pong_status.load(Ordering::Acquire)
    }

    /// Reads the flag and resets it to false in one step. Used at the top of
    /// each idle cycle: a sign of life is only good for the cycle it arrived
    /// in, otherwise one stray data package would suppress every future ping
    /// forever (§4.4 step 2 "skip this cycle" is per-cycle, not sticky).
    fn take_alive(&self) -> bool {
        self.pong_status.swap(false, Ordering::AcqRel)
    }
}

impl Default for PongTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the server-side ping timer for one client until `cancel` fires
/// (§4.4). On a timeout, invokes `callbacks.on_error(PingTimeout)` — the
/// handler/handshake layer decides whether that's recoverable (Panic) or
/// terminal, per §7 policy.
pub async fn run_ping_monitor<R, W, Cb>(
    handler: Arc<PackageHandler<R, W, Cb>>,
    tracker: Arc<PongTracker>,
    interval_ms: u64,
    timeout_ms: u64,
    cancel: CancellationToken,
    callbacks: Arc<Cb>,
) where
    R: AsyncReadExt + Unpin + Send + 'static,
    W: AsyncWriteExt + Unpin + Send + 'static,
    Cb: PackageCallbacks,
{
    if interval_ms == 0 {
        return;
    }
    debug_assert!(timeout_ms < interval_ms, "ping_timeout_ms must be < ping_interval_ms");

    let idle = Duration::from_millis(interval_ms.saturating_sub(timeout_ms));
    let timeout = Duration::from_millis(timeout_ms);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(idle) => {}
            _ = cancel.cancelled() => return,
        }
        if cancel.is_cancelled() {
            return;
        }

        if tracker.take_alive() {
            // Data or a pong arrived during the idle window; skip this cycle.
            // take_alive() already reset the flag so the *next* cycle starts
            // unconfirmed again rather than skipping forever.
            continue;
        }

        if handler.send(Package::new(PackageType::Ping, DataType::Empty, None)).is_err() {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = cancel.cancelled() => return,
        }
        if cancel.is_cancelled() {
            return;
        }

        if !tracker.is_alive() {
            warn!("ping timeout");
            callbacks.on_error(HandlerErrorKind::PingTimeout).await;
            return;
        }
    }
}

/// Client-side response to an inbound `Ping`: pause the dispatch loop so
/// the pong is not interleaved with an in-flight queued write, reply
/// directly, then resume (§4.4).
pub async fn respond_to_ping<R, W, Cb>(handler: &PackageHandler<R, W, Cb>)
where
    R: AsyncReadExt + Unpin + Send + 'static,
    W: AsyncWriteExt + Unpin + Send + 'static,
    Cb: PackageCallbacks,
{
    handler.pause_all().await;
    let pong = Package::empty(PackageType::Pong);
    if handler.dispatch(&pong).await.is_err() {
        debug!("failed to dispatch pong");
    }
    handler.resume_all().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_starts_unconfirmed() {
        let tracker = PongTracker::new();
        assert!(!tracker.is_alive());
    }

    #[test]
    fn clear_then_mark_alive_round_trips() {
        let tracker = PongTracker::new();
        tracker.clear();
        assert!(!tracker.is_alive());
        tracker.mark_alive();
        assert!(tracker.is_alive());
    }
}
