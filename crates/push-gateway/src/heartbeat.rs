//! Per-connection liveness prober.
//!
//! Every `interval` the monitor writes a protocol Ping through the
//! connection's write guard, then waits up to `timeout` for the read loop to
//! report any inbound frame. Silence or a failed probe write tears the
//! connection down. A ping that could not get the write guard in time is
//! skipped until the next tick. The monitor exits as soon as teardown starts, whichever
//! side triggered it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

use crate::connection::{Connection, TeardownReason};
use crate::registry::SessionRegistry;
use crate::transport::{Frame, TransportError};

/// Probe payload. Clients ignore it; it only makes pongs easy to spot in captures.
const PROBE_PAYLOAD: &[u8] = b"heartbeat";

/// Heartbeat policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between probes.
    pub interval: Duration,
    /// Maximum silence after a probe before the peer is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Read-side activity counter. The read loop bumps it on every inbound frame.
#[derive(Debug)]
pub struct ActivityTracker {
    tx: watch::Sender<u64>,
}

impl ActivityTracker {
    pub fn channel() -> (Self, watch::Receiver<u64>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx }, rx)
    }

    pub fn record(&self) {
        self.tx.send_modify(|seq| *seq = seq.wrapping_add(1));
    }
}

/// How the monitor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// Teardown was started elsewhere (read loop, push failure, shutdown).
    Cancelled,
    /// The read loop finished and dropped its activity tracker.
    ReaderGone,
    /// This monitor tore the connection down.
    TornDown(TeardownReason),
}

/// Run the heartbeat for `conn` until teardown.
pub async fn run(
    conn: Arc<Connection>,
    registry: Arc<SessionRegistry>,
    config: HeartbeatConfig,
    mut activity: watch::Receiver<u64>,
) -> HeartbeatExit {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = conn.cancelled() => return HeartbeatExit::Cancelled,
            _ = ticker.tick() => {}
        }

        // Anything seen before this probe does not count as a reply to it.
        activity.borrow_and_update();

        match conn.send(Frame::Ping(Bytes::from_static(PROBE_PAYLOAD))).await {
            Ok(()) => {}
            Err(TransportError::Busy(_)) => {
                debug!(connection_id = %conn.id(), "heartbeat ping deferred, writes queued");
                continue;
            }
            Err(e) => {
                warn!(
                    user_id = %conn.user_id(),
                    connection_id = %conn.id(),
                    error = %e,
                    "heartbeat probe failed"
                );
                return finish(&conn, &registry, TeardownReason::ProbeFailed).await;
            }
        }

        tokio::select! {
            _ = conn.cancelled() => return HeartbeatExit::Cancelled,
            reply = timeout(config.timeout, activity.changed()) => match reply {
                Ok(Ok(())) => {
                    debug!(connection_id = %conn.id(), "heartbeat ok");
                }
                Ok(Err(_)) => return HeartbeatExit::ReaderGone,
                Err(_) => {
                    warn!(
                        user_id = %conn.user_id(),
                        connection_id = %conn.id(),
                        timeout_ms = config.timeout.as_millis() as u64,
                        "heartbeat timed out"
                    );
                    return finish(&conn, &registry, TeardownReason::HeartbeatTimeout).await;
                }
            }
        }
    }
}

async fn finish(
    conn: &Connection,
    registry: &SessionRegistry,
    reason: TeardownReason,
) -> HeartbeatExit {
    if conn.teardown(registry, reason).await {
        HeartbeatExit::TornDown(reason)
    } else {
        HeartbeatExit::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::connection::UserId;
    use crate::transport::mock::MockHandle;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
        }
    }

    fn setup(mock: &MockHandle) -> (Arc<Connection>, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new());
        let conn = Arc::new(Connection::new(
            UserId(1),
            mock.sink(),
            Duration::from_millis(500),
        ));
        registry.register(conn.clone());
        (conn, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_reaped_after_timeout() {
        let mock = MockHandle::default();
        let (conn, registry) = setup(&mock);
        let (_tracker, rx) = ActivityTracker::channel();

        let start = Instant::now();
        let exit = run(conn.clone(), registry.clone(), config(), rx).await;

        assert_eq!(exit, HeartbeatExit::TornDown(TeardownReason::HeartbeatTimeout));
        // First probe at interval, reaped one timeout later.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "reaped too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2_100), "reaped too late: {elapsed:?}");
        assert_eq!(mock.pings(), 1);
        assert_eq!(mock.closes(), 1);
        assert!(registry.get(UserId(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ping_queued_behind_slow_pushes_is_deferred() {
        let mock = MockHandle::default();
        mock.delay_writes(Duration::from_millis(400));
        let (conn, registry) = setup(&mock);
        let (tracker, rx) = ActivityTracker::channel();

        let monitor = tokio::spawn(run(conn.clone(), registry.clone(), config(), rx));

        // Pushes hold the guard from 0.9s to 1.7s, so the 1s ping gives up
        // waiting at 1.5s. The 2s ping goes out at 2.4s.
        tokio::time::sleep(Duration::from_millis(900)).await;
        for text in ["a", "b"] {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(Frame::Text(text.into())).await });
        }
        tokio::time::sleep(Duration::from_millis(1_550)).await;
        tracker.record();
        tokio::task::yield_now().await;

        assert_eq!(mock.pings(), 1);
        assert_eq!(mock.sent_text(), vec!["a".to_string(), "b".to_string()]);
        assert!(!conn.is_closed());
        assert_eq!(mock.closes(), 0);
        assert!(registry.is_online(UserId(1)));

        conn.teardown(&registry, TeardownReason::PeerClosed).await;
        assert_eq!(monitor.await.unwrap(), HeartbeatExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn responsive_peer_stays_registered() {
        let mock = MockHandle::default();
        let (conn, registry) = setup(&mock);
        let (tracker, rx) = ActivityTracker::channel();

        let monitor = tokio::spawn(run(conn.clone(), registry.clone(), config(), rx));

        // Answer every probe shortly after it goes out.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(1_100)).await;
            tracker.record();
        }
        assert!(registry.is_online(UserId(1)));
        assert!(mock.pings() >= 4);
        assert_eq!(mock.closes(), 0);

        conn.teardown(&registry, TeardownReason::PeerClosed).await;
        assert_eq!(monitor.await.unwrap(), HeartbeatExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_tears_down_immediately() {
        let mock = MockHandle::default();
        mock.fail_writes();
        let (conn, registry) = setup(&mock);
        let (_tracker, rx) = ActivityTracker::channel();

        let exit = run(conn.clone(), registry.clone(), config(), rx).await;
        assert_eq!(exit, HeartbeatExit::TornDown(TeardownReason::ProbeFailed));
        assert_eq!(conn.teardown_reason(), Some(TeardownReason::ProbeFailed));
        assert_eq!(mock.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_reader_drops_tracker() {
        let mock = MockHandle::default();
        let (conn, registry) = setup(&mock);
        let (tracker, rx) = ActivityTracker::channel();

        let monitor = tokio::spawn(run(conn.clone(), registry.clone(), config(), rx));
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        drop(tracker);

        assert_eq!(monitor.await.unwrap(), HeartbeatExit::ReaderGone);
        assert_eq!(mock.closes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_before_probe_does_not_count() {
        let mock = MockHandle::default();
        let (conn, registry) = setup(&mock);
        let (tracker, rx) = ActivityTracker::channel();

        // Chatter before the first probe, then silence.
        tracker.record();
        tracker.record();

        let exit = run(conn, registry, config(), rx).await;
        assert_eq!(exit, HeartbeatExit::TornDown(TeardownReason::HeartbeatTimeout));
    }
}
