//! Drives one authenticated connection from registration to close.
//!
//! Authentication happens in the upgrade handler, before any transport
//! exists. From there: register, spawn the heartbeat, read until the peer goes
//! away or teardown is triggered elsewhere, then tear down (idempotent) and
//! wait for the heartbeat task to notice.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::{Stream, StreamExt};
use tracing::{debug, info};

use crate::connection::{Connection, Phase, TeardownReason, UserId};
use crate::heartbeat::{self, ActivityTracker, HeartbeatConfig};
use crate::metrics;
use crate::registry::SessionRegistry;
use crate::transport::{Frame, FrameSink, TransportError};

/// Per-connection settings resolved from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub heartbeat: HeartbeatConfig,
    /// Bound on any single write, including waiting for the write guard.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Register `user_id`'s new transport and serve it until it dies.
///
/// Returns the reason recorded by whichever path tore the connection down.
pub async fn run_session<S>(
    registry: Arc<SessionRegistry>,
    config: SessionConfig,
    user_id: UserId,
    sink: Box<dyn FrameSink>,
    stream: S,
) -> TeardownReason
where
    S: Stream<Item = Result<Frame, TransportError>> + Send + Unpin,
{
    let conn = Arc::new(Connection::new(user_id, sink, config.write_timeout));
    registry.register(conn.clone());
    metrics::record_connection_opened();
    info!(
        user_id = %user_id,
        connection_id = %conn.id(),
        connections = registry.connection_count(user_id),
        "session started"
    );

    serve(conn.clone(), registry, config, stream).await;

    metrics::record_connection_closed();
    conn.teardown_reason().unwrap_or(TeardownReason::PeerClosed)
}

/// Serve an already-registered connection: heartbeat plus read loop, then
/// teardown.
pub async fn serve<S>(
    conn: Arc<Connection>,
    registry: Arc<SessionRegistry>,
    config: SessionConfig,
    mut stream: S,
) where
    S: Stream<Item = Result<Frame, TransportError>> + Send + Unpin,
{
    conn.set_phase(Phase::Serving);

    let (activity, activity_rx) = ActivityTracker::channel();
    let monitor = tokio::spawn(heartbeat::run(
        conn.clone(),
        registry.clone(),
        config.heartbeat,
        activity_rx,
    ));

    let reason = loop {
        tokio::select! {
            _ = conn.cancelled() => break None,
            next = stream.next() => match next {
                Some(Ok(Frame::Close)) => break Some(TeardownReason::PeerClosed),
                Some(Ok(frame)) => {
                    activity.record();
                    // Inbound application data is not part of the protocol.
                    if let Frame::Text(text) = &frame {
                        debug!(
                            connection_id = %conn.id(),
                            len = text.len(),
                            "ignoring inbound text frame"
                        );
                    }
                }
                Some(Err(e)) => {
                    debug!(connection_id = %conn.id(), error = %e, "read failed");
                    break Some(TeardownReason::ReadError);
                }
                None => break Some(TeardownReason::PeerClosed),
            }
        }
    };

    if let Some(reason) = reason {
        conn.teardown(&registry, reason).await;
    }

    // Dropping the tracker also wakes a monitor waiting for a reply.
    drop(activity);
    if let Err(e) = monitor.await {
        debug!(connection_id = %conn.id(), error = %e, "heartbeat task ended abnormally");
    }
}

/// Tear down every live connection, e.g. on server shutdown. Returns how many
/// this call closed.
pub async fn shutdown_all(registry: &SessionRegistry) -> usize {
    let teardowns = registry
        .snapshot_all()
        .into_iter()
        .map(|conn| async move { conn.teardown(registry, TeardownReason::ShuttingDown).await });
    let closed = join_all(teardowns)
        .await
        .into_iter()
        .filter(|closed| *closed)
        .count();
    info!(closed, "all sessions shut down");
    closed
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;
    use crate::transport::mock::MockHandle;

    type Inbound = mpsc::UnboundedSender<Result<Frame, TransportError>>;

    fn config() -> SessionConfig {
        SessionConfig {
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(1),
                timeout: Duration::from_secs(1),
            },
            write_timeout: Duration::from_millis(200),
        }
    }

    fn spawn_session(
        registry: &Arc<SessionRegistry>,
        uid: i64,
    ) -> (MockHandle, Inbound, tokio::task::JoinHandle<TeardownReason>) {
        let mock = MockHandle::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_session(
            registry.clone(),
            config(),
            UserId(uid),
            mock.sink(),
            UnboundedReceiverStream::new(rx),
        ));
        (mock, tx, handle)
    }

    async fn wait_until_online(registry: &SessionRegistry, uid: i64, count: usize) {
        while registry.connection_count(UserId(uid)) < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn read_error_tears_down_once() {
        let registry = Arc::new(SessionRegistry::new());
        let (mock, tx, handle) = spawn_session(&registry, 1);
        wait_until_online(&registry, 1, 1).await;

        tx.send(Err(TransportError::Io("reset by peer".into()))).unwrap();
        assert_eq!(handle.await.unwrap(), TeardownReason::ReadError);
        assert!(registry.get(UserId(1)).is_none());
        assert_eq!(mock.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_frame_ends_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (mock, tx, handle) = spawn_session(&registry, 1);
        wait_until_online(&registry, 1, 1).await;

        tx.send(Ok(Frame::Close)).unwrap();
        assert_eq!(handle.await.unwrap(), TeardownReason::PeerClosed);
        assert_eq!(mock.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_stream_ends_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (mock, tx, handle) = spawn_session(&registry, 1);
        wait_until_online(&registry, 1, 1).await;

        drop(tx);
        assert_eq!(handle.await.unwrap(), TeardownReason::PeerClosed);
        assert_eq!(mock.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_reaped_by_heartbeat() {
        let registry = Arc::new(SessionRegistry::new());
        let (mock, _tx, handle) = spawn_session(&registry, 1);
        wait_until_online(&registry, 1, 1).await;

        // The stream stays open but nothing ever arrives.
        assert_eq!(handle.await.unwrap(), TeardownReason::HeartbeatTimeout);
        assert!(registry.get(UserId(1)).is_none());
        assert_eq!(mock.closes(), 1);
        assert_eq!(mock.pings(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_the_session_alive() {
        let registry = Arc::new(SessionRegistry::new());
        let (mock, tx, handle) = spawn_session(&registry, 1);
        wait_until_online(&registry, 1, 1).await;

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(1_100)).await;
            tx.send(Ok(Frame::Pong(bytes::Bytes::from_static(b"heartbeat"))))
                .unwrap();
        }
        assert!(registry.is_online(UserId(1)));
        assert!(mock.pings() >= 3);

        tx.send(Ok(Frame::Close)).unwrap();
        assert_eq!(handle.await.unwrap(), TeardownReason::PeerClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn external_teardown_unblocks_read_loop() {
        let registry = Arc::new(SessionRegistry::new());
        let (mock, _tx, handle) = spawn_session(&registry, 9);
        wait_until_online(&registry, 9, 1).await;

        let conn = registry.get(UserId(9)).unwrap().remove(0);
        assert!(conn.teardown(&registry, TeardownReason::ShuttingDown).await);

        assert_eq!(handle.await.unwrap(), TeardownReason::ShuttingDown);
        assert_eq!(mock.closes(), 1);
        assert_eq!(conn.phase(), Phase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn one_dead_device_leaves_the_other_connected() {
        let registry = Arc::new(SessionRegistry::new());
        let (_m1, tx1, h1) = spawn_session(&registry, 4);
        let (m2, tx2, h2) = spawn_session(&registry, 4);
        wait_until_online(&registry, 4, 2).await;

        tx1.send(Err(TransportError::Io("gone".into()))).unwrap();
        assert_eq!(h1.await.unwrap(), TeardownReason::ReadError);

        assert_eq!(registry.connection_count(UserId(4)), 1);
        assert_eq!(m2.closes(), 0);

        drop(tx2);
        h2.await.unwrap();
        assert!(registry.get(UserId(4)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_every_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (m1, _tx1, h1) = spawn_session(&registry, 1);
        let (m2, _tx2, h2) = spawn_session(&registry, 2);
        let (m3, _tx3, h3) = spawn_session(&registry, 2);
        wait_until_online(&registry, 1, 1).await;
        wait_until_online(&registry, 2, 2).await;

        assert_eq!(shutdown_all(&registry).await, 3);
        for h in [h1, h2, h3] {
            assert_eq!(h.await.unwrap(), TeardownReason::ShuttingDown);
        }
        assert_eq!(registry.total_connections(), 0);
        assert_eq!(m1.closes() + m2.closes() + m3.closes(), 3);
        assert_eq!(shutdown_all(&registry).await, 0);
    }
}
