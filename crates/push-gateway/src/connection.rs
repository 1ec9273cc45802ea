//! Connection wrapper: one live duplex transport owned by one user.
//!
//! Writes are serialised through an async mutex so the heartbeat and the push
//! dispatcher never interleave frames on the same socket. Teardown is guarded
//! by an atomic flag: however many paths race to tear a connection down, it is
//! deregistered and closed exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::registry::SessionRegistry;
use crate::transport::{Frame, FrameSink, TransportError};

/// Numeric user identifier carried in the credential's `uid` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for UserId {
    fn from(uid: i64) -> Self {
        UserId(uid)
    }
}

/// Identity of one physical connection. Registry removal compares these,
/// never socket handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle phase after authentication succeeded.
///
/// There is no authenticating phase: the credential is checked in `ws.rs`
/// before the upgrade, and a `Connection` only exists once it passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Registered = 0,
    Serving = 1,
    Teardown = 2,
    Closed = 3,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Phase::Registered,
            1 => Phase::Serving,
            2 => Phase::Teardown,
            _ => Phase::Closed,
        }
    }
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownReason {
    /// The read loop got an I/O error.
    ReadError,
    /// The peer sent a close frame or the stream ended.
    PeerClosed,
    /// No inbound activity within the heartbeat window.
    HeartbeatTimeout,
    /// Writing the heartbeat probe failed.
    ProbeFailed,
    /// A push write failed or timed out.
    PushFailed,
    /// The server is shutting down.
    ShuttingDown,
}

impl TeardownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadError => "read_error",
            Self::PeerClosed => "peer_closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ProbeFailed => "probe_failed",
            Self::PushFailed => "push_failed",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live connection registered under a user.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    created_at: Instant,
    write_timeout: Duration,
    sink: Mutex<Box<dyn FrameSink>>,
    closed: AtomicBool,
    phase: AtomicU8,
    reason: OnceLock<TeardownReason>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(user_id: UserId, sink: Box<dyn FrameSink>, write_timeout: Duration) -> Self {
        Self {
            id: ConnectionId::new(),
            user_id,
            created_at: Instant::now(),
            write_timeout,
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            phase: AtomicU8::new(Phase::Registered as u8),
            reason: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The reason recorded by whichever path won the teardown race.
    pub fn teardown_reason(&self) -> Option<TeardownReason> {
        self.reason.get().copied()
    }

    /// Resolves once teardown has started. Used by the read loop and the
    /// heartbeat as their stop signal.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Write one frame, holding the connection's write guard.
    ///
    /// Waiting for the guard and the write each get their own `write_timeout`.
    /// Running out of time in the queue yields [`TransportError::Busy`]; only
    /// [`TransportError::Timeout`] or an I/O error from the sink itself means
    /// the transport is broken.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut sink = match tokio::time::timeout(self.write_timeout, self.sink.lock()).await {
            Ok(sink) => sink,
            Err(_) => return Err(TransportError::Busy(self.write_timeout)),
        };
        // Teardown may have closed the sink while we were queued on the guard.
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.write_timeout, sink.send_frame(frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.write_timeout)),
        }
    }

    /// Deregister and close this connection. Returns `true` only for the call
    /// that actually performed the teardown; every later call is a no-op.
    pub async fn teardown(&self, registry: &SessionRegistry, reason: TeardownReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.reason.set(reason);
        self.set_phase(Phase::Teardown);
        self.cancel.cancel();

        registry.deregister(self.user_id, self.id);

        let close = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        match tokio::time::timeout(self.write_timeout, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection_id = %self.id, error = %e, "close frame not delivered");
            }
            Err(_) => {
                warn!(
                    connection_id = %self.id,
                    user_id = %self.user_id,
                    "timed out closing transport"
                );
            }
        }

        self.set_phase(Phase::Closed);
        metrics::record_teardown(reason);
        info!(
            user_id = %self.user_id,
            connection_id = %self.id,
            reason = %reason,
            age_secs = self.age().as_secs(),
            "connection closed"
        );
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("phase", &self.phase())
            .finish()
    }
}
