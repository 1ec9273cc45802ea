//! Push fan-out: "user X has new data" -> every live connection of X.
//!
//! Writes go out concurrently, each bounded by the connection's write timeout.
//! A failed write never fails the call; it is reported and counted. A broken
//! connection is torn down, while one that was merely busy with earlier writes
//! is left alone.

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionId, TeardownReason, UserId};
use crate::metrics;
use crate::registry::SessionRegistry;
use crate::transport::{Payload, TransportError};

/// A connection that could not be written to during a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDelivery {
    pub connection_id: ConnectionId,
    pub error: String,
}

/// Outcome of one `notify` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub user_id: Option<UserId>,
    /// `false` when the user had no registry entry; nothing was written.
    pub online: bool,
    pub delivered: usize,
    pub failed: Vec<FailedDelivery>,
}

impl DeliveryReport {
    fn offline(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    pub fn attempted(&self) -> usize {
        self.delivered + self.failed.len()
    }
}

/// Entry point for the rest of the backend to signal new data.
#[derive(Clone)]
pub struct PushDispatcher {
    registry: Arc<SessionRegistry>,
}

impl PushDispatcher {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Deliver `payload` to every live connection of `user_id`.
    ///
    /// Offline users are not an error: the report simply says `online: false`.
    pub async fn notify(&self, user_id: UserId, payload: impl Into<Payload>) -> DeliveryReport {
        let Some(connections) = self.registry.get(user_id) else {
            debug!(user_id = %user_id, "push skipped, user offline");
            metrics::record_push("offline");
            return DeliveryReport::offline(user_id);
        };

        let payload = payload.into();
        let writes = connections
            .into_iter()
            .map(|conn| self.deliver(conn, payload.clone()));
        let results = join_all(writes).await;

        let mut report = DeliveryReport {
            user_id: Some(user_id),
            online: true,
            ..DeliveryReport::default()
        };
        for result in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(failed) => report.failed.push(failed),
            }
        }

        debug!(
            user_id = %user_id,
            delivered = report.delivered,
            failed = report.failed.len(),
            bytes = payload.len(),
            "push fan-out complete"
        );
        report
    }

    /// `notify` for several users; their fan-outs run concurrently.
    pub async fn notify_many(
        &self,
        user_ids: &[UserId],
        payload: impl Into<Payload>,
    ) -> Vec<DeliveryReport> {
        let payload = payload.into();
        join_all(
            user_ids
                .iter()
                .map(|uid| self.notify(*uid, payload.clone())),
        )
        .await
    }

    /// Deliver `payload` to every live connection on this server.
    pub async fn broadcast(&self, payload: impl Into<Payload>) -> DeliveryReport {
        let payload = payload.into();
        let writes = self
            .registry
            .snapshot_all()
            .into_iter()
            .map(|conn| self.deliver(conn, payload.clone()));

        let mut report = DeliveryReport {
            online: true,
            ..DeliveryReport::default()
        };
        for result in join_all(writes).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(failed) => report.failed.push(failed),
            }
        }
        report
    }

    async fn deliver(&self, conn: Arc<Connection>, payload: Payload) -> Result<(), FailedDelivery> {
        match conn.send(payload.into_frame()).await {
            Ok(()) => {
                metrics::record_push("delivered");
                Ok(())
            }
            Err(e @ TransportError::Busy(_)) => {
                debug!(
                    user_id = %conn.user_id(),
                    connection_id = %conn.id(),
                    error = %e,
                    "push dropped, connection busy with earlier writes"
                );
                metrics::record_push("busy");
                Err(FailedDelivery {
                    connection_id: conn.id(),
                    error: e.to_string(),
                })
            }
            Err(e) => {
                warn!(
                    user_id = %conn.user_id(),
                    connection_id = %conn.id(),
                    error = %e,
                    "push write failed, tearing connection down"
                );
                metrics::record_push("failed");
                conn.teardown(&self.registry, TeardownReason::PushFailed).await;
                Err(FailedDelivery {
                    connection_id: conn.id(),
                    error: e.to_string(),
                })
            }
        }
    }
}
