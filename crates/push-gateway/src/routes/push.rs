//! HTTP push trigger and presence lookup for other backend services.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::info;

use crate::auth::{bearer_token, AuthError};
use crate::connection::UserId;
use crate::dispatcher::DeliveryReport;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;
use crate::transport::Payload;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct PresenceResponse {
    pub user_id: i64,
    pub online: bool,
    pub connections: usize,
}

fn parse_uid(raw: &str) -> ApiResult<UserId> {
    raw.parse::<i64>()
        .map(UserId)
        .map_err(|_| ApiError::BadRequest(format!("uid must be an integer, got {raw:?}")))
}

/// Constant-time comparison over fixed-length SHA-256 digests.
fn push_key_matches(presented: &str, expected: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented.as_slice().ct_eq(expected.as_slice()).into()
}

fn check_push_key(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.push_key.as_deref() else {
        return Err(ApiError::Forbidden("push API disabled".into()));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    let result = match presented {
        None => Err(AuthError::Missing),
        Some(key) if push_key_matches(key, expected) => Ok(()),
        Some(_) => Err(AuthError::Invalid("push key mismatch".into())),
    };
    result.map_err(|e| {
        metrics::record_auth_failure(e.kind());
        ApiError::Unauthorized(e)
    })
}

/// Empty body means the default "fetch new data" signal; UTF-8 bodies go out
/// as text frames, anything else as binary.
fn payload_from_body(body: Bytes) -> Payload {
    if body.is_empty() {
        return Payload::new_data_signal();
    }
    match String::from_utf8(body.to_vec()) {
        Ok(text) => Payload::Text(text),
        Err(_) => Payload::Binary(body),
    }
}

/// POST /api/push/{uid} - notify every connection of `uid`.
pub async fn push_to_user(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<DeliveryReport>> {
    check_push_key(&state, &headers)?;
    let user_id = parse_uid(&uid)?;

    let report = state.dispatcher.notify(user_id, payload_from_body(body)).await;
    info!(
        user_id = %user_id,
        online = report.online,
        delivered = report.delivered,
        failed = report.failed.len(),
        "push requested over HTTP"
    );
    Ok(Json(report))
}

/// GET /api/presence/{uid}
pub async fn presence(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> ApiResult<Json<PresenceResponse>> {
    let user_id = parse_uid(&uid)?;
    let connections = state.registry.connection_count(user_id);
    Ok(Json(PresenceResponse {
        user_id: user_id.0,
        online: connections > 0,
        connections,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/push/{uid}", post(push_to_user))
        .route("/presence/{uid}", get(presence))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_is_new_data_signal() {
        assert_eq!(payload_from_body(Bytes::new()), Payload::new_data_signal());
    }

    #[test]
    fn body_kinds() {
        assert_eq!(
            payload_from_body(Bytes::from_static(b"hello")),
            Payload::Text("hello".into())
        );
        assert_eq!(
            payload_from_body(Bytes::from_static(&[0xff, 0xfe])),
            Payload::Binary(Bytes::from_static(&[0xff, 0xfe]))
        );
    }

    #[test]
    fn push_key_comparison() {
        assert!(push_key_matches("s3cret-key", "s3cret-key"));
        assert!(!push_key_matches("s3cret-kez", "s3cret-key"));
        assert!(!push_key_matches("s3cret", "s3cret-key"));
        assert!(!push_key_matches("s3cret-key-and-more", "s3cret-key"));
        assert!(!push_key_matches("", "s3cret-key"));
    }

    #[test]
    fn uid_must_be_numeric() {
        assert_eq!(parse_uid("17").unwrap(), UserId(17));
        assert!(matches!(parse_uid("abc"), Err(ApiError::BadRequest(_))));
    }
}
