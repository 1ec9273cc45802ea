//! `GET /websocket`: authenticate, then upgrade into a push session.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::debug;

use crate::auth::{bearer_token, AuthError, Identity};
use crate::error::{ApiError, ApiResult};
use crate::lifecycle::run_session;
use crate::metrics;
use crate::state::AppState;
use crate::transport::frame_stream;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

/// Credential from `?token=`, falling back to `Authorization: Bearer`.
fn credential<'a>(params: &'a ConnectParams, headers: &'a HeaderMap) -> Option<&'a str> {
    params
        .token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(bearer_token)
        })
}

fn authenticate(state: &AppState, params: &ConnectParams, headers: &HeaderMap) -> ApiResult<Identity> {
    let result = match credential(params, headers) {
        Some(token) => state.validator.validate(token),
        None => Err(AuthError::Missing),
    };
    result.map_err(|e| {
        metrics::record_auth_failure(e.kind());
        ApiError::Unauthorized(e)
    })
}

/// Authentication runs before the upgrade is accepted, so a rejected client
/// gets a plain 401 and never touches the registry.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> ApiResult<Response> {
    let identity = authenticate(&state, &params, &headers)?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(user_id = %identity.user_id, "authenticated request was not an upgrade");
            return Ok(rejection.into_response());
        }
    };

    Ok(ws
        .read_buffer_size(state.buffer_size)
        .write_buffer_size(state.buffer_size)
        .on_upgrade(move |socket| handle_socket(socket, state, identity))
        .into_response())
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: Identity) {
    let (sink, stream) = socket.split();
    let reason = run_session(
        state.registry.clone(),
        state.session,
        identity.user_id,
        Box::new(sink),
        frame_stream(stream),
    )
    .await;
    debug!(user_id = %identity.user_id, reason = %reason, "session ended");
}
