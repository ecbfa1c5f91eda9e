//! WebSocket endpoint for persistent client connections.
//!
//! Each live connection occupies one reader task (this handler) and one
//! writer task draining the registry sink. The connection's lifecycle is
//! coupled to its session and project tokens: when either dies, the
//! registry drops the sink and the writer completes the close handshake
//! with the reason.

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::TokenKind;
use crate::error::CloseReason;
use crate::orchestrator::ConnectionCtx;
use crate::session::RawCookies;
use crate::state::AppState;
use crate::web::error::ApiError;
use crate::web::protocol::{ClientFrame, ErrorKind, ServerFrame};

/// `GET /ws` — upgrade to a bidirectional connection.
///
/// Authorization happens before the upgrade: the session and project
/// cookies must both resolve to live cache records, and the project must be
/// attached to the session.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let cookies = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(RawCookies::parse)
        .unwrap_or_default();

    let authz = match state.sessions.authenticate_session(&cookies).await {
        Ok(authz) => authz,
        Err(reject) => return ApiError::unauthenticated(reject.message()).into_response(),
    };

    let Some(project_token) = cookies.project_token.clone() else {
        return ApiError::unauthenticated("missing project token").into_response();
    };
    if !authz.project_tokens.contains(&project_token) {
        return ApiError::forbidden("project not attached to this session").into_response();
    }
    if state
        .store
        .validate(TokenKind::Project, &project_token)
        .is_err()
    {
        return ApiError::unauthenticated("project token expired").into_response();
    }
    let auth_token = cookies.auth_token.clone().unwrap_or_default();

    ws.on_upgrade(move |socket| handle_socket(socket, state, authz, auth_token, project_token))
}

/// WebSocket close codes (RFC 6455 section 7.4.1).
mod close_code {
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TRY_AGAIN_LATER: u16 = 1013;
}

fn ws_close_code(reason: CloseReason) -> u16 {
    match reason {
        // Policy-level closes the client should react to by re-acquiring
        // tokens; backpressure invites a reconnect.
        CloseReason::SessionExpired | CloseReason::ProjectEnded => close_code::POLICY_VIOLATION,
        CloseReason::Backpressure => close_code::TRY_AGAIN_LATER,
        CloseReason::Internal => close_code::INTERNAL_ERROR,
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    authz: crate::session::Authz,
    auth_token: String,
    project_token: String,
) {
    let (connection_id, outbound, close_reason) = state
        .registry
        .register(&authz.session_token, &project_token);
    let ctx = ConnectionCtx {
        id: connection_id,
        user_id: authz.user_id,
        auth_token,
        session_token: authz.session_token.clone(),
        project_token,
    };
    state.orchestrator.attach_connection(&ctx);
    debug!(connection_id = %connection_id, user_id = %authz.user_id, "connection established");

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(run_writer(sink, outbound, close_reason.clone()));

    // Reader loop: parse frames and hand them to the orchestrator. The
    // orchestrator is single-owner per connection, so frames are processed
    // in order with no cross-connection locking.
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => state.orchestrator.handle_frame(&ctx, frame).await,
                Err(e) => {
                    state.registry.deliver(
                        connection_id,
                        ServerFrame::error(
                            None,
                            ErrorKind::InvalidRequest,
                            format!("invalid frame: {e}"),
                        ),
                    );
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
        if close_reason.get().is_some() {
            break;
        }
    }

    // Client went away (or the registry closed us); either way the registry
    // entry must not outlive this task.
    state.registry.close(connection_id, CloseReason::Internal);
    let _ = writer.await;
    debug!(connection_id = %connection_id, "connection finished");
}

/// Writer task: drains the registry sink onto the socket. When the sink
/// closes, sends a close frame carrying the recorded reason.
async fn run_writer(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerFrame>,
    close_reason: Arc<std::sync::OnceLock<CloseReason>>,
) {
    while let Some(frame) = outbound.recv().await {
        let Ok(json) = serde_json::to_string(&frame) else {
            continue;
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    let reason = close_reason.get().copied().unwrap_or(CloseReason::Internal);
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: ws_close_code(reason),
            reason: reason.as_str().into(),
        })))
        .await;
}
