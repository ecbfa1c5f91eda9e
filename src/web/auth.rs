//! Session cookie endpoints.
//!
//! Token acquisition is an idempotent `GET`; deactivation is a `PUT`. All
//! cookies are non-scriptable, strict-same-site, with expiry matching the
//! underlying cache record.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use axum::response::{AppendHeaders, IntoResponse, Response};
use serde_json::{Value, json};
use tracing::info;

use crate::cache::TokenKind;
use crate::session::{PROJECT_COOKIE, RawCookies, SESSION_COOKIE};
use crate::state::AppState;
use crate::web::error::ApiError;

/// Build a `Set-Cookie` header value for a session-layer cookie.
fn token_cookie(name: &str, token: &str, max_age: i64) -> String {
    format!("{name}={token}; HttpOnly; SameSite=Strict; Path=/; Max-Age={max_age}")
}

fn cookies_from(headers: &HeaderMap) -> RawCookies {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(RawCookies::parse)
        .unwrap_or_default()
}

/// `GET /api/session` — acquire a session bound to the auth cookie.
///
/// Idempotent: a still-valid session cookie is returned unchanged instead
/// of minting a new session.
pub async fn acquire_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let cookies = cookies_from(&headers);

    if let Some(existing) = cookies.session_token.as_deref()
        && state
            .sessions
            .store()
            .validate(TokenKind::Session, existing)
            .is_ok()
    {
        let remaining = state
            .sessions
            .store()
            .remaining_ttl(TokenKind::Session, existing)
            .unwrap_or_default();
        return Ok(Json(json!({
            "sessionToken": existing,
            "expiresInSeconds": remaining.as_secs(),
        }))
        .into_response());
    }

    let (token, ttl) = state
        .sessions
        .acquire_session(&cookies)
        .await
        .map_err(|reject| ApiError::unauthenticated(reject.message()))?;

    let cookie = token_cookie(SESSION_COOKIE, &token, ttl.as_secs() as i64);
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({
            "sessionToken": token,
            "expiresInSeconds": ttl.as_secs(),
        })),
    )
        .into_response())
}

/// `PUT /api/session/deactivate` — explicit logout, drives the cascade.
pub async fn deactivate_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let cookies = cookies_from(&headers);
    if let Some(session_token) = cookies.session_token.as_deref() {
        state.sessions.deactivate_session(session_token);
        info!("session deactivated");
    }

    (
        AppendHeaders([
            (header::SET_COOKIE, token_cookie(SESSION_COOKIE, "", 0)),
            (header::SET_COOKIE, token_cookie(PROJECT_COOKIE, "", 0)),
        ]),
        Json(json!({ "ok": true })),
    )
        .into_response()
}

/// `GET /api/project/{project_id}` — activate a project within the current
/// session, returning its token. Idempotent per (session, project).
pub async fn activate_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let cookies = cookies_from(&headers);
    let authz = state
        .sessions
        .authenticate_session(&cookies)
        .await
        .map_err(|reject| ApiError::unauthenticated(reject.message()))?;

    let (token, ttl) = state
        .sessions
        .activate_project(&authz.session_token, &project_id)
        .map_err(|reject| ApiError::unauthenticated(reject.message()))?;

    let cookie = token_cookie(PROJECT_COOKIE, &token, ttl.as_secs() as i64);
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({
            "projectToken": token,
            "projectId": project_id,
            "expiresInSeconds": ttl.as_secs(),
        })),
    )
        .into_response())
}

/// `GET /api/health` — component statuses and queue depths.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let statuses: Vec<Value> = state
        .statuses
        .all()
        .into_iter()
        .map(|(name, status)| json!({ "component": name, "status": status }))
        .collect();
    let (auth, sessions, projects, one_shot) = state.store.shard_sizes();

    Json(json!({
        "components": statuses,
        "connections": state.registry.len(),
        "pendingRequests": state.orchestrator.pending_count(),
        "queues": {
            "inference": state.broker.depth(crate::broker::QueueName::Inference),
            "persist": state.broker.depth(crate::broker::QueueName::Persist),
            "deadLetters": state.broker.dead_letter_count(),
        },
        "cache": {
            "auth": auth,
            "sessions": sessions,
            "projects": projects,
            "oneShot": one_shot,
        },
    }))
}
