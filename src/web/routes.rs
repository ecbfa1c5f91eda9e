//! Router assembly for the web service.

use axum::Router;
use axum::middleware;
use axum::routing::{get, put};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::web::rate_limit::{EndpointLimits, rate_limit};
use crate::web::{auth, ws};

pub fn create_router(state: AppState) -> Router {
    let limits = Arc::new(EndpointLimits::new(&state.config.rate_limits));

    Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .route("/api/session", get(auth::acquire_session))
        .route("/api/session/deactivate", put(auth::deactivate_session))
        .route("/api/project/{project_id}", get(auth::activate_project))
        .route("/api/health", get(auth::health))
        .layer(middleware::from_fn_with_state(limits, rate_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
