//! Application state shared across components (web, workers, reaper).
//!
//! These are the process-wide singletons: initialized once at startup, torn
//! down in reverse order on shutdown, never replaced at runtime.

use sqlx::PgPool;
use std::sync::Arc;

use crate::analytics::AnalyticsSink;
use crate::broker::TaskBroker;
use crate::cache::TokenStore;
use crate::config::Config;
use crate::gateway::PersistenceGateway;
use crate::orchestrator::Orchestrator;
use crate::registry::ConnectionRegistry;
use crate::session::SessionManager;
use crate::status::ComponentStatusRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db_pool: PgPool,
    pub store: Arc<TokenStore>,
    pub broker: Arc<TaskBroker>,
    pub registry: Arc<ConnectionRegistry>,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub sessions: Arc<SessionManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub sink: Arc<AnalyticsSink>,
    pub statuses: ComponentStatusRegistry,
}
