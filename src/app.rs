//! Application assembly: configuration, singletons, and services.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::analytics::AnalyticsSink;
use crate::broker::TaskBroker;
use crate::cache::{Cascades, Reaper, TokenStore};
use crate::config::Config;
use crate::gateway::{PersistenceGateway, PgGateway};
use crate::inference::dummy::DummyInvoker;
use crate::inference::redact::{RegexSecretDetector, SecretDetector};
use crate::inference::ModelRegistry;
use crate::orchestrator::Orchestrator;
use crate::registry::ConnectionRegistry;
use crate::services::manager::ServiceManager;
use crate::services::reaper::ReaperService;
use crate::services::web::WebService;
use crate::services::workers::{InferencePoolService, PersistencePoolService};
use crate::session::SessionManager;
use crate::state::AppState;
use crate::status::ComponentStatusRegistry;

/// Main application struct containing all necessary components
pub struct App {
    config: Arc<Config>,
    service_manager: ServiceManager,
}

impl App {
    /// Create a new App instance with all singletons initialized.
    ///
    /// The model registry defaults to the deterministic development
    /// invokers for the configured model ids; production deployments
    /// register real invokers here.
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        let mut models = ModelRegistry::new();
        for model_id in &config.dispatch.default_model_ids {
            models.register(Arc::new(DummyInvoker::new(
                *model_id,
                Duration::from_millis(50),
            )));
        }
        Self::with_models(config, models).await
    }

    /// Assemble the application around a caller-provided model registry.
    pub async fn with_models(
        mut config: Config,
        models: ModelRegistry,
    ) -> Result<Self, anyhow::Error> {

        // Create database connection pool
        let db_pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(4))
            .idle_timeout(Duration::from_secs(60 * 2))
            .connect(&config.database_url)
            .await
            .context("Failed to create database pool")?;

        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run database migrations")?;

        let gateway: Arc<dyn PersistenceGateway> = Arc::new(PgGateway::new(db_pool.clone()));

        // Durable config can override the default model set without a
        // redeploy; everything else stays environment-driven.
        if let Some(value) = gateway.load_config("dispatch").await.ok().flatten()
            && let Some(ids) = value.get("defaultModelIds").and_then(|v| v.as_array())
        {
            let ids: Vec<i32> = ids.iter().filter_map(|v| v.as_i64()).map(|v| v as i32).collect();
            if !ids.is_empty() {
                info!(model_ids = ?ids, "default model ids overridden from durable config");
                config.dispatch.default_model_ids = ids;
            }
        }
        let config = Arc::new(config);

        // Process-wide singletons, initialized once and never replaced.
        let (store, expiry_rx) = TokenStore::new(config.tokens.clone());
        let store = Arc::new(store);
        let broker = Arc::new(TaskBroker::new(
            config.workers.visibility_timeout,
            config.dispatch.inference_queue_high_water,
            config.dispatch.inference_queue_low_water,
        ));
        let (registry, closed_rx) = ConnectionRegistry::new();
        let registry = Arc::new(registry);
        let sink = Arc::new(AnalyticsSink::new(
            Arc::clone(&broker),
            config.dispatch.persistence_queue_hard_cap,
        ));
        let detector: Arc<dyn SecretDetector> = Arc::new(RegexSecretDetector::new());

        let cascades = Arc::new(Cascades::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&broker),
            config.tokens.store_multi_file_context_durably,
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&cascades),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&broker),
            Arc::clone(&sink),
            Arc::clone(&detector),
            config.dispatch.clone(),
        ));
        let reaper = Reaper::new(cascades, expiry_rx);

        let state = AppState {
            config: Arc::clone(&config),
            db_pool,
            store,
            broker,
            registry,
            gateway,
            sessions,
            orchestrator,
            sink,
            statuses: ComponentStatusRegistry::new(),
        };

        info!(
            port = config.port,
            inference_workers = config.workers.inference_workers,
            persistence_workers = config.workers.persistence_workers,
            models = ?models.ids(),
            "application assembled"
        );

        let mut service_manager = ServiceManager::new();
        service_manager.register_service("web", Box::new(WebService::new(config.port, state.clone())));
        service_manager.register_service(
            "inference-workers",
            Box::new(InferencePoolService::new(
                state.clone(),
                Arc::new(models),
                detector,
            )),
        );
        service_manager.register_service(
            "persistence-workers",
            Box::new(PersistencePoolService::new(state.clone())),
        );
        service_manager.register_service(
            "reaper",
            Box::new(ReaperService::new(state, reaper, closed_rx)),
        );

        Ok(Self {
            config,
            service_manager,
        })
    }

    /// Start all registered services
    pub fn start_services(&mut self) {
        self.service_manager.spawn_all();
    }

    /// Run the application and handle shutdown signals
    pub async fn run(self) -> ExitCode {
        crate::signals::handle_shutdown_signals(self.service_manager, self.config.shutdown_timeout)
            .await
    }
}
