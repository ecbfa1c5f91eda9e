use super::Service;
use crate::state::AppState;
use crate::status::ComponentStatus;
use crate::workers::{InferenceWorker, PersistenceWorker};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::inference::ModelRegistry;
use crate::inference::redact::SecretDetector;

/// Inference worker pool service.
///
/// Workers are spawned detached so an in-flight model invocation survives
/// the service runner's own future being dropped; shutdown cancels the
/// token and joins them.
pub struct InferencePoolService {
    state: AppState,
    models: Arc<ModelRegistry>,
    detector: Arc<dyn SecretDetector>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl InferencePoolService {
    pub fn new(
        state: AppState,
        models: Arc<ModelRegistry>,
        detector: Arc<dyn SecretDetector>,
    ) -> Self {
        Self {
            state,
            models,
            detector,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl Service for InferencePoolService {
    fn name(&self) -> &'static str {
        "inference-workers"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        let workers = self.state.config.workers.clone();
        if workers.preload_models {
            self.models.preload_all().await?;
        }

        for id in 0..workers.inference_workers {
            let worker = InferenceWorker::new(
                id,
                Arc::clone(&self.state.store),
                Arc::clone(&self.state.broker),
                Arc::clone(&self.models),
                Arc::clone(&self.detector),
                self.state.config.dispatch.per_model_timeout,
                workers.model_concurrency,
            );
            let cancel = self.cancel.clone();
            self.handles.push(tokio::spawn(async move {
                worker.run(cancel).await;
            }));
        }
        info!(count = workers.inference_workers, "inference pool running");
        self.state
            .statuses
            .set("inference-workers", ComponentStatus::Active);

        // Workers run until cancelled; this service has no foreground work.
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// Persistence worker pool service.
pub struct PersistencePoolService {
    state: AppState,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl PersistencePoolService {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl Service for PersistencePoolService {
    fn name(&self) -> &'static str {
        "persistence-workers"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        let workers = self.state.config.workers.clone();
        for id in 0..workers.persistence_workers {
            let worker = PersistenceWorker::new(
                id,
                Arc::clone(&self.state.broker),
                Arc::clone(&self.state.gateway),
                workers.persistence_max_retries,
                workers.persistence_batch_size,
            );
            let cancel = self.cancel.clone();
            self.handles.push(tokio::spawn(async move {
                worker.run(cancel).await;
            }));
        }
        info!(count = workers.persistence_workers, "persistence pool running");
        self.state
            .statuses
            .set("persistence-workers", ComponentStatus::Active);

        std::future::pending::<()>().await;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        Ok(())
    }
}
