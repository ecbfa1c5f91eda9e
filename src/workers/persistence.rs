//! Persistence workers: consumers of the `persist` queue.
//!
//! Each task is a self-describing record translated into gateway writes in
//! a fixed causal order (query, then generations, then telemetry, then
//! ground truth). Transient failures re-queue with exponential backoff up
//! to a bounded retry count; permanent failures dead-letter with the
//! payload preserved.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{QueueName, TaskBroker, TaskEnvelope, kind};
use crate::error::GatewayError;
use crate::gateway::PersistenceGateway;
use crate::gateway::models::{
    ContextFlushRecord, FeedbackRecord, GroundTruthRow, QueryTaskRecord, TelemetryRecord,
};

/// Base backoff doubled per attempt.
const RETRY_BASE: Duration = Duration::from_millis(250);

pub struct PersistenceWorker {
    id: usize, // For logging purposes
    broker: Arc<TaskBroker>,
    gateway: Arc<dyn PersistenceGateway>,
    max_retries: u32,
    batch_size: usize,
}

impl PersistenceWorker {
    pub fn new(
        id: usize,
        broker: Arc<TaskBroker>,
        gateway: Arc<dyn PersistenceGateway>,
        max_retries: u32,
        batch_size: usize,
    ) -> Self {
        Self {
            id,
            broker,
            gateway,
            max_retries,
            batch_size,
        }
    }

    /// Runs the worker's main loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(worker_id = self.id, "persistence worker started");
        loop {
            let task = tokio::select! {
                task = self.broker.claim(QueueName::Persist) => task,
                _ = cancel.cancelled() => {
                    debug!(worker_id = self.id, "persistence worker stopped");
                    return;
                }
            };
            self.handle(task).await;

            // Telemetry envelopes are cheap and frequent; drain what is
            // already ready in one pass up to the batch size.
            let mut batched = 0;
            while batched < self.batch_size {
                let Some(next) = self.broker.try_claim(QueueName::Persist) else {
                    break;
                };
                if next.kind != kind::TELEMETRY {
                    self.handle(next).await;
                    break;
                }
                self.handle(next).await;
                batched += 1;
            }
        }
    }

    async fn handle(&self, task: TaskEnvelope) {
        let task_id = task.id;
        let attempt = task.attempt;
        match self.write(&task).await {
            Ok(()) => {
                if let Err(e) = self.broker.ack(QueueName::Persist, task_id) {
                    warn!(worker_id = self.id, task_id, error = %e, "failed to ack persist task");
                }
            }
            Err(e) if e.is_transient() && attempt <= self.max_retries => {
                let backoff = RETRY_BASE * 2u32.saturating_pow(attempt - 1);
                debug!(
                    worker_id = self.id,
                    task_id,
                    attempt,
                    backoff = format!("{backoff:.2?}"),
                    error = %e,
                    "transient persistence failure, re-queueing"
                );
                if let Err(e) = self.broker.retry(QueueName::Persist, task_id, backoff) {
                    warn!(worker_id = self.id, task_id, error = %e, "failed to re-queue task");
                }
            }
            Err(e) => {
                warn!(
                    worker_id = self.id,
                    task_id,
                    attempt,
                    error = %e,
                    "persistence failed permanently, dead-lettering"
                );
                if let Err(e) = self.broker.dead_letter(QueueName::Persist, task_id) {
                    warn!(worker_id = self.id, task_id, error = %e, "failed to dead-letter task");
                }
            }
        }
    }

    async fn write(&self, task: &TaskEnvelope) -> Result<(), GatewayError> {
        match task.kind.as_str() {
            kind::QUERY => {
                let record: QueryTaskRecord = decode(task)?;
                // Causal order within the task: query row before generation
                // rows before telemetry.
                self.gateway.create_meta_query(&record.query).await?;
                for generation in &record.generations {
                    self.gateway.create_generation(generation).await?;
                }
                if let Some(telemetry) = &record.telemetry {
                    self.gateway.upsert_telemetry(telemetry).await?;
                }
                Ok(())
            }
            kind::FEEDBACK_UPDATE => {
                let record: FeedbackRecord = decode(task)?;
                self.gateway.update_generation_feedback(&record).await?;
                if let Some(ground_truth) = &record.ground_truth {
                    self.gateway
                        .append_ground_truth(&GroundTruthRow {
                            request_id: record.request_id.clone(),
                            truth_timestamp: record.submitted_at,
                            ground_truth: ground_truth.clone(),
                        })
                        .await?;
                }
                Ok(())
            }
            kind::CONTEXT_FLUSH => {
                let record: ContextFlushRecord = decode(task)?;
                self.gateway.flush_project_context(&record).await
            }
            kind::TELEMETRY => {
                let record: TelemetryRecord = decode(task)?;
                self.gateway.upsert_telemetry(&record).await
            }
            other => Err(GatewayError::Permanent(format!(
                "unknown persist task kind '{other}'"
            ))),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(task: &TaskEnvelope) -> Result<T, GatewayError> {
    serde_json::from_value(task.payload.clone())
        .map_err(|e| GatewayError::Permanent(format!("malformed {} payload: {e}", task.kind)))
}
