//! Inference workers: consumers of the `inference` queue.
//!
//! Each worker revalidates the task's tokens, redacts secrets, invokes the
//! requested models in parallel under a concurrency cap and per-model
//! timeout, publishes per-model replies as they land, and finishes with an
//! `inference-complete` barrier envelope. Workers are stateless with
//! respect to the broker; a worker dying mid-task is covered by visibility-
//! timeout redelivery, and the orchestrator drops replies for requests it
//! no longer tracks.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{QueueName, ReplyEnvelope, TaskBroker, TaskEnvelope};
use crate::cache::{TokenKind, TokenStore};
use crate::inference::redact::SecretDetector;
use crate::inference::{InferencePrompt, ModelRegistry};
use crate::orchestrator::{InferenceJob, InferenceTask};
use crate::web::protocol::{ChatMessage, ErrorKind, ModelReply};

/// A single inference worker instance.
///
/// Each worker runs in its own asynchronous task and continuously claims
/// inference tasks from the broker.
pub struct InferenceWorker {
    id: usize, // For logging purposes
    store: Arc<TokenStore>,
    broker: Arc<TaskBroker>,
    models: Arc<ModelRegistry>,
    detector: Arc<dyn SecretDetector>,
    per_model_timeout: Duration,
    concurrency: Arc<Semaphore>,
}

impl InferenceWorker {
    pub fn new(
        id: usize,
        store: Arc<TokenStore>,
        broker: Arc<TaskBroker>,
        models: Arc<ModelRegistry>,
        detector: Arc<dyn SecretDetector>,
        per_model_timeout: Duration,
        model_concurrency: usize,
    ) -> Self {
        Self {
            id,
            store,
            broker,
            models,
            detector,
            per_model_timeout,
            concurrency: Arc::new(Semaphore::new(model_concurrency.max(1))),
        }
    }

    /// Runs the worker's main loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(worker_id = self.id, "inference worker started");
        loop {
            let task = tokio::select! {
                task = self.broker.claim(QueueName::Inference) => task,
                _ = cancel.cancelled() => {
                    debug!(worker_id = self.id, "inference worker stopped");
                    return;
                }
            };
            let task_id = task.id;
            self.process(task).await;
            if let Err(e) = self.broker.ack(QueueName::Inference, task_id) {
                warn!(worker_id = self.id, task_id, error = %e, "failed to ack task");
            }
        }
    }

    async fn process(&self, envelope: TaskEnvelope) {
        let Some(reply_channel) = envelope.reply_channel.clone() else {
            warn!(worker_id = self.id, task_id = envelope.id, "inference task without reply channel");
            return;
        };
        let task: InferenceTask = match serde_json::from_value(envelope.payload.clone()) {
            Ok(task) => task,
            Err(e) => {
                warn!(worker_id = self.id, task_id = envelope.id, error = %e, "malformed inference payload");
                return;
            }
        };

        // Tokens may have been revoked between enqueue and claim; publish a
        // single error reply and skip model invocation.
        if !self.tokens_still_valid(&task) {
            self.broker.publish_reply(
                &reply_channel,
                ReplyEnvelope::InferenceError {
                    request_id: task.request_id.clone(),
                    code: ErrorKind::Unauthenticated,
                    message: "session no longer valid".into(),
                },
            );
            return;
        }

        match &task.job {
            InferenceJob::Completion {
                model_ids,
                context,
                snapshot_files,
                ..
            } => {
                let prompt = InferencePrompt {
                    prefix: self.detector.redact(&context.prefix),
                    suffix: self.detector.redact(&context.suffix),
                    file_name: context.file_name.clone(),
                    context_files: snapshot_files.clone(),
                };
                self.run_completion(&task, &reply_channel, model_ids, Arc::new(prompt))
                    .await;
            }
            InferenceJob::Chat {
                chat_id,
                model_id,
                messages,
            } => {
                self.run_chat(&task, &reply_channel, chat_id, *model_id, messages)
                    .await;
            }
        }
    }

    fn tokens_still_valid(&self, task: &InferenceTask) -> bool {
        self.store.validate(TokenKind::Auth, &task.auth_token).is_ok()
            && self
                .store
                .validate(TokenKind::Session, &task.session_token)
                .is_ok()
            && self
                .store
                .validate(TokenKind::Project, &task.project_token)
                .is_ok()
    }

    /// Invoke every requested model in parallel, publishing each result as
    /// it becomes available. No aggregation happens here.
    async fn run_completion(
        &self,
        task: &InferenceTask,
        reply_channel: &str,
        model_ids: &[i32],
        prompt: Arc<InferencePrompt>,
    ) {
        let mut joins: JoinSet<()> = JoinSet::new();
        for model_id in model_ids.iter().copied() {
            let broker = Arc::clone(&self.broker);
            let models = Arc::clone(&self.models);
            let concurrency = Arc::clone(&self.concurrency);
            let prompt = Arc::clone(&prompt);
            let reply_channel = reply_channel.to_owned();
            let request_id = task.request_id.clone();
            let timeout = self.per_model_timeout;

            joins.spawn(async move {
                let _permit = concurrency.acquire().await.expect("semaphore closed");
                let reply = invoke_completion(&models, model_id, &prompt, timeout).await;
                broker.publish_reply(
                    &reply_channel,
                    ReplyEnvelope::Model { request_id, reply },
                );
            });
        }
        while joins.join_next().await.is_some() {}

        self.broker.publish_reply(
            reply_channel,
            ReplyEnvelope::InferenceComplete {
                request_id: task.request_id.clone(),
                attempted: model_ids.to_vec(),
            },
        );
    }

    /// Chat: single model, partial output forwarded as it is produced.
    async fn run_chat(
        &self,
        task: &InferenceTask,
        reply_channel: &str,
        chat_id: &str,
        model_id: i32,
        messages: &[ChatMessage],
    ) {
        let reply = match self.models.get(model_id) {
            Some(invoker) => {
                let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<String>();
                let forwarder = {
                    let broker = Arc::clone(&self.broker);
                    let reply_channel = reply_channel.to_owned();
                    let request_id = task.request_id.clone();
                    let chat_id = chat_id.to_owned();
                    tokio::spawn(async move {
                        while let Some(delta) = delta_rx.recv().await {
                            broker.publish_reply(
                                &reply_channel,
                                ReplyEnvelope::ChatDelta {
                                    request_id: request_id.clone(),
                                    chat_id: chat_id.clone(),
                                    model_id,
                                    delta,
                                },
                            );
                        }
                    })
                };

                let started = Instant::now();
                let outcome =
                    tokio::time::timeout(self.per_model_timeout, invoker.chat(messages, delta_tx))
                        .await;
                let _ = forwarder.await;
                match outcome {
                    Ok(Ok(output)) => ModelReply {
                        model_id,
                        completion: Some(output.completion),
                        confidence: Some(output.confidence.clamp(0.0, 1.0)),
                        logprobs: output.logprobs,
                        generation_time_ms: Some(started.elapsed().as_millis() as u64),
                        error: None,
                    },
                    Ok(Err(e)) => error_reply(model_id, e.to_string()),
                    Err(_) => error_reply(model_id, "model timed out".into()),
                }
            }
            None => error_reply(model_id, format!("unknown model {model_id}")),
        };

        self.broker.publish_reply(
            reply_channel,
            ReplyEnvelope::Model {
                request_id: task.request_id.clone(),
                reply,
            },
        );
        self.broker.publish_reply(
            reply_channel,
            ReplyEnvelope::InferenceComplete {
                request_id: task.request_id.clone(),
                attempted: vec![model_id],
            },
        );
    }
}

fn error_reply(model_id: i32, message: String) -> ModelReply {
    ModelReply {
        model_id,
        completion: None,
        confidence: None,
        logprobs: Vec::new(),
        generation_time_ms: None,
        error: Some(message),
    }
}

async fn invoke_completion(
    models: &ModelRegistry,
    model_id: i32,
    prompt: &InferencePrompt,
    timeout: Duration,
) -> ModelReply {
    let Some(invoker) = models.get(model_id) else {
        return error_reply(model_id, format!("unknown model {model_id}"));
    };
    let started = Instant::now();
    match tokio::time::timeout(timeout, invoker.complete(prompt)).await {
        Ok(Ok(output)) => ModelReply {
            model_id,
            completion: Some(output.completion),
            confidence: Some(output.confidence.clamp(0.0, 1.0)),
            logprobs: output.logprobs,
            generation_time_ms: Some(started.elapsed().as_millis() as u64),
            error: None,
        },
        Ok(Err(e)) => {
            warn!(model_id, error = %e, "model invocation failed");
            error_reply(model_id, e.to_string())
        }
        Err(_) => error_reply(model_id, "model timed out".into()),
    }
}
