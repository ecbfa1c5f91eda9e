//! Request orchestration: frame handling, pending-request tracking, and
//! result fan-out.
//!
//! The orchestrator is single-owner per connection: each connection has one
//! inbound frame loop and one reply forwarder, and the pending table is
//! local to the process that issued the request. Reply channels are routed
//! by connection ownership, so no cross-process access is needed.

pub mod pending;

pub use pending::{PendingKind, PendingRequest, PendingTable, RecordOutcome};

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::analytics::AnalyticsSink;
use crate::broker::{ReplyEnvelope, TaskBroker, kind};
use crate::cache::{TokenKind, TokenStore};
use crate::config::DispatchConfig;
use crate::error::{CacheError, CloseReason};
use crate::gateway::models::{
    ChatQueryRecord, CompletionQueryRecord, FeedbackRecord, MetaQueryRecord, QueryTaskRecord,
    TelemetryRecord,
};
use crate::inference::redact::SecretDetector;
use crate::registry::{ClosedConnection, ConnectionId, ConnectionRegistry, DeliverOutcome};
use crate::web::protocol::{
    BehavioralTelemetry, ChatMessage, ClientFrame, CodeContext, ContextualTelemetry, ErrorKind,
    ModelReply, ServerFrame,
};

/// Serialized payload of an inference-queue task.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceTask {
    pub request_id: String,
    pub user_id: Uuid,
    pub auth_token: String,
    pub session_token: String,
    pub project_token: String,
    pub job: InferenceJob,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "jobKind", rename_all = "camelCase")]
pub enum InferenceJob {
    Completion {
        model_ids: Vec<i32>,
        context: CodeContext,
        /// Multi-file context snapshot taken at enqueue time.
        snapshot_files: indexmap::IndexMap<String, String>,
        snapshot_through: u64,
    },
    Chat {
        chat_id: String,
        model_id: i32,
        messages: Vec<ChatMessage>,
    },
}

/// Identity of a connection as seen by the frame loop.
#[derive(Debug, Clone)]
pub struct ConnectionCtx {
    pub id: ConnectionId,
    pub user_id: Uuid,
    pub auth_token: String,
    pub session_token: String,
    pub project_token: String,
}

pub struct Orchestrator {
    store: Arc<TokenStore>,
    registry: Arc<ConnectionRegistry>,
    broker: Arc<TaskBroker>,
    sink: Arc<AnalyticsSink>,
    detector: Arc<dyn SecretDetector>,
    pending: PendingTable,
    dispatch: DispatchConfig,
}

fn content_digest(content: &str) -> String {
    hex::encode(&Sha256::digest(content.as_bytes())[..8])
}

impl Orchestrator {
    pub fn new(
        store: Arc<TokenStore>,
        registry: Arc<ConnectionRegistry>,
        broker: Arc<TaskBroker>,
        sink: Arc<AnalyticsSink>,
        detector: Arc<dyn SecretDetector>,
        dispatch: DispatchConfig,
    ) -> Self {
        Self {
            store,
            registry,
            broker,
            sink,
            detector,
            pending: PendingTable::new(),
            dispatch,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Subscribe the connection's reply channel and spawn its forwarder.
    ///
    /// The forwarder drains per-model replies published by workers and runs
    /// until the channel is unsubscribed on connection close.
    pub fn attach_connection(self: &Arc<Self>, ctx: &ConnectionCtx) {
        let channel = ctx.id.reply_channel();
        let mut replies = self.broker.subscribe_reply(&channel);
        let orchestrator = Arc::clone(self);
        let connection_id = ctx.id;
        tokio::spawn(async move {
            while let Some(envelope) = replies.recv().await {
                orchestrator.handle_reply(connection_id, envelope);
            }
            trace!(connection_id = %connection_id, "reply forwarder finished");
        });
    }

    /// Consume closed-connection events: unsubscribe the reply channel and
    /// orphan-seal whatever the connection still had pending, so failed and
    /// abandoned requests stay observable in analytics.
    pub async fn run_closed_listener(
        self: Arc<Self>,
        mut closed: mpsc::UnboundedReceiver<ClosedConnection>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                event = closed.recv() => {
                    let Some(event) = event else { return };
                    self.broker.unsubscribe_reply(&event.id.reply_channel());
                    for pending in self.pending.take_for_connection(event.id) {
                        debug!(
                            request_id = %pending.request_id,
                            reason = %event.reason,
                            "orphan-sealing pending request"
                        );
                        self.persist_sealed(pending, false, true);
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    // ── Frame dispatch ──────────────────────────────────────────────

    pub async fn handle_frame(self: &Arc<Self>, ctx: &ConnectionCtx, frame: ClientFrame) {
        match frame {
            ClientFrame::CompletionRequest {
                request_id,
                model_ids,
                context,
                contextual_telemetry,
                behavioral_telemetry,
                change_indices,
            } => {
                self.handle_completion(
                    ctx,
                    request_id,
                    model_ids,
                    context,
                    contextual_telemetry,
                    behavioral_telemetry,
                    change_indices,
                )
                .await;
            }
            ClientFrame::ChatRequest {
                request_id,
                chat_id,
                model_id,
                messages,
            } => {
                self.handle_chat(ctx, request_id, chat_id, model_id, messages).await;
            }
            ClientFrame::CompletionFeedback {
                request_id,
                model_id,
                accepted,
                shown_at,
                ground_truth,
            } => {
                self.handle_feedback(ctx, request_id, model_id, accepted, shown_at, ground_truth);
            }
            ClientFrame::ContextUpdate {
                request_id,
                file_path,
                content,
            } => {
                self.handle_context_update(ctx, request_id, file_path, content);
            }
            ClientFrame::Ping {
                request_id,
                timestamp,
            } => {
                self.deliver(ctx.id, ServerFrame::Pong {
                    request_id,
                    timestamp,
                });
            }
        }
    }

    fn deliver(&self, id: ConnectionId, frame: ServerFrame) -> DeliverOutcome {
        self.registry.deliver(id, frame)
    }

    /// Re-validate the connection's tokens against the cache.
    ///
    /// On an evicted token the error frame is followed by closing the
    /// connection, per the invariant that a connection never outlives its
    /// session or project.
    fn revalidate(&self, ctx: &ConnectionCtx, request_id: &str) -> bool {
        if let Err(e) = self.store.validate(TokenKind::Session, &ctx.session_token) {
            self.reject_evicted(ctx, request_id, e, CloseReason::SessionExpired);
            return false;
        }
        if let Err(e) = self.store.validate(TokenKind::Project, &ctx.project_token) {
            self.reject_evicted(ctx, request_id, e, CloseReason::ProjectEnded);
            return false;
        }
        true
    }

    fn reject_evicted(
        &self,
        ctx: &ConnectionCtx,
        request_id: &str,
        error: CacheError,
        reason: CloseReason,
    ) {
        self.deliver(
            ctx.id,
            ServerFrame::error(
                Some(request_id.to_owned()),
                ErrorKind::Unauthenticated,
                error.to_string(),
            ),
        );
        self.registry.close(ctx.id, reason);
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_completion(
        self: &Arc<Self>,
        ctx: &ConnectionCtx,
        request_id: String,
        model_ids: Vec<i32>,
        context: CodeContext,
        contextual: ContextualTelemetry,
        behavioral: BehavioralTelemetry,
        change_indices: Option<Vec<u64>>,
    ) {
        if !self.revalidate(ctx, &request_id) {
            return;
        }

        // Duplicate model ids are treated once; an empty list falls back to
        // the configured defaults.
        let mut expected: Vec<i32> = Vec::new();
        for id in &model_ids {
            if !expected.contains(id) {
                expected.push(*id);
            }
        }
        if expected.is_empty() {
            expected = self.dispatch.default_model_ids.clone();
        }
        if expected.is_empty() {
            self.deliver(
                ctx.id,
                ServerFrame::error(Some(request_id), ErrorKind::InvalidRequest, "no models requested"),
            );
            return;
        }

        let snapshot = match self.store.snapshot_context(&ctx.project_token) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.reject_evicted(ctx, &request_id, e, CloseReason::ProjectEnded);
                return;
            }
        };
        if let Some(indices) = &change_indices
            && indices.iter().any(|i| *i > snapshot.applied_through)
        {
            self.deliver(
                ctx.id,
                ServerFrame::error(
                    Some(request_id),
                    ErrorKind::InvalidRequest,
                    "unknown context change index",
                ),
            );
            return;
        }

        let redacted = CodeContext {
            prefix: self.detector.redact(&context.prefix),
            suffix: self.detector.redact(&context.suffix),
            file_name: context.file_name,
            selected_text: context.selected_text.map(|s| self.detector.redact(&s)),
        };

        let now = Instant::now();
        let pending = PendingRequest {
            request_id: request_id.clone(),
            connection_id: ctx.id,
            user_id: ctx.user_id,
            project_id: snapshot.project_id.clone(),
            kind: PendingKind::Completion {
                context: redacted.clone(),
            },
            expected: expected.clone(),
            received: Vec::new(),
            issued_at: Utc::now(),
            enqueued_at: now,
            deadline: now + self.dispatch.request_deadline,
            contextual,
            behavioral,
            snapshot_through: snapshot.applied_through,
        };
        if !self.pending.insert(pending) {
            self.deliver(
                ctx.id,
                ServerFrame::error(
                    Some(request_id),
                    ErrorKind::InvalidRequest,
                    "request id already in flight",
                ),
            );
            return;
        }

        let task = InferenceTask {
            request_id: request_id.clone(),
            user_id: ctx.user_id,
            auth_token: ctx.auth_token.clone(),
            session_token: ctx.session_token.clone(),
            project_token: ctx.project_token.clone(),
            job: InferenceJob::Completion {
                model_ids: expected,
                context: redacted,
                snapshot_files: snapshot.files,
                snapshot_through: snapshot.applied_through,
            },
        };
        self.enqueue_inference(ctx, request_id, kind::COMPLETION, &task);
    }

    async fn handle_chat(
        self: &Arc<Self>,
        ctx: &ConnectionCtx,
        request_id: String,
        chat_id: String,
        model_id: i32,
        messages: Vec<ChatMessage>,
    ) {
        if !self.revalidate(ctx, &request_id) {
            return;
        }
        let snapshot = match self.store.snapshot_context(&ctx.project_token) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.reject_evicted(ctx, &request_id, e, CloseReason::ProjectEnded);
                return;
            }
        };

        let redacted: Vec<ChatMessage> = messages
            .into_iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: self.detector.redact(&m.content),
            })
            .collect();

        let now = Instant::now();
        let pending = PendingRequest {
            request_id: request_id.clone(),
            connection_id: ctx.id,
            user_id: ctx.user_id,
            project_id: snapshot.project_id,
            kind: PendingKind::Chat {
                chat_id: chat_id.clone(),
                messages: redacted.clone(),
            },
            expected: vec![model_id],
            received: Vec::new(),
            issued_at: Utc::now(),
            enqueued_at: now,
            deadline: now + self.dispatch.request_deadline,
            contextual: ContextualTelemetry {
                version_id: 0,
                trigger_type_id: 0,
                language_id: 0,
                file_path: None,
                caret_line: None,
                document_char_length: None,
                relative_document_position: None,
            },
            behavioral: BehavioralTelemetry {
                time_since_last_shown: None,
                time_since_last_accepted: None,
                typing_speed: None,
            },
            snapshot_through: 0,
        };
        if !self.pending.insert(pending) {
            self.deliver(
                ctx.id,
                ServerFrame::error(
                    Some(request_id),
                    ErrorKind::InvalidRequest,
                    "request id already in flight",
                ),
            );
            return;
        }

        let task = InferenceTask {
            request_id: request_id.clone(),
            user_id: ctx.user_id,
            auth_token: ctx.auth_token.clone(),
            session_token: ctx.session_token.clone(),
            project_token: ctx.project_token.clone(),
            job: InferenceJob::Chat {
                chat_id,
                model_id,
                messages: redacted,
            },
        };
        self.enqueue_inference(ctx, request_id, kind::CHAT, &task);
    }

    /// Enqueue an inference task under admission control, arming the
    /// deadline timer on success.
    fn enqueue_inference(
        self: &Arc<Self>,
        ctx: &ConnectionCtx,
        request_id: String,
        task_kind: &str,
        task: &InferenceTask,
    ) {
        let payload = match serde_json::to_value(task) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode inference task");
                self.pending.take(&request_id);
                self.deliver(
                    ctx.id,
                    ServerFrame::error(Some(request_id), ErrorKind::Internal, "encoding failed"),
                );
                return;
            }
        };

        match self
            .broker
            .try_enqueue_inference(task_kind, payload, Some(ctx.id.reply_channel()))
        {
            Ok(_) => {
                let orchestrator = Arc::clone(self);
                let deadline = self.dispatch.request_deadline;
                let request_id = request_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(deadline).await;
                    orchestrator.seal_deadline(&request_id);
                });
            }
            Err(e) => {
                // Over the high-water mark: shed load until it drains, but
                // keep the refused request's telemetry so saturation stays
                // visible in analytics.
                if let Some(refused) = self.pending.take(&request_id)
                    && matches!(refused.kind, PendingKind::Completion { .. })
                {
                    self.sink.emit_telemetry(&TelemetryRecord {
                        request_id: refused.request_id,
                        contextual: refused.contextual,
                        behavioral: refused.behavioral,
                    });
                }
                self.deliver(
                    ctx.id,
                    ServerFrame::error(Some(request_id), ErrorKind::Busy, e.to_string()),
                );
            }
        }
    }

    fn handle_feedback(
        &self,
        ctx: &ConnectionCtx,
        request_id: String,
        model_id: i32,
        accepted: bool,
        shown_at: Vec<chrono::DateTime<Utc>>,
        ground_truth: Option<String>,
    ) {
        // Ownership: when the request is still pending here, check the user
        // directly; otherwise the gateway enforces it row-level. Feedback is
        // accepted regardless of whether the original connection is alive.
        if let Some(owner) = self.pending.owner_of(&request_id)
            && owner != ctx.user_id
        {
            self.deliver(
                ctx.id,
                ServerFrame::error(Some(request_id), ErrorKind::Forbidden, "not your request"),
            );
            return;
        }

        let record = FeedbackRecord {
            request_id,
            user_id: ctx.user_id,
            model_id,
            accepted,
            shown_at,
            ground_truth,
            submitted_at: Utc::now(),
        };
        // Fire-and-forget from the client's perspective; no reply frame.
        self.sink.emit_feedback(&record);
    }

    fn handle_context_update(
        &self,
        ctx: &ConnectionCtx,
        request_id: String,
        file_path: String,
        content: String,
    ) {
        if !self.revalidate(ctx, &request_id) {
            return;
        }
        let change_index = match self.store.update_context(&ctx.project_token, &file_path, &content)
        {
            Ok(index) => index,
            Err(e) => {
                self.reject_evicted(ctx, &request_id, e, CloseReason::ProjectEnded);
                return;
            }
        };
        let digest = content_digest(&content);

        self.deliver(
            ctx.id,
            ServerFrame::ContextAck {
                request_id,
                change_index,
                file_path: file_path.clone(),
                digest: digest.clone(),
            },
        );
        self.registry.broadcast(
            &ctx.project_token,
            &ServerFrame::ContextBroadcast {
                project_token: ctx.project_token.clone(),
                change_index,
                file_path,
                digest,
            },
            Some(ctx.id),
        );
    }

    // ── Reply fan-out ───────────────────────────────────────────────

    fn handle_reply(&self, connection_id: ConnectionId, envelope: ReplyEnvelope) {
        match envelope {
            ReplyEnvelope::Model { request_id, reply } => {
                self.on_model_reply(connection_id, &request_id, reply);
            }
            ReplyEnvelope::ChatDelta {
                request_id,
                chat_id,
                model_id,
                delta,
            } => {
                // Partials are forwarded without waiting for completion.
                if self.pending.owner_of(&request_id).is_some() {
                    self.deliver(
                        connection_id,
                        ServerFrame::ChatPartial {
                            request_id,
                            chat_id,
                            model_id,
                            delta,
                        },
                    );
                }
            }
            ReplyEnvelope::InferenceComplete {
                request_id,
                attempted,
            } => {
                trace!(request_id = %request_id, attempted = ?attempted, "inference barrier");
            }
            ReplyEnvelope::InferenceError {
                request_id,
                code,
                message,
            } => {
                self.deliver(
                    connection_id,
                    ServerFrame::error(Some(request_id.clone()), code, message),
                );
                if let Some(pending) = self.pending.take(&request_id) {
                    self.persist_sealed(pending, false, false);
                }
            }
        }
    }

    fn on_model_reply(&self, connection_id: ConnectionId, request_id: &str, reply: ModelReply) {
        let is_chat = self.pending.is_chat(request_id).unwrap_or(false);
        match self.pending.record_reply(request_id, &reply) {
            RecordOutcome::Dropped | RecordOutcome::Duplicate => {
                trace!(request_id, model_id = reply.model_id, "stale model reply dropped");
            }
            RecordOutcome::Recorded { complete } => {
                // Chat output was already streamed as partial frames; only
                // completion requests get a per-model reply frame.
                if !is_chat {
                    self.deliver(
                        connection_id,
                        ServerFrame::CompletionPartial {
                            request_id: request_id.to_owned(),
                            reply,
                        },
                    );
                }
                if complete {
                    self.seal_complete(request_id);
                }
            }
        }
    }

    /// Seal after every expected model reported.
    fn seal_complete(&self, request_id: &str) {
        let Some(pending) = self.pending.take(request_id) else {
            return;
        };
        self.finish(pending, false);
    }

    /// Seal on deadline with whatever arrived; remaining models are marked
    /// timed out. Fires even with zero successes so failed requests remain
    /// observable in analytics.
    fn seal_deadline(&self, request_id: &str) {
        let Some(pending) = self.pending.take(request_id) else {
            return;
        };
        debug!(request_id, "request deadline fired");
        self.finish(pending, true);
    }

    fn finish(&self, pending: PendingRequest, deadline_fired: bool) {
        let timed_out = pending.remaining();
        let frame = match &pending.kind {
            PendingKind::Completion { .. } => ServerFrame::CompletionFinal {
                request_id: pending.request_id.clone(),
                received: pending.received_ids(),
                timed_out: timed_out.clone(),
                timeout: deadline_fired,
            },
            PendingKind::Chat { chat_id, .. } => ServerFrame::ChatFinal {
                request_id: pending.request_id.clone(),
                chat_id: chat_id.clone(),
                model_id: pending.expected.first().copied().unwrap_or_default(),
                timeout: deadline_fired,
            },
        };
        let orphaned = self.deliver(pending.connection_id, frame) != DeliverOutcome::Delivered;
        self.persist_sealed(pending, deadline_fired, orphaned);
    }

    /// Enqueue the persist task for a sealed request. Called strictly after
    /// every reply frame for the request has been forwarded.
    fn persist_sealed(&self, pending: PendingRequest, deadline_fired: bool, orphaned: bool) {
        let timed_out_models = pending.remaining();
        let telemetry = match &pending.kind {
            PendingKind::Completion { .. } => Some(TelemetryRecord {
                request_id: pending.request_id.clone(),
                contextual: pending.contextual.clone(),
                behavioral: pending.behavioral.clone(),
            }),
            PendingKind::Chat { .. } => None,
        };
        let query = match pending.kind {
            PendingKind::Completion { context } => {
                MetaQueryRecord::Completion(CompletionQueryRecord {
                    request_id: pending.request_id,
                    user_id: pending.user_id,
                    project_id: pending.project_id,
                    issued_at: pending.issued_at,
                    context,
                    snapshot_through: pending.snapshot_through,
                    deadline_fired,
                    orphaned,
                })
            }
            PendingKind::Chat { chat_id, messages } => MetaQueryRecord::Chat(ChatQueryRecord {
                request_id: pending.request_id,
                user_id: pending.user_id,
                project_id: pending.project_id,
                chat_id,
                issued_at: pending.issued_at,
                messages,
                deadline_fired,
                orphaned,
            }),
        };

        // Only models that actually replied get generation rows; timed-out
        // models are recorded on the query task itself.
        self.sink.emit_query(&QueryTaskRecord {
            query,
            generations: pending.received,
            telemetry,
            timed_out_models,
        });
    }

    /// Refuse new work and wait for in-flight requests to seal, used during
    /// graceful shutdown.
    pub async fn drain(&self, timeout: std::time::Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.pending.is_empty() {
            if Instant::now() >= deadline {
                warn!(pending = self.pending.len(), "drain timed out with pending requests");
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        info!("orchestrator drained");
        true
    }
}
