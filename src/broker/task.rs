//! Task envelopes and reply envelopes carried by the broker.
//!
//! Queue payloads are opaque JSON to the broker itself; producers and
//! consumers agree on the shape through the `kind` discriminator.

use serde_json::Value;
use tokio::time::Instant;

use crate::web::protocol::{ErrorKind, ModelReply};

/// The two work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    Inference,
    Persist,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Inference => "inference",
            QueueName::Persist => "persist",
        }
    }
}

/// Payload discriminators understood by the worker pools.
pub mod kind {
    /// Inference queue: multi-model completion request.
    pub const COMPLETION: &str = "completion";
    /// Inference queue: single-model chat request.
    pub const CHAT: &str = "chat";
    /// Persist queue: full query record (query, generations, telemetry).
    pub const QUERY: &str = "query";
    /// Persist queue: feedback/ground-truth update for an earlier query.
    pub const FEEDBACK_UPDATE: &str = "feedback-update";
    /// Persist queue: multi-file context flush for a dying project.
    pub const CONTEXT_FLUSH: &str = "context-flush";
    /// Persist queue: standalone telemetry envelope from the analytics sink.
    pub const TELEMETRY: &str = "telemetry";
}

/// A unit of work on one of the queues.
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    pub id: u64,
    pub kind: String,
    pub payload: Value,
    pub reply_channel: Option<String>,
    /// Delivery attempt, starting at 1. Redelivery and retries increment it.
    pub attempt: u32,
    pub enqueued_at: Instant,
}

/// Messages published on a reply channel by inference workers.
#[derive(Debug, Clone)]
pub enum ReplyEnvelope {
    /// One model finished (successfully or with an error payload).
    Model {
        request_id: String,
        reply: ModelReply,
    },
    /// Incremental chat output, forwarded without aggregation.
    ChatDelta {
        request_id: String,
        chat_id: String,
        model_id: i32,
        delta: String,
    },
    /// Synchronization barrier: the worker attempted every model it will.
    InferenceComplete {
        request_id: String,
        attempted: Vec<i32>,
    },
    /// The worker refused the task (e.g. tokens no longer validate).
    InferenceError {
        request_id: String,
        code: ErrorKind,
        message: String,
    },
}

impl ReplyEnvelope {
    pub fn request_id(&self) -> &str {
        match self {
            ReplyEnvelope::Model { request_id, .. }
            | ReplyEnvelope::ChatDelta { request_id, .. }
            | ReplyEnvelope::InferenceComplete { request_id, .. }
            | ReplyEnvelope::InferenceError { request_id, .. } => request_id,
        }
    }
}
