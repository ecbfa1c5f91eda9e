//! Durable record types crossing the persistence gateway.
//!
//! These are also the self-describing payloads carried by `persist` queue
//! tasks, so everything here serializes.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::web::protocol::{BehavioralTelemetry, ChatMessage, CodeContext, ContextualTelemetry};

/// Durable user row, loaded on the hot path for authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub preferences: Value,
    pub verified: bool,
    pub joined_at: DateTime<Utc>,
}

/// A query record, discriminated into its concrete variant.
///
/// The durable model uses table inheritance; the gateway dispatches each
/// variant to the right table set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "queryKind", rename_all = "camelCase")]
pub enum MetaQueryRecord {
    Completion(CompletionQueryRecord),
    Chat(ChatQueryRecord),
}

impl MetaQueryRecord {
    pub fn request_id(&self) -> &str {
        match self {
            MetaQueryRecord::Completion(q) => &q.request_id,
            MetaQueryRecord::Chat(q) => &q.request_id,
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            MetaQueryRecord::Completion(q) => q.user_id,
            MetaQueryRecord::Chat(q) => q.user_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionQueryRecord {
    pub request_id: String,
    pub user_id: Uuid,
    pub project_id: String,
    pub issued_at: DateTime<Utc>,
    /// Redacted code context as sent to the models.
    pub context: CodeContext,
    /// Highest multi-file context change index incorporated.
    pub snapshot_through: u64,
    pub deadline_fired: bool,
    /// True when the originating connection was gone by the time the
    /// request was sealed; the record is kept for analytics regardless.
    pub orphaned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatQueryRecord {
    pub request_id: String,
    pub user_id: Uuid,
    pub project_id: String,
    pub chat_id: String,
    pub issued_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
    pub deadline_fired: bool,
    pub orphaned: bool,
}

/// One generation per (request, model). The pair is the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRow {
    pub request_id: String,
    pub model_id: i32,
    pub completion: String,
    pub confidence: f64,
    pub logprobs: Vec<f64>,
    pub generation_time_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timed_out: bool,
}

/// Append-only ground truth, keyed by (request, truth timestamp).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundTruthRow {
    pub request_id: String,
    pub truth_timestamp: DateTime<Utc>,
    pub ground_truth: String,
}

/// Telemetry pair attached to a query, upserted by request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub request_id: String,
    pub contextual: ContextualTelemetry,
    pub behavioral: BehavioralTelemetry,
}

/// Feedback update for an earlier completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub request_id: String,
    pub user_id: Uuid,
    pub model_id: i32,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shown_at: Vec<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_truth: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Multi-file context of a dying project, flushed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFlushRecord {
    pub project_id: String,
    pub user_id: Uuid,
    pub files: IndexMap<String, String>,
    /// Change index the flush is consistent with; (project, index) is the
    /// idempotency key.
    pub applied_through: u64,
    pub flushed_at: DateTime<Utc>,
}

/// The full persist payload for a sealed request: causal write order within
/// the task is query, then generations, then telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTaskRecord {
    pub query: MetaQueryRecord,
    pub generations: Vec<GenerationRow>,
    pub telemetry: Option<TelemetryRecord>,
    pub timed_out_models: Vec<i32>,
}
