//! Narrow interface over the durable store.
//!
//! The hot path reads through it (user lookup, config load); the cold path
//! writes through it from the persistence workers. The core never touches
//! the schema directly.

pub mod models;
mod pg;

pub use pg::PgGateway;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::GatewayError;
use models::{
    ContextFlushRecord, FeedbackRecord, GenerationRow, GroundTruthRow, MetaQueryRecord,
    TelemetryRecord, UserRow,
};

/// Verbs exposed to the core. Row identity is keyed by (request-id,
/// model-id) for generations, (project-id, change-index) for context
/// flushes, (request-id, truth-timestamp) for ground truth, and UUIDs
/// elsewhere, so every write is idempotent under redelivery.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn upsert_user(&self, user: &UserRow) -> Result<(), GatewayError>;

    async fn load_user(&self, user_id: Uuid) -> Result<Option<UserRow>, GatewayError>;

    async fn load_config(&self, name: &str) -> Result<Option<Value>, GatewayError>;

    async fn create_meta_query(&self, query: &MetaQueryRecord) -> Result<(), GatewayError>;

    async fn create_generation(&self, generation: &GenerationRow) -> Result<(), GatewayError>;

    async fn append_ground_truth(&self, truth: &GroundTruthRow) -> Result<(), GatewayError>;

    async fn upsert_telemetry(&self, telemetry: &TelemetryRecord) -> Result<(), GatewayError>;

    /// Record acceptance feedback on an existing generation. Replayed
    /// submissions are no-ops.
    async fn update_generation_feedback(&self, feedback: &FeedbackRecord)
    -> Result<(), GatewayError>;

    async fn flush_project_context(&self, flush: &ContextFlushRecord) -> Result<(), GatewayError>;
}
