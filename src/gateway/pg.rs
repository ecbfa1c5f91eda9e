//! PostgreSQL implementation of the persistence gateway.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::gateway::PersistenceGateway;
use crate::gateway::models::{
    ChatQueryRecord, CompletionQueryRecord, ContextFlushRecord, FeedbackRecord, GenerationRow,
    GroundTruthRow, MetaQueryRecord, TelemetryRecord, UserRow,
};

pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_completion_child(
        tx: &mut sqlx::PgConnection,
        query: &CompletionQueryRecord,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO completion_queries (request_id, prefix, suffix, file_name, selected_text, snapshot_through)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (request_id) DO NOTHING",
        )
        .bind(&query.request_id)
        .bind(&query.context.prefix)
        .bind(&query.context.suffix)
        .bind(&query.context.file_name)
        .bind(&query.context.selected_text)
        .bind(query.snapshot_through as i64)
        .execute(tx)
        .await?;
        Ok(())
    }

    async fn insert_chat_child(
        tx: &mut sqlx::PgConnection,
        query: &ChatQueryRecord,
    ) -> Result<(), GatewayError> {
        let messages = serde_json::to_value(&query.messages)
            .map_err(|e| GatewayError::Permanent(e.to_string()))?;
        sqlx::query(
            "INSERT INTO chat_queries (request_id, chat_id, messages)
             VALUES ($1, $2, $3)
             ON CONFLICT (request_id) DO NOTHING",
        )
        .bind(&query.request_id)
        .bind(&query.chat_id)
        .bind(messages)
        .execute(tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn upsert_user(&self, user: &UserRow) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO users (id, email, name, preferences, verified, joined_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET
                email = EXCLUDED.email,
                name = EXCLUDED.name,
                preferences = EXCLUDED.preferences,
                verified = EXCLUDED.verified",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.preferences)
        .bind(user.verified)
        .bind(user.joined_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_user(&self, user_id: Uuid) -> Result<Option<UserRow>, GatewayError> {
        let row: Option<(Uuid, String, String, Value, bool, chrono::DateTime<chrono::Utc>)> =
            sqlx::query_as(
                "SELECT id, email, name, preferences, verified, joined_at FROM users WHERE id = $1",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id, email, name, preferences, verified, joined_at)| UserRow {
            id,
            email,
            name,
            preferences,
            verified,
            joined_at,
        }))
    }

    async fn load_config(&self, name: &str) -> Result<Option<Value>, GatewayError> {
        let row: Option<(Value,)> = sqlx::query_as("SELECT data FROM configs WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(data,)| data))
    }

    async fn create_meta_query(&self, query: &MetaQueryRecord) -> Result<(), GatewayError> {
        let mut tx = self.pool.begin().await?;

        let (request_id, user_id, project_id, query_kind, issued_at, deadline_fired, orphaned) =
            match query {
                MetaQueryRecord::Completion(q) => (
                    &q.request_id,
                    q.user_id,
                    &q.project_id,
                    "completion",
                    q.issued_at,
                    q.deadline_fired,
                    q.orphaned,
                ),
                MetaQueryRecord::Chat(q) => (
                    &q.request_id,
                    q.user_id,
                    &q.project_id,
                    "chat",
                    q.issued_at,
                    q.deadline_fired,
                    q.orphaned,
                ),
            };

        sqlx::query(
            "INSERT INTO meta_queries (request_id, user_id, project_id, query_kind, issued_at, deadline_fired, orphaned)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (request_id) DO NOTHING",
        )
        .bind(request_id)
        .bind(user_id)
        .bind(project_id)
        .bind(query_kind)
        .bind(issued_at)
        .bind(deadline_fired)
        .bind(orphaned)
        .execute(&mut *tx)
        .await?;

        match query {
            MetaQueryRecord::Completion(q) => Self::insert_completion_child(&mut tx, q).await?,
            MetaQueryRecord::Chat(q) => Self::insert_chat_child(&mut tx, q).await?,
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_generation(&self, generation: &GenerationRow) -> Result<(), GatewayError> {
        let logprobs = serde_json::to_value(&generation.logprobs)
            .map_err(|e| GatewayError::Permanent(e.to_string()))?;
        sqlx::query(
            "INSERT INTO generations (request_id, model_id, completion, confidence, logprobs, generation_time_ms, error, timed_out)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (request_id, model_id) DO NOTHING",
        )
        .bind(&generation.request_id)
        .bind(generation.model_id)
        .bind(&generation.completion)
        .bind(generation.confidence)
        .bind(logprobs)
        .bind(generation.generation_time_ms)
        .bind(&generation.error)
        .bind(generation.timed_out)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_ground_truth(&self, truth: &GroundTruthRow) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO ground_truths (request_id, truth_timestamp, ground_truth)
             VALUES ($1, $2, $3)
             ON CONFLICT (request_id, truth_timestamp) DO NOTHING",
        )
        .bind(&truth.request_id)
        .bind(truth.truth_timestamp)
        .bind(&truth.ground_truth)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_telemetry(&self, telemetry: &TelemetryRecord) -> Result<(), GatewayError> {
        let contextual = serde_json::to_value(&telemetry.contextual)
            .map_err(|e| GatewayError::Permanent(e.to_string()))?;
        let behavioral = serde_json::to_value(&telemetry.behavioral)
            .map_err(|e| GatewayError::Permanent(e.to_string()))?;
        sqlx::query(
            "INSERT INTO telemetries (request_id, contextual, behavioral)
             VALUES ($1, $2, $3)
             ON CONFLICT (request_id) DO UPDATE SET
                contextual = EXCLUDED.contextual,
                behavioral = EXCLUDED.behavioral",
        )
        .bind(&telemetry.request_id)
        .bind(contextual)
        .bind(behavioral)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_generation_feedback(
        &self,
        feedback: &FeedbackRecord,
    ) -> Result<(), GatewayError> {
        let shown_at = serde_json::to_value(&feedback.shown_at)
            .map_err(|e| GatewayError::Permanent(e.to_string()))?;
        // The join enforces ownership at the row level: feedback is
        // accepted whenever the submitting user matches the original
        // request's user, regardless of connection liveness.
        let result = sqlx::query(
            "UPDATE generations g SET accepted = $3, shown_at = $4
             FROM meta_queries m
             WHERE g.request_id = $1 AND g.model_id = $2
               AND m.request_id = g.request_id AND m.user_id = $5",
        )
        .bind(&feedback.request_id)
        .bind(feedback.model_id)
        .bind(feedback.accepted)
        .bind(shown_at)
        .bind(feedback.user_id)
        .execute(&self.pool)
        .await?;

        // The generation row may not have landed yet; back off and retry
        // rather than losing the feedback.
        if result.rows_affected() == 0 {
            return Err(GatewayError::Transient(format!(
                "no matching generation for ({}, {}) yet",
                feedback.request_id, feedback.model_id
            )));
        }
        Ok(())
    }

    async fn flush_project_context(&self, flush: &ContextFlushRecord) -> Result<(), GatewayError> {
        let files = serde_json::to_value(&flush.files)
            .map_err(|e| GatewayError::Permanent(e.to_string()))?;
        sqlx::query(
            "INSERT INTO context_snapshots (project_id, change_index, user_id, files, flushed_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (project_id, change_index) DO NOTHING",
        )
        .bind(&flush.project_id)
        .bind(flush.applied_through as i64)
        .bind(flush.user_id)
        .bind(files)
        .bind(flush.flushed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
