//! In-memory table of requests awaiting model replies.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::gateway::models::GenerationRow;
use crate::registry::ConnectionId;
use crate::web::protocol::{
    BehavioralTelemetry, ChatMessage, CodeContext, ContextualTelemetry, ModelReply,
};

/// Variant-specific request data carried until the seal.
#[derive(Debug, Clone)]
pub enum PendingKind {
    Completion {
        /// Redacted code context, as sent to the models and as persisted.
        context: CodeContext,
    },
    Chat {
        chat_id: String,
        messages: Vec<ChatMessage>,
    },
}

/// Tracks which models have responded for a given client request.
///
/// Owned by the orchestrator that issued the request; destroyed when all
/// models have reported or the deadline fires.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: String,
    pub connection_id: ConnectionId,
    pub user_id: Uuid,
    pub project_id: String,
    pub kind: PendingKind,
    /// Deduplicated model ids this request fans out to.
    pub expected: Vec<i32>,
    /// Replies received so far, at most one per model id.
    pub received: Vec<GenerationRow>,
    pub issued_at: DateTime<Utc>,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    pub contextual: ContextualTelemetry,
    pub behavioral: BehavioralTelemetry,
    pub snapshot_through: u64,
}

impl PendingRequest {
    pub fn is_complete(&self) -> bool {
        self.received.len() >= self.expected.len()
    }

    /// Models that have not replied yet.
    pub fn remaining(&self) -> Vec<i32> {
        self.expected
            .iter()
            .copied()
            .filter(|id| !self.received.iter().any(|r| r.model_id == *id))
            .collect()
    }

    pub fn received_ids(&self) -> Vec<i32> {
        self.received.iter().map(|r| r.model_id).collect()
    }
}

/// Outcome of recording a reply against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// No such pending request (completed, sealed, or orphaned); dropped.
    Dropped,
    /// Duplicate reply for a model that already reported; dropped.
    Duplicate,
    /// Recorded; `complete` is true when every expected model has reported.
    Recorded { complete: bool },
}

/// Process-local pending-request table, keyed by request id.
#[derive(Default)]
pub struct PendingTable {
    inner: DashMap<String, PendingRequest>,
    by_connection: DashMap<ConnectionId, Vec<String>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new pending request. Fails when the request id is already
    /// live (client reused an id before its previous request sealed).
    pub fn insert(&self, pending: PendingRequest) -> bool {
        let request_id = pending.request_id.clone();
        let connection_id = pending.connection_id;
        let mut duplicate = false;
        self.inner
            .entry(request_id.clone())
            .and_modify(|_| duplicate = true)
            .or_insert(pending);
        if duplicate {
            return false;
        }
        self.by_connection
            .entry(connection_id)
            .or_default()
            .push(request_id);
        true
    }

    /// Owner of a live request, used for feedback ownership checks.
    pub fn owner_of(&self, request_id: &str) -> Option<Uuid> {
        self.inner.get(request_id).map(|p| p.user_id)
    }

    /// Whether a live request is a chat request.
    pub fn is_chat(&self, request_id: &str) -> Option<bool> {
        self.inner
            .get(request_id)
            .map(|p| matches!(p.kind, PendingKind::Chat { .. }))
    }

    /// Record a model reply, deduplicating per (request, model).
    pub fn record_reply(&self, request_id: &str, reply: &ModelReply) -> RecordOutcome {
        let Some(mut pending) = self.inner.get_mut(request_id) else {
            return RecordOutcome::Dropped;
        };
        if pending.received.iter().any(|r| r.model_id == reply.model_id) {
            return RecordOutcome::Duplicate;
        }
        if !pending.expected.contains(&reply.model_id) {
            return RecordOutcome::Dropped;
        }
        pending.received.push(GenerationRow {
            request_id: request_id.to_owned(),
            model_id: reply.model_id,
            completion: reply.completion.clone().unwrap_or_default(),
            confidence: reply.confidence.unwrap_or(0.0),
            logprobs: reply.logprobs.clone(),
            generation_time_ms: reply.generation_time_ms.unwrap_or(0) as i64,
            error: reply.error.clone(),
            timed_out: false,
        });
        RecordOutcome::Recorded {
            complete: pending.is_complete(),
        }
    }

    /// Remove and return a pending request for sealing.
    pub fn take(&self, request_id: &str) -> Option<PendingRequest> {
        let (_, pending) = self.inner.remove(request_id)?;
        if let Some(mut ids) = self.by_connection.get_mut(&pending.connection_id) {
            ids.retain(|id| id != request_id);
        }
        self.by_connection
            .remove_if(&pending.connection_id, |_, ids| ids.is_empty());
        Some(pending)
    }

    /// Remove and return every pending request bound to a connection.
    pub fn take_for_connection(&self, connection_id: ConnectionId) -> Vec<PendingRequest> {
        let Some((_, ids)) = self.by_connection.remove(&connection_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.inner.remove(id).map(|(_, p)| p))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(request_id: &str, connection: u64, expected: Vec<i32>) -> PendingRequest {
        PendingRequest {
            request_id: request_id.to_owned(),
            connection_id: ConnectionId(connection),
            user_id: Uuid::new_v4(),
            project_id: "proj".into(),
            kind: PendingKind::Completion {
                context: CodeContext {
                    prefix: String::new(),
                    suffix: String::new(),
                    file_name: None,
                    selected_text: None,
                },
            },
            expected,
            received: Vec::new(),
            issued_at: Utc::now(),
            enqueued_at: Instant::now(),
            deadline: Instant::now(),
            contextual: ContextualTelemetry {
                version_id: 1,
                trigger_type_id: 1,
                language_id: 1,
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
        }
    }

    fn reply(model_id: i32) -> ModelReply {
        ModelReply {
            model_id,
            completion: Some("x".into()),
            confidence: Some(0.9),
            logprobs: vec![],
            generation_time_ms: Some(10),
            error: None,
        }
    }

    #[tokio::test]
    async fn duplicate_model_reply_is_dropped() {
        let table = PendingTable::new();
        table.insert(pending("r", 1, vec![1, 2]));

        assert_eq!(
            table.record_reply("r", &reply(1)),
            RecordOutcome::Recorded { complete: false }
        );
        assert_eq!(table.record_reply("r", &reply(1)), RecordOutcome::Duplicate);
        assert_eq!(
            table.record_reply("r", &reply(2)),
            RecordOutcome::Recorded { complete: true }
        );
    }

    #[tokio::test]
    async fn reply_for_sealed_request_is_dropped() {
        let table = PendingTable::new();
        table.insert(pending("r", 1, vec![1]));
        table.take("r").unwrap();
        assert_eq!(table.record_reply("r", &reply(1)), RecordOutcome::Dropped);
    }

    #[tokio::test]
    async fn live_request_id_cannot_be_reused() {
        let table = PendingTable::new();
        assert!(table.insert(pending("r", 1, vec![1])));
        assert!(!table.insert(pending("r", 2, vec![1])));
    }

    #[tokio::test]
    async fn take_for_connection_scopes_by_connection() {
        let table = PendingTable::new();
        table.insert(pending("a", 1, vec![1]));
        table.insert(pending("b", 1, vec![1]));
        table.insert(pending("c", 2, vec![1]));

        let taken = table.take_for_connection(ConnectionId(1));
        assert_eq!(taken.len(), 2);
        assert_eq!(table.len(), 1);
    }
}
