//! Domain error types shared across components.

use thiserror::Error;

pub type Result<T> = anyhow::Result<T>;

/// Errors produced by the token store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("token not found")]
    NotFound,
    #[error("token expired")]
    Expired,
    #[error("parent token not found or expired")]
    ParentMissing,
    #[error("token kind mismatch")]
    KindMismatch,
    #[error("concurrent update conflict")]
    Conflict,
}

/// Errors produced by the task broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue '{0}' is saturated")]
    Saturated(&'static str),
    #[error("unknown task {0}")]
    UnknownTask(u64),
}

/// Errors produced by the persistence gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Worth retrying with backoff (connection loss, timeout, lock contention).
    #[error("transient persistence failure: {0}")]
    Transient(String),
    /// Never retried; the task is dead-lettered with its payload.
    #[error("permanent persistence failure: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            // Schema and referential violations will fail identically on retry.
            sqlx::Error::Database(db) if db.constraint().is_some() => {
                GatewayError::Permanent(e.to_string())
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => GatewayError::Permanent(e.to_string()),
            _ => GatewayError::Transient(e.to_string()),
        }
    }
}

/// Reason a connection was closed, sent to the client in the close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    SessionExpired,
    ProjectEnded,
    Backpressure,
    Internal,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::SessionExpired => "session-expired",
            CloseReason::ProjectEnded => "project-ended",
            CloseReason::Backpressure => "backpressure",
            CloseReason::Internal => "internal",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
