//! Token records held in the session cache.
//!
//! All tokens are opaque 128-bit identifiers rendered as 32-char lowercase
//! hex. The cache owns both sides of the session/project relationship as
//! membership sets inside the records themselves; no in-process owning
//! reference exists outside the store.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rand::Rng;
use serde_json::Value;
use std::collections::VecDeque;
use uuid::Uuid;

/// Generate an unguessable 128-bit token rendered as 32 hex chars.
pub fn generate_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The level of the token hierarchy a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TokenKind {
    Auth,
    Session,
    Project,
    OneShot,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Auth => "auth",
            TokenKind::Session => "session",
            TokenKind::Project => "project",
            TokenKind::OneShot => "one-shot",
        }
    }
}

/// Root identity credential.
#[derive(Debug, Clone)]
pub struct AuthRecord {
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
}

/// Per-client session linking an auth token to a set of active projects.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub auth_token: String,
    pub user_id: Uuid,
    /// Child project tokens attached to this session.
    pub projects: Vec<String>,
    /// User-preference snapshot taken at session creation.
    pub preferences: Value,
}

/// A single append-only entry in a project's context change-log.
#[derive(Debug, Clone)]
pub struct ContextChange {
    pub index: u64,
    pub file_path: String,
    pub content: String,
    pub changed_at: DateTime<Utc>,
}

/// Per-project handle shared across one or more sessions.
///
/// Carries the multi-file context map and its bounded change-log. Entries
/// older than the bound are dropped; their effect is already present in
/// `files`, which always holds the latest content per path.
#[derive(Debug, Clone)]
pub struct ProjectRecord {
    pub project_id: String,
    pub user_id: Uuid,
    /// Parent session tokens. The project dies when this empties.
    pub parents: Vec<String>,
    pub files: IndexMap<String, String>,
    pub changelog: VecDeque<ContextChange>,
    /// Next change index to hand out; indices are strictly monotonic per project.
    pub next_change_index: u64,
}

impl ProjectRecord {
    /// Highest change index applied so far, or 0 if none.
    pub fn applied_through(&self) -> u64 {
        self.next_change_index.saturating_sub(1)
    }
}

/// Point-in-time view of a project's multi-file context.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    pub project_id: String,
    pub files: IndexMap<String, String>,
    pub applied_through: u64,
}

/// What a one-shot token is good for. Consumption destroys the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OneShotPurpose {
    Verification,
    Reset,
}

/// Single-purpose short-TTL token, consumed on first read.
#[derive(Debug, Clone)]
pub struct OneShotRecord {
    pub purpose: OneShotPurpose,
    pub user_id: Uuid,
}

/// A validated record of any kind, as returned by `TokenStore::validate`.
#[derive(Debug, Clone)]
pub enum TokenRecord {
    Auth(AuthRecord),
    Session(SessionRecord),
    Project(ProjectRecord),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_128_bit_hex() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_tokens_are_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
    }
}
