//! Cascading cleanup of the token hierarchy.
//!
//! The reaper consumes expiry notices emitted a safety margin before each
//! record expires and propagates invalidation downward: auth to sessions,
//! sessions to projects, dying projects to connection closes and a durable
//! context flush. Every step is idempotent, so duplicate or replayed
//! notices are harmless.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{QueueName, TaskBroker, kind};
use crate::cache::store::{ExpiryNotice, TokenStore};
use crate::cache::tokens::{ProjectRecord, TokenKind, TokenRecord};
use crate::error::{CacheError, CloseReason};
use crate::gateway::models::ContextFlushRecord;
use crate::registry::ConnectionRegistry;

/// Shared cascade driver, used both by the reaper service (hook-fired) and
/// by explicit deactivation on the request path.
pub struct Cascades {
    store: Arc<TokenStore>,
    registry: Arc<ConnectionRegistry>,
    broker: Arc<TaskBroker>,
    store_context_durably: bool,
}

impl Cascades {
    pub fn new(
        store: Arc<TokenStore>,
        registry: Arc<ConnectionRegistry>,
        broker: Arc<TaskBroker>,
        store_context_durably: bool,
    ) -> Self {
        Self {
            store,
            registry,
            broker,
            store_context_durably,
        }
    }

    /// Auth death: detach every child session.
    pub fn cascade_auth(&self, auth_token: &str) {
        match self.store.revoke_auth(auth_token) {
            Ok((_, session_tokens)) => {
                debug!(
                    sessions = session_tokens.len(),
                    "auth token dying, detaching child sessions"
                );
                for session_token in session_tokens {
                    self.cascade_session(&session_token, CloseReason::SessionExpired);
                }
            }
            Err(CacheError::NotFound) => {}
            Err(e) => warn!(error = %e, "auth cascade failed"),
        }
    }

    /// Session death: detach from every child project, close the session's
    /// connections, and flush any project whose parent set emptied.
    pub fn cascade_session(&self, session_token: &str, reason: CloseReason) {
        let detach = match self.store.detach_session(session_token) {
            Ok(detach) => detach,
            Err(CacheError::NotFound) => return,
            Err(e) => {
                warn!(error = %e, "session cascade failed");
                return;
            }
        };

        self.registry.close_session(session_token, reason);
        for (project_token, project) in detach.dead_projects {
            self.finish_project(&project_token, project);
        }
    }

    /// Project hook fired: if no parent session is still live, destroy the
    /// project. Covers sessions that vanished without a cascade (lost
    /// notices).
    pub fn cascade_project(&self, project_token: &str) {
        let record = match self.store.validate(TokenKind::Project, project_token) {
            Ok(TokenRecord::Project(record)) => record,
            _ => return,
        };
        let any_parent_live = record
            .parents
            .iter()
            .any(|p| self.store.validate(TokenKind::Session, p).is_ok());
        if any_parent_live {
            return;
        }
        if let Some(record) = self.store.remove_project(project_token) {
            self.finish_project(project_token, record);
        }
    }

    /// Close the project's connections and flush its context durably.
    fn finish_project(&self, project_token: &str, project: ProjectRecord) {
        self.registry
            .close_project(project_token, CloseReason::ProjectEnded);

        if !self.store_context_durably || project.files.is_empty() {
            return;
        }
        let flush = ContextFlushRecord {
            project_id: project.project_id.clone(),
            user_id: project.user_id,
            files: project.files.clone(),
            applied_through: project.applied_through(),
            flushed_at: Utc::now(),
        };
        match serde_json::to_value(&flush) {
            Ok(payload) => {
                self.broker
                    .enqueue(QueueName::Persist, kind::CONTEXT_FLUSH, payload, None);
                debug!(project_id = %project.project_id, "project context flush enqueued");
            }
            Err(e) => warn!(error = %e, "failed to encode context flush"),
        }
    }
}

/// Consumes expiry notices and drives the cascades.
pub struct Reaper {
    cascades: Arc<Cascades>,
    notices: mpsc::UnboundedReceiver<ExpiryNotice>,
}

impl Reaper {
    pub fn new(cascades: Arc<Cascades>, notices: mpsc::UnboundedReceiver<ExpiryNotice>) -> Self {
        Self { cascades, notices }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("reaper started");
        loop {
            tokio::select! {
                notice = self.notices.recv() => {
                    match notice {
                        Some(notice) => self.handle(notice),
                        None => {
                            debug!("expiry notice stream closed");
                            return;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    // Drain whatever is already queued before stopping.
                    while let Ok(notice) = self.notices.try_recv() {
                        self.handle(notice);
                    }
                    debug!("reaper stopped");
                    return;
                }
            }
        }
    }

    fn handle(&self, notice: ExpiryNotice) {
        match notice.kind {
            TokenKind::Auth => self.cascades.cascade_auth(&notice.token),
            TokenKind::Session => self
                .cascades
                .cascade_session(&notice.token, CloseReason::SessionExpired),
            TokenKind::Project => self.cascades.cascade_project(&notice.token),
            TokenKind::OneShot => {}
        }
    }
}
