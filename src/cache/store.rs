//! TTL'd key-value store for the token hierarchy.
//!
//! Every long-lived token is paired with an expiry hook that fires a safety
//! margin before the record itself expires, so cascading cleanup runs while
//! the record is still readable. Reads never refresh TTLs; the TTL set at
//! issue time is authoritative.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::cache::tokens::{
    AuthRecord, ContextChange, ContextSnapshot, OneShotPurpose, OneShotRecord, ProjectRecord,
    SessionRecord, TokenKind, TokenRecord, generate_token,
};
use crate::config::TokenConfig;
use crate::error::CacheError;

/// A value paired with its absolute expiry.
#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Notification that a token's expiry hook has fired.
///
/// The main record is still readable for roughly the configured safety
/// margin after this is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryNotice {
    pub kind: TokenKind,
    pub token: String,
}

#[derive(Debug, PartialEq, Eq)]
struct Hook {
    fire_at: Instant,
    kind: TokenKind,
    token: String,
}

impl Ord for Hook {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.fire_at, self.kind, &self.token).cmp(&(other.fire_at, other.kind, &other.token))
    }
}

impl PartialOrd for Hook {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of detaching a session: the removed record plus every project
/// whose parent set emptied as a consequence.
#[derive(Debug)]
pub struct SessionDetach {
    pub session: SessionRecord,
    pub dead_projects: Vec<(String, ProjectRecord)>,
}

/// Concurrent token store with per-entry TTL and expiry notifications.
///
/// All single-key mutations are atomic under the entry lock of the owning
/// shard, which is what the remote-cache compare-and-set contract
/// degenerates to in-process.
pub struct TokenStore {
    config: TokenConfig,
    auth: DashMap<String, Expiring<AuthRecord>>,
    sessions: DashMap<String, Expiring<SessionRecord>>,
    projects: DashMap<String, Expiring<ProjectRecord>>,
    one_shot: DashMap<String, Expiring<OneShotRecord>>,
    /// `{user_id}:{project_id}` -> project token, for cross-session reuse.
    project_index: DashMap<String, String>,
    hooks: Mutex<BinaryHeap<Reverse<Hook>>>,
    hook_added: Notify,
    expiry_tx: mpsc::UnboundedSender<ExpiryNotice>,
}

impl TokenStore {
    /// Create a store and the expiry notification stream consumed by the reaper.
    pub fn new(config: TokenConfig) -> (Self, mpsc::UnboundedReceiver<ExpiryNotice>) {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let store = Self {
            config,
            auth: DashMap::new(),
            sessions: DashMap::new(),
            projects: DashMap::new(),
            one_shot: DashMap::new(),
            project_index: DashMap::new(),
            hooks: Mutex::new(BinaryHeap::new()),
            hook_added: Notify::new(),
            expiry_tx,
        };
        (store, expiry_rx)
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    fn schedule_hook(&self, kind: TokenKind, token: &str, expires_at: Instant) {
        let fire_at = expires_at
            .checked_sub(self.config.expiry_margin)
            .unwrap_or(expires_at);
        self.hooks.lock().expect("lock poisoned").push(Reverse(Hook {
            fire_at,
            kind,
            token: token.to_owned(),
        }));
        self.hook_added.notify_one();
    }

    // ── Issue / validate ────────────────────────────────────────────

    /// Allocate an auth token for a user with the configured absolute TTL.
    pub fn issue_auth(&self, user_id: Uuid) -> String {
        let token = generate_token();
        let expires_at = Instant::now() + self.config.auth_token_ttl;
        self.auth.insert(
            token.clone(),
            Expiring {
                value: AuthRecord {
                    user_id,
                    issued_at: Utc::now(),
                },
                expires_at,
            },
        );
        self.schedule_hook(TokenKind::Auth, &token, expires_at);
        debug!(user_id = %user_id, "issued auth token");
        token
    }

    /// Create a session under an auth token.
    ///
    /// The session TTL is the configured session lifetime clamped to the
    /// parent auth token's remaining lifetime.
    pub fn issue_session(
        &self,
        auth_token: &str,
        preferences: Value,
    ) -> Result<String, CacheError> {
        let now = Instant::now();
        let (user_id, auth_expires_at) = {
            let entry = self.auth.get(auth_token).ok_or(CacheError::ParentMissing)?;
            if !entry.live(now) {
                drop(entry);
                self.auth.remove(auth_token);
                return Err(CacheError::ParentMissing);
            }
            (entry.value.user_id, entry.expires_at)
        };

        let expires_at = auth_expires_at.min(now + self.config.session_token_ttl);
        let token = generate_token();
        self.sessions.insert(
            token.clone(),
            Expiring {
                value: SessionRecord {
                    auth_token: auth_token.to_owned(),
                    user_id,
                    projects: Vec::new(),
                    preferences,
                },
                expires_at,
            },
        );
        self.schedule_hook(TokenKind::Session, &token, expires_at);
        Ok(token)
    }

    /// Attach a project to a session, reusing an existing ProjectToken when
    /// one is live for the same (user, project) under any other session.
    pub fn attach_project(
        &self,
        session_token: &str,
        project_id: &str,
    ) -> Result<String, CacheError> {
        let now = Instant::now();
        let (user_id, session_expires_at) = {
            let entry = self
                .sessions
                .get(session_token)
                .ok_or(CacheError::ParentMissing)?;
            if !entry.live(now) {
                return Err(CacheError::ParentMissing);
            }
            (entry.value.user_id, entry.expires_at)
        };

        let index_key = format!("{user_id}:{project_id}");

        // Reuse path: the index may point at a token whose record has since
        // expired, in which case the stale index entry is dropped and a
        // fresh project is created.
        if let Some(existing) = self.project_index.get(&index_key).map(|t| t.clone()) {
            if let Some(mut entry) = self.projects.get_mut(&existing) {
                if entry.live(now) {
                    if !entry.value.parents.iter().any(|p| p == session_token) {
                        entry.value.parents.push(session_token.to_owned());
                    }
                    entry.expires_at = entry.expires_at.max(session_expires_at);
                    let extended_to = entry.expires_at;
                    drop(entry);
                    self.link_session_project(session_token, &existing);
                    // Re-arm the hook for the (possibly) extended lifetime;
                    // stale hooks are harmless, presence is re-checked when
                    // they fire.
                    self.schedule_hook(TokenKind::Project, &existing, extended_to);
                    return Ok(existing);
                }
            }
            self.project_index.remove(&index_key);
            self.projects.remove(&existing);
        }

        let token = generate_token();
        self.projects.insert(
            token.clone(),
            Expiring {
                value: ProjectRecord {
                    project_id: project_id.to_owned(),
                    user_id,
                    parents: vec![session_token.to_owned()],
                    files: indexmap::IndexMap::new(),
                    changelog: VecDeque::new(),
                    next_change_index: 1,
                },
                expires_at: session_expires_at,
            },
        );
        self.project_index.insert(index_key, token.clone());
        self.link_session_project(session_token, &token);
        self.schedule_hook(TokenKind::Project, &token, session_expires_at);
        Ok(token)
    }

    fn link_session_project(&self, session_token: &str, project_token: &str) {
        if let Some(mut entry) = self.sessions.get_mut(session_token)
            && !entry.value.projects.iter().any(|p| p == project_token)
        {
            entry.value.projects.push(project_token.to_owned());
        }
    }

    /// Remove a session and unlink it from every child project.
    ///
    /// Projects whose parent set empties are destroyed and returned so the
    /// caller can flush their context to durable storage.
    pub fn detach_session(&self, session_token: &str) -> Result<SessionDetach, CacheError> {
        let (_, entry) = self
            .sessions
            .remove(session_token)
            .ok_or(CacheError::NotFound)?;
        let session = entry.value;

        let mut dead_projects = Vec::new();
        for project_token in &session.projects {
            let emptied = {
                let Some(mut project) = self.projects.get_mut(project_token) else {
                    continue;
                };
                project.value.parents.retain(|p| p != session_token);
                project.value.parents.is_empty()
            };
            if emptied && let Some((token, removed)) = self.projects.remove(project_token) {
                let index_key = format!("{}:{}", removed.value.user_id, removed.value.project_id);
                self.project_index.remove(&index_key);
                dead_projects.push((token, removed.value));
            }
        }

        Ok(SessionDetach {
            session,
            dead_projects,
        })
    }

    /// Constant-time lookup. Never refreshes the TTL.
    ///
    /// An expired record still present (lazy removal) is removed here and
    /// reported as `Expired`; a record that was never there, or already
    /// removed, is `NotFound`.
    pub fn validate(&self, kind: TokenKind, token: &str) -> Result<TokenRecord, CacheError> {
        fn lookup<T: Clone>(
            shard: &DashMap<String, Expiring<T>>,
            token: &str,
            wrap: impl FnOnce(T) -> TokenRecord,
        ) -> Result<TokenRecord, CacheError> {
            let now = Instant::now();
            match shard.get(token) {
                Some(entry) if entry.live(now) => Ok(wrap(entry.value.clone())),
                Some(entry) => {
                    drop(entry);
                    shard.remove_if(token, |_, e| !e.live(now));
                    Err(CacheError::Expired)
                }
                None => Err(CacheError::NotFound),
            }
        }

        match kind {
            TokenKind::Auth => lookup(&self.auth, token, TokenRecord::Auth),
            TokenKind::Session => lookup(&self.sessions, token, TokenRecord::Session),
            TokenKind::Project => lookup(&self.projects, token, TokenRecord::Project),
            TokenKind::OneShot => Err(CacheError::KindMismatch),
        }
    }

    /// Issue a one-shot verification/reset token with its configured TTL.
    pub fn issue_one_shot(&self, purpose: OneShotPurpose, user_id: Uuid) -> String {
        let ttl = match purpose {
            OneShotPurpose::Verification => self.config.verification_token_ttl,
            OneShotPurpose::Reset => self.config.reset_token_ttl,
        };
        let token = generate_token();
        self.one_shot.insert(
            token.clone(),
            Expiring {
                value: OneShotRecord { purpose, user_id },
                expires_at: Instant::now() + ttl,
            },
        );
        token
    }

    /// Validate and consume a one-shot token. The record is destroyed even
    /// when it turns out to be expired.
    pub fn consume_one_shot(&self, token: &str) -> Result<OneShotRecord, CacheError> {
        let (_, entry) = self.one_shot.remove(token).ok_or(CacheError::NotFound)?;
        if entry.live(Instant::now()) {
            Ok(entry.value)
        } else {
            Err(CacheError::Expired)
        }
    }

    // ── Multi-file context ──────────────────────────────────────────

    /// Apply a context change: overwrite the addressed file and append to
    /// the change-log, returning the strictly monotonic per-project index.
    pub fn update_context(
        &self,
        project_token: &str,
        file_path: &str,
        content: &str,
    ) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut entry = self
            .projects
            .get_mut(project_token)
            .ok_or(CacheError::NotFound)?;
        if !entry.live(now) {
            return Err(CacheError::NotFound);
        }

        let project = &mut entry.value;
        let index = project.next_change_index;
        project.next_change_index += 1;
        project
            .files
            .insert(file_path.to_owned(), content.to_owned());
        project.changelog.push_back(ContextChange {
            index,
            file_path: file_path.to_owned(),
            content: content.to_owned(),
            changed_at: Utc::now(),
        });
        // Compaction: the base map already carries every applied change, so
        // bounding the log is just dropping its oldest entries.
        while project.changelog.len() > self.config.changelog_cap {
            project.changelog.pop_front();
        }
        Ok(index)
    }

    /// Snapshot the current context map along with the highest applied index.
    pub fn snapshot_context(&self, project_token: &str) -> Result<ContextSnapshot, CacheError> {
        let now = Instant::now();
        let entry = self
            .projects
            .get(project_token)
            .ok_or(CacheError::NotFound)?;
        if !entry.live(now) {
            return Err(CacheError::NotFound);
        }
        Ok(ContextSnapshot {
            project_id: entry.value.project_id.clone(),
            files: entry.value.files.clone(),
            applied_through: entry.value.applied_through(),
        })
    }

    // ── Revocation and cascade support ──────────────────────────────

    /// Explicitly revoke an auth token, returning its record and the tokens
    /// of every child session (for the caller to cascade).
    pub fn revoke_auth(&self, auth_token: &str) -> Result<(AuthRecord, Vec<String>), CacheError> {
        let (_, entry) = self.auth.remove(auth_token).ok_or(CacheError::NotFound)?;
        Ok((entry.value, self.sessions_of_auth(auth_token)))
    }

    /// Remove a project outright, unlinking its index entry. Used by the
    /// project cascade when no parent session survives.
    pub fn remove_project(&self, project_token: &str) -> Option<ProjectRecord> {
        let (_, entry) = self.projects.remove(project_token)?;
        let index_key = format!("{}:{}", entry.value.user_id, entry.value.project_id);
        self.project_index.remove(&index_key);
        Some(entry.value)
    }

    /// Tokens of every session whose parent is the given auth token.
    pub fn sessions_of_auth(&self, auth_token: &str) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|e| e.value().value.auth_token == auth_token)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Remaining lifetime of a token, used to align cookie expiry with the
    /// underlying record.
    pub fn remaining_ttl(&self, kind: TokenKind, token: &str) -> Option<Duration> {
        let now = Instant::now();
        let expires_at = match kind {
            TokenKind::Auth => self.auth.get(token)?.expires_at,
            TokenKind::Session => self.sessions.get(token)?.expires_at,
            TokenKind::Project => self.projects.get(token)?.expires_at,
            TokenKind::OneShot => self.one_shot.get(token)?.expires_at,
        };
        expires_at.checked_duration_since(now)
    }

    /// Current depth of each shard, for health reporting.
    pub fn shard_sizes(&self) -> (usize, usize, usize, usize) {
        (
            self.auth.len(),
            self.sessions.len(),
            self.projects.len(),
            self.one_shot.len(),
        )
    }

    /// Emit notices for every record whose hook window has opened but which
    /// is still present. Covers lost hook notifications; cascades are
    /// idempotent so duplicate notices are harmless.
    pub fn sweep_due(&self) {
        let due = Instant::now() + self.config.expiry_margin;
        for entry in self.auth.iter() {
            if entry.value().expires_at <= due {
                self.notify(TokenKind::Auth, entry.key());
            }
        }
        for entry in self.sessions.iter() {
            if entry.value().expires_at <= due {
                self.notify(TokenKind::Session, entry.key());
            }
        }
        for entry in self.projects.iter() {
            if entry.value().expires_at <= due {
                self.notify(TokenKind::Project, entry.key());
            }
        }
        let now = Instant::now();
        self.one_shot.retain(|_, e| e.live(now));
    }

    fn notify(&self, kind: TokenKind, token: &str) {
        let notice = ExpiryNotice {
            kind,
            token: token.to_owned(),
        };
        if self.expiry_tx.send(notice).is_err() {
            warn!(kind = kind.as_str(), "expiry notice dropped, reaper gone");
        }
    }

    /// Drive the hook heap: sleeps until the next hook fires, emits a notice
    /// if the record is still present, and runs a periodic orphan sweep to
    /// cover lost notifications.
    pub async fn run_expiry_sweeper(&self, cancel: CancellationToken) {
        let sweep_interval = self.config.expiry_margin * 2;
        let mut next_sweep = Instant::now() + sweep_interval;
        loop {
            let next_hook = self
                .hooks
                .lock()
                .expect("lock poisoned")
                .peek()
                .map(|Reverse(h)| h.fire_at);
            let wake_at = next_hook.map_or(next_sweep, |h| h.min(next_sweep));

            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = self.hook_added.notified() => continue,
                _ = cancel.cancelled() => {
                    debug!("expiry sweeper stopped");
                    return;
                }
            }

            let now = Instant::now();
            loop {
                let hook = {
                    let mut hooks = self.hooks.lock().expect("lock poisoned");
                    match hooks.peek() {
                        Some(Reverse(h)) if h.fire_at <= now => hooks.pop().map(|Reverse(h)| h),
                        _ => None,
                    }
                };
                let Some(hook) = hook else { break };
                let present = match hook.kind {
                    TokenKind::Auth => self.auth.contains_key(&hook.token),
                    TokenKind::Session => self.sessions.contains_key(&hook.token),
                    TokenKind::Project => self.projects.contains_key(&hook.token),
                    TokenKind::OneShot => false,
                };
                if present {
                    trace!(kind = hook.kind.as_str(), "expiry hook fired");
                    self.notify(hook.kind, &hook.token);
                }
            }

            if Instant::now() >= next_sweep {
                self.sweep_due();
                next_sweep = Instant::now() + sweep_interval;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (TokenStore, mpsc::UnboundedReceiver<ExpiryNotice>) {
        TokenStore::new(TokenConfig::default())
    }

    #[tokio::test]
    async fn session_requires_live_auth() {
        let (store, _rx) = store();
        let err = store.issue_session("missing", json!({})).unwrap_err();
        assert!(matches!(err, CacheError::ParentMissing));

        let auth = store.issue_auth(Uuid::new_v4());
        let session = store.issue_session(&auth, json!({"theme": "dark"})).unwrap();
        assert!(store.validate(TokenKind::Session, &session).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn session_ttl_clamped_to_auth_remainder() {
        let config = TokenConfig {
            auth_token_ttl: Duration::from_secs(60),
            session_token_ttl: Duration::from_secs(3600),
            ..TokenConfig::default()
        };
        let (store, _rx) = TokenStore::new(config);
        let auth = store.issue_auth(Uuid::new_v4());
        let session = store.issue_session(&auth, json!({})).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.validate(TokenKind::Session, &session).is_err());
    }

    #[tokio::test]
    async fn project_reused_across_sessions_of_same_user() {
        let (store, _rx) = store();
        let user = Uuid::new_v4();
        let auth = store.issue_auth(user);
        let s1 = store.issue_session(&auth, json!({})).unwrap();
        let s2 = store.issue_session(&auth, json!({})).unwrap();

        let p1 = store.attach_project(&s1, "proj-a").unwrap();
        let p2 = store.attach_project(&s2, "proj-a").unwrap();
        assert_eq!(p1, p2);

        let TokenRecord::Project(record) = store.validate(TokenKind::Project, &p1).unwrap() else {
            panic!("expected project record");
        };
        assert_eq!(record.parents.len(), 2);
    }

    #[tokio::test]
    async fn detach_destroys_project_when_last_parent_leaves() {
        let (store, _rx) = store();
        let auth = store.issue_auth(Uuid::new_v4());
        let s1 = store.issue_session(&auth, json!({})).unwrap();
        let s2 = store.issue_session(&auth, json!({})).unwrap();
        let project = store.attach_project(&s1, "proj-a").unwrap();
        store.attach_project(&s2, "proj-a").unwrap();

        let first = store.detach_session(&s1).unwrap();
        assert!(first.dead_projects.is_empty());
        assert!(store.validate(TokenKind::Project, &project).is_ok());

        let second = store.detach_session(&s2).unwrap();
        assert_eq!(second.dead_projects.len(), 1);
        assert!(store.validate(TokenKind::Project, &project).is_err());
    }

    #[tokio::test]
    async fn context_indices_are_monotonic() {
        let (store, _rx) = store();
        let auth = store.issue_auth(Uuid::new_v4());
        let session = store.issue_session(&auth, json!({})).unwrap();
        let project = store.attach_project(&session, "proj-a").unwrap();

        let first = store.update_context(&project, "src/foo.py", "a = 1").unwrap();
        let second = store.update_context(&project, "src/foo.py", "a = 2").unwrap();
        let third = store.update_context(&project, "src/bar.py", "b = 3").unwrap();
        assert!(first < second && second < third);

        let snapshot = store.snapshot_context(&project).unwrap();
        assert_eq!(snapshot.applied_through, third);
        assert_eq!(snapshot.files.get("src/foo.py").unwrap(), "a = 2");
    }

    #[tokio::test]
    async fn changelog_bounded_by_cap() {
        let config = TokenConfig {
            changelog_cap: 4,
            ..TokenConfig::default()
        };
        let (store, _rx) = TokenStore::new(config);
        let auth = store.issue_auth(Uuid::new_v4());
        let session = store.issue_session(&auth, json!({})).unwrap();
        let project = store.attach_project(&session, "proj-a").unwrap();

        for i in 0..10 {
            store
                .update_context(&project, &format!("f{i}.py"), "x")
                .unwrap();
        }

        let TokenRecord::Project(record) =
            store.validate(TokenKind::Project, &project).unwrap()
        else {
            panic!("expected project record");
        };
        assert_eq!(record.changelog.len(), 4);
        // Compacted content survives in the base map.
        assert_eq!(record.files.len(), 10);
    }

    #[tokio::test]
    async fn one_shot_consumed_exactly_once() {
        let (store, _rx) = store();
        let token = store.issue_one_shot(OneShotPurpose::Reset, Uuid::new_v4());
        assert!(store.consume_one_shot(&token).is_ok());
        assert!(store.consume_one_shot(&token).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn hook_fires_before_main_expiry() {
        let config = TokenConfig {
            auth_token_ttl: Duration::from_secs(30),
            expiry_margin: Duration::from_secs(5),
            ..TokenConfig::default()
        };
        let (store, mut rx) = TokenStore::new(config);
        let token = store.issue_auth(Uuid::new_v4());

        tokio::time::advance(Duration::from_secs(26)).await;
        store.sweep_due();
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.kind, TokenKind::Auth);
        assert_eq!(notice.token, token);
        // Record is still readable inside the margin window.
        assert!(store.validate(TokenKind::Auth, &token).is_ok());
    }
}
