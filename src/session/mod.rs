//! Higher-level session verbs used by the request path.
//!
//! Wraps the token store with cookie handling, user resolution through the
//! persistence gateway, and the explicit-logout cascade.

use cookie::Cookie;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::cache::{Cascades, TokenKind, TokenRecord, TokenStore};
use crate::error::{CacheError, CloseReason};
use crate::gateway::PersistenceGateway;
use crate::web::protocol::ErrorKind;

pub const AUTH_COOKIE: &str = "auth_token";
pub const SESSION_COOKIE: &str = "session_token";
pub const PROJECT_COOKIE: &str = "project_token";

/// Session-related cookies extracted from a request.
#[derive(Debug, Clone, Default)]
pub struct RawCookies {
    pub auth_token: Option<String>,
    pub session_token: Option<String>,
    pub project_token: Option<String>,
}

impl RawCookies {
    /// Parse a `Cookie` request header.
    pub fn parse(header: &str) -> Self {
        let mut cookies = Self::default();
        for cookie in Cookie::split_parse(header).flatten() {
            match cookie.name() {
                AUTH_COOKIE => cookies.auth_token = Some(cookie.value().to_owned()),
                SESSION_COOKIE => cookies.session_token = Some(cookie.value().to_owned()),
                PROJECT_COOKIE => cookies.project_token = Some(cookie.value().to_owned()),
                _ => {}
            }
        }
        cookies
    }
}

/// Successful authorization of a connection or request.
#[derive(Debug, Clone)]
pub struct Authz {
    pub user_id: Uuid,
    pub session_token: String,
    /// Project tokens currently attached to the session.
    pub project_tokens: Vec<String>,
    pub preferences: Value,
}

/// Distinguished rejection reasons for authorization failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    /// No token was presented at all.
    Missing,
    /// The token is not in the cache.
    Unknown,
    /// The token was in the cache but its TTL has passed.
    Expired,
    /// The session's parent auth token does not match the presented one.
    MismatchedParent,
}

impl Reject {
    pub fn error_kind(&self) -> ErrorKind {
        ErrorKind::Unauthenticated
    }

    pub fn message(&self) -> &'static str {
        match self {
            Reject::Missing => "missing session token",
            Reject::Unknown => "unknown session token",
            Reject::Expired => "session expired",
            Reject::MismatchedParent => "session does not belong to this login",
        }
    }
}

impl From<CacheError> for Reject {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Expired => Reject::Expired,
            _ => Reject::Unknown,
        }
    }
}

pub struct SessionManager {
    store: Arc<TokenStore>,
    gateway: Arc<dyn PersistenceGateway>,
    cascades: Arc<Cascades>,
}

impl SessionManager {
    pub fn new(
        store: Arc<TokenStore>,
        gateway: Arc<dyn PersistenceGateway>,
        cascades: Arc<Cascades>,
    ) -> Self {
        Self {
            store,
            gateway,
            cascades,
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Issue a root auth token for a user. Called by the account surface
    /// after a successful login or OAuth exchange.
    pub fn issue_auth(&self, user_id: Uuid) -> String {
        self.store.issue_auth(user_id)
    }

    /// Resolve raw cookies into an authorization, or a distinguished reject.
    pub async fn authenticate_session(&self, cookies: &RawCookies) -> Result<Authz, Reject> {
        let session_token = cookies.session_token.as_deref().ok_or(Reject::Missing)?;

        let record = match self.store.validate(TokenKind::Session, session_token)? {
            TokenRecord::Session(record) => record,
            _ => return Err(Reject::Unknown),
        };

        // The parent auth token must itself still be live (the cascade may
        // simply not have reached this session yet).
        if self
            .store
            .validate(TokenKind::Auth, &record.auth_token)
            .is_err()
        {
            return Err(Reject::Expired);
        }
        if let Some(presented) = cookies.auth_token.as_deref()
            && presented != record.auth_token
        {
            return Err(Reject::MismatchedParent);
        }

        // Hot-path user read; a vanished user invalidates the session.
        match self.gateway.load_user(record.user_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(Reject::Unknown),
            Err(e) => {
                warn!(error = %e, "user lookup failed during authentication");
                return Err(Reject::Unknown);
            }
        }

        Ok(Authz {
            user_id: record.user_id,
            session_token: session_token.to_owned(),
            project_tokens: record.projects,
            preferences: record.preferences,
        })
    }

    /// Create a session bound to a valid auth cookie, returning the token
    /// and its remaining lifetime (for the cookie's Max-Age).
    pub async fn acquire_session(&self, cookies: &RawCookies) -> Result<(String, Duration), Reject> {
        let auth_token = cookies.auth_token.as_deref().ok_or(Reject::Missing)?;
        let auth = match self.store.validate(TokenKind::Auth, auth_token)? {
            TokenRecord::Auth(auth) => auth,
            _ => return Err(Reject::Unknown),
        };

        let preferences = match self.gateway.load_user(auth.user_id).await {
            Ok(Some(user)) => user.preferences,
            Ok(None) => return Err(Reject::Unknown),
            Err(e) => {
                warn!(error = %e, "user lookup failed during session acquisition");
                return Err(Reject::Unknown);
            }
        };

        let token = self
            .store
            .issue_session(auth_token, preferences)
            .map_err(|_| Reject::Expired)?;
        let ttl = self
            .store
            .remaining_ttl(TokenKind::Session, &token)
            .unwrap_or_default();
        Ok((token, ttl))
    }

    /// Attach a project to a session; idempotent per (session, project).
    pub fn activate_project(
        &self,
        session_token: &str,
        project_id: &str,
    ) -> Result<(String, Duration), Reject> {
        let token = self
            .store
            .attach_project(session_token, project_id)
            .map_err(Reject::from)?;
        let ttl = self
            .store
            .remaining_ttl(TokenKind::Project, &token)
            .unwrap_or_default();
        Ok((token, ttl))
    }

    /// Explicit logout: drives the full cascade (project detachment,
    /// connection closes, durable context flush).
    pub fn deactivate_session(&self, session_token: &str) {
        self.cascades
            .cascade_session(session_token, CloseReason::SessionExpired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_session_cookies() {
        let cookies =
            RawCookies::parse("auth_token=aaa; session_token=bbb; project_token=ccc; other=x");
        assert_eq!(cookies.auth_token.as_deref(), Some("aaa"));
        assert_eq!(cookies.session_token.as_deref(), Some("bbb"));
        assert_eq!(cookies.project_token.as_deref(), Some("ccc"));
    }

    #[test]
    fn missing_cookies_parse_to_none() {
        let cookies = RawCookies::parse("theme=dark");
        assert!(cookies.auth_token.is_none());
        assert!(cookies.session_token.is_none());
    }
}
