//! Session cache: the four-level token hierarchy with TTL-driven cleanup.

mod reaper;
mod store;
mod tokens;

pub use reaper::{Cascades, Reaper};
pub use store::{ExpiryNotice, SessionDetach, TokenStore};
pub use tokens::{
    AuthRecord, ContextChange, ContextSnapshot, OneShotPurpose, OneShotRecord, ProjectRecord,
    SessionRecord, TokenKind, TokenRecord, generate_token,
};
