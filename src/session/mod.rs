//! Session management for SAML authentication.
//!
//! In-memory session storage with signed cookies and background cleanup.

pub mod cleanup;
pub mod cookie;
pub mod store;
pub mod types;

pub use cleanup::{spawn_cleanup_task, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use store::{SessionError, SessionStore};
pub use types::{SessionId, UserProfile};
