//! In-memory session store.
//!
//! Sessions live in a sharded concurrent map:
//! - Operations on one session ID are atomic
//! - Operations on different IDs never wait on a global lock
//! - Unknown or expired IDs resolve to "unauthenticated"

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::types::{expiry_after, Session, SessionId, UserProfile};

/// Errors returned by [`SessionStore::attach`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Unknown or expired session.
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// A profile is already bound to this session.
    #[error("Session already authenticated: {0}")]
    AlreadyAuthenticated(SessionId),
}

/// Session store keyed by [`SessionId`].
pub struct SessionStore {
    sessions: DashMap<SessionId, Session>,

    /// Lifetime of an authenticated session in seconds.
    ttl_secs: u64,

    /// Lifetime of a session that has not logged in yet.
    anonymous_ttl_secs: u64,
}

impl SessionStore {
    /// Create an empty store. Sessions live `anonymous_ttl_secs` until a
    /// profile is attached, then `ttl_secs` from the attach.
    pub fn new(ttl_secs: u64, anonymous_ttl_secs: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl_secs,
            anonymous_ttl_secs,
        }
    }

    /// Allocate a new unauthenticated session.
    pub fn create(&self) -> SessionId {
        let session = Session::new(self.anonymous_ttl_secs);
        let id = session.id;
        self.sessions.insert(id, session);
        debug!(session = %id, "Session created");
        id
    }

    /// Bind a profile to an existing, unexpired, unauthenticated session.
    ///
    /// The expiry is reset to a full TTL from now.
    pub fn attach(&self, id: SessionId, profile: UserProfile) -> Result<(), SessionError> {
        let expired = match self.sessions.get_mut(&id) {
            None => return Err(SessionError::NotFound(id)),
            Some(mut session) => {
                if session.is_expired() {
                    true
                } else if session.is_authenticated() {
                    return Err(SessionError::AlreadyAuthenticated(id));
                } else {
                    let now = Utc::now();
                    session.profile = Some(Arc::new(profile));
                    session.last_accessed = now;
                    session.expires_at = expiry_after(now, self.ttl_secs);
                    false
                }
            }
        };

        if expired {
            // Shard guard from get_mut is released above.
            self.sessions.remove_if(&id, |_, s| s.is_expired());
            return Err(SessionError::NotFound(id));
        }

        debug!(session = %id, "Profile attached to session");
        Ok(())
    }

    /// Check whether the session exists, is unexpired, and carries a profile.
    pub fn is_authenticated(&self, id: SessionId) -> bool {
        self.profile(id).is_some()
    }

    /// Check whether the session exists and is unexpired.
    pub fn is_live(&self, id: SessionId) -> bool {
        self.with_live(id, |_| ()).is_some()
    }

    /// Get the profile bound to a session, updating its last access time.
    pub fn profile(&self, id: SessionId) -> Option<Arc<UserProfile>> {
        self.with_live(id, |session| session.profile.clone())
            .flatten()
    }

    /// Remove a session. Unknown IDs are a no-op.
    pub fn destroy(&self, id: SessionId) -> bool {
        let removed = self.sessions.remove(&id).is_some();
        if removed {
            debug!(session = %id, "Session destroyed");
        }
        removed
    }

    /// Evict all expired sessions. Returns the number evicted.
    pub fn evict_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired());
        before.saturating_sub(self.sessions.len())
    }

    /// Number of stored sessions, including not yet evicted expired ones.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run `f` against a live session, touching it. Expired entries are dropped.
    fn with_live<T>(&self, id: SessionId, f: impl FnOnce(&Session) -> T) -> Option<T> {
        let expired = match self.sessions.get_mut(&id) {
            None => return None,
            Some(mut session) => {
                if session.is_expired() {
                    true
                } else {
                    session.touch();
                    return Some(f(&*session));
                }
            }
        };

        if expired {
            self.sessions.remove_if(&id, |_, s| s.is_expired());
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn remaining_secs(&self, id: SessionId) -> Option<i64> {
        self.sessions
            .get(&id)
            .map(|session| (session.expires_at - Utc::now()).num_seconds())
    }

    #[cfg(test)]
    fn expire_now(&self, id: SessionId) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.expires_at = Utc::now() - chrono::Duration::seconds(10);
        }
    }
}
