//! Outstanding AuthnRequest tracking.
//!
//! Every redirect to the IdP records a [`PendingRequest`] keyed by the
//! RelayState token sent along with it. The ACS callback consumes that entry
//! exactly once; a second callback with the same RelayState finds nothing.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;

use crate::session::types::expiry_after;
use crate::session::SessionId;

/// Default lifetime of an outstanding AuthnRequest.
pub const DEFAULT_REQUEST_TTL_SECS: u64 = 300;

/// Correlation state for one issued AuthnRequest.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// AuthnRequest ID, expected as `InResponseTo` on the response.
    pub request_id: String,

    /// Session that started the login.
    pub session_id: SessionId,

    /// When the request was issued.
    pub issued_at: DateTime<Utc>,
}

/// Reasons a callback cannot be correlated to an issued request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("Callback carries no RelayState")]
    Missing,

    #[error("No outstanding AuthnRequest for RelayState")]
    Unknown,

    #[error("AuthnRequest {request_id} expired")]
    Expired { request_id: String },
}

/// Single-use store of outstanding AuthnRequests.
pub struct RequestTracker {
    pending: DashMap<String, PendingRequest>,
    ttl_secs: u64,
}

impl RequestTracker {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            pending: DashMap::new(),
            ttl_secs,
        }
    }

    /// Record a request issued under `relay_state`.
    pub fn issue(&self, relay_state: String, request_id: String, session_id: SessionId) {
        self.pending.insert(
            relay_state,
            PendingRequest {
                request_id,
                session_id,
                issued_at: Utc::now(),
            },
        );
    }

    /// Remove and return the request for `relay_state`.
    ///
    /// The entry is removed even when expired, so it can never be retried.
    pub fn consume(&self, relay_state: &str) -> Result<PendingRequest, CorrelationError> {
        let (_, request) = self
            .pending
            .remove(relay_state)
            .ok_or(CorrelationError::Unknown)?;

        if self.is_expired(&request) {
            return Err(CorrelationError::Expired {
                request_id: request.request_id,
            });
        }

        Ok(request)
    }

    /// Drop expired requests from abandoned logins. Returns the number evicted.
    pub fn evict_expired(&self) -> usize {
        let before = self.pending.len();
        let now = Utc::now();
        let ttl_secs = self.ttl_secs;
        self.pending
            .retain(|_, request| now <= expiry_after(request.issued_at, ttl_secs));
        before.saturating_sub(self.pending.len())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn is_expired(&self, request: &PendingRequest) -> bool {
        Utc::now() > expiry_after(request.issued_at, self.ttl_secs)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, relay_state: &str, age_secs: i64) {
        if let Some(mut request) = self.pending.get_mut(relay_state) {
            request.issued_at = Utc::now() - chrono::Duration::seconds(age_secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_issue_and_consume() {
        let tracker = RequestTracker::new(DEFAULT_REQUEST_TTL_SECS);
        let session = SessionId::new();
        tracker.issue("relay-1".to_string(), "_req1".to_string(), session);

        let request = tracker.consume("relay-1").unwrap();
        assert_eq!(request.request_id, "_req1");
        assert_eq!(request.session_id, session);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_consume_is_single_use() {
        let tracker = RequestTracker::new(DEFAULT_REQUEST_TTL_SECS);
        tracker.issue("relay-1".to_string(), "_req1".to_string(), SessionId::new());

        assert!(tracker.consume("relay-1").is_ok());
        assert_eq!(
            tracker.consume("relay-1").unwrap_err(),
            CorrelationError::Unknown
        );
    }

    #[test]
    fn test_unknown_relay_state() {
        let tracker = RequestTracker::new(DEFAULT_REQUEST_TTL_SECS);
        assert_eq!(
            tracker.consume("never-issued").unwrap_err(),
            CorrelationError::Unknown
        );
    }

    #[test]
    fn test_expired_request_rejected_and_removed() {
        let tracker = RequestTracker::new(DEFAULT_REQUEST_TTL_SECS);
        tracker.issue("relay-1".to_string(), "_req1".to_string(), SessionId::new());
        tracker.backdate("relay-1", 301);

        assert_eq!(
            tracker.consume("relay-1").unwrap_err(),
            CorrelationError::Expired {
                request_id: "_req1".to_string()
            }
        );
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_evict_expired() {
        let tracker = RequestTracker::new(DEFAULT_REQUEST_TTL_SECS);
        tracker.issue("fresh".to_string(), "_req1".to_string(), SessionId::new());
        tracker.issue("stale".to_string(), "_req2".to_string(), SessionId::new());
        tracker.backdate("stale", 600);

        assert_eq!(tracker.evict_expired(), 1);
        assert!(tracker.consume("fresh").is_ok());
    }

    #[test]
    fn test_huge_ttl_never_expires_early() {
        let tracker = RequestTracker::new(u64::MAX);
        tracker.issue("relay-1".to_string(), "_req1".to_string(), SessionId::new());
        tracker.backdate("relay-1", 3600);

        assert_eq!(tracker.evict_expired(), 0);
        assert!(tracker.consume("relay-1").is_ok());
    }

    #[test]
    fn test_concurrent_consume_succeeds_once() {
        let tracker = Arc::new(RequestTracker::new(DEFAULT_REQUEST_TTL_SECS));
        tracker.issue("relay-1".to_string(), "_req1".to_string(), SessionId::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || tracker.consume("relay-1").is_ok())
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }
}
