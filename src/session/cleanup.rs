//! Background session cleanup task.
//!
//! Periodically evicts expired sessions and abandoned AuthnRequests.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

use super::store::SessionStore;
use crate::saml::RequestTracker;

/// Default cleanup interval in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300; // 5 minutes

/// Spawn a background task that periodically cleans up expired state.
///
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_cleanup_task(
    session_store: Arc<SessionStore>,
    request_tracker: Arc<RequestTracker>,
    cleanup_interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(cleanup_interval_secs.max(1)));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let sessions = session_store.evict_expired();
            let requests = request_tracker.evict_expired();

            if sessions > 0 || requests > 0 {
                info!(
                    sessions_evicted = sessions,
                    requests_evicted = requests,
                    "Session cleanup completed"
                );
            } else {
                debug!("Session cleanup: nothing expired");
            }

            debug!(
                active_sessions = session_store.session_count(),
                pending_requests = request_tracker.pending_count(),
                "Session store status"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::DEFAULT_REQUEST_TTL_SECS;
    use crate::session::SessionId;

    #[tokio::test]
    async fn test_cleanup_task_evicts_abandoned_requests() {
        let store = Arc::new(SessionStore::new(3600, 300));
        let tracker = Arc::new(RequestTracker::new(DEFAULT_REQUEST_TTL_SECS));

        let live = store.create();
        tracker.issue("stale".to_string(), "_req1".to_string(), SessionId::new());
        tracker.backdate("stale", 3600);
        tracker.issue("fresh".to_string(), "_req2".to_string(), live);

        let handle = spawn_cleanup_task(Arc::clone(&store), Arc::clone(&tracker), 1);

        // Wait for at least one cleanup cycle
        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.abort();

        assert_eq!(tracker.pending_count(), 1, "Only the fresh request remains");
        assert!(store.is_live(live), "Live session should not be cleaned up");
    }
}
