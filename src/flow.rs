//! SSO flow controller.
//!
//! The redirect handshake is a small state machine:
//!
//! ```text
//! Anonymous --GET /login--> RequestIssued --accepted response--> Authenticated
//!                                 |                                    |
//!                                 +--rejected response--> Failed       +--logout--> Anonymous
//! ```
//!
//! [`transition`] is pure: it maps `(state, event)` to the next state and an
//! [`Effect`] describing the HTTP outcome. [`SsoFlow`] performs the side
//! effects (session store, request tracker, verifier) that produce events.

use axum::http::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::saml::{
    AssertionVerifier, CorrelationError, RequestTracker, SamlProvider, TrustMaterial,
    VerificationError,
};
use crate::session::{SessionError, SessionId, SessionStore};

/// Landing route and protected resource.
pub const HOME_PATH: &str = "/";
/// Login entry point.
pub const LOGIN_PATH: &str = "/login";
/// Failure endpoint (always 401).
pub const FAIL_PATH: &str = "/login/fail";

/// Verifications allowed on the blocking pool at once, including ones whose
/// caller already gave up after `verify_timeout`.
pub const MAX_PENDING_VERIFICATIONS: usize = 64;

/// Authentication state of one browser session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Anonymous,
    RequestIssued,
    Authenticated,
    Failed,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// `/login` hit by a session that already has a profile.
    AlreadyAuthenticated,
    /// An AuthnRequest was issued; `new_session` when the cookie must be set.
    RequestIssued {
        location: String,
        session: SessionId,
        new_session: bool,
    },
    /// The IdP response verified and the profile is attached to `session`.
    ResponseAccepted { session: SessionId },
    /// The IdP response, or its correlation, was rejected.
    ResponseRejected,
    /// `/logout`.
    Logout,
    /// Request for the protected resource.
    ProtectedAccess,
}

/// Session cookie change carried by a redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieChange {
    Keep,
    Set(SessionId),
    Clear,
}

/// HTTP outcome of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Redirect {
        location: String,
        cookie: CookieChange,
    },
    Respond {
        status: StatusCode,
        body: &'static str,
    },
}

impl Effect {
    fn redirect(location: impl Into<String>, cookie: CookieChange) -> Self {
        Effect::Redirect {
            location: location.into(),
            cookie,
        }
    }
}

/// Advance the state machine.
pub fn transition(state: FlowState, event: FlowEvent) -> (FlowState, Effect) {
    use FlowEvent::*;
    use FlowState::*;

    match (state, event) {
        (_, AlreadyAuthenticated) => (
            Authenticated,
            Effect::redirect(HOME_PATH, CookieChange::Keep),
        ),
        (
            _,
            FlowEvent::RequestIssued {
                location,
                session,
                new_session,
            },
        ) => {
            let cookie = if new_session {
                CookieChange::Set(session)
            } else {
                CookieChange::Keep
            };
            (FlowState::RequestIssued, Effect::redirect(location, cookie))
        }
        (FlowState::RequestIssued, ResponseAccepted { session }) => (
            Authenticated,
            Effect::redirect(HOME_PATH, CookieChange::Set(session)),
        ),
        // A response with no issued request behind it never authenticates.
        (_, ResponseAccepted { .. }) | (_, ResponseRejected) => {
            (Failed, Effect::redirect(FAIL_PATH, CookieChange::Keep))
        }
        (_, Logout) => (Anonymous, Effect::redirect(HOME_PATH, CookieChange::Clear)),
        (Authenticated, ProtectedAccess) => (
            Authenticated,
            Effect::Respond {
                status: StatusCode::OK,
                body: "Authenticated",
            },
        ),
        (state, ProtectedAccess) => (state, Effect::redirect(LOGIN_PATH, CookieChange::Keep)),
    }
}

/// Why a callback ended in `Failed`.
#[derive(Debug, Error)]
pub enum CallbackFailure {
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error("Callback carries no SAMLResponse")]
    MissingResponse,

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error("Could not bind profile to a session: {0}")]
    Session(#[from] SessionError),
}

/// Form fields posted by the IdP to the ACS endpoint.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CallbackForm {
    #[serde(rename = "SAMLResponse")]
    pub saml_response: Option<String>,
    #[serde(rename = "RelayState")]
    pub relay_state: Option<String>,
}

/// Orchestrates login, callback, logout and protected-resource access.
pub struct SsoFlow {
    provider: Arc<SamlProvider>,
    verifier: Arc<dyn AssertionVerifier>,
    trust: Arc<TrustMaterial>,
    sessions: Arc<SessionStore>,
    requests: Arc<RequestTracker>,
    /// Bounds how long a callback waits for the verifier. The blocking task
    /// itself cannot be cancelled and runs to completion after a timeout;
    /// `verify_slots` caps how many of those can pile up.
    verify_timeout: Duration,
    verify_slots: Arc<Semaphore>,
}

impl SsoFlow {
    pub fn new(
        provider: Arc<SamlProvider>,
        verifier: Arc<dyn AssertionVerifier>,
        trust: Arc<TrustMaterial>,
        sessions: Arc<SessionStore>,
        requests: Arc<RequestTracker>,
        verify_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            verifier,
            trust,
            sessions,
            requests,
            verify_timeout,
            verify_slots: Arc::new(Semaphore::new(MAX_PENDING_VERIFICATIONS)),
        }
    }

    #[cfg(test)]
    pub(crate) fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    #[cfg(test)]
    fn with_verify_slots(mut self, slots: usize) -> Self {
        self.verify_slots = Arc::new(Semaphore::new(slots));
        self
    }

    /// Current state of a browser session, as far as the store knows.
    pub fn state_of(&self, session: Option<SessionId>) -> FlowState {
        match session {
            Some(id) if self.sessions.is_authenticated(id) => FlowState::Authenticated,
            _ => FlowState::Anonymous,
        }
    }

    /// `GET /login`: issue an AuthnRequest and redirect to the IdP.
    pub fn login(&self, session: Option<SessionId>) -> Effect {
        let state = self.state_of(session);
        if state == FlowState::Authenticated {
            return transition(state, FlowEvent::AlreadyAuthenticated).1;
        }

        let (session, new_session) = match session {
            Some(id) if self.sessions.is_live(id) => (id, false),
            _ => (self.sessions.create(), true),
        };

        let relay_state = uuid::Uuid::new_v4().simple().to_string();
        let redirect = match self.provider.create_authn_request(&relay_state) {
            Ok(redirect) => redirect,
            Err(e) => {
                error!(error = %e, "Failed to create SAML AuthnRequest");
                return Effect::Respond {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    body: "Internal Server Error",
                };
            }
        };

        self.requests
            .issue(relay_state, redirect.request_id.clone(), session);

        info!(
            session = %session,
            request_id = %redirect.request_id,
            "Redirecting to IdP"
        );

        transition(
            state,
            FlowEvent::RequestIssued {
                location: redirect.location,
                session,
                new_session,
            },
        )
        .1
    }

    /// `POST` to the ACS endpoint: verify the IdP response and log the user in.
    pub async fn callback(&self, form: CallbackForm) -> Effect {
        match self.accept_response(form).await {
            Ok(session) => {
                transition(
                    FlowState::RequestIssued,
                    FlowEvent::ResponseAccepted { session },
                )
                .1
            }
            Err((state, failure)) => {
                warn!(error = %failure, "SAML login failed");
                transition(state, FlowEvent::ResponseRejected).1
            }
        }
    }

    /// `GET /logout`: destroy the server-side session and clear the cookie.
    pub fn logout(&self, session: Option<SessionId>) -> Effect {
        let state = self.state_of(session);
        if let Some(id) = session {
            if self.sessions.destroy(id) {
                info!(session = %id, "Session logged out");
            }
        }
        transition(state, FlowEvent::Logout).1
    }

    /// Protected resource: content when authenticated, otherwise off to `/login`.
    pub fn protected(&self, session: Option<SessionId>) -> Effect {
        transition(self.state_of(session), FlowEvent::ProtectedAccess).1
    }

    /// Returns the session now holding the profile, or the state the failure
    /// happened in together with the reason.
    async fn accept_response(
        &self,
        form: CallbackForm,
    ) -> Result<SessionId, (FlowState, CallbackFailure)> {
        let relay_state = form
            .relay_state
            .ok_or((
                FlowState::Anonymous,
                CallbackFailure::Correlation(CorrelationError::Missing),
            ))?;

        let pending = self
            .requests
            .consume(&relay_state)
            .map_err(|e| (FlowState::Anonymous, CallbackFailure::Correlation(e)))?;

        let saml_response = form
            .saml_response
            .ok_or((FlowState::RequestIssued, CallbackFailure::MissingResponse))?;

        let profile = self
            .verify(saml_response, pending.request_id.clone())
            .await
            .map_err(|e| (FlowState::RequestIssued, CallbackFailure::Verification(e)))?;

        // The pre-login id was handed out before authentication; never promote it.
        let name_id = profile.name_id.clone();
        let session = self.sessions.create();
        self.sessions
            .attach(session, profile)
            .map_err(|e| (FlowState::RequestIssued, CallbackFailure::Session(e)))?;
        self.sessions.destroy(pending.session_id);

        info!(
            session = %session,
            previous_session = %pending.session_id,
            request_id = %pending.request_id,
            name_id = %name_id,
            "SAML login succeeded"
        );

        Ok(session)
    }

    /// Run the verifier on the blocking pool, bounded by `verify_timeout`.
    ///
    /// A timeout only stops the wait. The task keeps its slot until the
    /// verifier returns, and callbacks fail with `Overloaded` while every
    /// slot is held.
    async fn verify(
        &self,
        saml_response: String,
        request_id: String,
    ) -> Result<crate::session::UserProfile, VerificationError> {
        let verifier = Arc::clone(&self.verifier);
        let trust = Arc::clone(&self.trust);
        let permit = Arc::clone(&self.verify_slots)
            .try_acquire_owned()
            .map_err(|_| VerificationError::Overloaded)?;

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            verifier.verify(&saml_response, &request_id, &trust)
        });

        match tokio::time::timeout(self.verify_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(VerificationError::Aborted(join_error.to_string())),
            Err(_) => Err(VerificationError::Timeout(self.verify_timeout)),
        }
    }
}
