//! HTTP surface: routes, cookie plumbing and effect rendering.

use axum::extract::{Form, State};
use axum::http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::flow::{CallbackForm, CookieChange, Effect, SsoFlow, FAIL_PATH, HOME_PATH, LOGIN_PATH};
use crate::saml::SamlConfig;
use crate::session::SessionId;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub flow: Arc<SsoFlow>,
    pub config: Arc<SamlConfig>,
    /// Rendered SP metadata; fixed for the life of the process.
    pub metadata: Arc<String>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let callback_path = state.config.callback_path().to_string();

    Router::new()
        .route(HOME_PATH, get(home))
        .route(LOGIN_PATH, get(login))
        .route(&callback_path, post(callback))
        .route(FAIL_PATH, get(login_failed))
        .route("/logout", get(logout))
        .route("/shibboleth/metadata", get(metadata))
        .route("/metadata", get(metadata))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

async fn home(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = session_from_headers(&state.config, &headers);
    render(&state.config, state.flow.protected(session))
}

async fn login(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = session_from_headers(&state.config, &headers);
    render(&state.config, state.flow.login(session))
}

async fn callback(State(state): State<AppState>, form: Option<Form<CallbackForm>>) -> Response {
    let form = form.map(|Form(form)| form).unwrap_or_default();
    render(&state.config, state.flow.callback(form).await)
}

async fn login_failed() -> Response {
    (StatusCode::UNAUTHORIZED, "Login failed").into_response()
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = session_from_headers(&state.config, &headers);
    render(&state.config, state.flow.logout(session))
}

async fn metadata(State(state): State<AppState>) -> Response {
    (
        [(CONTENT_TYPE, "application/xml")],
        state.metadata.as_str().to_owned(),
    )
        .into_response()
}

/// Log the panic and answer with a generic 500.
fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    error!(panic = %detail, "Request handler panicked");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

/// First valid session cookie across all `Cookie` headers.
fn session_from_headers(config: &SamlConfig, headers: &HeaderMap) -> Option<SessionId> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| config.parse_session_cookie(value))
}

fn render(config: &SamlConfig, effect: Effect) -> Response {
    match effect {
        Effect::Respond { status, body } => (status, body).into_response(),
        Effect::Redirect { location, cookie } => {
            let mut response = Redirect::to(&location).into_response();
            let set_cookie = match cookie {
                CookieChange::Keep => return response,
                CookieChange::Set(id) => config.build_cookie(id),
                CookieChange::Clear => config.build_expired_cookie(),
            };
            match HeaderValue::from_str(&set_cookie) {
                Ok(value) => {
                    response.headers_mut().append(SET_COOKIE, value);
                    response
                }
                Err(e) => {
                    error!(error = %e, "Session cookie is not a valid header value");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::tests::{harness, relay_state_of, Harness};
    use axum::body::Body;
    use axum::http::header::LOCATION;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn app(h: Harness) -> (Router, Harness) {
        let state = AppState {
            flow: Arc::clone(&h.flow),
            config: Arc::clone(&h.config),
            metadata: Arc::new("<md:EntityDescriptor/>".to_string()),
        };
        (router(state), h)
    }

    fn get_req(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn location(response: &Response) -> String {
        response
            .headers()
            .get(LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    /// `name=value` part of the Set-Cookie header.
    fn cookie_pair(response: &Response) -> String {
        let header = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        header.split(';').next().unwrap().to_string()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Walk `/login` and the callback, returning the authenticated cookie pair.
    async fn log_in(router: &Router, h: &Harness) -> String {
        let response = router
            .clone()
            .oneshot(get_req("/login", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let cookie = cookie_pair(&response);
        let relay = relay_state_of(&location(&response));

        let pending = h.requests.consume(&relay).unwrap();
        h.requests
            .issue(relay.clone(), pending.request_id.clone(), pending.session_id);

        let body = format!(
            "SAMLResponse=signed%3Aalice%40{}&RelayState={}",
            pending.request_id, relay
        );
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/login/callback")
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .header(COOKIE, cookie.as_str())
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/");
        cookie_pair(&response)
    }

    #[tokio::test]
    async fn test_home_without_cookie_redirects_to_login() {
        let (router, _h) = app(harness());
        let response = router.oneshot(get_req("/", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/login");
    }

    #[tokio::test]
    async fn test_forged_cookie_is_ignored() {
        let (router, _h) = app(harness());
        let forged = format!("saml_sso_session={}.deadbeef", SessionId::new());
        let response = router
            .oneshot(get_req("/", Some(&forged)))
            .await
            .unwrap();

        assert_eq!(location(&response), "/login");
    }

    #[tokio::test]
    async fn test_login_fail_is_unauthorized() {
        let (router, _h) = app(harness());
        let response = router.oneshot(get_req("/login/fail", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_text(response).await, "Login failed");
    }

    #[tokio::test]
    async fn test_callback_rejects_get() {
        let (router, _h) = app(harness());
        let response = router
            .oneshot(get_req("/login/callback", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_callback_without_form_fails() {
        let (router, _h) = app(harness());
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/login/callback")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/login/fail");
    }

    #[tokio::test]
    async fn test_login_sets_cookie_and_redirects_to_idp() {
        let (router, h) = app(harness());
        let response = router.oneshot(get_req("/login", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert!(location(&response).starts_with(&h.config.idp_sso_url));
        let set_cookie = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(set_cookie.starts_with("saml_sso_session="));
        assert!(set_cookie.contains("HttpOnly"));
    }

    #[tokio::test]
    async fn test_full_login_then_logout() {
        let (router, h) = app(harness());
        let cookie = log_in(&router, &h).await;

        let response = router
            .clone()
            .oneshot(get_req("/", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Authenticated");

        let response = router
            .clone()
            .oneshot(get_req("/logout", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/");
        let cleared = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cleared.contains("Max-Age=0"));

        // The old cookie no longer grants access.
        let response = router
            .oneshot(get_req("/", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(location(&response), "/login");
    }

    #[tokio::test]
    async fn test_metadata_routes() {
        let (router, _h) = app(harness());
        for uri in ["/shibboleth/metadata", "/metadata"] {
            let response = router.clone().oneshot(get_req(uri, None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers().get(CONTENT_TYPE).unwrap(),
                "application/xml"
            );
            assert_eq!(body_text(response).await, "<md:EntityDescriptor/>");
        }
    }
}
