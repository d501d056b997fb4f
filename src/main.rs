//! SAML SSO Gateway
//!
//! A SAML 2.0 Service Provider that signs users in against a single IdP via
//! the HTTP-Redirect / HTTP-POST browser profile and keeps them logged in
//! with a signed session cookie.

mod flow;
mod routes;
mod saml;
mod session;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};

use flow::SsoFlow;
use routes::AppState;
use saml::{
    AssertionVerifier, CredentialPaths, RequestTracker, SamlConfig, SamlProvider, SessionSecret,
    TrustMaterial,
};
use session::{spawn_cleanup_task, SessionStore, DEFAULT_CLEANUP_INTERVAL_SECS};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "saml-sso-gateway")]
#[command(about = "SAML 2.0 single sign-on gateway")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:3000", env = "LISTEN_ADDR")]
    listen: SocketAddr,

    /// Assertion Consumer Service URL the IdP posts back to
    #[arg(long, env = "CALLBACK_URL")]
    callback_url: String,

    /// IdP Single Sign-On URL
    #[arg(long, env = "ENTRYPOINT")]
    entrypoint: String,

    /// SP Entity ID
    #[arg(long, env = "ISSUER")]
    issuer: String,

    /// IdP Entity ID (expected assertion issuer)
    #[arg(long, env = "IDP_ENTITY_ID")]
    idp_entity_id: String,

    /// Secret for signing session cookies
    #[arg(long, env = "SESSION_SECRET", hide_env_values = true)]
    session_secret: String,

    /// SP private key for assertion decryption
    #[arg(long, default_value = "cert/decryption_key.pem", env = "DECRYPTION_KEY_PATH")]
    decryption_key_path: PathBuf,

    /// SP private key for signing AuthnRequests
    #[arg(long, default_value = "cert/signing_key.pem", env = "SIGNING_KEY_PATH")]
    signing_key_path: PathBuf,

    /// SP decryption certificate
    #[arg(long, default_value = "cert/decryption_cert.pem", env = "DECRYPTION_CERT_PATH")]
    decryption_cert_path: PathBuf,

    /// SP signing certificate
    #[arg(long, default_value = "cert/signing_cert.pem", env = "SIGNING_CERT_PATH")]
    signing_cert_path: PathBuf,

    /// IdP signing certificate
    #[arg(long, default_value = "cert/idp_cert.pem", env = "IDP_CERT_PATH")]
    idp_cert_path: PathBuf,

    /// NameID format to request
    #[arg(long, default_value = saml::config::TRANSIENT_NAME_ID_FORMAT, env = "NAME_ID_FORMAT")]
    name_id_format: String,

    /// Session lifetime in seconds
    #[arg(long, default_value_t = 8 * 60 * 60, env = "SESSION_TTL_SECS")]
    session_ttl_secs: u64,

    /// Lifetime of an outstanding AuthnRequest in seconds
    #[arg(long, default_value_t = saml::DEFAULT_REQUEST_TTL_SECS, env = "REQUEST_TTL_SECS")]
    request_ttl_secs: u64,

    /// Upper bound on assertion verification in seconds
    #[arg(long, default_value_t = 10, env = "VERIFY_TIMEOUT_SECS")]
    verify_timeout_secs: u64,

    /// Interval between expired-state sweeps in seconds
    #[arg(long, default_value_t = DEFAULT_CLEANUP_INTERVAL_SECS, env = "CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: u64,

    /// Set the Secure flag on the session cookie
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "COOKIE_SECURE")]
    cookie_secure: bool,

    /// Session cookie domain
    #[arg(long, env = "COOKIE_DOMAIN")]
    cookie_domain: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, env = "AUTH_VERBOSE")]
    verbose: bool,
}

impl Args {
    fn saml_config(&self) -> SamlConfig {
        SamlConfig {
            entity_id: self.issuer.clone(),
            callback_url: self.callback_url.clone(),
            idp_sso_url: self.entrypoint.clone(),
            idp_entity_id: self.idp_entity_id.clone(),
            name_id_format: self.name_id_format.clone(),
            session_secret: SessionSecret::new(self.session_secret.clone()),
            session_ttl_secs: self.session_ttl_secs,
            request_ttl_secs: self.request_ttl_secs,
            verify_timeout_secs: self.verify_timeout_secs,
            cleanup_interval_secs: self.cleanup_interval_secs,
            cookie_domain: self.cookie_domain.clone(),
            cookie_secure: self.cookie_secure,
            ..SamlConfig::default()
        }
    }

    fn credential_paths(&self) -> CredentialPaths {
        CredentialPaths {
            decryption_key: self.decryption_key_path.clone(),
            signing_key: self.signing_key_path.clone(),
            decryption_cert: self.decryption_cert_path.clone(),
            signing_cert: self.signing_cert_path.clone(),
            idp_cert: self.idp_cert_path.clone(),
        }
    }
}

/// Everything `main` needs to serve.
struct App {
    state: AppState,
    sessions: Arc<SessionStore>,
    requests: Arc<RequestTracker>,
    cleanup_interval_secs: u64,
}

/// Validate configuration and load trust material. Any failure here is fatal
/// and happens before the listener is bound.
fn build_app(args: &Args) -> Result<App> {
    let config = args.saml_config();
    config
        .validate()
        .map_err(|e| anyhow!(e))
        .context("Invalid SAML configuration")?;
    let config = Arc::new(config);

    let trust = Arc::new(
        TrustMaterial::load(&args.credential_paths()).context("Failed to load SAML credentials")?,
    );

    let provider = Arc::new(
        SamlProvider::new(Arc::clone(&config), Arc::clone(&trust))
            .context("Failed to initialize SAML provider")?,
    );

    let metadata = Arc::new(
        saml::metadata::generate(&config, &trust).context("Failed to render SP metadata")?,
    );
    let sessions = Arc::new(SessionStore::new(
        config.session_ttl_secs,
        config.request_ttl_secs,
    ));
    let requests = Arc::new(RequestTracker::new(config.request_ttl_secs));

    let verifier: Arc<dyn AssertionVerifier> = Arc::clone(&provider) as _;
    let flow = Arc::new(SsoFlow::new(
        provider,
        verifier,
        trust,
        Arc::clone(&sessions),
        Arc::clone(&requests),
        Duration::from_secs(config.verify_timeout_secs),
    ));

    Ok(App {
        state: AppState {
            flow,
            config: Arc::clone(&config),
            metadata,
        },
        sessions,
        requests,
        cleanup_interval_secs: config.cleanup_interval_secs,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "{}={},tower_http={}",
            env!("CARGO_CRATE_NAME"),
            log_level,
            log_level
        ))
        .json()
        .init();

    info!("Starting SAML SSO gateway");

    let app = build_app(&args)?;

    info!(
        entity_id = %app.state.config.entity_id,
        idp_entity_id = %app.state.config.idp_entity_id,
        callback_path = %app.state.config.callback_path(),
        session_ttl_secs = app.state.config.session_ttl_secs,
        cookie_secure = app.state.config.cookie_secure,
        "Configuration loaded"
    );

    let cleanup: JoinHandle<()> =
        spawn_cleanup_task(app.sessions, app.requests, app.cleanup_interval_secs);

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    let local_addr = listener
        .local_addr()
        .context("Failed to read bound address")?;
    info!(address = %local_addr, "Listening on {}", local_addr);

    let result = axum::serve(listener, routes::router(app.state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    cleanup.abort();

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e).context("HTTP server failed");
    }

    info!("SAML SSO gateway stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
