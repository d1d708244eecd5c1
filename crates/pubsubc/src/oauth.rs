//! Token acquisition.
//!
//! A configured access token is delivered immediately. Otherwise a one-shot
//! HTTP listener drives the authorization-code flow: `GET /` redirects the
//! browser to the authorization server with a fresh CSRF state, and
//! `GET /oauth/callback` checks that state, exchanges the code at the token
//! endpoint and delivers the access token on the returned channel.

use crate::config::OAuthConfig;
use crate::error::ClientError;
use axum::extract::{Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use pubsub_common::CodecError;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Path the authorization server redirects back to.
pub const CALLBACK_PATH: &str = "/oauth/callback";

/// Permissions requested from the authorization server.
pub const SCOPES: &[&str] = &[
    "openid",
    "user:read:email",
    "channel:manage:redemptions", // create custom rewards
    "channel:read:redemptions",   // read custom rewards & redemptions
];

const OPENID_CLAIMS: &str = r#"{"id_token":{"email":null,"email_verified":null,"preferred_username":null},"userinfo":{"picture":null}}"#;

/// Random bytes in a CSRF state value (hex-encoded to 128 chars).
const STATE_BYTES: usize = 64;

const AUTHORIZED_BODY: &str = "Authorization complete. You can close this window.";

/// Token endpoint response.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// Bearer token for the pub/sub LISTEN request.
    pub access_token: String,
    /// Refresh token, when issued.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Granted scopes.
    #[serde(default)]
    pub scope: Option<Vec<String>>,
    /// Usually `bearer`.
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    scope: Option<String>,
    state: Option<String>,
}

struct FlowState {
    http: reqwest::Client,
    config: OAuthConfig,
    /// Most recently issued CSRF state; consumed by a matching callback.
    pending_state: Mutex<Option<String>>,
    token_tx: Mutex<Option<oneshot::Sender<String>>>,
}

impl FlowState {
    fn new(config: OAuthConfig, token_tx: oneshot::Sender<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            pending_state: Mutex::new(None),
            token_tx: Mutex::new(Some(token_tx)),
        }
    }

    fn issue_state(&self) -> Result<String, CodecError> {
        let state = pubsub_common::nonce::random_hex(STATE_BYTES)?;
        *self
            .pending_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        Ok(state)
    }

    /// Consumes the pending state if `presented` matches it exactly.
    fn take_matching_state(&self, presented: Option<&str>) -> bool {
        let mut pending = self
            .pending_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match (pending.as_deref(), presented) {
            (Some(expected), Some(got)) if expected == got => {
                *pending = None;
                true
            }
            _ => false,
        }
    }

    fn deliver(&self, token: String) {
        let sender = self
            .token_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                if tx.send(token).is_err() {
                    warn!("access token dropped: receiver already gone");
                }
            }
            None => debug!("access token already delivered, ignoring"),
        }
    }
}

/// Handle to the temporary OAuth callback listener.
#[derive(Debug)]
pub struct CallbackListener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl CallbackListener {
    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals the listener to stop. Safe to call any number of times.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Stops the listener and waits for in-flight requests to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "oauth callback listener task failed");
        }
    }
}

/// Result of [`acquire`]: a channel that yields exactly one token, and the
/// callback listener when the OAuth flow is in use.
#[derive(Debug)]
pub struct TokenAcquisition {
    /// Delivers the access token once.
    pub token_rx: oneshot::Receiver<String>,
    /// Running callback listener, absent when a direct token was configured.
    pub listener: Option<CallbackListener>,
}

/// Starts token acquisition.
///
/// With a non-empty `direct_token` the token is placed on the channel
/// immediately. Otherwise the callback listener is bound on
/// `oauth.listen`; listener failures after startup are reported on `fatal_tx`
/// unless the listener was closed intentionally.
///
/// # Errors
///
/// Returns [`ClientError::ListenerBind`] if the callback port cannot be bound,
/// or [`ClientError::ConfigInvalid`] if the listen address is not parseable.
pub async fn acquire(
    direct_token: &str,
    oauth: &OAuthConfig,
    fatal_tx: mpsc::Sender<ClientError>,
) -> Result<TokenAcquisition, ClientError> {
    let (token_tx, token_rx) = oneshot::channel();

    if !direct_token.is_empty() {
        debug!("using configured access token");
        // The receiver is alive in this scope, so this cannot fail.
        let _ = token_tx.send(direct_token.to_string());
        return Ok(TokenAcquisition {
            token_rx,
            listener: None,
        });
    }

    let addr: SocketAddr = oauth.listen.parse().map_err(|_| {
        ClientError::ConfigInvalid(format!(
            "oauth.listen must be a socket address, got: {}",
            oauth.listen
        ))
    })?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ClientError::ListenerBind { addr, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ClientError::ListenerBind { addr, source })?;

    let state = Arc::new(FlowState::new(oauth.clone(), token_tx));
    let app = router(state);
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                .await;
            match result {
                Ok(()) => debug!("oauth callback listener stopped"),
                Err(_) if shutdown.is_cancelled() => {}
                Err(e) => {
                    error!(error = %e, "oauth callback listener closed unexpectedly");
                    let _ = fatal_tx.send(ClientError::ListenerFailed(e)).await;
                }
            }
        }
    });

    info!("visit http://{local_addr}/ to authorize");

    Ok(TokenAcquisition {
        token_rx,
        listener: Some(CallbackListener {
            local_addr,
            shutdown,
            handle,
        }),
    })
}

fn router(state: Arc<FlowState>) -> Router {
    Router::new()
        .route("/", get(handle_authorize))
        .route(CALLBACK_PATH, get(handle_callback))
        .fallback(handle_not_found)
        .with_state(state)
}

fn authorize_url(config: &OAuthConfig, state: &str) -> Result<reqwest::Url, String> {
    let scope = SCOPES.join(" ");
    reqwest::Url::parse_with_params(
        &config.authorize_url,
        &[
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", config.callback_url.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("state", state),
            ("claims", OPENID_CLAIMS),
        ],
    )
    .map_err(|e| e.to_string())
}

async fn handle_authorize(State(state): State<Arc<FlowState>>) -> Response {
    // New state per attempt to prevent CSRF.
    let csrf = match state.issue_state() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to generate oauth state");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    match authorize_url(&state.config, &csrf) {
        Ok(url) => {
            debug!(url = %url, "redirecting to authorization server");
            Redirect::temporary(url.as_str()).into_response()
        }
        Err(e) => {
            error!(error = %e, "invalid authorize url");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn handle_callback(
    State(state): State<Arc<FlowState>>,
    Query(params): Query<CallbackParams>,
) -> Result<&'static str, ClientError> {
    if !state.take_matching_state(params.state.as_deref()) {
        warn!("oauth callback rejected: session state mismatch");
        return Err(ClientError::StateMismatch);
    }
    debug!(scope = ?params.scope, "oauth callback accepted");

    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        warn!("oauth callback carried no code");
        return Err(ClientError::ExchangeFailed("missing code".to_string()));
    };

    let token = exchange_code(&state.http, &state.config, &code)
        .await
        .inspect_err(|e| {
            if let ClientError::ExchangeFailed(reason) = e {
                warn!(reason = %reason, "failed to exchange oauth code for a token");
            }
        })?;

    info!("access token acquired");
    state.deliver(token.access_token);
    Ok(AUTHORIZED_BODY)
}

async fn handle_not_found(uri: Uri) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("path {} not found", uri.path()))
}

/// Exchanges an authorization code for an access token.
///
/// # Errors
///
/// Returns [`ClientError::ExchangeFailed`] on network errors, non-success
/// statuses, or an unparseable response body.
pub async fn exchange_code(
    http: &reqwest::Client,
    config: &OAuthConfig,
    code: &str,
) -> Result<TokenResponse, ClientError> {
    let form = [
        ("client_id", config.client_id.as_str()),
        ("client_secret", config.client_secret.as_str()),
        ("code", code),
        ("grant_type", "authorization_code"),
        ("redirect_uri", config.callback_url.as_str()),
    ];

    let resp = http
        .post(&config.token_url)
        .form(&form)
        .send()
        .await
        .map_err(|e| ClientError::ExchangeFailed(e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::ExchangeFailed(format!("{status}: {body}")));
    }

    resp.json()
        .await
        .map_err(|e| ClientError::ExchangeFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(token_url: String) -> OAuthConfig {
        OAuthConfig {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            callback_url: "http://localhost:8080/oauth/callback".to_string(),
            listen: "127.0.0.1:0".to_string(),
            authorize_url: "https://id.example.com/oauth2/authorize".to_string(),
            token_url,
        }
    }

    fn flow(token_url: String) -> (Arc<FlowState>, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (Arc::new(FlowState::new(test_config(token_url), tx)), rx)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let resp = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let location = resp
            .headers()
            .get("location")
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        (status, location, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn issued_state(state: &Arc<FlowState>) -> String {
        let (status, location, _) = get(router(state.clone()), "/").await;
        assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
        let url = reqwest::Url::parse(&location.unwrap()).unwrap();
        url.query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[tokio::test]
    async fn root_redirects_with_state_and_scopes() {
        let (state, _rx) = flow("http://127.0.0.1:1/token".to_string());
        let (status, location, _) = get(router(state.clone()), "/").await;

        assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
        let url = reqwest::Url::parse(&location.unwrap()).unwrap();
        assert_eq!(url.host_str(), Some("id.example.com"));
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "client-id");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["redirect_uri"], "http://localhost:8080/oauth/callback");
        assert_eq!(
            pairs["scope"],
            "openid user:read:email channel:manage:redemptions channel:read:redemptions"
        );
        assert_eq!(pairs["state"].len(), 128);
        assert!(pairs["claims"].contains("preferred_username"));
    }

    #[tokio::test]
    async fn each_redirect_issues_a_new_state() {
        let (state, _rx) = flow("http://127.0.0.1:1/token".to_string());
        let first = issued_state(&state).await;
        let second = issued_state(&state).await;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn callback_with_wrong_state_is_unauthorized() {
        let (state, mut rx) = flow("http://127.0.0.1:1/token".to_string());
        let issued = issued_state(&state).await;

        let uri = format!("{CALLBACK_PATH}?code=c&scope=openid&state={}", issued.to_uppercase());
        let (status, _, body) = get(router(state.clone()), &uri).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "session state mismatch");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn callback_before_any_redirect_is_unauthorized() {
        let (state, mut rx) = flow("http://127.0.0.1:1/token".to_string());
        let (status, _, _) = get(router(state), &format!("{CALLBACK_PATH}?code=c&state=")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn callback_with_superseded_state_is_unauthorized() {
        let (state, _rx) = flow("http://127.0.0.1:1/token".to_string());
        let old = issued_state(&state).await;
        let _new = issued_state(&state).await;

        let (status, _, _) =
            get(router(state), &format!("{CALLBACK_PATH}?code=c&state={old}")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn callback_exchanges_code_and_delivers_token_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(body_string_contains("code=auth-code"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("client_secret=client-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh-token",
                "refresh_token": "refresh",
                "expires_in": 14400,
                "scope": ["openid"],
                "token_type": "bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (state, rx) = flow(format!("{}/oauth2/token", server.uri()));
        let issued = issued_state(&state).await;

        let uri = format!("{CALLBACK_PATH}?code=auth-code&scope=openid&state={issued}");
        let (status, _, body) = get(router(state.clone()), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, AUTHORIZED_BODY);
        assert_eq!(rx.await.unwrap(), "fresh-token");

        // State is single use.
        let (status, _, _) = get(router(state), &uri).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn failed_exchange_is_unauthorized_and_keeps_channel_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid code"))
            .mount(&server)
            .await;

        let (state, mut rx) = flow(format!("{}/oauth2/token", server.uri()));
        let issued = issued_state(&state).await;

        let uri = format!("{CALLBACK_PATH}?code=bad&state={issued}");
        let (status, _, body) = get(router(state), &uri).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "failed to exchange oauth code for a token");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (state, _rx) = flow("http://127.0.0.1:1/token".to_string());
        let (status, _, body) = get(router(state), "/favicon.ico").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "path /favicon.ico not found");
    }

    #[tokio::test]
    async fn direct_token_is_delivered_without_listener() {
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let acquisition = acquire("abc", &test_config(String::new()), fatal_tx)
            .await
            .unwrap();
        assert!(acquisition.listener.is_none());
        assert_eq!(acquisition.token_rx.await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn listener_close_is_idempotent() {
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let acquisition = acquire("", &test_config(String::new()), fatal_tx)
            .await
            .unwrap();
        let listener = acquisition.listener.expect("listener should be running");
        assert_ne!(listener.local_addr().port(), 0);

        listener.close();
        listener.close();
        tokio::time::timeout(std::time::Duration::from_secs(5), listener.shutdown())
            .await
            .expect("shutdown should not block");
        assert!(fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config(String::new());
        config.listen = taken.local_addr().unwrap().to_string();

        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let err = acquire("", &config, fatal_tx).await.unwrap_err();
        assert!(matches!(err, ClientError::ListenerBind { .. }));
    }
}
