use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/**
 * OAuth 2.1 / OpenID Connect authentication for the proxy.
 *
 * When the remote server refuses a POST with 401/403, the AuthManager
 * discovers the server's OIDC configuration, composes a browser
 * authorization URL, and runs a transient local HTTP server that receives
 * the authorization-code callback and exchanges it for an access token.
 */
use axum::extract::{Query, State};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope,
    TokenResponse, TokenUrl,
};
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, OnceCell, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::config::AuthConfig;
use crate::error::AuthError;

/// Grace before the callback server shuts down, so the browser can finish
/// fetching the success page.
const BROWSER_GRACE: Duration = Duration::from_secs(1);
/// Drain window for the callback server on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const SUCCESS_PAGE: &str = r#"<html>
  <head><title>Authentication Successful</title></head>
  <body>
    <h1>Authentication Successful</h1>
    <p>You can now close this window and return to the application.</p>
  </body>
</html>"#;

/// The OpenID Connect discovery document, reduced to the fields the flow
/// needs.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcConfiguration {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub issuer: String,
}

#[derive(Default)]
struct AttemptsLedger {
    attempts: u32,
    last_attempt: Option<Instant>,
}

/// Drives the OpenID Connect authorization-code flow on behalf of the HTTP
/// sender. The access token lives under a reader-heavy lock; the attempts
/// ledger under its own mutex.
pub struct AuthManager {
    opts: AuthConfig,
    redirect_url: String,
    http_client: reqwest::Client,
    access_token: Arc<RwLock<String>>,
    oidc_config: OnceCell<OidcConfiguration>,
    attempts: Mutex<AttemptsLedger>,
    complete_tx: watch::Sender<bool>,
}

/// Blocks until the callback server has completed its token exchange.
/// Completion is sticky: a waiter obtained after the flow finished returns
/// immediately.
pub struct AuthWaiter {
    rx: watch::Receiver<bool>,
}

impl AuthWaiter {
    pub async fn wait(mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl AuthManager {
    /// Create a new AuthManager. Zero-valued config fields are replaced with
    /// defaults.
    pub fn new(cfg: AuthConfig, http_client: reqwest::Client) -> Self {
        let opts = cfg.resolved();
        let redirect_url = format!(
            "http://localhost:{}{}",
            opts.listen_port, opts.callback_path
        );
        let (complete_tx, _) = watch::channel(false);
        AuthManager {
            opts,
            redirect_url,
            http_client,
            access_token: Arc::new(RwLock::new(String::new())),
            oidc_config: OnceCell::new(),
            attempts: Mutex::new(AttemptsLedger::default()),
            complete_tx,
        }
    }

    /// The current access token; empty until a flow has completed.
    pub async fn access_token(&self) -> String {
        self.access_token.read().await.clone()
    }

    #[cfg(test)]
    pub(crate) async fn set_access_token(&self, token: String) {
        *self.access_token.write().await = token;
    }

    /// Check whether an authentication attempt is admitted under the maximum
    /// attempt count and the cooldown window, and record it if so.
    pub async fn can_attempt(&self) -> Result<(), AuthError> {
        let mut ledger = self.attempts.lock().await;
        let now = Instant::now();

        if let Some(last) = ledger.last_attempt {
            let elapsed = now.duration_since(last);
            if elapsed < self.opts.cooldown {
                return Err(AuthError::Cooldown {
                    wait: self.opts.cooldown - elapsed,
                });
            }
        }
        if ledger.attempts >= self.opts.max_attempts {
            match ledger.last_attempt {
                Some(last) if now.duration_since(last) < self.opts.cooldown => {
                    return Err(AuthError::AttemptsExceeded {
                        max: self.opts.max_attempts,
                    });
                }
                _ => {
                    debug!("resetting authentication attempt counter after cooldown");
                    ledger.attempts = 0;
                }
            }
        }
        ledger.attempts += 1;
        ledger.last_attempt = Some(now);
        debug!(
            attempt = ledger.attempts,
            max = self.opts.max_attempts,
            "authentication attempt"
        );
        Ok(())
    }

    /// Zero the attempt counter, typically signaled by the caller after the
    /// first successful use of a freshly issued token.
    pub async fn reset_attempts(&self) {
        let mut ledger = self.attempts.lock().await;
        if ledger.attempts == 0 && ledger.last_attempt.is_none() {
            return;
        }
        ledger.attempts = 0;
        ledger.last_attempt = None;
        debug!("authentication attempt counter reset after successful token usage");
    }

    /// Handle a 401/403 response: run the admission check, discover the
    /// OIDC configuration, start the local callback server, and return the
    /// authorization URL together with a waiter that blocks until the
    /// callback has completed its exchange.
    pub async fn handle_auth_challenge(
        &self,
        cancel: &CancellationToken,
        response: &reqwest::Response,
    ) -> Result<(String, AuthWaiter), AuthError> {
        self.can_attempt().await?;

        let www_auth = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .ok_or(AuthError::MissingChallenge)?;
        debug!(header = www_auth, "received WWW-Authenticate header");

        let scopes = match parse_scopes(www_auth) {
            Ok(scopes) => scopes,
            Err(err) => {
                debug!("error parsing scopes: {err}; using default scopes");
                default_scopes()
            }
        };

        let server_url = server_base_url(response.url())?;

        let oidc = tokio::select! {
            _ = cancel.cancelled() => return Err(AuthError::Canceled),
            config = self
                .oidc_config
                .get_or_try_init(|| self.fetch_oidc_configuration(&server_url)) => config?.clone(),
        };

        let oauth = self.build_oauth_client(&oidc)?;
        self.start_callback_server(oauth.clone(), cancel);

        let state = CsrfToken::new_random_len(32);
        let (auth_url, _state) = oauth
            .authorize_url(|| state)
            .add_scopes(scopes.into_iter().map(Scope::new))
            .url();
        debug!(url = %auth_url, "started authentication flow");

        let waiter = AuthWaiter {
            rx: self.complete_tx.subscribe(),
        };
        Ok((auth_url.to_string(), waiter))
    }

    async fn fetch_oidc_configuration(
        &self,
        server_url: &str,
    ) -> Result<OidcConfiguration, AuthError> {
        let config_url = format!("{server_url}{}", self.opts.oidc_config_path);
        debug!(url = %config_url, "fetching OIDC configuration");

        let response = self.http_client.get(&config_url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(AuthError::Discovery {
                status: response.status(),
            });
        }
        let config: OidcConfiguration = response.json().await?;
        debug!(
            authorization_endpoint = %config.authorization_endpoint,
            token_endpoint = %config.token_endpoint,
            "OIDC configuration fetched"
        );
        Ok(config)
    }

    fn build_oauth_client(&self, oidc: &OidcConfiguration) -> Result<BasicClient, AuthError> {
        Url::parse(&oidc.issuer)
            .map_err(|err| AuthError::Provider(format!("invalid issuer {}: {err}", oidc.issuer)))?;
        let auth_url = AuthUrl::new(oidc.authorization_endpoint.clone())
            .map_err(|err| AuthError::Provider(format!("invalid authorization endpoint: {err}")))?;
        let token_url = TokenUrl::new(oidc.token_endpoint.clone())
            .map_err(|err| AuthError::Provider(format!("invalid token endpoint: {err}")))?;
        let redirect_url = RedirectUrl::new(self.redirect_url.clone())
            .map_err(|err| AuthError::Provider(format!("invalid redirect URL: {err}")))?;

        Ok(BasicClient::new(
            ClientId::new(self.opts.client_id.clone()),
            Some(ClientSecret::new(self.opts.client_secret.clone())),
            auth_url,
            Some(token_url),
        )
        .set_redirect_uri(redirect_url))
    }

    /// Spawn the callback server. Binding and serving happen on the spawned
    /// task; failures there are logged, never propagated, so a challenge
    /// whose listener cannot bind still hands the user an authorization URL.
    fn start_callback_server(&self, oauth: BasicClient, cancel: &CancellationToken) {
        let shutdown = cancel.child_token();
        let state = Arc::new(CallbackState {
            oauth,
            token: Arc::clone(&self.access_token),
            complete: self.complete_tx.clone(),
            shutdown: shutdown.clone(),
        });
        let app = Router::new()
            .route(&self.opts.callback_path, get(handle_callback))
            .with_state(state);
        let addr = SocketAddr::from(([0, 0, 0, 0], self.opts.listen_port));
        debug!(port = self.opts.listen_port, "starting authentication callback server");

        tokio::spawn(async move {
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!("failed to bind auth callback listener: {err}");
                    return;
                }
            };
            let drain = shutdown.clone();
            let server =
                axum::serve(listener, app).with_graceful_shutdown(shutdown.cancelled_owned());
            tokio::select! {
                served = server => {
                    if let Err(err) = served {
                        error!("auth callback server error: {err}");
                    }
                }
                _ = async {
                    drain.cancelled().await;
                    tokio::time::sleep(SHUTDOWN_GRACE).await;
                } => {
                    warn!("auth callback server did not drain within the shutdown window");
                }
            }
        });
    }
}

struct CallbackState {
    oauth: BasicClient,
    token: Arc<RwLock<String>>,
    complete: watch::Sender<bool>,
    shutdown: CancellationToken,
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(code) = params.get("code") else {
        return (StatusCode::BAD_REQUEST, "missing code in request").into_response();
    };

    let exchanged = state
        .oauth
        .exchange_code(AuthorizationCode::new(code.clone()))
        .request_async(async_http_client)
        .await;
    let token = match exchanged {
        Ok(token) => token,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to exchange token: {err}"),
            )
                .into_response();
        }
    };

    *state.token.write().await = token.access_token().secret().clone();

    let state = Arc::clone(&state);
    tokio::spawn(async move {
        tokio::time::sleep(BROWSER_GRACE).await;
        debug!("shutting down authentication callback server");
        state.shutdown.cancel();
        state.complete.send_replace(true);
    });

    Html(SUCCESS_PAGE).into_response()
}

fn default_scopes() -> Vec<String> {
    ["openid", "profile", "email"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Extract scopes from a `WWW-Authenticate` header. A header that does not
/// carry the `Bearer` scheme is an error; a `Bearer` header without a
/// `scope` parameter yields the defaults.
fn parse_scopes(header: &str) -> Result<Vec<String>, AuthError> {
    let rest = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AuthError::InvalidChallenge(header.to_string()))?;

    for part in rest.split(',') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("scope=") {
            let value = value.trim_matches('"');
            return Ok(value
                .split_whitespace()
                .map(|scope| scope.trim_matches('\'').to_string())
                .collect());
        }
    }
    Ok(default_scopes())
}

/// The base URL of the server that issued a challenge, derived from the
/// request URL of the refused response.
fn server_base_url(url: &Url) -> Result<String, AuthError> {
    let host = url.host_str().ok_or(AuthError::MissingServerHost)?;
    match url.port() {
        Some(port) => Ok(format!("{}://{}:{}", url.scheme(), host, port)),
        None => Ok(format!("{}://{}", url.scheme(), host)),
    }
}
