use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth::AuthManager;
use crate::error::ProxyError;
use crate::jsonrpc;

/// Waits for the POST path announced on the endpoint channel, then posts
/// every message from the input channel to `host ∥ path`, dispatching
/// responses onto the output channel. A bearer token is attached whenever
/// the AuthManager holds one.
pub struct HttpPostSender {
    client: reqwest::Client,
    host: String,
    endpoint_rx: mpsc::Receiver<String>,
    input_rx: mpsc::Receiver<String>,
    output_tx: mpsc::Sender<String>,
    auth: Arc<AuthManager>,
}

impl HttpPostSender {
    pub fn new(
        client: reqwest::Client,
        host: String,
        endpoint_rx: mpsc::Receiver<String>,
        input_rx: mpsc::Receiver<String>,
        output_tx: mpsc::Sender<String>,
        auth: Arc<AuthManager>,
    ) -> Self {
        HttpPostSender {
            client,
            host,
            endpoint_rx,
            input_rx,
            output_tx,
            auth,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ProxyError> {
        debug!("waiting for POST path");
        let path = tokio::select! {
            _ = cancel.cancelled() => {
                info!("HTTP sender canceled before receiving endpoint");
                return Err(ProxyError::Canceled);
            }
            path = self.endpoint_rx.recv() => match path {
                Some(path) => path,
                None => {
                    info!("endpoint channel closed, terminating HTTP sender");
                    return Ok(());
                }
            },
        };
        let endpoint = Url::parse(&format!("{}{}", self.host, path)).map_err(|err| {
            error!("invalid endpoint URL: {err}");
            ProxyError::InvalidEndpoint(err)
        })?;
        debug!(%endpoint, "received endpoint, listening for messages");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("HTTP sender canceled");
                    return Err(ProxyError::Canceled);
                }
                msg = self.input_rx.recv() => {
                    let Some(msg) = msg else {
                        info!("input channel closed, terminating HTTP sender");
                        return Ok(());
                    };
                    self.dispatch(&cancel, &endpoint, msg).await;
                }
            }
        }
    }

    /// POST one message and route the response. Per-request failures are
    /// logged and never terminate the worker.
    async fn dispatch(&self, cancel: &CancellationToken, endpoint: &Url, msg: String) {
        debug!(msg, "received message, sending over POST");

        let token = self.auth.access_token().await;
        let mut request = self
            .client
            .post(endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(msg.clone());
        if !token.is_empty() {
            debug!("attaching bearer token");
            request = request.bearer_auth(&token);
        }

        // Request-scoped cancellation: an in-flight POST must not outlive the
        // pipeline.
        let sent = tokio::select! {
            _ = cancel.cancelled() => {
                info!("HTTP sender canceled during request");
                return;
            }
            sent = request.send() => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                error!("failed to post message: {err}");
                return;
            }
        };

        match response.status() {
            // The reply is directly in the body.
            StatusCode::OK => {
                let body = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("HTTP sender canceled while reading response");
                        return;
                    }
                    body = response.text() => body,
                };
                match body {
                    Ok(body) => {
                        debug!(body, "response received");
                        if self.output_tx.send(body).await.is_err() {
                            warn!("output channel closed, dropping response");
                        }
                        if !token.is_empty() {
                            self.auth.reset_attempts().await;
                        }
                    }
                    Err(err) => error!("error reading response body: {err}"),
                }
            }
            // The real reply will arrive over SSE.
            StatusCode::ACCEPTED => {
                debug!(msg, "message accepted");
                if !token.is_empty() {
                    self.auth.reset_attempts().await;
                }
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!("unauthorized message");
                self.handle_unauthorized(cancel, &msg, &response).await;
            }
            status => warn!(%status, "unexpected response status"),
        }
    }

    async fn handle_unauthorized(
        &self,
        cancel: &CancellationToken,
        msg: &str,
        response: &reqwest::Response,
    ) {
        let id = jsonrpc::message_id(msg);
        let (auth_url, waiter) = match self.auth.handle_auth_challenge(cancel, response).await {
            Ok(challenge) => challenge,
            Err(err) => {
                error!("failed to create auth challenge: {err}");
                return;
            }
        };

        tokio::spawn(async move {
            info!("waiting for auth callback server");
            waiter.wait().await;
            info!("auth callback server closed");
        });

        let reply = jsonrpc::auth_challenge_reply(id, &auth_url);
        match serde_json::to_string(&reply) {
            Ok(line) => {
                debug!(line, "sending auth error to output");
                if self.output_tx.send(line).await.is_err() {
                    warn!("output channel closed, dropping auth error");
                }
            }
            Err(err) => error!("failed to serialize auth error: {err}"),
        }
    }
}
