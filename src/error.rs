use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Errors returned by the pipeline workers.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("operation canceled")]
    Canceled,

    #[error("invalid endpoint URL: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while driving the OAuth authorization-code flow.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("too many authentication attempts; please try again in {}s", wait.as_secs())]
    Cooldown { wait: Duration },

    #[error("maximum authentication attempts ({max}) exceeded")]
    AttemptsExceeded { max: u32 },

    #[error("no WWW-Authenticate header in challenge response")]
    MissingChallenge,

    #[error("invalid WWW-Authenticate header, expected Bearer: {0}")]
    InvalidChallenge(String),

    #[error("challenge response URL has no host")]
    MissingServerHost,

    #[error("failed to fetch OIDC configuration, status: {status}")]
    Discovery { status: StatusCode },

    #[error("failed to initialize OAuth provider: {0}")]
    Provider(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("authentication canceled")]
    Canceled,
}

/// Errors raised by an SSE subscription.
#[derive(Debug, Error)]
pub enum SseError {
    #[error("invalid SSE URL: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("event stream error: {0}")]
    Stream(String),
}
