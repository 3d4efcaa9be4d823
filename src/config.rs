use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_LISTEN_PORT: u16 = 8181;
const DEFAULT_CALLBACK_PATH: &str = "/callback";
const DEFAULT_OIDC_CONFIG_PATH: &str = "/.well-known/openid-configuration";
const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 3;
const DEFAULT_AUTH_COOLDOWN: Duration = Duration::from_secs(15);

/// How the proxy talks to the remote MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Responses and notifications arrive on a persistent SSE stream; the
    /// POST endpoint is announced by the first stream event.
    Sse,
    /// Request/response bodies flow in-line over a single HTTP path.
    Http,
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sse" => Ok(TransportMode::Sse),
            "http" => Ok(TransportMode::Http),
            other => Err(format!(
                "invalid mode: {other}. Must be one of \"sse\", \"http\""
            )),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Sse => write!(f, "sse"),
            TransportMode::Http => write!(f, "http"),
        }
    }
}

/// Proxy configuration, immutable for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Remote MCP server base: scheme plus authority. A bare authority is
    /// accepted and gets `http://` prepended during validation.
    pub host: String,
    pub mode: TransportMode,
    /// Path appended to the host for the SSE subscription.
    pub sse_path: String,
    /// Path POSTed to in direct HTTP mode.
    pub mcp_path: String,
    pub auth: AuthConfig,
}

impl Config {
    /// Normalize a host flag into a base URL with a scheme.
    pub fn normalize_host(host: &str) -> String {
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        }
    }
}

/// Configuration for the OAuth callback flow. Any field left at its zero
/// value is replaced with a default by [`AuthConfig::resolved`]:
///   - `listen_port`: port the local callback server listens on (8181)
///   - `callback_path`: HTTP path for the auth callback ("/callback")
///   - `oidc_config_path`: path of the OIDC discovery document
///     ("/.well-known/openid-configuration")
///   - `max_attempts`: maximum authentication attempts (3)
///   - `cooldown`: minimum interval between auth attempts (15 seconds)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub listen_port: u16,
    pub callback_path: String,
    pub oidc_config_path: String,
    pub max_attempts: u32,
    pub cooldown: Duration,
}

impl AuthConfig {
    /// Fill in any zero-valued fields with defaults.
    pub fn resolved(mut self) -> Self {
        if self.listen_port == 0 {
            self.listen_port = DEFAULT_LISTEN_PORT;
        }
        if self.callback_path.is_empty() {
            self.callback_path = DEFAULT_CALLBACK_PATH.to_string();
        }
        if self.oidc_config_path.is_empty() {
            self.oidc_config_path = DEFAULT_OIDC_CONFIG_PATH.to_string();
        }
        if self.max_attempts == 0 {
            self.max_attempts = DEFAULT_MAX_AUTH_ATTEMPTS;
        }
        if self.cooldown.is_zero() {
            self.cooldown = DEFAULT_AUTH_COOLDOWN;
        }
        self
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            client_id: String::new(),
            client_secret: String::new(),
            listen_port: DEFAULT_LISTEN_PORT,
            callback_path: DEFAULT_CALLBACK_PATH.to_string(),
            oidc_config_path: DEFAULT_OIDC_CONFIG_PATH.to_string(),
            max_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            cooldown: DEFAULT_AUTH_COOLDOWN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resolved_fills_zero_fields() {
        let resolved = AuthConfig {
            client_id: "test-client".to_string(),
            client_secret: String::new(),
            listen_port: 0,
            callback_path: String::new(),
            oidc_config_path: String::new(),
            max_attempts: 0,
            cooldown: Duration::ZERO,
        }
        .resolved();

        assert_eq!(
            resolved,
            AuthConfig {
                client_id: "test-client".to_string(),
                ..AuthConfig::default()
            }
        );
    }

    #[test]
    fn resolved_keeps_custom_fields() {
        let custom = AuthConfig {
            client_id: "test-client".to_string(),
            client_secret: "test-secret".to_string(),
            listen_port: 9000,
            callback_path: "/custom-callback".to_string(),
            oidc_config_path: "/custom-config".to_string(),
            max_attempts: 5,
            cooldown: Duration::from_secs(30),
        };

        assert_eq!(custom.clone().resolved(), custom);
    }

    #[test]
    fn mode_parses_known_values() {
        assert_eq!("sse".parse::<TransportMode>(), Ok(TransportMode::Sse));
        assert_eq!("http".parse::<TransportMode>(), Ok(TransportMode::Http));
        assert!("ws".parse::<TransportMode>().is_err());
    }

    #[test]
    fn normalize_host_prepends_scheme() {
        assert_eq!(Config::normalize_host("localhost:8000"), "http://localhost:8000");
        assert_eq!(
            Config::normalize_host("https://mcp.example.com"),
            "https://mcp.example.com"
        );
    }
}
