pub mod auth;
pub mod config;
mod engine;
/**
 * MCP Relay Library
 *
 * A bidirectional proxy between a line-delimited JSON-RPC client speaking
 * over stdio and a remote MCP server reachable over HTTP. Two transports are
 * supported: a persistent SSE stream with a dynamically discovered POST
 * endpoint, and a direct request/response HTTP path. When the remote server
 * answers 401/403, an OAuth 2.1 authorization-code flow is driven through
 * the user's browser via a transient local callback server.
 */
mod error;
mod http;
mod io;
pub mod jsonrpc;
pub mod sse;

pub use self::config::{AuthConfig, Config, TransportMode};
pub use self::engine::Engine;
pub use self::error::{AuthError, ProxyError, SseError};
