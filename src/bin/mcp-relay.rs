/**
 * The entry point for the mcp-relay application.
 * It sets up logging, validates the flags, and runs the proxy pipeline.
 */
use clap::Parser;
use mcp_relay::{AuthConfig, Config, Engine, TransportMode};
use std::error::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// MCP Relay CLI arguments
#[derive(Parser)]
#[command(
    name = "mcp-relay",
    version = env!("CARGO_PKG_VERSION"),
    about = concat!("MCP Relay v", env!("CARGO_PKG_VERSION"), ". Proxy a stdio JSON-RPC client to a remote MCP server over SSE or direct HTTP."),
    long_about = None,
    after_help = "Examples:\n  \
        Connect to an SSE server:\n  \
        mcp-relay --host https://mcp.example.com\n  \
        Connect over direct HTTP with OAuth credentials:\n  \
        mcp-relay --host https://mcp.example.com --mode http --client_id my-id --client_secret my-secret
",
)]
struct Cli {
    /// The remote MCP server base (scheme+authority or bare host).
    #[arg(long, default_value = "localhost:8000")]
    host: String,

    /// The style of HTTP communication to use with the server (one of: sse, http).
    #[arg(long, default_value = "sse")]
    mode: TransportMode,

    /// The path appended to the host for the SSE connection.
    #[arg(long = "sse_path", default_value = "/sse")]
    sse_path: String,

    /// The path appended to the host for non-SSE POSTs.
    #[arg(long = "mcp_path", default_value = "/mcp")]
    mcp_path: String,

    /// The ClientID to be used in OAuth.
    #[arg(long = "client_id", default_value = "")]
    client_id: String,

    /// The Client Secret to be used in OAuth.
    #[arg(long = "client_secret", default_value = "")]
    client_secret: String,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Logs go to stderr: stdout is the protocol channel.
    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config {
        host: cli.host,
        mode: cli.mode,
        sse_path: cli.sse_path,
        mcp_path: cli.mcp_path,
        auth: AuthConfig {
            client_id: cli.client_id,
            client_secret: cli.client_secret,
            ..AuthConfig::default()
        },
    };

    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("Failed to create engine: {err}");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("received interrupt, shutting down");
            signal_cancel.cancel();
        }
    });

    info!("starting engine");
    engine.run(cancel).await;

    Ok(())
}
