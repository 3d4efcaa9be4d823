use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::auth::AuthManager;
use crate::config::{Config, TransportMode};
use crate::error::ProxyError;
use crate::http::HttpPostSender;
use crate::io::{FileReader, OutputProxy};
use crate::sse::{HttpSseClient, SseSubscriber, SseWorker};

/// Capacity of the stdin-to-POST and stdout channels.
const CHANNEL_CAPACITY: usize = 1_000;

/// Constructs the workers, wires the channels, and supervises the pipeline
/// under a shared cancellation token. Any worker finishing, for any reason,
/// cancels the rest.
pub struct Engine {
    config: Config,
    http_client: reqwest::Client,
    auth: Arc<AuthManager>,
    sse_client: Option<Arc<dyn SseSubscriber>>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self, ProxyError> {
        let mut config = config;
        config.host = Config::normalize_host(&config.host);
        url::Url::parse(&config.host)?;

        // No global timeout: POSTs may long-poll.
        let http_client = reqwest::Client::new();
        let auth = Arc::new(AuthManager::new(config.auth.clone(), http_client.clone()));
        let sse_client: Option<Arc<dyn SseSubscriber>> = match config.mode {
            TransportMode::Sse => Some(Arc::new(HttpSseClient::new(
                http_client.clone(),
                format!("{}{}", config.host, config.sse_path),
            ))),
            TransportMode::Http => None,
        };

        Ok(Engine {
            config,
            http_client,
            auth,
            sse_client,
        })
    }

    /// Replace the SSE subscription capability, used by tests to script the
    /// remote stream.
    pub fn with_sse_subscriber(mut self, subscriber: Arc<dyn SseSubscriber>) -> Self {
        self.sse_client = Some(subscriber);
        self
    }

    /// Run the pipeline over the process's stdin and stdout.
    pub async fn run(self, cancel: CancellationToken) {
        self.run_with_io(tokio::io::stdin(), tokio::io::stdout(), cancel)
            .await
    }

    /// Run the pipeline over the given reader and writer.
    pub async fn run_with_io<R, W>(self, input: R, output: W, cancel: CancellationToken)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (stdin_tx, stdin_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (post_path_tx, post_path_rx) = mpsc::channel(1);
        let (stdout_tx, stdout_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let cancel = cancel.child_token();
        let mut workers: JoinSet<(&'static str, Result<(), ProxyError>)> = JoinSet::new();

        let reader = FileReader::new(BufReader::new(input), stdin_tx);
        let reader_cancel = cancel.clone();
        workers.spawn(async move { ("file-reader", reader.run(reader_cancel).await) });

        let sender = HttpPostSender::new(
            self.http_client.clone(),
            self.config.host.clone(),
            post_path_rx,
            stdin_rx,
            stdout_tx.clone(),
            Arc::clone(&self.auth),
        );
        let sender_cancel = cancel.clone();
        workers.spawn(async move { ("http-post", sender.run(sender_cancel).await) });

        let proxy = OutputProxy::new(output, stdout_rx);
        let proxy_cancel = cancel.clone();
        workers.spawn(async move { ("stdout", proxy.run(proxy_cancel).await) });

        match self.sse_client {
            Some(subscriber) => {
                let worker = SseWorker::new(subscriber, post_path_tx, stdout_tx);
                let sse_cancel = cancel.clone();
                workers.spawn(async move { ("sse", worker.run(sse_cancel).await) });
            }
            None => {
                // Direct HTTP mode: the POST path is known up front; seed the
                // latch so the sender starts immediately.
                let _ = post_path_tx.send(self.config.mcp_path.clone()).await;
            }
        }

        info!("running engine");
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((name, result)) => match result {
                    Ok(()) => info!(worker = name, "worker exited"),
                    Err(err) => info!(worker = name, %err, "worker exited with error"),
                },
                Err(err) => error!("worker panicked: {err}"),
            }
            // The first exit, clean or not, tears down the rest.
            cancel.cancel();
        }
        debug!("all workers joined");
        info!("engine exited");
    }
}
