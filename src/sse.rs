use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{ProxyError, SseError};

/// Stream name the MCP server multiplexes its messages on.
const MESSAGES_STREAM: &str = "messages";

const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";

/// Buffer between the subscription task and the worker loop.
const EVENT_BUFFER: usize = 16;

/// One event received from the remote stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// The single capability the worker needs from an SSE client: subscribe to a
/// named stream and deliver its events on a channel. Tests replace the
/// network client wholesale with a scripted implementation.
#[async_trait]
pub trait SseSubscriber: Send + Sync {
    async fn subscribe(
        &self,
        stream: &str,
        events: mpsc::Sender<SseEvent>,
    ) -> Result<(), SseError>;
}

/// SSE client over reqwest. Subscribes with a long-lived GET and decodes the
/// body as an event stream.
pub struct HttpSseClient {
    client: reqwest::Client,
    url: String,
}

impl HttpSseClient {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        HttpSseClient { client, url }
    }
}

#[async_trait]
impl SseSubscriber for HttpSseClient {
    async fn subscribe(
        &self,
        stream: &str,
        events: mpsc::Sender<SseEvent>,
    ) -> Result<(), SseError> {
        let mut url = Url::parse(&self.url)?;
        url.query_pairs_mut().append_pair("stream", stream);

        let response = self
            .client
            .get(url)
            .header(ACCEPT, EVENT_STREAM_MIME_TYPE)
            .send()
            .await?
            .error_for_status()?;

        let mut event_stream = response.bytes_stream().eventsource();
        while let Some(event) = event_stream.next().await {
            match event {
                Ok(event) => {
                    let event = SseEvent {
                        event: event.event,
                        data: event.data,
                    };
                    if events.send(event).await.is_err() {
                        debug!("event channel closed, ending subscription");
                        break;
                    }
                }
                Err(err) => return Err(SseError::Stream(err.to_string())),
            }
        }
        Ok(())
    }
}

/// Subscribes to the remote stream, publishes the first endpoint
/// announcement to the endpoint channel, and forwards every other event
/// payload to the output channel.
pub struct SseWorker {
    client: std::sync::Arc<dyn SseSubscriber>,
    endpoint_tx: mpsc::Sender<String>,
    output_tx: mpsc::Sender<String>,
}

impl SseWorker {
    pub fn new(
        client: std::sync::Arc<dyn SseSubscriber>,
        endpoint_tx: mpsc::Sender<String>,
        output_tx: mpsc::Sender<String>,
    ) -> Self {
        SseWorker {
            client,
            endpoint_tx,
            output_tx,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), ProxyError> {
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);

        let client = std::sync::Arc::clone(&self.client);
        let sub_cancel = cancel.clone();
        tokio::spawn(async move {
            debug!("subscribing to messages stream");
            if let Err(err) = client.subscribe(MESSAGES_STREAM, events_tx.clone()).await {
                error!("failed to subscribe to SSE: {err}");
                // Keep the event sender open so the worker stays parked on
                // cancellation instead of reading a closed channel as a
                // finished stream.
                sub_cancel.cancelled().await;
            }
        });

        let mut endpoint_sent = false;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("SSE worker canceled");
                    return Err(ProxyError::Canceled);
                }
                event = events_rx.recv() => event,
            };
            let Some(event) = event else {
                info!("SSE event channel closed");
                return Ok(());
            };

            let payload = event.data;
            debug!(payload, "received event");

            if payload.starts_with("/messages/") || payload.contains("session_id") {
                if endpoint_sent {
                    warn!(payload, "received second endpoint event, skipping");
                    continue;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("SSE worker canceled while sending endpoint");
                        return Err(ProxyError::Canceled);
                    }
                    sent = self.endpoint_tx.send(payload.clone()) => {
                        if sent.is_err() {
                            warn!("endpoint channel closed, dropping endpoint");
                            continue;
                        }
                        info!(path = %payload, "sent endpoint");
                        endpoint_sent = true;
                    }
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("SSE worker canceled");
                        return Err(ProxyError::Canceled);
                    }
                    sent = self.output_tx.send(payload) => {
                        if sent.is_err() {
                            warn!("output channel closed, dropping event");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Scripted subscriber: hands the event sender to the test, which then
    /// plays events into the worker.
    struct FakeSse {
        handoff: Arc<Mutex<Option<tokio::sync::oneshot::Sender<mpsc::Sender<SseEvent>>>>>,
        fail: bool,
    }

    impl FakeSse {
        fn new() -> (Self, tokio::sync::oneshot::Receiver<mpsc::Sender<SseEvent>>) {
            let (tx, rx) = tokio::sync::oneshot::channel();
            (
                FakeSse {
                    handoff: Arc::new(Mutex::new(Some(tx))),
                    fail: false,
                },
                rx,
            )
        }

        fn failing() -> Self {
            FakeSse {
                handoff: Arc::new(Mutex::new(None)),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl SseSubscriber for FakeSse {
        async fn subscribe(
            &self,
            stream: &str,
            events: mpsc::Sender<SseEvent>,
        ) -> Result<(), SseError> {
            if self.fail {
                return Err(SseError::Stream("subscription refused".to_string()));
            }
            assert_eq!(stream, "messages");
            if let Some(tx) = self.handoff.lock().await.take() {
                let _ = tx.send(events);
            }
            Ok(())
        }
    }

    fn data_event(data: &str) -> SseEvent {
        SseEvent {
            event: "message".to_string(),
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn passes_endpoint_and_messages() {
        let (fake, handoff) = FakeSse::new();
        let (endpoint_tx, mut endpoint_rx) = mpsc::channel(1);
        let (output_tx, mut output_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(SseWorker::new(Arc::new(fake), endpoint_tx, output_tx).run(cancel.clone()));
        let events = handoff.await.unwrap();

        events
            .send(data_event("/messages/endpoint?session_id=abc"))
            .await
            .unwrap();
        events.send(data_event("Hello SSE")).await.unwrap();
        events.send(data_event("Another message")).await.unwrap();

        assert_eq!(
            endpoint_rx.recv().await.unwrap(),
            "/messages/endpoint?session_id=abc"
        );
        assert_eq!(output_rx.recv().await.unwrap(), "Hello SSE");
        assert_eq!(output_rx.recv().await.unwrap(), "Another message");

        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ProxyError::Canceled)));
    }

    #[tokio::test]
    async fn only_first_endpoint_is_latched() {
        let (fake, handoff) = FakeSse::new();
        let (endpoint_tx, mut endpoint_rx) = mpsc::channel(1);
        let (output_tx, mut output_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(SseWorker::new(Arc::new(fake), endpoint_tx, output_tx).run(cancel.clone()));
        let events = handoff.await.unwrap();

        events.send(data_event("/messages/a")).await.unwrap();
        events.send(data_event("/messages/b")).await.unwrap();
        events.send(data_event("hello")).await.unwrap();

        assert_eq!(output_rx.recv().await.unwrap(), "hello");
        assert_eq!(endpoint_rx.recv().await.unwrap(), "/messages/a");
        assert!(endpoint_rx.try_recv().is_err());

        cancel.cancel();
        let _ = handle.await.unwrap();
    }

    #[tokio::test]
    async fn plain_messages_are_not_endpoints() {
        let (fake, handoff) = FakeSse::new();
        let (endpoint_tx, mut endpoint_rx) = mpsc::channel(1);
        let (output_tx, mut output_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(SseWorker::new(Arc::new(fake), endpoint_tx, output_tx).run(cancel.clone()));
        let events = handoff.await.unwrap();

        // Mentions the path without starting with it: an ordinary message.
        events
            .send(data_event("path is /messages/12345"))
            .await
            .unwrap();
        assert_eq!(output_rx.recv().await.unwrap(), "path is /messages/12345");

        // An empty payload is still a payload.
        events.send(data_event("")).await.unwrap();
        assert_eq!(output_rx.recv().await.unwrap(), "");
        assert!(endpoint_rx.try_recv().is_err());

        cancel.cancel();
        let _ = handle.await.unwrap();
    }

    #[tokio::test]
    async fn closed_stream_is_a_clean_exit() {
        let (fake, handoff) = FakeSse::new();
        let (endpoint_tx, endpoint_rx) = mpsc::channel::<String>(1);
        let (output_tx, _output_rx) = mpsc::channel(10);

        let handle = tokio::spawn(
            SseWorker::new(Arc::new(fake), endpoint_tx, output_tx).run(CancellationToken::new()),
        );
        let events = handoff.await.unwrap();
        drop(events);
        drop(endpoint_rx);

        // Closing the stream before any event is a success.
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not exit after stream closed")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn subscribe_failure_keeps_worker_alive_until_cancel() {
        let (endpoint_tx, _endpoint_rx) = mpsc::channel(1);
        let (output_tx, _output_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            SseWorker::new(Arc::new(FakeSse::failing()), endpoint_tx, output_tx).run(cancel.clone()),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not honor cancellation")
            .unwrap();
        assert!(matches!(result, Err(ProxyError::Canceled)));
    }
}
