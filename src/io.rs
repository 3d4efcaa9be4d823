use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::ProxyError;

/// Reads the input stream a line at a time and publishes each line to the
/// output channel. The channel closes when the reader returns, which is how
/// downstream workers observe end of input.
pub struct FileReader<R> {
    reader: R,
    output_tx: mpsc::Sender<String>,
}

impl<R: AsyncBufRead + Unpin> FileReader<R> {
    pub fn new(reader: R, output_tx: mpsc::Sender<String>) -> Self {
        FileReader { reader, output_tx }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), ProxyError> {
        debug!("starting to read input");
        let mut lines = self.reader.lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("file reader canceled");
                    return Err(ProxyError::Canceled);
                }
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    debug!(line, "read line");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("file reader canceled");
                            return Err(ProxyError::Canceled);
                        }
                        sent = self.output_tx.send(line) => {
                            if sent.is_err() {
                                info!("output channel closed, terminating file reader");
                                return Ok(());
                            }
                        }
                    }
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    error!("error reading input: {err}");
                    return Err(err.into());
                }
            }
        }
    }
}

/// Serializes every message from the input channel to the output stream,
/// newline-terminated and flushed per message so a line-oriented reader on
/// the far side never waits on a buffer.
pub struct OutputProxy<W> {
    writer: W,
    input_rx: mpsc::Receiver<String>,
}

impl<W: AsyncWrite + Unpin> OutputProxy<W> {
    pub fn new(writer: W, input_rx: mpsc::Receiver<String>) -> Self {
        OutputProxy { writer, input_rx }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ProxyError> {
        debug!("running output proxy");
        loop {
            // Biased toward the channel: messages already queued are written
            // out before shutdown is observed, so a reply racing a teardown
            // still reaches the client.
            let msg = tokio::select! {
                biased;
                msg = self.input_rx.recv() => msg,
                _ = cancel.cancelled() => {
                    info!("output proxy canceled");
                    return Err(ProxyError::Canceled);
                }
            };
            let Some(msg) = msg else {
                info!("input channel closed, terminating output proxy");
                return Ok(());
            };
            if let Err(err) = self.write_line(&msg).await {
                error!("failed to write message: {err}");
                return Err(err.into());
            }
            debug!(msg, "wrote message");
        }
    }

    async fn write_line(&mut self, msg: &str) -> std::io::Result<()> {
        self.writer.write_all(msg.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use std::time::Duration;

    #[tokio::test]
    async fn file_reader_reads_lines() {
        let input = Cursor::new("line1\nline2\nline3\n");
        let (tx, mut rx) = mpsc::channel(10);

        let result = FileReader::new(input, tx).run(CancellationToken::new()).await;
        assert!(result.is_ok());

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["line1", "line2", "line3"]);
    }

    #[tokio::test]
    async fn file_reader_empty_input() {
        let input = Cursor::new("");
        let (tx, mut rx) = mpsc::channel(10);

        let result = FileReader::new(input, tx).run(CancellationToken::new()).await;
        assert!(result.is_ok());
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn file_reader_cancellation() {
        // An unbuffered channel with no reader keeps the worker blocked on
        // send, so cancellation is the only way out.
        let input = Cursor::new("line\n".repeat(1000));
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(FileReader::new(input, tx).run(cancel.clone()));
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("file reader did not terminate after cancellation")
            .unwrap();
        assert!(matches!(result, Err(ProxyError::Canceled)));
    }

    #[tokio::test]
    async fn output_proxy_appends_newlines() {
        let (tx, rx) = mpsc::channel(10);
        let mut sink = Cursor::new(Vec::new());

        tx.send("first".to_string()).await.unwrap();
        tx.send("second".to_string()).await.unwrap();
        drop(tx);

        let result = OutputProxy::new(&mut sink, rx).run(CancellationToken::new()).await;
        assert!(result.is_ok());
        assert_eq!(String::from_utf8(sink.into_inner()).unwrap(), "first\nsecond\n");
    }

    #[tokio::test]
    async fn output_proxy_cancellation() {
        let (_tx, rx) = mpsc::channel::<String>(1);
        let mut sink = Cursor::new(Vec::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = OutputProxy::new(&mut sink, rx).run(cancel).await;
        assert!(matches!(result, Err(ProxyError::Canceled)));
        assert!(sink.into_inner().is_empty());
    }
}
