use async_trait::async_trait;

use super::reader::{Source, StreamReader};
use super::StreamError;

/// Create a single-producer / single-consumer pipe with `buffer` slots.
///
/// The writer's [`send`](StreamWriter::send) completes immediately while a
/// buffer slot is free and otherwise waits until the consumer advances or
/// disconnects. `buffer = 0` is a rendezvous pipe: every send waits for a
/// matching `recv`.
///
/// Dropping or closing either side delivers end-of-stream to the peer.
pub fn pipe<T: Send + 'static>(buffer: usize) -> (StreamReader<T>, StreamWriter<T>) {
    let (tx, rx) = flume::bounded(buffer);
    (
        StreamReader::from_source(Box::new(PipeSource { rx: Some(rx) })),
        StreamWriter { tx },
    )
}

/// Writing half of a [`pipe`].
pub struct StreamWriter<T> {
    tx: flume::Sender<Result<T, StreamError>>,
}

impl<T: Send + 'static> StreamWriter<T> {
    /// Send one chunk, or an in-band error terminating the stream.
    ///
    /// Returns `false` when the reader has closed; the producer should
    /// stop sending. Waits while the pipe buffer is full.
    pub async fn send(&self, item: Result<T, StreamError>) -> bool {
        self.tx.send_async(item).await.is_ok()
    }

    /// Returns `true` once the reader side has been closed or dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }

    /// Terminate the stream. Buffered chunks are still delivered, then the
    /// reader observes end-of-stream.
    pub fn close(self) {}
}

impl<T> std::fmt::Debug for StreamWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("closed", &self.tx.is_disconnected())
            .finish()
    }
}

struct PipeSource<T> {
    rx: Option<flume::Receiver<Result<T, StreamError>>>,
}

#[async_trait]
impl<T: Send> Source<T> for PipeSource<T> {
    async fn next(&mut self) -> Result<T, StreamError> {
        match &self.rx {
            None => Err(StreamError::Closed),
            Some(rx) => match rx.recv_async().await {
                Ok(item) => item,
                Err(flume::RecvError::Disconnected) => Err(StreamError::Closed),
            },
        }
    }

    fn close(&mut self) {
        self.rx = None;
    }
}
