use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;

use super::StreamError;

/// Internal chunk source behind a [`StreamReader`].
///
/// Pipes, array sources, transformation wrappers, and copy children all
/// implement this; the reader owns exactly one boxed source.
#[async_trait]
pub(crate) trait Source<T>: Send {
    /// Produce the next chunk, `Err(Closed)` at end of stream, or a single
    /// in-band error.
    async fn next(&mut self) -> Result<T, StreamError>;

    /// Release the producer side early. Default is a no-op for sources
    /// without a live peer.
    fn close(&mut self) {}
}

/// Reading half of a stream: a lazy, exactly-once sequence of chunks.
///
/// A reader is owned by a single consumer. [`recv`](Self::recv) yields
/// chunks in producer order until `Err(StreamError::Closed)`; an in-band
/// error is delivered once, after which the reader is terminated and
/// yields `Closed` forever.
///
/// To hand the same chunks to several consumers, use
/// [`copy`](Self::copy): each child gets an independent reader with its
/// own bounded buffer.
pub struct StreamReader<T> {
    source: Box<dyn Source<T>>,
    done: bool,
}

impl<T: Send + 'static> StreamReader<T> {
    pub(crate) fn from_source(source: Box<dyn Source<T>>) -> Self {
        Self {
            source,
            done: false,
        }
    }

    /// A reader that yields each element of `items` in order, then
    /// terminates. No backing worker is spawned.
    #[must_use]
    pub fn from_vec(items: Vec<T>) -> Self {
        Self::from_source(Box::new(ArraySource {
            items: items.into_iter(),
        }))
    }

    /// Trivially wrap a single value as a one-chunk stream.
    #[must_use]
    pub fn of(value: T) -> Self {
        Self::from_vec(vec![value])
    }

    /// A reader that terminates immediately with `error`.
    #[must_use]
    pub fn failing(error: StreamError) -> Self {
        Self::from_source(Box::new(FailingSource { error: Some(error) }))
    }

    /// Receive the next chunk.
    ///
    /// Returns `Err(StreamError::Closed)` at end of stream. Any other
    /// error terminates the reader: subsequent calls yield `Closed`.
    pub async fn recv(&mut self) -> Result<T, StreamError> {
        if self.done {
            return Err(StreamError::Closed);
        }
        match self.source.next().await {
            Ok(chunk) => Ok(chunk),
            Err(err) => {
                self.done = true;
                self.source.close();
                Err(err)
            }
        }
    }

    /// Stop consuming and release the producer. The peer observes
    /// end-of-stream on its next send.
    pub fn close(&mut self) {
        self.done = true;
        self.source.close();
    }

    /// Drain the stream into a vector.
    ///
    /// An in-band error discards all partial data and is returned as-is.
    pub async fn collect_all(mut self) -> Result<Vec<T>, StreamError> {
        let mut items = Vec::new();
        loop {
            match self.recv().await {
                Ok(chunk) => items.push(chunk),
                Err(StreamError::Closed) => return Ok(items),
                Err(err) => return Err(err),
            }
        }
    }

    /// Return a reader whose chunks are `f(chunk)`.
    ///
    /// If `f` returns an error the downstream reader terminates with that
    /// error and the upstream producer is released.
    #[must_use]
    pub fn map<U, F>(self, f: F) -> StreamReader<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Result<U, StreamError> + Send + Sync + 'static,
    {
        StreamReader::from_source(Box::new(MappedSource {
            parent: self,
            f: Arc::new(f),
        }))
    }

    /// Fan this stream out into `n` independent readers.
    ///
    /// A background worker reads one chunk at a time and broadcasts it to
    /// every child. Each child has a bounded buffer, so one slow consumer
    /// applies backpressure to its peers rather than losing chunks. A
    /// child that closes early only cancels its own branch; the worker
    /// stops (and releases the parent) once every child is gone.
    #[must_use]
    pub fn copy(self, n: usize) -> Vec<StreamReader<T>>
    where
        T: Clone,
    {
        super::copy::copy(self, n)
    }

    /// Adapt this reader into a [`futures_util::Stream`] of
    /// `Result<T, StreamError>`. The stream ends after the terminal item.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, StreamError>> {
        futures_util::stream::unfold(self, |mut reader| async move {
            match reader.recv().await {
                Ok(chunk) => Some((Ok(chunk), reader)),
                Err(StreamError::Closed) => None,
                Err(err) => Some((Err(err), reader)),
            }
        })
    }
}

impl<T> std::fmt::Debug for StreamReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

struct ArraySource<T> {
    items: std::vec::IntoIter<T>,
}

#[async_trait]
impl<T: Send> Source<T> for ArraySource<T> {
    async fn next(&mut self) -> Result<T, StreamError> {
        self.items.next().ok_or(StreamError::Closed)
    }
}

struct FailingSource {
    error: Option<StreamError>,
}

#[async_trait]
impl<T: Send> Source<T> for FailingSource {
    async fn next(&mut self) -> Result<T, StreamError> {
        Err(self.error.take().unwrap_or(StreamError::Closed))
    }
}

struct MappedSource<T, U> {
    parent: StreamReader<T>,
    f: Arc<dyn Fn(T) -> Result<U, StreamError> + Send + Sync>,
}

#[async_trait]
impl<T: Send + 'static, U: Send + 'static> Source<U> for MappedSource<T, U> {
    async fn next(&mut self) -> Result<U, StreamError> {
        let chunk = self.parent.recv().await?;
        (self.f)(chunk)
    }

    fn close(&mut self) {
        self.parent.close();
    }
}
