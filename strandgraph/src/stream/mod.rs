//! Streaming substrate: lazy chunk sequences with backpressure.
//!
//! Every value edge in a compiled plan is carried either eagerly or as a
//! stream. This module supplies the stream half: single-producer /
//! single-consumer pipes ([`pipe`]), array-backed sources, per-chunk
//! transformation ([`StreamReader::map`]), fan-out copying
//! ([`StreamReader::copy`]), and concatenation back to eager values
//! ([`concat_values`]).
//!
//! A stream is a causal sequence of chunks terminated by either
//! end-of-stream ([`StreamError::Closed`]) or a single in-band error.
//! Exactly one consumer owns a reader; fanning out requires explicit
//! copies, each with its own bounded buffer so a slow child applies
//! backpressure instead of dropping chunks.

mod concat;
mod copy;
mod pipe;
mod reader;

pub use concat::concat_values;
pub use pipe::{pipe, StreamWriter};
pub use reader::StreamReader;

use miette::Diagnostic;
use thiserror::Error;

/// Terminal and in-band stream conditions.
///
/// `Closed` is the end-of-stream sentinel: it is not a failure, merely the
/// signal that no further chunks will arrive. Any other variant is
/// delivered in-band exactly once, after which the stream yields `Closed`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum StreamError {
    /// End of stream. Every reader yields this forever once terminated.
    #[error("end of stream")]
    #[diagnostic(code(strandgraph::stream::closed))]
    Closed,

    /// The execution owning this stream was cancelled.
    #[error("stream cancelled")]
    #[diagnostic(code(strandgraph::stream::cancelled))]
    Cancelled,

    /// An upstream producer failed; partial data must be discarded.
    #[error("stream failed: {message}")]
    #[diagnostic(code(strandgraph::stream::failed))]
    Failed { message: String },
}

impl StreamError {
    /// Wrap an arbitrary upstream failure for in-band delivery.
    pub fn failed(message: impl Into<String>) -> Self {
        StreamError::Failed {
            message: message.into(),
        }
    }

    /// Returns `true` for the end-of-stream sentinel.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamError::Closed)
    }
}
