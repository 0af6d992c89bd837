//! Error types for TDS stream operations
//!
//! This enum defines the error conditions that can occur while a pipeline
//! runs, providing structured error handling throughout the system. Library
//! code propagates `TdsError`; binaries convert to `anyhow::Error` at the
//! top level.

use std::io;

/// Errors surfaced by stream operators and the pipeline coordinator.
#[derive(Debug, thiserror::Error)]
pub enum TdsError {
    /// Malformed header, wrong row arity, or incompatible schemas
    ///
    /// Raised when a stream violates its own declaration: a header that does
    /// not parse, a row whose field count differs from the column count, or
    /// two streams that must agree (merge, concat, join) but do not.
    #[error("schema error: {0}")]
    Schema(String),

    /// Input declared sorted but an inversion was observed
    ///
    /// The message names the input side and the key column that decided the
    /// inversion.
    #[error("ordering error: {0}")]
    Ordering(String),

    /// An input, output, or temp file could not be used
    #[error("{context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A stage returned without draining its input to end-of-stream
    ///
    /// Left undetected this would wedge the producer behind a full pipe, so
    /// the framework checks every stage on completion.
    #[error("{stage}: exited without consuming input to end-of-stream")]
    Consumption { stage: String },

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Pipe communication error
    ///
    /// Occurs when a pipe peer is unexpectedly gone: a write to a pipe whose
    /// reader terminated, or an input that ended without an end-of-stream
    /// marker because its producer died.
    #[error("pipe closed: {0}")]
    PipeClosed(&'static str),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TdsError {
    /// Attach path or operation context to an I/O failure.
    pub fn resource(context: impl Into<String>, source: io::Error) -> Self {
        Self::Resource {
            context: context.into(),
            source,
        }
    }
}
