//! Operator traits: sources, filters, and sinks
//!
//! Every stream operator is one of three shapes: a [`Source`] produces a
//! stream into a pipe, a [`Filter`] consumes one stream and produces
//! another, and a [`Sink`] consumes a stream. Construction is
//! configuration; the header-handling prologue of `run` is setup; the
//! flush/provenance/`Eos` epilogue is finish.
//!
//! A filter's input is borrowed rather than owned so the pipeline can check
//! after `run` returns that the stage consumed its stream to end-of-stream;
//! a stage that silently stops reading would otherwise wedge its producer
//! behind a full pipe.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::TdsError;
use crate::message::{Message, PipeRx, PipeTx};

/// Base trait for all stream operators.
#[async_trait]
pub trait Operator: Send {
    /// Name used for logging and error attribution.
    fn name(&self) -> &str;
}

/// An operator that originates a stream.
#[async_trait]
pub trait Source: Operator {
    /// Produce the full stream (`Header`, rows and comments, `Eos`) into
    /// `tx`, stopping early on cancellation.
    async fn run(&mut self, tx: PipeTx, cancel: CancellationToken) -> Result<(), TdsError>;
}

/// An operator that consumes one stream and produces another.
#[async_trait]
pub trait Filter: Operator {
    /// Transform the stream on `rx` into a stream on `tx`.
    ///
    /// Implementations must read `rx` through `Eos` (or return an error),
    /// forward input comments, and close with their own `Eos`.
    async fn run(
        &mut self,
        rx: &mut PipeRx,
        tx: PipeTx,
        cancel: CancellationToken,
    ) -> Result<(), TdsError>;
}

/// An operator that terminates a stream.
#[async_trait]
pub trait Sink: Operator {
    async fn run(&mut self, rx: &mut PipeRx, cancel: CancellationToken) -> Result<(), TdsError>;
}

/// Emit the provenance comment a filter appends on finish, describing its
/// own invocation. Tail output: a gone reader is silent here.
pub async fn send_provenance(tx: &PipeTx, invocation: &str) {
    tx.send_tail(Message::Comment(format!("# | {invocation}"))).await;
}

/// Provenance suppression and invocation text shared by the operators.
///
/// Operators hold one of these; the CLI fills in the argv it was launched
/// with, library users get the operator's self-description.
#[derive(Debug, Clone)]
pub struct Provenance {
    invocation: String,
    enabled: bool,
}

impl Provenance {
    pub fn new(invocation: impl Into<String>) -> Self {
        Self {
            invocation: invocation.into(),
            enabled: true,
        }
    }

    /// Suppress the provenance comment (`--nolog`).
    pub fn disabled(invocation: impl Into<String>) -> Self {
        Self {
            invocation: invocation.into(),
            enabled: false,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Send the comment if enabled; always precedes `Eos`.
    pub async fn emit(&self, tx: &PipeTx) {
        if self.enabled {
            send_provenance(tx, &self.invocation).await;
        }
    }
}
