//! Messages and the bounded pipe connecting stream operators
//!
//! Operators communicate exclusively through [`pipe`]s: bounded FIFO
//! channels of [`Message`]s. A producer blocked on a full pipe and a
//! consumer blocked on an empty one are the only suspension points in the
//! system, which is how a slow consumer bounds the buffered footprint of a
//! whole pipeline to the sum of pipe capacities.
//!
//! Enqueueing moves the message, so a producer can never observe or mutate
//! a row after handing it downstream.

use std::sync::Arc;
use std::sync::OnceLock;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::TdsError;
use crate::schema::Schema;

/// A data row: one string per column, in header order. The empty string is
/// the in-memory null.
pub type Row = Vec<String>;

/// Shared handle to a stream's schema.
pub type SchemaRef = Arc<Schema>;

/// Items flowing through a pipe between stream operators.
///
/// Every well-formed stream is `Header`, then any number of `Row` and
/// `Comment` items, then `Eos`. A pipe that ends without `Eos` means its
/// producer died, and consumers treat that as a failure.
#[derive(Debug, Clone)]
pub enum Message {
    /// Stream header; fixed for the lifetime of the stream.
    Header(SchemaRef),

    /// One data row, with exactly as many fields as the header declares.
    Row(Row),

    /// A raw comment line (leading `#` included), passed through filters
    /// unchanged.
    Comment(String),

    /// End-of-stream marker
    ///
    /// Signals that no more data will arrive on this pipe, allowing
    /// downstream operators to finalize their processing.
    Eos,
}

/// Capacity used when a pipe is created without an explicit one.
pub const DEFAULT_PIPE_CAPACITY: usize = 2048;

static PIPE_CAPACITY: OnceLock<usize> = OnceLock::new();

/// Override the process-wide default pipe capacity. Only the first call
/// wins; returns whether this call set it.
pub fn set_default_pipe_capacity(capacity: usize) -> bool {
    PIPE_CAPACITY.set(capacity.max(1)).is_ok()
}

/// The process-wide default pipe capacity.
pub fn default_pipe_capacity() -> usize {
    *PIPE_CAPACITY.get_or_init(|| DEFAULT_PIPE_CAPACITY)
}

/// Create a bounded pipe with the process-wide default capacity.
pub fn pipe() -> (PipeTx, PipeRx) {
    pipe_with(default_pipe_capacity())
}

/// Create a bounded pipe with an explicit capacity.
pub fn pipe_with(capacity: usize) -> (PipeTx, PipeRx) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PipeTx { tx },
        PipeRx {
            rx,
            finished: false,
        },
    )
}

/// Write side of a pipe. Dropping every clone closes the stream; the reader
/// then drains whatever is buffered and observes the end.
#[derive(Clone)]
pub struct PipeTx {
    tx: mpsc::Sender<Message>,
}

impl PipeTx {
    /// Blocking enqueue: waits while the pipe is full. Fails when the
    /// reader is gone.
    pub async fn send(&self, msg: Message) -> Result<(), TdsError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| TdsError::PipeClosed("reader terminated"))
    }

    /// Enqueue where a gone reader is expected tail behavior (provenance
    /// comments, `Eos`) and therefore silent.
    pub async fn send_tail(&self, msg: Message) {
        let _ = self.tx.send(msg).await;
    }

    /// Whether the reader has terminated.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read side of a pipe. Tracks whether `Eos` was observed so the framework
/// can verify that a stage consumed its input completely.
pub struct PipeRx {
    rx: mpsc::Receiver<Message>,
    finished: bool,
}

impl PipeRx {
    /// Blocking dequeue: waits while the pipe is empty. `None` means the
    /// write side was dropped and the pipe is drained.
    pub async fn recv(&mut self) -> Option<Message> {
        let msg = self.rx.recv().await;
        if matches!(msg, Some(Message::Eos)) {
            self.finished = true;
        }
        msg
    }

    /// Non-blocking dequeue.
    pub fn try_recv(&mut self) -> Result<Message, TryRecvError> {
        let msg = self.rx.try_recv();
        if matches!(msg, Ok(Message::Eos)) {
            self.finished = true;
        }
        msg
    }

    /// Number of messages currently buffered.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Whether this reader has seen `Eos`.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Error for an input that ended without `Eos`: the producer died.
    pub fn closed_early(&self) -> TdsError {
        TdsError::PipeClosed("input ended without end-of-stream")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Separator;

    fn row(fields: &[&str]) -> Row {
        fields.iter().map(|f| f.to_string()).collect()
    }

    #[tokio::test]
    async fn fifo_order_and_eos_tracking() {
        let (tx, mut rx) = pipe_with(4);
        tx.send(Message::Row(row(&["a"]))).await.unwrap();
        tx.send(Message::Row(row(&["b"]))).await.unwrap();
        tx.send(Message::Eos).await.unwrap();

        assert!(matches!(rx.recv().await, Some(Message::Row(r)) if r == row(&["a"])));
        assert!(!rx.finished());
        assert!(matches!(rx.recv().await, Some(Message::Row(r)) if r == row(&["b"])));
        assert!(matches!(rx.recv().await, Some(Message::Eos)));
        assert!(rx.finished());
    }

    #[tokio::test]
    async fn full_pipe_blocks_until_dequeue() {
        let (tx, mut rx) = pipe_with(1);
        tx.send(Message::Eos).await.unwrap();

        let pending = tokio::spawn(async move {
            tx.send(Message::Eos).await.unwrap();
        });
        // The second send cannot complete before a dequeue frees a slot.
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());
        assert_eq!(rx.pending(), 1);

        rx.recv().await.unwrap();
        pending.await.unwrap();
        assert!(matches!(rx.recv().await, Some(Message::Eos)));
    }

    #[tokio::test]
    async fn dropped_writer_without_eos_is_visible() {
        let (tx, mut rx) = pipe_with(4);
        tx.send(Message::Row(row(&["a"]))).await.unwrap();
        drop(tx);

        assert!(matches!(rx.recv().await, Some(Message::Row(_))));
        assert!(rx.recv().await.is_none());
        assert!(!rx.finished());
    }

    #[tokio::test]
    async fn try_recv_does_not_block() {
        let (tx, mut rx) = pipe_with(4);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        let schema = Arc::new(Schema::new(Separator::Default, vec!["a"]).unwrap());
        tx.send(Message::Header(schema)).await.unwrap();
        assert!(matches!(rx.try_recv(), Ok(Message::Header(_))));
    }

    #[tokio::test]
    async fn send_to_dropped_reader_fails() {
        let (tx, rx) = pipe_with(1);
        drop(rx);
        assert!(matches!(
            tx.send(Message::Eos).await,
            Err(TdsError::PipeClosed(_))
        ));
        // Tail sends swallow the same condition.
        tx.send_tail(Message::Eos).await;
    }
}
