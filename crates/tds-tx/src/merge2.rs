//! Two-way ordered merge of presorted streams
//!
//! The merge step every bigger structure is built from: take two
//! schema-compatible, presorted inputs, emit the smaller front row (left on
//! ties, which is what makes the whole tree stable), refill, and drain the
//! survivor when one side ends. Each side is verified to actually be sorted
//! as it is consumed; an inversion aborts the merge naming the side and the
//! key column that broke.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use tds_core::key::{KeySpec, ResolvedKey};
use tds_core::message::{Message, PipeRx, PipeTx, Row, SchemaRef};
use tds_core::TdsError;
use tds_io::{tmpfiles, StreamReader, StreamWriter};

/// What to do with a file input once it has been fully merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Leave the file alone (ordinary user inputs).
    Keep,
    /// Unlink a user input (`--removeinputs`).
    Unlink,
    /// Release a registered spill file.
    Spill,
}

/// One merge input: an in-process pipe or a stream file read incrementally.
pub enum Feed {
    Pipe(PipeRx),
    File {
        reader: StreamReader,
        path: PathBuf,
        removal: Removal,
    },
}

impl Feed {
    pub async fn open(path: impl Into<PathBuf>, removal: Removal) -> Result<Self, TdsError> {
        let path = path.into();
        let reader = StreamReader::open(&path).await?;
        Ok(Self::File {
            reader,
            path,
            removal,
        })
    }

    pub fn pipe(rx: PipeRx) -> Self {
        Self::Pipe(rx)
    }

    pub fn name(&self) -> String {
        match self {
            Self::Pipe(_) => "pipe".to_string(),
            Self::File { path, .. } => path.display().to_string(),
        }
    }

    /// Next stream item, uniformly ending in `Eos`. A pipe that dies
    /// without `Eos` is a failed producer.
    pub async fn next(&mut self) -> Result<Option<Message>, TdsError> {
        match self {
            Self::Pipe(rx) => match rx.recv().await {
                Some(msg) => Ok(Some(msg)),
                None if rx.finished() => Ok(None),
                None => Err(rx.closed_early()),
            },
            Self::File { reader, .. } => reader.next().await,
        }
    }

    /// Dispose of a fully consumed input.
    pub fn finish(self) {
        if let Self::File { path, removal, .. } = self {
            match removal {
                Removal::Keep => {}
                Removal::Spill => tmpfiles::release(&path),
                Removal::Unlink => match std::fs::remove_file(&path) {
                    Ok(()) => debug!(path = %path.display(), "removed merged input"),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e,
                            "could not remove merged input")
                    }
                },
            }
        }
    }
}

/// Where a merge writes: an in-process pipe or a spill file.
///
/// Pipe outputs can suppress the header (when the caller already wrote one)
/// and the trailing `Eos` (when the caller wants to append provenance
/// first).
pub enum MergeOut {
    Pipe {
        tx: PipeTx,
        header: bool,
        eos: bool,
    },
    File(StreamWriter),
}

impl MergeOut {
    /// A complete stream into a pipe: header, rows, `Eos`.
    pub fn pipe(tx: PipeTx) -> Self {
        Self::Pipe {
            tx,
            header: true,
            eos: true,
        }
    }

    /// System output: the caller finishes the stream itself.
    pub fn system(tx: PipeTx, header: bool) -> Self {
        Self::Pipe {
            tx,
            header,
            eos: false,
        }
    }

    pub fn file(writer: StreamWriter) -> Self {
        Self::File(writer)
    }

    async fn send_header(&mut self, schema: SchemaRef) -> Result<(), TdsError> {
        match self {
            Self::Pipe { tx, header, .. } => {
                if *header {
                    tx.send(Message::Header(schema)).await?;
                }
                Ok(())
            }
            Self::File(w) => w.write(&Message::Header(schema)).await,
        }
    }

    async fn send(&mut self, msg: Message) -> Result<(), TdsError> {
        match self {
            Self::Pipe { tx, .. } => tx.send(msg).await,
            Self::File(w) => w.write(&msg).await,
        }
    }

    /// Close the stream: `Eos` on pipes (when owed), flush on files.
    pub async fn finish(&mut self) -> Result<(), TdsError> {
        match self {
            Self::Pipe { tx, eos, .. } => {
                if *eos {
                    tx.send_tail(Message::Eos).await;
                }
                Ok(())
            }
            Self::File(w) => w.flush().await,
        }
    }
}

struct Side {
    feed: Feed,
    label: &'static str,
    prev: Option<Row>,
    /// Comments seen before the header; they can only go out once the
    /// output header is written.
    held: Vec<String>,
}

impl Side {
    fn new(feed: Feed, label: &'static str) -> Self {
        Self {
            feed,
            label,
            prev: None,
            held: Vec::new(),
        }
    }

    /// Read up to this side's header, holding any leading comments.
    async fn header(&mut self) -> Result<SchemaRef, TdsError> {
        loop {
            match self.feed.next().await? {
                Some(Message::Header(schema)) => return Ok(schema),
                Some(Message::Comment(c)) => self.held.push(c),
                Some(_) | None => {
                    return Err(TdsError::Schema(format!(
                        "{} input {}: stream did not start with a header",
                        self.label,
                        self.feed.name()
                    )))
                }
            }
        }
    }

    async fn flush_held(&mut self, out: &mut MergeOut) -> Result<(), TdsError> {
        for c in self.held.drain(..) {
            out.send(Message::Comment(c)).await?;
        }
        Ok(())
    }

    /// Next row, forwarding comments and verifying sortedness. `None` once
    /// the side is exhausted.
    async fn next_row(
        &mut self,
        key: &ResolvedKey,
        out: &mut MergeOut,
    ) -> Result<Option<Row>, TdsError> {
        loop {
            match self.feed.next().await? {
                Some(Message::Row(row)) => {
                    if let Some(prev) = &self.prev {
                        if key.compare(prev, &row) == std::cmp::Ordering::Greater {
                            let col = key.deciding_column(prev, &row).unwrap_or("?");
                            return Err(TdsError::Ordering(format!(
                                "{} input {}: not sorted by {col}",
                                self.label,
                                self.feed.name()
                            )));
                        }
                    }
                    self.prev = Some(row.clone());
                    return Ok(Some(row));
                }
                Some(Message::Comment(c)) => out.send(Message::Comment(c)).await?,
                Some(Message::Header(_)) => {
                    return Err(TdsError::Schema(format!(
                        "{} input {}: second header in one stream",
                        self.label,
                        self.feed.name()
                    )))
                }
                Some(Message::Eos) | None => return Ok(None),
            }
        }
    }
}

/// The two-way merge step.
pub struct Merge2 {
    key: KeySpec,
}

impl Merge2 {
    pub fn new(key: KeySpec) -> Self {
        Self { key }
    }

    /// Merge `left` and `right` into `out` and finish the output stream.
    /// Consumed file inputs are disposed per their removal policy; on error
    /// they are left for the registry to sweep.
    pub async fn run(
        &self,
        left: Feed,
        right: Feed,
        out: &mut MergeOut,
        cancel: &CancellationToken,
    ) -> Result<SchemaRef, TdsError> {
        let mut left = Side::new(left, "left");
        let mut right = Side::new(right, "right");

        let schema = left.header().await?;
        let right_schema = right.header().await?;
        if !schema.compatible(&right_schema) {
            return Err(TdsError::Schema(format!(
                "cannot merge incompatible streams: [{}] vs [{}]",
                schema.columns().join(", "),
                right_schema.columns().join(", ")
            )));
        }
        let key = self.key.resolve(&schema)?;
        out.send_header(schema.clone()).await?;
        left.flush_held(out).await?;
        right.flush_held(out).await?;

        let mut lrow = left.next_row(&key, out).await?;
        let mut rrow = right.next_row(&key, out).await?;
        loop {
            if cancel.is_cancelled() {
                return Err(TdsError::PipeClosed("merge cancelled"));
            }
            match (lrow.take(), rrow.take()) {
                (Some(l), Some(r)) => {
                    // Left wins ties: stability across sibling inputs.
                    if key.compare(&l, &r) != std::cmp::Ordering::Greater {
                        out.send(Message::Row(l)).await?;
                        lrow = left.next_row(&key, out).await?;
                        rrow = Some(r);
                    } else {
                        out.send(Message::Row(r)).await?;
                        rrow = right.next_row(&key, out).await?;
                        lrow = Some(l);
                    }
                }
                (Some(l), None) => {
                    out.send(Message::Row(l)).await?;
                    lrow = left.next_row(&key, out).await?;
                }
                (None, Some(r)) => {
                    out.send(Message::Row(r)).await?;
                    rrow = right.next_row(&key, out).await?;
                }
                (None, None) => break,
            }
        }
        out.finish().await?;
        left.feed.finish();
        right.feed.finish();
        Ok(schema)
    }
}
