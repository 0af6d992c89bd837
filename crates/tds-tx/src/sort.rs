//! External stable sort
//!
//! Rows buffer in memory up to the run limit, each full run is stable-sorted
//! and spilled as a stream file through the registry, and the spills feed
//! the N-way merge driver. An input that fits in one run never touches
//! disk. Ties beyond the key keep input order.
//!
//! Comments cannot keep their row positions across a sort; they are held
//! and emitted right after the output header.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tds_core::key::KeySpec;
use tds_core::message::{Message, PipeRx, PipeTx, Row, SchemaRef};
use tds_core::{Filter, Operator, Provenance, TdsError};
use tds_io::{tmpfiles, StreamWriter};

use crate::merge::MergeDriver;
use crate::merge2::Removal;

/// Rows buffered per run before spilling, unless overridden.
pub const DEFAULT_RUN_ROWS: usize = 100_000;

pub struct Sort {
    key: KeySpec,
    run_limit: usize,
    parallelism: Option<usize>,
    endgame: bool,
    provenance: Provenance,
}

impl Sort {
    pub fn new(key: KeySpec) -> Self {
        let provenance = Provenance::new(format!("sort {}", key.describe()));
        Self {
            key,
            run_limit: DEFAULT_RUN_ROWS,
            parallelism: None,
            endgame: true,
            provenance,
        }
    }

    /// Rows held in memory per run (`--max-rows`).
    pub fn run_limit(mut self, rows: usize) -> Self {
        self.run_limit = rows.max(1);
        self
    }

    /// Merge parallelism for the spill phase.
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism.max(1));
        self
    }

    pub fn endgame(mut self, endgame: bool) -> Self {
        self.endgame = endgame;
        self
    }

    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// Stable-sort one run and spill it as a stream file.
    async fn spill_run(
        &self,
        schema: &SchemaRef,
        mut rows: Vec<Row>,
    ) -> Result<std::path::PathBuf, TdsError> {
        let key = self.key.resolve(schema)?;
        rows.sort_by(|a, b| key.compare(a, b));
        let path = tmpfiles::create("sortrun")?;
        let count = rows.len();
        let mut writer = StreamWriter::create(&path).await?;
        writer.write(&Message::Header(schema.clone())).await?;
        for row in rows {
            writer.write(&Message::Row(row)).await?;
        }
        writer.finish().await?;
        debug!(path = %path.display(), rows = count, "spilled sort run");
        Ok(path)
    }
}

#[async_trait]
impl Operator for Sort {
    fn name(&self) -> &str {
        "sort"
    }
}

#[async_trait]
impl Filter for Sort {
    async fn run(
        &mut self,
        rx: &mut PipeRx,
        tx: PipeTx,
        cancel: CancellationToken,
    ) -> Result<(), TdsError> {
        let schema = match rx.recv().await {
            Some(Message::Header(schema)) => schema,
            Some(_) => {
                return Err(TdsError::Schema(
                    "sort input did not start with a header".into(),
                ))
            }
            None => return Err(rx.closed_early()),
        };
        let key = self.key.resolve(&schema)?;

        let mut buffer: Vec<Row> = Vec::new();
        let mut comments: Vec<String> = Vec::new();
        let mut spills: Vec<std::path::PathBuf> = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match rx.recv().await {
                Some(Message::Row(row)) => {
                    buffer.push(row);
                    if buffer.len() >= self.run_limit {
                        let run = std::mem::take(&mut buffer);
                        spills.push(self.spill_run(&schema, run).await?);
                    }
                }
                Some(Message::Comment(c)) => comments.push(c),
                Some(Message::Header(_)) => {
                    return Err(TdsError::Schema(
                        "sort input carried a second header".into(),
                    ))
                }
                Some(Message::Eos) => break,
                None => return Err(rx.closed_early()),
            }
        }

        tx.send(Message::Header(schema.clone())).await?;
        for comment in comments {
            tx.send(Message::Comment(comment)).await?;
        }

        if spills.is_empty() {
            // Single run: sort in place and emit directly downstream.
            buffer.sort_by(|a, b| key.compare(a, b));
            info!(rows = buffer.len(), "sorted in memory");
            for row in buffer {
                tx.send(Message::Row(row)).await?;
            }
            self.provenance.emit(&tx).await;
            tx.send_tail(Message::Eos).await;
            return Ok(());
        }

        if !buffer.is_empty() {
            spills.push(self.spill_run(&schema, buffer).await?);
        }
        if spills.len() == 1 {
            // The input ended exactly on a run boundary: the one spill is
            // already the answer.
            let path = spills.remove(0);
            let mut feed = crate::merge2::Feed::open(&path, Removal::Spill).await?;
            loop {
                match feed.next().await? {
                    Some(Message::Header(_)) => {}
                    Some(Message::Eos) | None => break,
                    Some(msg) => tx.send(msg).await?,
                }
            }
            feed.finish();
            self.provenance.emit(&tx).await;
            tx.send_tail(Message::Eos).await;
            return Ok(());
        }
        info!(runs = spills.len(), "merging sort runs");
        let mut driver = MergeDriver::new(self.key.clone())
            .headerless()
            .endgame(self.endgame)
            .provenance(self.provenance.clone());
        if let Some(parallelism) = self.parallelism {
            driver = driver.parallelism(parallelism);
        }
        driver
            .merge_files(spills, Removal::Spill, tx, cancel)
            .await
    }
}
