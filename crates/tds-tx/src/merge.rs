//! N-way merge driver: a bounded-parallel tree of two-way merges
//!
//! Merges any number of presorted, schema-compatible inputs with bounded
//! memory and one pass of scratch disk. The tree is not expressed
//! recursively: a work queue per depth holds ready inputs, a single control
//! loop owns all scheduling state, and spawned workers run the actual
//! two-way merges.
//!
//! Scheduling: the driver pairs the two oldest ready items of a depth and
//! spawns a merge writing a spill file one depth up. A shared budget
//! (default: CPU count) caps live merges; excess merges wait on a one-shot
//! gate raised as budget frees. Outputs are admitted to the next depth in
//! the order their merges were scheduled, not the order they finish, which
//! keeps sibling order and therefore stability.
//!
//! A depth that closes with a single leftover item promotes it unchanged.
//! Once every remaining input can merge concurrently under the budget, the
//! endgame begins: outputs switch from spill files to pipes and the last
//! merge runs inline in the driver, producing the system output. With
//! `--noendgame` the machine degrades to spill files until two inputs
//! remain.
//!
//! In xargs mode the filenames themselves arrive as rows on an input
//! stream, and depth 0 stays open until that stream ends.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tds_core::key::KeySpec;
use tds_core::message::{Message, PipeRx, PipeTx};
use tds_core::{Provenance, TdsError};
use tds_io::{tmpfiles, StreamReader, StreamWriter};

use crate::merge2::{Feed, Merge2, MergeOut, Removal};

struct Item {
    path: PathBuf,
    removal: Removal,
}

enum Ctrl {
    /// A filename arrived on the xargs stream.
    Leaf(PathBuf),
    /// The xargs stream ended.
    LeavesDone,
    /// A merge produced its output; `slot` orders siblings.
    Produced { depth: usize, slot: u64, item: Item },
    /// A merge worker released its budget.
    Done,
    Failed(TdsError),
}

#[derive(Default)]
struct Depth {
    ready: VecDeque<Item>,
    /// Finished outputs waiting for an earlier sibling to land.
    parked: BTreeMap<u64, Item>,
    next_slot: u64,
    expect_slot: u64,
    /// Scheduled merges that will produce into this depth.
    incoming: usize,
}

/// Configuration and entry points for the merge tree.
pub struct MergeDriver {
    key: KeySpec,
    parallelism: usize,
    endgame: bool,
    write_header: bool,
    provenance: Provenance,
}

impl MergeDriver {
    pub fn new(key: KeySpec) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            key,
            parallelism: cpus,
            endgame: true,
            write_header: true,
            provenance: Provenance::disabled("merge"),
        }
    }

    /// Cap on concurrently running two-way merges.
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Disable the streaming endgame; every merge spills to disk until two
    /// inputs remain.
    pub fn endgame(mut self, endgame: bool) -> Self {
        self.endgame = endgame;
        self
    }

    /// Suppress the output header (the caller already wrote one).
    pub fn headerless(mut self) -> Self {
        self.write_header = false;
        self
    }

    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// Merge a fixed set of input files into `tx` as one complete stream.
    pub async fn merge_files(
        &self,
        inputs: Vec<PathBuf>,
        removal: Removal,
        tx: PipeTx,
        cancel: CancellationToken,
    ) -> Result<(), TdsError> {
        if inputs.len() < 2 {
            return Err(TdsError::Config(format!(
                "need at least two inputs to merge, got {}",
                inputs.len()
            )));
        }
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let mut machine = Machine::new(self, ctrl_tx, cancel.clone());
        for path in inputs {
            machine.leaf(Item { path, removal });
        }
        machine.leaf_closed = true;
        let items = machine.run(ctrl_rx).await?;
        self.finish(items, tx, cancel).await
    }

    /// xargs mode: merge the files named by the rows of `names` (first
    /// column), incrementally as they arrive.
    pub async fn merge_xargs(
        &self,
        mut names: StreamReader,
        removal: Removal,
        tx: PipeTx,
        cancel: CancellationToken,
    ) -> Result<(), TdsError> {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let pump_tx = ctrl_tx.clone();
        tokio::spawn(async move {
            let outcome = async {
                loop {
                    match names.next().await? {
                        Some(Message::Row(row)) => {
                            let name = row.first().cloned().unwrap_or_default();
                            if name.is_empty() {
                                return Err(TdsError::Config(
                                    "xargs input named an empty file".into(),
                                ));
                            }
                            if pump_tx.send(Ctrl::Leaf(PathBuf::from(name))).is_err() {
                                return Ok(());
                            }
                        }
                        Some(Message::Eos) | None => return Ok(()),
                        Some(_) => {}
                    }
                }
            }
            .await;
            match outcome {
                Ok(()) => {
                    let _ = pump_tx.send(Ctrl::LeavesDone);
                }
                Err(e) => {
                    let _ = pump_tx.send(Ctrl::Failed(e));
                }
            }
        });
        let mut machine = Machine::new(self, ctrl_tx, cancel.clone());
        machine.leaf_removal = removal;
        let items = machine.run(ctrl_rx).await?;
        self.finish(items, tx, cancel).await
    }

    /// Final phase: the surviving inputs all merge concurrently, connected
    /// by pipes, with the last merge running inline here.
    async fn finish(
        &self,
        items: Vec<Item>,
        tx: PipeTx,
        cancel: CancellationToken,
    ) -> Result<(), TdsError> {
        debug!(inputs = items.len(), "merge endgame");
        let mut level: Vec<EndSrc> = items.into_iter().map(EndSrc::File).collect();
        let mut workers: Vec<tokio::task::JoinHandle<Result<(), TdsError>>> = Vec::new();

        if level.len() == 1 {
            // Everything already merged into one spill; stream it out.
            let result = self.pump_single(level.remove(0), &tx).await;
            return self.close_output(result, workers, tx).await;
        }

        while level.len() > 2 {
            let mut next = Vec::with_capacity(level.len() / 2 + 1);
            let mut pending = level.into_iter();
            while let Some(a) = pending.next() {
                let Some(b) = pending.next() else {
                    // A leftover input is promoted to the next level
                    // unchanged.
                    next.push(a);
                    break;
                };
                let (ptx, prx) = tds_core::pipe();
                let merge = Merge2::new(self.key.clone());
                let c = cancel.clone();
                workers.push(tokio::spawn(async move {
                    let left = a.into_feed().await?;
                    let right = b.into_feed().await?;
                    let mut out = MergeOut::pipe(ptx);
                    merge.run(left, right, &mut out, &c).await?;
                    Ok(())
                }));
                next.push(EndSrc::Pipe(prx));
            }
            level = next;
        }

        let mut pair = level.into_iter();
        let (left, right) = match (pair.next(), pair.next()) {
            (Some(l), Some(r)) => (l, r),
            _ => return Err(TdsError::Config("merge endgame lost its inputs".into())),
        };
        let result = async {
            let left = left.into_feed().await?;
            let right = right.into_feed().await?;
            let mut out = MergeOut::system(tx.clone(), self.write_header);
            Merge2::new(self.key.clone())
                .run(left, right, &mut out, &cancel)
                .await?;
            Ok(())
        }
        .await;
        self.close_output(result, workers, tx).await
    }

    /// Stream one already-merged spill file to the output.
    async fn pump_single(&self, src: EndSrc, tx: &PipeTx) -> Result<(), TdsError> {
        let mut feed = src.into_feed().await?;
        loop {
            match feed.next().await? {
                Some(Message::Header(schema)) => {
                    if self.write_header {
                        tx.send(Message::Header(schema)).await?;
                    }
                }
                Some(Message::Eos) | None => break,
                Some(msg) => tx.send(msg).await?,
            }
        }
        feed.finish();
        Ok(())
    }

    /// Join the endgame workers, pick the most useful first error, and
    /// finish the output stream.
    async fn close_output(
        &self,
        inline_result: Result<(), TdsError>,
        workers: Vec<tokio::task::JoinHandle<Result<(), TdsError>>>,
        tx: PipeTx,
    ) -> Result<(), TdsError> {
        let mut first_error: Option<TdsError> = None;
        let mut keep = |err: TdsError| {
            // A worker's schema or ordering error beats the broken-pipe
            // noise it causes downstream.
            let informative = !matches!(err, TdsError::PipeClosed(_));
            match &first_error {
                Some(held) if informative && matches!(held, TdsError::PipeClosed(_)) => {
                    first_error = Some(err)
                }
                Some(_) => {}
                None => first_error = Some(err),
            }
        };
        if let Err(e) = inline_result {
            keep(e);
        }
        for worker in workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => keep(e),
                Err(join_err) => keep(TdsError::Other(anyhow::anyhow!(
                    "merge worker failed: {join_err}"
                ))),
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        self.provenance.emit(&tx).await;
        tx.send_tail(Message::Eos).await;
        info!("merge finished");
        Ok(())
    }
}

enum EndSrc {
    File(Item),
    Pipe(PipeRx),
}

impl EndSrc {
    async fn into_feed(self) -> Result<Feed, TdsError> {
        match self {
            Self::File(item) => Feed::open(item.path, item.removal).await,
            Self::Pipe(rx) => Ok(Feed::pipe(rx)),
        }
    }
}

/// The per-depth work-queue machine. Runs on the driver task as the only
/// consumer of the control queue; merge workers and the xargs pump only
/// ever send.
struct Machine {
    depths: Vec<Depth>,
    leaf_closed: bool,
    leaf_count: u64,
    leaf_removal: Removal,
    running: usize,
    gates: VecDeque<oneshot::Sender<()>>,
    first_error: Option<TdsError>,
    parallelism: usize,
    endgame: bool,
    key: KeySpec,
    ctrl_tx: mpsc::UnboundedSender<Ctrl>,
    cancel: CancellationToken,
}

impl Machine {
    fn new(driver: &MergeDriver, ctrl_tx: mpsc::UnboundedSender<Ctrl>, cancel: CancellationToken) -> Self {
        Self {
            depths: vec![Depth::default()],
            leaf_closed: false,
            leaf_count: 0,
            leaf_removal: Removal::Keep,
            running: 0,
            gates: VecDeque::new(),
            first_error: None,
            parallelism: driver.parallelism,
            endgame: driver.endgame,
            key: driver.key.clone(),
            ctrl_tx,
            cancel,
        }
    }

    fn leaf(&mut self, item: Item) {
        self.leaf_count += 1;
        self.depths[0].ready.push_back(item);
    }

    fn depth_mut(&mut self, depth: usize) -> &mut Depth {
        while self.depths.len() <= depth {
            self.depths.push(Depth::default());
        }
        &mut self.depths[depth]
    }

    /// Items still in play: ready everywhere, parked, and being produced.
    fn remaining(&self) -> usize {
        self.depths
            .iter()
            .map(|d| d.ready.len() + d.parked.len() + d.incoming)
            .sum()
    }

    /// Once this few inputs remain, the rest of the tree runs at once.
    fn threshold(&self) -> usize {
        if self.endgame {
            self.parallelism + 1
        } else {
            2
        }
    }

    /// No more items can ever arrive at `depth`.
    fn closed(&self, depth: usize) -> bool {
        if depth == 0 {
            return self.leaf_closed;
        }
        let below = &self.depths[depth - 1];
        let here = &self.depths[depth];
        self.closed(depth - 1)
            && below.ready.is_empty()
            && here.incoming == 0
            && here.parked.is_empty()
    }

    /// Admit a produced item at its slot, releasing any parked successors.
    fn admit(&mut self, depth: usize, slot: u64, item: Item) {
        let d = self.depth_mut(depth);
        if slot == d.expect_slot {
            d.ready.push_back(item);
            d.expect_slot += 1;
            while let Some(next) = d.parked.remove(&d.expect_slot) {
                d.ready.push_back(next);
                d.expect_slot += 1;
            }
        } else {
            d.parked.insert(slot, item);
        }
    }

    /// Pair ready items and promote runts until nothing changes.
    fn try_schedule(&mut self) {
        if self.first_error.is_some() {
            return;
        }
        loop {
            if self.leaf_closed && self.remaining() <= self.threshold() {
                // The endgame takes whatever is left.
                return;
            }
            let mut changed = false;
            for depth in 0..self.depths.len() {
                while self.depths[depth].ready.len() >= 2 {
                    if self.leaf_closed && self.remaining() <= self.threshold() {
                        return;
                    }
                    let left = self.depths[depth].ready.pop_front();
                    let right = self.depths[depth].ready.pop_front();
                    if let (Some(left), Some(right)) = (left, right) {
                        self.schedule_pair(depth, left, right);
                        changed = true;
                    }
                }
            }
            // Runt rule: a closed depth's lone leftover moves up unchanged.
            for depth in 0..self.depths.len() {
                if self.depths[depth].ready.len() == 1
                    && self.closed(depth)
                    && self.remaining() > 1
                {
                    if let Some(runt) = self.depth_mut(depth).ready.pop_front() {
                        let slot = {
                            let up = self.depth_mut(depth + 1);
                            let slot = up.next_slot;
                            up.next_slot += 1;
                            slot
                        };
                        debug!(depth, "promoting runt");
                        self.admit(depth + 1, slot, runt);
                        changed = true;
                    }
                }
            }
            if !changed {
                return;
            }
        }
    }

    /// Spawn one two-way merge of `left` and `right` at `depth`, writing a
    /// spill file admitted at `depth + 1`.
    fn schedule_pair(&mut self, depth: usize, left: Item, right: Item) {
        let slot = {
            let up = self.depth_mut(depth + 1);
            let slot = up.next_slot;
            up.next_slot += 1;
            up.incoming += 1;
            slot
        };
        let gate = if self.running < self.parallelism {
            self.running += 1;
            None
        } else {
            let (gate_tx, gate_rx) = oneshot::channel();
            self.gates.push_back(gate_tx);
            Some(gate_rx)
        };
        debug!(depth, slot, gated = gate.is_some(), "scheduling merge");

        let merge = Merge2::new(self.key.clone());
        let ctrl = self.ctrl_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Some(gate) = gate {
                // The driver dropped the gate: the tree is aborting.
                if gate.await.is_err() {
                    return;
                }
            }
            let result = async {
                let left = Feed::open(left.path, left.removal).await?;
                let right = Feed::open(right.path, right.removal).await?;
                let out_path = tmpfiles::create("merge")?;
                let writer = StreamWriter::create(&out_path).await?;
                let mut out = MergeOut::file(writer);
                merge.run(left, right, &mut out, &cancel).await?;
                Ok(out_path)
            }
            .await;
            match result {
                Ok(path) => {
                    let _ = ctrl.send(Ctrl::Produced {
                        depth: depth + 1,
                        slot,
                        item: Item {
                            path,
                            removal: Removal::Spill,
                        },
                    });
                }
                Err(e) => {
                    let _ = ctrl.send(Ctrl::Failed(e));
                }
            }
            let _ = ctrl.send(Ctrl::Done);
        });
    }

    /// Drive the control loop until the remaining tree fits the endgame,
    /// then hand the surviving items back in sibling order.
    async fn run(mut self, mut ctrl_rx: mpsc::UnboundedReceiver<Ctrl>) -> Result<Vec<Item>, TdsError> {
        loop {
            self.try_schedule();

            // A failed merge never reports Produced, so the abort path only
            // waits for started workers to release their budget.
            if self.running == 0 {
                if let Some(err) = self.first_error.take() {
                    debug!(%err, "merge tree aborted");
                    return Err(err);
                }
                if self.leaf_closed && self.depths.iter().all(|d| d.incoming == 0) {
                    // Collect deepest-first: deeper items cover earlier
                    // siblings, so this preserves global input order.
                    let mut items = Vec::new();
                    for depth in (0..self.depths.len()).rev() {
                        while let Some(item) = self.depths[depth].ready.pop_front() {
                            items.push(item);
                        }
                    }
                    return Ok(items);
                }
            }

            match ctrl_rx.recv().await {
                Some(Ctrl::Leaf(path)) => {
                    let removal = self.leaf_removal;
                    self.leaf(Item { path, removal });
                }
                Some(Ctrl::LeavesDone) => {
                    self.leaf_closed = true;
                    if self.leaf_count < 2 {
                        self.fail(TdsError::Config(format!(
                            "need at least two inputs to merge, got {}",
                            self.leaf_count
                        )));
                    }
                }
                Some(Ctrl::Produced { depth, slot, item }) => {
                    self.depth_mut(depth).incoming -= 1;
                    self.admit(depth, slot, item);
                }
                Some(Ctrl::Done) => {
                    self.running -= 1;
                    while let Some(gate) = self.gates.pop_front() {
                        if gate.send(()).is_ok() {
                            self.running += 1;
                            break;
                        }
                    }
                }
                Some(Ctrl::Failed(e)) => self.fail(e),
                None => {
                    return Err(TdsError::Other(anyhow::anyhow!(
                        "merge control queue closed unexpectedly"
                    )))
                }
            }
        }
    }

    fn fail(&mut self, err: TdsError) {
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
        // Dropping the gates aborts every scheduled-but-unstarted merge;
        // the token stops the running ones.
        self.gates.clear();
        self.cancel.cancel();
    }
}
