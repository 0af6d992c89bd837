//! Pipeline builder: wiring operators with pipes and workers
//!
//! Given a source, an ordered list of filters, and a sink, the builder
//! creates the connecting pipes, runs every stage on its own worker (or
//! cooperatively on one), and joins them downstream-first so an error in a
//! late stage is reported ahead of the upstream failures it causes. The
//! first error wins; everything else is cancelled.

use std::future::Future;
use std::pin::Pin;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::TdsError;
use crate::filter::{Filter, Sink, Source};
use crate::message::{pipe_with, default_pipe_capacity};

type StageFuture = Pin<Box<dyn Future<Output = (String, Result<(), TdsError>)> + Send>>;

/// A linear pipeline `source -> filter* -> sink`.
pub struct Pipeline {
    source: Box<dyn Source>,
    filters: Vec<Box<dyn Filter>>,
    sink: Box<dyn Sink>,
    capacity: usize,
    cooperative: bool,
}

impl Pipeline {
    pub fn new(source: Box<dyn Source>, sink: Box<dyn Sink>) -> Self {
        Self {
            source,
            filters: Vec::new(),
            sink,
            capacity: default_pipe_capacity(),
            cooperative: false,
        }
    }

    /// Append a filter stage; stages run in insertion order.
    pub fn filter(mut self, filter: Box<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Capacity for every pipe created between stages.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Drive all stages on the calling worker instead of spawning one task
    /// per stage. Only sensible when pipe capacities dominate the largest
    /// stage's buffering needs.
    pub fn cooperative(mut self) -> Self {
        self.cooperative = true;
        self
    }

    /// Start the pipeline on a background task; `join` the handle for the
    /// result. This is the auto-run form of [`Pipeline::run`].
    pub fn spawn(self) -> PipelineHandle {
        PipelineHandle {
            handle: tokio::spawn(self.run()),
        }
    }

    /// Run the pipeline to completion and return the first error observed,
    /// checking every filter for full input consumption.
    pub async fn run(self) -> Result<(), TdsError> {
        let cancel = CancellationToken::new();
        let stages = self.filters.len() + 2;
        debug!(stages, capacity = self.capacity, "starting pipeline");

        let mut futures: Vec<StageFuture> = Vec::with_capacity(stages);
        let (source_tx, mut rx) = pipe_with(self.capacity);

        let mut source = self.source;
        let c = cancel.child_token();
        futures.push(Box::pin(async move {
            let name = source.name().to_string();
            let result = source.run(source_tx, c).await;
            (name, result)
        }));

        for mut filter in self.filters {
            let (filter_tx, next_rx) = pipe_with(self.capacity);
            let mut filter_rx = rx;
            rx = next_rx;
            let c = cancel.child_token();
            futures.push(Box::pin(async move {
                let name = filter.name().to_string();
                let result = filter.run(&mut filter_rx, filter_tx, c).await;
                let result = match result {
                    Ok(()) if !filter_rx.finished() => {
                        Err(TdsError::Consumption { stage: name.clone() })
                    }
                    other => other,
                };
                (name, result)
            }));
        }

        let mut sink = self.sink;
        let mut sink_rx = rx;
        let c = cancel.child_token();
        futures.push(Box::pin(async move {
            let name = sink.name().to_string();
            let result = sink.run(&mut sink_rx, c).await;
            let result = match result {
                Ok(()) if !sink_rx.finished() => {
                    Err(TdsError::Consumption { stage: name.clone() })
                }
                other => other,
            };
            (name, result)
        }));

        let mut outcomes: Vec<(String, Result<(), TdsError>)> = if self.cooperative {
            join_all(futures).await
        } else {
            let handles: Vec<_> = futures.into_iter().map(tokio::spawn).collect();
            let mut outcomes = Vec::with_capacity(stages);
            // Join downstream-first so a sink error is collected before the
            // upstream broken-pipe failures it triggers.
            for handle in handles.into_iter().rev() {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(join_err) => (
                        "worker".to_string(),
                        Err(TdsError::Other(anyhow::anyhow!(
                            "stage worker failed: {join_err}"
                        ))),
                    ),
                };
                if outcome.1.is_err() {
                    cancel.cancel();
                }
                outcomes.push(outcome);
            }
            outcomes
        };
        if self.cooperative {
            // join_all keeps source-to-sink order; inspect downstream-first.
            outcomes.reverse();
        }

        for (stage, outcome) in outcomes {
            if let Err(err) = outcome {
                error!(stage = %stage, %err, "pipeline stage failed");
                return Err(err);
            }
            debug!(stage = %stage, "stage finished");
        }
        Ok(())
    }
}

/// Handle to a spawned pipeline.
pub struct PipelineHandle {
    handle: tokio::task::JoinHandle<Result<(), TdsError>>,
}

impl PipelineHandle {
    pub async fn join(self) -> Result<(), TdsError> {
        match self.handle.await {
            Ok(result) => result,
            Err(join_err) => Err(TdsError::Other(anyhow::anyhow!(
                "pipeline worker failed: {join_err}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::filter::{Operator, Filter, Sink, Source};
    use crate::message::{Message, PipeRx, PipeTx, Row, SchemaRef};
    use crate::schema::{Schema, Separator};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(Separator::Default, vec!["v"]).unwrap())
    }

    fn row(v: &str) -> Row {
        vec![v.to_string()]
    }

    struct VecSource(Vec<Message>);

    #[async_trait]
    impl Operator for VecSource {
        fn name(&self) -> &str {
            "vec-source"
        }
    }

    #[async_trait]
    impl Source for VecSource {
        async fn run(
            &mut self,
            tx: PipeTx,
            _cancel: CancellationToken,
        ) -> Result<(), TdsError> {
            for msg in self.0.drain(..) {
                tx.send(msg).await?;
            }
            tx.send_tail(Message::Eos).await;
            Ok(())
        }
    }

    struct Passthrough;

    #[async_trait]
    impl Operator for Passthrough {
        fn name(&self) -> &str {
            "passthrough"
        }
    }

    #[async_trait]
    impl Filter for Passthrough {
        async fn run(
            &mut self,
            rx: &mut PipeRx,
            tx: PipeTx,
            _cancel: CancellationToken,
        ) -> Result<(), TdsError> {
            while let Some(msg) = rx.recv().await {
                let done = matches!(msg, Message::Eos);
                tx.send(msg).await?;
                if done {
                    return Ok(());
                }
            }
            Err(rx.closed_early())
        }
    }

    /// Returns success after the header without draining its input.
    struct Lazy;

    #[async_trait]
    impl Operator for Lazy {
        fn name(&self) -> &str {
            "lazy"
        }
    }

    #[async_trait]
    impl Filter for Lazy {
        async fn run(
            &mut self,
            rx: &mut PipeRx,
            tx: PipeTx,
            _cancel: CancellationToken,
        ) -> Result<(), TdsError> {
            let _ = rx.recv().await;
            tx.send(Message::Eos).await?;
            Ok(())
        }
    }

    struct CollectSink(Arc<Mutex<Vec<Message>>>);

    #[async_trait]
    impl Operator for CollectSink {
        fn name(&self) -> &str {
            "collect"
        }
    }

    #[async_trait]
    impl Sink for CollectSink {
        async fn run(
            &mut self,
            rx: &mut PipeRx,
            _cancel: CancellationToken,
        ) -> Result<(), TdsError> {
            while let Some(msg) = rx.recv().await {
                let done = matches!(msg, Message::Eos);
                self.0.lock().unwrap().push(msg);
                if done {
                    return Ok(());
                }
            }
            Err(rx.closed_early())
        }
    }

    fn messages() -> Vec<Message> {
        vec![
            Message::Header(schema()),
            Message::Row(row("a")),
            Message::Comment("# note".into()),
            Message::Row(row("b")),
        ]
    }

    #[tokio::test]
    async fn parallel_pipeline_delivers_in_order() {
        let out = Arc::new(Mutex::new(Vec::new()));
        Pipeline::new(
            Box::new(VecSource(messages())),
            Box::new(CollectSink(out.clone())),
        )
        .filter(Box::new(Passthrough))
        .filter(Box::new(Passthrough))
        .capacity(2)
        .run()
        .await
        .unwrap();

        let got = out.lock().unwrap();
        assert_eq!(got.len(), 5);
        assert!(matches!(got[0], Message::Header(_)));
        assert!(matches!(&got[1], Message::Row(r) if *r == row("a")));
        assert!(matches!(&got[2], Message::Comment(c) if c == "# note"));
        assert!(matches!(&got[3], Message::Row(r) if *r == row("b")));
        assert!(matches!(got[4], Message::Eos));
    }

    #[tokio::test]
    async fn cooperative_pipeline_matches_parallel() {
        let out = Arc::new(Mutex::new(Vec::new()));
        Pipeline::new(
            Box::new(VecSource(messages())),
            Box::new(CollectSink(out.clone())),
        )
        .filter(Box::new(Passthrough))
        .cooperative()
        .run()
        .await
        .unwrap();
        assert_eq!(out.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn unconsumed_input_is_detected() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let err = Pipeline::new(
            Box::new(VecSource(messages())),
            Box::new(CollectSink(out)),
        )
        .filter(Box::new(Lazy))
        .capacity(16)
        .run()
        .await
        .unwrap_err();
        assert!(matches!(err, TdsError::Consumption { stage } if stage == "lazy"));
    }
}
