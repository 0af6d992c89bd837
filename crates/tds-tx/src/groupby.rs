//! Group-by driver: route each key group through a reducer
//!
//! Segments a sorted stream on one key column. In the default
//! (group-ignorant) mode every group gets a fresh reducer instance fed
//! exactly that group's rows through a bounded pipe, with end-of-stream at
//! the group boundary; a per-group post worker collects the reducer's
//! output, prepends the group key when the reducer's schema lacks the key
//! column, and holds every instance to the schema the first one committed.
//! In group-aware mode (`-M`) the single reducer sees the whole stream and
//! observes key transitions itself.
//!
//! The output stream keeps the input's separator; a reducer emitting a
//! different one is repaired by field-safing at the writer, not treated as
//! an error. A reducer that returns without draining its group is fatal:
//! left alone it would wedge the driver behind a full pipe.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tds_core::message::{pipe, Message, PipeRx, PipeTx, SchemaRef};
use tds_core::schema::Schema;
use tds_core::{Filter, Operator, Provenance, TdsError};

use crate::reducers::ReducerFactory;

pub struct GroupBy {
    key_col: String,
    factory: Box<dyn ReducerFactory>,
    group_aware: bool,
    pass_key: bool,
    verify: bool,
    provenance: Provenance,
}

/// Output policy fixed by the first reducer instance and enforced on the
/// rest.
#[derive(Clone)]
struct GroupPolicy {
    reducer_schema: SchemaRef,
    output: SchemaRef,
    prepend_key: bool,
}

/// One in-flight group: the pipe feeding the reducer and the two workers.
struct Group {
    gtx: PipeTx,
    reducer: tokio::task::JoinHandle<Result<(), TdsError>>,
    post: tokio::task::JoinHandle<Result<GroupPolicy, TdsError>>,
}

impl GroupBy {
    pub fn new(key_col: impl Into<String>, factory: Box<dyn ReducerFactory>) -> Self {
        let key_col = key_col.into();
        let provenance = Provenance::new(format!(
            "groupby -k {key_col} -C {}",
            factory.describe()
        ));
        Self {
            key_col,
            factory,
            group_aware: false,
            pass_key: false,
            verify: true,
            provenance,
        }
    }

    /// The reducer handles the whole stream and watches key transitions
    /// itself (`-M`).
    pub fn group_aware(mut self) -> Self {
        self.group_aware = true;
        self
    }

    /// Hand each group's key value to the factory (`-K`).
    pub fn pass_key(mut self) -> Self {
        self.pass_key = true;
        self
    }

    /// Skip the group-contiguity check on declared-sorted input.
    pub fn skip_verification(mut self) -> Self {
        self.verify = false;
        self
    }

    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// Spawn the reducer and post worker for one group and hand back the
    /// feeding end.
    fn start_group(
        &self,
        key: Option<String>,
        input_schema: &SchemaRef,
        policy: Option<GroupPolicy>,
        held_comments: Vec<String>,
        tx: &PipeTx,
        cancel: &CancellationToken,
    ) -> Group {
        debug!(key = key.as_deref().unwrap_or("<none>"), "starting group");
        let (gtx, mut grx) = pipe();
        let (otx, orx) = pipe();

        let mut reducer = self
            .factory
            .create(if self.pass_key { key.as_deref() } else { None });
        let c = cancel.clone();
        let reducer_task = tokio::spawn(async move {
            let result = reducer.run(&mut grx, otx, c).await;
            match result {
                Ok(()) if !grx.finished() => Err(TdsError::Consumption {
                    stage: "reducer".to_string(),
                }),
                other => other,
            }
        });

        let post_task = tokio::spawn(post_group(
            orx,
            tx.clone(),
            policy,
            key,
            self.key_col.clone(),
            input_schema.clone(),
            held_comments,
        ));

        Group {
            gtx,
            reducer: reducer_task,
            post: post_task,
        }
    }

    /// Close a group's input, join its workers, and keep the most useful
    /// error.
    async fn finish_group(&self, group: Group) -> Result<GroupPolicy, TdsError> {
        group.gtx.send_tail(Message::Eos).await;
        drop(group.gtx);

        let reducer_result = match group.reducer.await {
            Ok(result) => result,
            Err(join_err) => Err(TdsError::Other(anyhow::anyhow!(
                "reducer worker failed: {join_err}"
            ))),
        };
        let post_result = match group.post.await {
            Ok(result) => result,
            Err(join_err) => Err(TdsError::Other(anyhow::anyhow!(
                "group post worker failed: {join_err}"
            ))),
        };
        match (reducer_result, post_result) {
            (Ok(()), Ok(policy)) => Ok(policy),
            (Err(re), Err(pe)) => {
                // The post worker's schema complaint explains the reducer's
                // broken pipe, and vice versa.
                if matches!(re, TdsError::PipeClosed(_)) {
                    Err(pe)
                } else {
                    Err(re)
                }
            }
            (Err(re), Ok(_)) => Err(re),
            (Ok(()), Err(pe)) => Err(pe),
        }
    }

    /// Group-ignorant mode: one reducer instance per key group.
    async fn run_grouped(
        &mut self,
        rx: &mut PipeRx,
        tx: PipeTx,
        cancel: CancellationToken,
    ) -> Result<(), TdsError> {
        let schema = match rx.recv().await {
            Some(Message::Header(schema)) => schema,
            Some(_) => {
                return Err(TdsError::Schema(
                    "group-by input did not start with a header".into(),
                ))
            }
            None => return Err(rx.closed_early()),
        };
        let key_idx = schema.require_col(&self.key_col)?;

        let mut policy: Option<GroupPolicy> = None;
        let mut held_comments: Vec<String> = Vec::new();
        let mut current: Option<(String, Group)> = None;
        let mut finished_keys: HashSet<String> = HashSet::new();
        let mut groups = 0u64;

        loop {
            match rx.recv().await {
                Some(Message::Row(row)) => {
                    let key = row[key_idx].clone();
                    let boundary = match &current {
                        Some((open_key, _)) => *open_key != key,
                        None => true,
                    };
                    if boundary {
                        if let Some((closed_key, group)) = current.take() {
                            policy = Some(self.finish_group(group).await?);
                            finished_keys.insert(closed_key);
                        }
                        if self.verify && finished_keys.contains(&key) {
                            return Err(TdsError::Ordering(format!(
                                "group key {key:?} reappears; input is not grouped"
                            )));
                        }
                        groups += 1;
                        let group = self.start_group(
                            Some(key.clone()),
                            &schema,
                            policy.clone(),
                            std::mem::take(&mut held_comments),
                            &tx,
                            &cancel,
                        );
                        group.gtx.send(Message::Header(schema.clone())).await?;
                        current = Some((key, group));
                    }
                    let send_failed = match &current {
                        Some((_, group)) => group.gtx.send(Message::Row(row)).await.is_err(),
                        None => false,
                    };
                    if send_failed {
                        // The reducer quit early; its wrapper has the real
                        // error.
                        if let Some((_, group)) = current.take() {
                            self.finish_group(group).await?;
                        }
                        return Err(TdsError::PipeClosed(
                            "reducer stopped reading its group",
                        ));
                    }
                }
                Some(Message::Comment(c)) => {
                    if policy.is_some() {
                        tx.send(Message::Comment(c)).await?;
                    } else {
                        held_comments.push(c);
                    }
                }
                Some(Message::Header(_)) => {
                    return Err(TdsError::Schema(
                        "group-by input carried a second header".into(),
                    ))
                }
                Some(Message::Eos) => break,
                None => return Err(rx.closed_early()),
            }
        }

        if let Some((_, group)) = current.take() {
            policy = Some(self.finish_group(group).await?);
        }
        if policy.is_none() {
            // Empty input: still invoke the reducer once, with a null key,
            // so the output gets a header.
            let group = self.start_group(
                None,
                &schema,
                None,
                std::mem::take(&mut held_comments),
                &tx,
                &cancel,
            );
            group.gtx.send(Message::Header(schema.clone())).await?;
            self.finish_group(group).await?;
        }
        info!(groups, "group-by finished");
        self.provenance.emit(&tx).await;
        tx.send_tail(Message::Eos).await;
        Ok(())
    }

    /// Group-aware mode: connect the whole stream to a single reducer.
    async fn run_aware(
        &mut self,
        rx: &mut PipeRx,
        tx: PipeTx,
        cancel: CancellationToken,
    ) -> Result<(), TdsError> {
        let (gtx, mut grx) = pipe();
        let (otx, mut orx) = pipe();
        let mut reducer = self.factory.create(None);
        let c = cancel.clone();
        let reducer_task = tokio::spawn(async move {
            let result = reducer.run(&mut grx, otx, c).await;
            match result {
                Ok(()) if !grx.finished() => Err(TdsError::Consumption {
                    stage: "reducer".to_string(),
                }),
                other => other,
            }
        });

        let feed = async {
            while let Some(msg) = rx.recv().await {
                let done = matches!(msg, Message::Eos);
                if gtx.send(msg).await.is_err() {
                    return Err(TdsError::PipeClosed("reducer stopped reading its input"));
                }
                if done {
                    return Ok(());
                }
            }
            Err(rx.closed_early())
        };
        let drain = async {
            while let Some(msg) = orx.recv().await {
                if matches!(msg, Message::Eos) {
                    return Ok(());
                }
                tx.send(msg).await?;
            }
            Err(orx.closed_early())
        };
        let (feed_result, drain_result) = tokio::join!(feed, drain);

        let reducer_result = match reducer_task.await {
            Ok(result) => result,
            Err(join_err) => Err(TdsError::Other(anyhow::anyhow!(
                "reducer worker failed: {join_err}"
            ))),
        };
        let mut fallback = None;
        for result in [reducer_result, feed_result, drain_result] {
            if let Err(err) = result {
                if !matches!(err, TdsError::PipeClosed(_)) {
                    return Err(err);
                }
                if fallback.is_none() {
                    fallback = Some(err);
                }
            }
        }
        if let Some(err) = fallback {
            return Err(err);
        }
        self.provenance.emit(&tx).await;
        tx.send_tail(Message::Eos).await;
        Ok(())
    }
}

#[async_trait]
impl Operator for GroupBy {
    fn name(&self) -> &str {
        "groupby"
    }
}

#[async_trait]
impl Filter for GroupBy {
    async fn run(
        &mut self,
        rx: &mut PipeRx,
        tx: PipeTx,
        cancel: CancellationToken,
    ) -> Result<(), TdsError> {
        if self.group_aware {
            self.run_aware(rx, tx, cancel).await
        } else {
            self.run_grouped(rx, tx, cancel).await
        }
    }
}

/// Per-group post worker: validate the reducer's header, re-inject the key
/// when missing, and forward rows to the shared output.
async fn post_group(
    mut orx: PipeRx,
    tx: PipeTx,
    policy: Option<GroupPolicy>,
    key: Option<String>,
    key_col: String,
    input_schema: SchemaRef,
    held_comments: Vec<String>,
) -> Result<GroupPolicy, TdsError> {
    let reducer_schema = match orx.recv().await {
        Some(Message::Header(schema)) => schema,
        Some(_) | None => {
            return Err(TdsError::Schema("reducer emitted no header".into()))
        }
    };

    let policy = match policy {
        Some(policy) => {
            if !policy.reducer_schema.compatible(&reducer_schema) {
                return Err(TdsError::Schema(format!(
                    "reducer output schema changed between groups: [{}] vs [{}]",
                    policy.reducer_schema.columns().join(", "),
                    reducer_schema.columns().join(", ")
                )));
            }
            policy
        }
        None => {
            let prepend_key = reducer_schema.col_index(&key_col).is_none();
            let mut columns: Vec<String> = Vec::new();
            if prepend_key {
                columns.push(key_col);
            }
            columns.extend(reducer_schema.columns().iter().cloned());
            // The surrounding stream's separator wins; a reducer emitting
            // another one is repaired by field-safing at the writer.
            let output = SchemaRef::new(
                Schema::new(input_schema.separator(), columns)?
                    .with_empty(input_schema.empty_token()),
            );
            tx.send(Message::Header(output.clone())).await?;
            GroupPolicy {
                reducer_schema,
                output,
                prepend_key,
            }
        }
    };
    for c in held_comments {
        tx.send(Message::Comment(c)).await?;
    }

    loop {
        match orx.recv().await {
            Some(Message::Row(mut row)) => {
                if policy.prepend_key {
                    row.insert(0, key.clone().unwrap_or_default());
                }
                if row.len() != policy.output.arity() {
                    return Err(TdsError::Schema(format!(
                        "reducer row has {} fields, its header declares {}",
                        row.len() - usize::from(policy.prepend_key),
                        policy.reducer_schema.arity()
                    )));
                }
                tx.send(Message::Row(row)).await?;
            }
            Some(Message::Comment(c)) => tx.send(Message::Comment(c)).await?,
            Some(Message::Header(_)) => {
                return Err(TdsError::Schema(
                    "reducer emitted a second header".into(),
                ))
            }
            Some(Message::Eos) => return Ok(policy),
            None => return Err(orx.closed_early()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tds_core::message::{pipe_with, Row};
    use tds_core::schema::Separator;
    use tds_core::ReducerSpec;

    use super::*;
    use crate::reducers::SpecFactory;

    fn schema(cols: &[&str]) -> SchemaRef {
        SchemaRef::new(Schema::new(Separator::Default, cols.to_vec()).unwrap())
    }

    fn row(fields: &[&str]) -> Row {
        fields.iter().map(|f| f.to_string()).collect()
    }

    fn factory(spec: ReducerSpec) -> Box<dyn ReducerFactory> {
        Box::new(SpecFactory::new(spec))
    }

    async fn run_groupby(
        mut groupby: GroupBy,
        cols: &[&str],
        input: Vec<Message>,
    ) -> Result<Vec<Message>, TdsError> {
        let (itx, mut irx) = pipe_with(input.len() + 2);
        itx.send(Message::Header(schema(cols))).await.unwrap();
        for msg in input {
            itx.send(msg).await.unwrap();
        }
        itx.send(Message::Eos).await.unwrap();
        drop(itx);

        let (otx, orx) = pipe_with(64);
        let run = groupby.run(&mut irx, otx, CancellationToken::new());
        let gather = async {
            let mut orx = orx;
            let mut out = Vec::new();
            while let Some(msg) = orx.recv().await {
                let done = matches!(msg, Message::Eos);
                out.push(msg);
                if done {
                    break;
                }
            }
            out
        };
        let (result, out) = tokio::join!(run, gather);
        result?;
        Ok(out)
    }

    fn data_rows(messages: &[Message]) -> Vec<Row> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::Row(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn counts_adjacent_groups() {
        let mut input = Vec::new();
        for _ in 0..6 {
            input.push(Message::Row(row(&["A"])));
        }
        for _ in 0..6 {
            input.push(Message::Row(row(&["B"])));
        }
        let out = run_groupby(
            GroupBy::new("event", factory(ReducerSpec::Count)),
            &["event"],
            input,
        )
        .await
        .unwrap();
        assert!(matches!(&out[0], Message::Header(s) if s.columns() == ["event", "n"]));
        assert_eq!(
            data_rows(&out),
            vec![row(&["A", "6"]), row(&["B", "6"])]
        );
    }

    #[tokio::test]
    async fn prepends_key_when_reducer_lacks_it() {
        let input = vec![
            Message::Row(row(&["G1", "1"])),
            Message::Row(row(&["G1", "1"])),
            Message::Row(row(&["G2", "3"])),
            Message::Row(row(&["G2", "3"])),
            Message::Row(row(&["G2", "3"])),
            Message::Row(row(&["G2", "3"])),
        ];
        let out = run_groupby(
            GroupBy::new("g", factory(ReducerSpec::Mean { column: "x".into() })),
            &["g", "x"],
            input,
        )
        .await
        .unwrap();
        assert!(matches!(&out[0], Message::Header(s) if s.columns() == ["g", "mean", "n"]));
        assert_eq!(
            data_rows(&out),
            vec![row(&["G1", "1", "2"]), row(&["G2", "3", "4"])]
        );
    }

    #[tokio::test]
    async fn keeps_reducer_schema_when_key_present() {
        let input = vec![
            Message::Row(row(&["a", "1"])),
            Message::Row(row(&["a", "2"])),
            Message::Row(row(&["b", "9"])),
        ];
        let out = run_groupby(
            GroupBy::new("k", factory(ReducerSpec::First)),
            &["k", "v"],
            input,
        )
        .await
        .unwrap();
        assert!(matches!(&out[0], Message::Header(s) if s.columns() == ["k", "v"]));
        assert_eq!(
            data_rows(&out),
            vec![row(&["a", "1"]), row(&["b", "9"])]
        );
    }

    #[tokio::test]
    async fn identity_reducer_preserves_multiset() {
        let input = vec![
            Message::Row(row(&["a", "1"])),
            Message::Row(row(&["a", "2"])),
            Message::Row(row(&["b", "3"])),
        ];
        let out = run_groupby(
            GroupBy::new("k", factory(ReducerSpec::Identity)),
            &["k", "v"],
            input,
        )
        .await
        .unwrap();
        assert_eq!(
            data_rows(&out),
            vec![row(&["a", "1"]), row(&["a", "2"]), row(&["b", "3"])]
        );
    }

    #[tokio::test]
    async fn empty_input_invokes_reducer_once_for_header() {
        let out = run_groupby(
            GroupBy::new("event", factory(ReducerSpec::Count)),
            &["event"],
            vec![],
        )
        .await
        .unwrap();
        assert!(matches!(&out[0], Message::Header(s) if s.columns() == ["event", "n"]));
        assert!(data_rows(&out).is_empty());
    }

    #[tokio::test]
    async fn noncontiguous_group_is_fatal() {
        let input = vec![
            Message::Row(row(&["A"])),
            Message::Row(row(&["B"])),
            Message::Row(row(&["A"])),
        ];
        let err = run_groupby(
            GroupBy::new("event", factory(ReducerSpec::Count)),
            &["event"],
            input,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TdsError::Ordering(_)));
    }

    #[tokio::test]
    async fn skip_verification_allows_reappearing_keys() {
        let input = vec![
            Message::Row(row(&["A"])),
            Message::Row(row(&["B"])),
            Message::Row(row(&["A"])),
        ];
        let out = run_groupby(
            GroupBy::new("event", factory(ReducerSpec::Count)).skip_verification(),
            &["event"],
            input,
        )
        .await
        .unwrap();
        assert_eq!(
            data_rows(&out),
            vec![row(&["A", "1"]), row(&["B", "1"]), row(&["A", "1"])]
        );
    }

    #[tokio::test]
    async fn group_aware_reducer_sees_whole_stream() {
        let input = vec![
            Message::Row(row(&["a", "1"])),
            Message::Row(row(&["b", "2"])),
        ];
        let out = run_groupby(
            GroupBy::new("k", factory(ReducerSpec::Identity)).group_aware(),
            &["k", "v"],
            input,
        )
        .await
        .unwrap();
        assert!(matches!(&out[0], Message::Header(s) if s.columns() == ["k", "v"]));
        assert_eq!(data_rows(&out).len(), 2);
    }

    #[tokio::test]
    async fn comments_come_out_after_the_header() {
        let input = vec![
            Message::Comment("# early".into()),
            Message::Row(row(&["A"])),
        ];
        let out = run_groupby(
            GroupBy::new("event", factory(ReducerSpec::Count)),
            &["event"],
            input,
        )
        .await
        .unwrap();
        assert!(matches!(&out[0], Message::Header(_)));
        assert!(matches!(&out[1], Message::Comment(c) if c == "# early"));
    }

    /// Alternates between two reducers with different output schemas.
    struct FlipFlop(std::sync::atomic::AtomicUsize);

    impl ReducerFactory for FlipFlop {
        fn create(&self, _key: Option<&str>) -> Box<dyn Filter> {
            let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n % 2 == 0 {
                crate::reducers::create_reducer(&ReducerSpec::Count)
            } else {
                crate::reducers::create_reducer(&ReducerSpec::Mean {
                    column: "x".into(),
                })
            }
        }

        fn describe(&self) -> String {
            "flipflop".into()
        }
    }

    #[tokio::test]
    async fn reducer_schema_must_not_change_between_groups() {
        let input = vec![
            Message::Row(row(&["a", "1"])),
            Message::Row(row(&["b", "2"])),
        ];
        let err = run_groupby(
            GroupBy::new(
                "k",
                Box::new(FlipFlop(std::sync::atomic::AtomicUsize::new(0))),
            ),
            &["k", "x"],
            input,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TdsError::Schema(_)));
    }

    #[tokio::test]
    async fn missing_key_column_is_fatal() {
        let err = run_groupby(
            GroupBy::new("nope", factory(ReducerSpec::Count)),
            &["event"],
            vec![],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TdsError::Schema(_)));
    }
}
