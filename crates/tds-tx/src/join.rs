//! Sort-merge join of two presorted streams
//!
//! Walks both sides under the key spec. While one side's key is smaller it
//! is emitted unmatched (outer) or dropped (inner); on equality the whole
//! right-side run of equal keys is buffered and crossed with every matching
//! left row, preserving left order. Output columns are the key tuple first,
//! then the left side's non-key columns, then the right side's; a non-key
//! name present on both sides is fatal.
//!
//! Both inputs are verified to be sorted consistently with the key spec as
//! they are consumed.

use std::collections::HashSet;
use std::str::FromStr;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use tds_core::key::{KeySpec, ResolvedKey};
use tds_core::message::{Message, PipeTx, Row, SchemaRef};
use tds_core::schema::Schema;
use tds_core::{Provenance, TdsError};

use crate::merge2::Feed;

/// Right-run size above which a warning is logged, unless overridden.
pub const DEFAULT_RUN_WARN_ROWS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Outer,
}

impl FromStr for JoinType {
    type Err = TdsError;

    fn from_str(s: &str) -> Result<Self, TdsError> {
        match s {
            "inner" => Ok(Self::Inner),
            "outer" => Ok(Self::Outer),
            "left" | "right" => Err(TdsError::Config(format!(
                "join type {s:?} is not implemented; use inner or outer"
            ))),
            other => Err(TdsError::Config(format!("unknown join type {other:?}"))),
        }
    }
}

pub struct Join {
    key: KeySpec,
    join_type: JoinType,
    empty: Option<String>,
    warn_run_rows: usize,
    provenance: Provenance,
}

impl Join {
    pub fn new(key: KeySpec, join_type: JoinType) -> Self {
        let provenance = Provenance::new(format!(
            "join -t {} {}",
            match join_type {
                JoinType::Inner => "inner",
                JoinType::Outer => "outer",
            },
            key.describe()
        ));
        Self {
            key,
            join_type,
            empty: None,
            warn_run_rows: DEFAULT_RUN_WARN_ROWS,
            provenance,
        }
    }

    /// Empty-value token for unmatched sides (`-e`); defaults to the left
    /// stream's token.
    pub fn empty_token(mut self, token: impl Into<String>) -> Self {
        self.empty = Some(token.into());
        self
    }

    /// Right-run buffer size that triggers a warning.
    pub fn warn_run_rows(mut self, rows: usize) -> Self {
        self.warn_run_rows = rows.max(1);
        self
    }

    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// Join `left` and `right` into `tx` as one complete stream.
    pub async fn run(
        &self,
        left: Feed,
        right: Feed,
        tx: PipeTx,
        cancel: CancellationToken,
    ) -> Result<(), TdsError> {
        let mut left = JoinSide::new(left, "left");
        let mut right = JoinSide::new(right, "right");
        let lschema = left.header().await?;
        let rschema = right.header().await?;

        let lkey = self.key.resolve(&lschema)?;
        let rkey = self.key.resolve(&rschema)?;
        let shape = OutputShape::build(
            &self.key,
            &lschema,
            &rschema,
            self.empty.as_deref(),
        )?;
        tx.send(Message::Header(shape.schema.clone())).await?;
        for c in left.held.drain(..).chain(right.held.drain(..)) {
            tx.send(Message::Comment(c)).await?;
        }

        let outer = self.join_type == JoinType::Outer;
        let mut lrow = left.next_row(&lkey, &tx).await?;
        let mut rrow = right.next_row(&rkey, &tx).await?;
        loop {
            if cancel.is_cancelled() {
                return Err(TdsError::PipeClosed("join cancelled"));
            }
            match (lrow.take(), rrow.take()) {
                (None, None) => break,
                (Some(l), None) => {
                    if outer {
                        tx.send(Message::Row(shape.left_only(&l))).await?;
                    }
                    lrow = left.next_row(&lkey, &tx).await?;
                }
                (None, Some(r)) => {
                    if outer {
                        tx.send(Message::Row(shape.right_only(&r))).await?;
                    }
                    rrow = right.next_row(&rkey, &tx).await?;
                }
                (Some(l), Some(r)) => match lkey.compare_across(&l, &rkey, &r) {
                    std::cmp::Ordering::Less => {
                        if outer {
                            tx.send(Message::Row(shape.left_only(&l))).await?;
                        }
                        lrow = left.next_row(&lkey, &tx).await?;
                        rrow = Some(r);
                    }
                    std::cmp::Ordering::Greater => {
                        if outer {
                            tx.send(Message::Row(shape.right_only(&r))).await?;
                        }
                        rrow = right.next_row(&rkey, &tx).await?;
                        lrow = Some(l);
                    }
                    std::cmp::Ordering::Equal => {
                        // Buffer the whole right run of this key, then cross
                        // it with every matching left row in left order.
                        let mut run = vec![r];
                        loop {
                            match right.next_row(&rkey, &tx).await? {
                                Some(next)
                                    if rkey.compare(&run[0], &next)
                                        == std::cmp::Ordering::Equal =>
                                {
                                    run.push(next)
                                }
                                other => {
                                    rrow = other;
                                    break;
                                }
                            }
                        }
                        if run.len() > self.warn_run_rows {
                            warn!(
                                rows = run.len(),
                                "large right-side join run held in memory"
                            );
                        }
                        let mut l = Some(l);
                        while let Some(lcur) = l.take() {
                            for rmatch in &run {
                                tx.send(Message::Row(shape.matched(&lcur, rmatch))).await?;
                            }
                            match left.next_row(&lkey, &tx).await? {
                                Some(next)
                                    if lkey.compare_across(&next, &rkey, &run[0])
                                        == std::cmp::Ordering::Equal =>
                                {
                                    l = Some(next)
                                }
                                other => lrow = other,
                            }
                        }
                    }
                },
            }
        }
        self.provenance.emit(&tx).await;
        tx.send_tail(Message::Eos).await;
        Ok(())
    }
}

/// Precomputed projection of both sides into the output row layout.
struct OutputShape {
    schema: SchemaRef,
    lkey_idx: Vec<usize>,
    rkey_idx: Vec<usize>,
    left_rest: Vec<usize>,
    right_rest: Vec<usize>,
}

impl OutputShape {
    fn build(
        key: &KeySpec,
        lschema: &SchemaRef,
        rschema: &SchemaRef,
        empty: Option<&str>,
    ) -> Result<Self, TdsError> {
        let key_names: Vec<&str> = key.column_names();
        let key_set: HashSet<&str> = key_names.iter().copied().collect();

        let mut lkey_idx = Vec::new();
        let mut rkey_idx = Vec::new();
        for name in &key_names {
            lkey_idx.push(lschema.require_col(name)?);
            rkey_idx.push(rschema.require_col(name)?);
        }

        let left_rest: Vec<usize> = (0..lschema.arity())
            .filter(|i| !key_set.contains(lschema.columns()[*i].as_str()))
            .collect();
        let right_rest: Vec<usize> = (0..rschema.arity())
            .filter(|i| !key_set.contains(rschema.columns()[*i].as_str()))
            .collect();

        for i in &right_rest {
            let name = &rschema.columns()[*i];
            if left_rest
                .iter()
                .any(|j| &lschema.columns()[*j] == name)
            {
                return Err(TdsError::Schema(format!(
                    "non-key column {name:?} appears on both join sides"
                )));
            }
        }

        let mut columns: Vec<String> = key_names.iter().map(|n| n.to_string()).collect();
        columns.extend(left_rest.iter().map(|i| lschema.columns()[*i].clone()));
        columns.extend(right_rest.iter().map(|i| rschema.columns()[*i].clone()));

        let schema = Schema::new(lschema.separator(), columns)?
            .with_empty(empty.unwrap_or(lschema.empty_token()));
        Ok(Self {
            schema: SchemaRef::new(schema),
            lkey_idx,
            rkey_idx,
            left_rest,
            right_rest,
        })
    }

    fn matched(&self, l: &Row, r: &Row) -> Row {
        let mut row = Vec::with_capacity(self.schema.arity());
        row.extend(self.lkey_idx.iter().map(|i| l[*i].clone()));
        row.extend(self.left_rest.iter().map(|i| l[*i].clone()));
        row.extend(self.right_rest.iter().map(|i| r[*i].clone()));
        row
    }

    fn left_only(&self, l: &Row) -> Row {
        let mut row = Vec::with_capacity(self.schema.arity());
        row.extend(self.lkey_idx.iter().map(|i| l[*i].clone()));
        row.extend(self.left_rest.iter().map(|i| l[*i].clone()));
        row.extend(self.right_rest.iter().map(|_| String::new()));
        row
    }

    fn right_only(&self, r: &Row) -> Row {
        let mut row = Vec::with_capacity(self.schema.arity());
        row.extend(self.rkey_idx.iter().map(|i| r[*i].clone()));
        row.extend(self.left_rest.iter().map(|_| String::new()));
        row.extend(self.right_rest.iter().map(|i| r[*i].clone()));
        row
    }
}

struct JoinSide {
    feed: Feed,
    label: &'static str,
    prev: Option<Row>,
    held: Vec<String>,
}

impl JoinSide {
    fn new(feed: Feed, label: &'static str) -> Self {
        Self {
            feed,
            label,
            prev: None,
            held: Vec::new(),
        }
    }

    async fn header(&mut self) -> Result<SchemaRef, TdsError> {
        loop {
            match self.feed.next().await? {
                Some(Message::Header(schema)) => return Ok(schema),
                Some(Message::Comment(c)) => self.held.push(c),
                Some(_) | None => {
                    return Err(TdsError::Schema(format!(
                        "{} join input {}: stream did not start with a header",
                        self.label,
                        self.feed.name()
                    )))
                }
            }
        }
    }

    async fn next_row(
        &mut self,
        key: &ResolvedKey,
        tx: &PipeTx,
    ) -> Result<Option<Row>, TdsError> {
        loop {
            match self.feed.next().await? {
                Some(Message::Row(row)) => {
                    if let Some(prev) = &self.prev {
                        if key.compare(prev, &row) == std::cmp::Ordering::Greater {
                            let col = key.deciding_column(prev, &row).unwrap_or("?");
                            return Err(TdsError::Ordering(format!(
                                "{} join input {}: not sorted by {col}",
                                self.label,
                                self.feed.name()
                            )));
                        }
                    }
                    self.prev = Some(row.clone());
                    return Ok(Some(row));
                }
                Some(Message::Comment(c)) => tx.send(Message::Comment(c)).await?,
                Some(Message::Header(_)) => {
                    return Err(TdsError::Schema(format!(
                        "{} join input: second header in one stream",
                        self.label
                    )))
                }
                Some(Message::Eos) | None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tds_core::message::{pipe_with, PipeRx};
    use tds_core::schema::Separator;

    use super::*;

    fn schema(cols: &[&str]) -> SchemaRef {
        SchemaRef::new(Schema::new(Separator::Default, cols.to_vec()).unwrap())
    }

    fn row(fields: &[&str]) -> Row {
        fields.iter().map(|f| f.to_string()).collect()
    }

    async fn feed_of(schema: SchemaRef, rows: Vec<Row>) -> Feed {
        let (tx, rx) = pipe_with(rows.len() + 2);
        tx.send(Message::Header(schema)).await.unwrap();
        for r in rows {
            tx.send(Message::Row(r)).await.unwrap();
        }
        tx.send(Message::Eos).await.unwrap();
        Feed::pipe(rx)
    }

    async fn collect_rows(mut rx: PipeRx) -> (Option<SchemaRef>, Vec<Row>) {
        let mut schema = None;
        let mut rows = Vec::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Header(s) => schema = Some(s),
                Message::Row(r) => rows.push(r),
                Message::Eos => break,
                Message::Comment(_) => {}
            }
        }
        (schema, rows)
    }

    async fn run_join(
        join: Join,
        left: Feed,
        right: Feed,
    ) -> Result<(Option<SchemaRef>, Vec<Row>), TdsError> {
        let (tx, rx) = pipe_with(128);
        let (result, out) = tokio::join!(
            join.run(left, right, tx, CancellationToken::new()),
            collect_rows(rx)
        );
        result?;
        Ok(out)
    }

    #[tokio::test]
    async fn inner_join_multiplies_runs() {
        let left = feed_of(
            schema(&["sid", "cid"]),
            vec![
                row(&["1", "10"]),
                row(&["2", "11"]),
                row(&["1", "12"]),
                row(&["2", "12"]),
            ],
        )
        .await;
        let right = feed_of(
            schema(&["cid", "cname"]),
            vec![
                row(&["10", "pascal"]),
                row(&["11", "numanal"]),
                row(&["12", "os"]),
            ],
        )
        .await;
        let (out_schema, rows) = run_join(
            Join::new(KeySpec::parse(["-n", "cid"]).unwrap(), JoinType::Inner),
            left,
            right,
        )
        .await
        .unwrap();
        assert_eq!(out_schema.unwrap().columns(), ["cid", "sid", "cname"]);
        assert_eq!(
            rows,
            vec![
                row(&["10", "1", "pascal"]),
                row(&["11", "2", "numanal"]),
                row(&["12", "1", "os"]),
                row(&["12", "2", "os"]),
            ]
        );
    }

    #[tokio::test]
    async fn outer_join_pads_with_nulls() {
        let left = feed_of(
            schema(&["sid", "cid"]),
            vec![row(&["1", "10"]), row(&["2", "20"])],
        )
        .await;
        let right = feed_of(
            schema(&["cid", "cname"]),
            vec![row(&["10", "a"]), row(&["30", "c"])],
        )
        .await;
        let (_, rows) = run_join(
            Join::new(KeySpec::parse(["-n", "cid"]).unwrap(), JoinType::Outer),
            left,
            right,
        )
        .await
        .unwrap();
        // Nulls are in-memory empties; the writer renders the token.
        assert_eq!(
            rows,
            vec![
                row(&["10", "1", "a"]),
                row(&["20", "2", ""]),
                row(&["30", "", "c"]),
            ]
        );
    }

    #[tokio::test]
    async fn inner_join_drops_unmatched() {
        let left = feed_of(
            schema(&["sid", "cid"]),
            vec![row(&["1", "10"]), row(&["2", "20"])],
        )
        .await;
        let right = feed_of(
            schema(&["cid", "cname"]),
            vec![row(&["10", "a"]), row(&["30", "c"])],
        )
        .await;
        let (_, rows) = run_join(
            Join::new(KeySpec::parse(["-n", "cid"]).unwrap(), JoinType::Inner),
            left,
            right,
        )
        .await
        .unwrap();
        assert_eq!(rows, vec![row(&["10", "1", "a"])]);
    }

    #[tokio::test]
    async fn left_run_times_right_run() {
        let left = feed_of(
            schema(&["k", "l"]),
            vec![row(&["1", "a"]), row(&["1", "b"])],
        )
        .await;
        let right = feed_of(
            schema(&["k", "r"]),
            vec![row(&["1", "x"]), row(&["1", "y"]), row(&["1", "z"])],
        )
        .await;
        let (_, rows) = run_join(
            Join::new(KeySpec::parse(["-n", "k"]).unwrap(), JoinType::Inner),
            left,
            right,
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 6);
        // Left-outer order: all of a's matches before b's.
        let ls: Vec<&str> = rows.iter().map(|r| r[1].as_str()).collect();
        assert_eq!(ls, ["a", "a", "a", "b", "b", "b"]);
    }

    #[tokio::test]
    async fn non_key_collision_is_fatal() {
        let left = feed_of(schema(&["k", "v"]), vec![]).await;
        let right = feed_of(schema(&["k", "v"]), vec![]).await;
        let err = run_join(
            Join::new(KeySpec::lexical("k"), JoinType::Inner),
            left,
            right,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TdsError::Schema(_)));
    }

    #[tokio::test]
    async fn unsorted_side_is_fatal() {
        let left = feed_of(
            schema(&["k", "v"]),
            vec![row(&["5", "a"]), row(&["1", "b"])],
        )
        .await;
        let right = feed_of(schema(&["k", "w"]), vec![row(&["1", "x"])]).await;
        let err = run_join(
            Join::new(KeySpec::parse(["-n", "k"]).unwrap(), JoinType::Inner),
            left,
            right,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TdsError::Ordering(_)));
    }

    #[tokio::test]
    async fn unsupported_join_types_are_refused() {
        assert!(matches!("left".parse::<JoinType>(), Err(TdsError::Config(_))));
        assert!(matches!("right".parse::<JoinType>(), Err(TdsError::Config(_))));
        assert!(matches!("cross".parse::<JoinType>(), Err(TdsError::Config(_))));
        assert_eq!("outer".parse::<JoinType>().unwrap(), JoinType::Outer);
    }

    #[tokio::test]
    async fn empty_inputs_yield_header_only() {
        let left = feed_of(schema(&["k", "l"]), vec![]).await;
        let right = feed_of(schema(&["k", "r"]), vec![]).await;
        let (out_schema, rows) = run_join(
            Join::new(KeySpec::lexical("k"), JoinType::Outer),
            left,
            right,
        )
        .await
        .unwrap();
        assert_eq!(out_schema.unwrap().columns(), ["k", "l", "r"]);
        assert!(rows.is_empty());
    }
}
