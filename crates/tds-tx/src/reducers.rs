//! Built-in reducers and the reducer factory
//!
//! The group-by driver instantiates a fresh reducer per group from a
//! [`ReducerFactory`]. Factories are pure configuration: [`SpecFactory`]
//! turns a declarative [`ReducerSpec`] into boxed filter instances, the way
//! every group invocation gets the same behavior.
//!
//! A reducer is an ordinary [`Filter`] over one group's stream: it receives
//! the group's header and rows, and emits its own header even when the
//! group is empty. Aggregating reducers emit no data row for an empty
//! group.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tds_core::key::numeric_cmp;
use tds_core::message::{Message, PipeRx, PipeTx, Row, SchemaRef};
use tds_core::schema::{Schema, Separator};
use tds_core::{Filter, Operator, ReducerSpec, TdsError};

/// Produces one reducer instance per group.
pub trait ReducerFactory: Send + Sync {
    /// Build a fresh instance. `key` is the group's key value when the
    /// driver is configured to pass it, `None` otherwise (and always for
    /// the empty-input invocation).
    fn create(&self, key: Option<&str>) -> Box<dyn Filter>;

    /// Rendering for provenance comments.
    fn describe(&self) -> String;
}

/// Factory over a declarative spec.
pub struct SpecFactory {
    spec: ReducerSpec,
}

impl SpecFactory {
    pub fn new(spec: ReducerSpec) -> Self {
        Self { spec }
    }
}

impl ReducerFactory for SpecFactory {
    fn create(&self, _key: Option<&str>) -> Box<dyn Filter> {
        create_reducer(&self.spec)
    }

    fn describe(&self) -> String {
        self.spec.describe()
    }
}

/// Factory function building a reducer instance from its configuration.
pub fn create_reducer(spec: &ReducerSpec) -> Box<dyn Filter> {
    match spec {
        ReducerSpec::Count => Box::new(Count { n: 0 }),
        ReducerSpec::Sum { column } => Box::new(Accumulate::new(column, AccKind::Sum)),
        ReducerSpec::Mean { column } => Box::new(Accumulate::new(column, AccKind::Mean)),
        ReducerSpec::Min { column } => Box::new(Extreme::new(column, false)),
        ReducerSpec::Max { column } => Box::new(Extreme::new(column, true)),
        ReducerSpec::First => Box::new(Edge { last: false, row: None }),
        ReducerSpec::Last => Box::new(Edge { last: true, row: None }),
        ReducerSpec::Identity => Box::new(Identity),
    }
}

fn own_schema(columns: &[&str]) -> Result<SchemaRef, TdsError> {
    Ok(SchemaRef::new(Schema::new(Separator::Default, columns.to_vec())?))
}

/// Render an aggregate so integral results read as integers.
fn format_value(x: f64) -> String {
    if x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        format!("{x}")
    }
}

/// Read the group's header or fail; reducers are only ever fed streams the
/// driver already validated.
async fn group_header(rx: &mut PipeRx) -> Result<SchemaRef, TdsError> {
    match rx.recv().await {
        Some(Message::Header(schema)) => Ok(schema),
        _ => Err(TdsError::Schema(
            "reducer input did not start with a header".into(),
        )),
    }
}

/// Row count per group, emitted as column `n`.
struct Count {
    n: u64,
}

#[async_trait]
impl Operator for Count {
    fn name(&self) -> &str {
        "count"
    }
}

#[async_trait]
impl Filter for Count {
    async fn run(
        &mut self,
        rx: &mut PipeRx,
        tx: PipeTx,
        _cancel: CancellationToken,
    ) -> Result<(), TdsError> {
        group_header(rx).await?;
        tx.send(Message::Header(own_schema(&["n"])?)).await?;
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Row(_) => self.n += 1,
                Message::Eos => {
                    if self.n > 0 {
                        tx.send(Message::Row(vec![self.n.to_string()])).await?;
                    }
                    tx.send_tail(Message::Eos).await;
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(rx.closed_early())
    }
}

enum AccKind {
    Sum,
    Mean,
}

/// Sum or mean of one numeric column. Unparsable and null fields are
/// skipped; `mean` reports how many values actually contributed.
struct Accumulate {
    column: String,
    kind: AccKind,
    sum: f64,
    n: u64,
}

impl Accumulate {
    fn new(column: &str, kind: AccKind) -> Self {
        Self {
            column: column.to_string(),
            kind,
            sum: 0.0,
            n: 0,
        }
    }
}

#[async_trait]
impl Operator for Accumulate {
    fn name(&self) -> &str {
        match self.kind {
            AccKind::Sum => "sum",
            AccKind::Mean => "mean",
        }
    }
}

#[async_trait]
impl Filter for Accumulate {
    async fn run(
        &mut self,
        rx: &mut PipeRx,
        tx: PipeTx,
        _cancel: CancellationToken,
    ) -> Result<(), TdsError> {
        let schema = group_header(rx).await?;
        let idx = schema.require_col(&self.column)?;
        let own = match self.kind {
            AccKind::Sum => own_schema(&["sum"])?,
            AccKind::Mean => own_schema(&["mean", "n"])?,
        };
        tx.send(Message::Header(own)).await?;
        let mut any_rows = false;
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Row(row) => {
                    any_rows = true;
                    if let Ok(v) = row[idx].parse::<f64>() {
                        self.sum += v;
                        self.n += 1;
                    }
                }
                Message::Eos => {
                    if any_rows {
                        let row = match self.kind {
                            AccKind::Sum => vec![format_value(self.sum)],
                            AccKind::Mean => {
                                let mean = if self.n > 0 {
                                    format_value(self.sum / self.n as f64)
                                } else {
                                    String::new()
                                };
                                vec![mean, self.n.to_string()]
                            }
                        };
                        tx.send(Message::Row(row)).await?;
                    }
                    tx.send_tail(Message::Eos).await;
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(rx.closed_early())
    }
}

/// Numeric-order minimum or maximum of one column.
struct Extreme {
    column: String,
    max: bool,
    best: Option<String>,
}

impl Extreme {
    fn new(column: &str, max: bool) -> Self {
        Self {
            column: column.to_string(),
            max,
            best: None,
        }
    }
}

#[async_trait]
impl Operator for Extreme {
    fn name(&self) -> &str {
        if self.max {
            "max"
        } else {
            "min"
        }
    }
}

#[async_trait]
impl Filter for Extreme {
    async fn run(
        &mut self,
        rx: &mut PipeRx,
        tx: PipeTx,
        _cancel: CancellationToken,
    ) -> Result<(), TdsError> {
        let schema = group_header(rx).await?;
        let idx = schema.require_col(&self.column)?;
        let own = own_schema(&[if self.max { "max" } else { "min" }])?;
        tx.send(Message::Header(own)).await?;
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Row(row) => {
                    let value = &row[idx];
                    let better = match &self.best {
                        None => true,
                        Some(best) => {
                            let ord = numeric_cmp(value, best);
                            if self.max {
                                ord == std::cmp::Ordering::Greater
                            } else {
                                ord == std::cmp::Ordering::Less
                            }
                        }
                    };
                    if better {
                        self.best = Some(value.clone());
                    }
                }
                Message::Eos => {
                    if let Some(best) = self.best.take() {
                        tx.send(Message::Row(vec![best])).await?;
                    }
                    tx.send_tail(Message::Eos).await;
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(rx.closed_early())
    }
}

/// First or last row of the group, unchanged; the output schema is the
/// group's own (key column included).
struct Edge {
    last: bool,
    row: Option<Row>,
}

#[async_trait]
impl Operator for Edge {
    fn name(&self) -> &str {
        if self.last {
            "last"
        } else {
            "first"
        }
    }
}

#[async_trait]
impl Filter for Edge {
    async fn run(
        &mut self,
        rx: &mut PipeRx,
        tx: PipeTx,
        _cancel: CancellationToken,
    ) -> Result<(), TdsError> {
        let schema = group_header(rx).await?;
        tx.send(Message::Header(schema)).await?;
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Row(row) => {
                    if self.last || self.row.is_none() {
                        self.row = Some(row);
                    }
                }
                Message::Eos => {
                    if let Some(row) = self.row.take() {
                        tx.send(Message::Row(row)).await?;
                    }
                    tx.send_tail(Message::Eos).await;
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(rx.closed_early())
    }
}

/// Passes the group through untouched.
struct Identity;

#[async_trait]
impl Operator for Identity {
    fn name(&self) -> &str {
        "identity"
    }
}

#[async_trait]
impl Filter for Identity {
    async fn run(
        &mut self,
        rx: &mut PipeRx,
        tx: PipeTx,
        _cancel: CancellationToken,
    ) -> Result<(), TdsError> {
        while let Some(msg) = rx.recv().await {
            let done = matches!(msg, Message::Eos);
            if done {
                tx.send_tail(Message::Eos).await;
                return Ok(());
            }
            tx.send(msg).await?;
        }
        Err(rx.closed_early())
    }
}

#[cfg(test)]
mod tests {
    use tds_core::message::pipe_with;

    use super::*;

    fn schema(cols: &[&str]) -> SchemaRef {
        own_schema(cols).unwrap()
    }

    fn row(fields: &[&str]) -> Row {
        fields.iter().map(|f| f.to_string()).collect()
    }

    async fn run_reducer(spec: &ReducerSpec, cols: &[&str], rows: Vec<Row>) -> Vec<Message> {
        let mut reducer = create_reducer(spec);
        let (itx, mut irx) = pipe_with(rows.len() + 2);
        itx.send(Message::Header(schema(cols))).await.unwrap();
        for r in rows {
            itx.send(Message::Row(r)).await.unwrap();
        }
        itx.send(Message::Eos).await.unwrap();

        let (otx, mut orx) = pipe_with(64);
        reducer
            .run(&mut irx, otx, CancellationToken::new())
            .await
            .unwrap();
        let mut out = Vec::new();
        while let Some(msg) = orx.recv().await {
            let done = matches!(msg, Message::Eos);
            out.push(msg);
            if done {
                break;
            }
        }
        out
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
    async fn count_counts() {
        let out = run_reducer(
            &ReducerSpec::Count,
            &["event"],
            vec![row(&["A"]), row(&["A"]), row(&["A"])],
        )
        .await;
        assert_eq!(data_rows(&out), vec![row(&["3"])]);
    }

    #[tokio::test]
    async fn count_empty_group_emits_header_only() {
        let out = run_reducer(&ReducerSpec::Count, &["event"], vec![]).await;
        assert!(matches!(&out[0], Message::Header(s) if s.columns() == ["n"]));
        assert!(data_rows(&out).is_empty());
    }

    #[tokio::test]
    async fn mean_reports_value_and_count() {
        let out = run_reducer(
            &ReducerSpec::Mean {
                column: "x".into(),
            },
            &["x"],
            vec![row(&["1"]), row(&["2"]), row(&["3"]), row(&["6"])],
        )
        .await;
        assert_eq!(data_rows(&out), vec![row(&["3", "4"])]);
    }

    #[tokio::test]
    async fn sum_skips_nulls() {
        let out = run_reducer(
            &ReducerSpec::Sum {
                column: "x".into(),
            },
            &["x"],
            vec![row(&["2"]), row(&[""]), row(&["5"])],
        )
        .await;
        assert_eq!(data_rows(&out), vec![row(&["7"])]);
    }

    #[tokio::test]
    async fn min_max_use_numeric_order() {
        let rows = vec![row(&["9"]), row(&["10"]), row(&["2"])];
        let min = run_reducer(&ReducerSpec::Min { column: "x".into() }, &["x"], rows.clone()).await;
        let max = run_reducer(&ReducerSpec::Max { column: "x".into() }, &["x"], rows).await;
        assert_eq!(data_rows(&min), vec![row(&["2"])]);
        assert_eq!(data_rows(&max), vec![row(&["10"])]);
    }

    #[tokio::test]
    async fn first_and_last_keep_full_rows() {
        let rows = vec![row(&["a", "1"]), row(&["b", "2"]), row(&["c", "3"])];
        let first =
            run_reducer(&ReducerSpec::First, &["k", "v"], rows.clone()).await;
        let last = run_reducer(&ReducerSpec::Last, &["k", "v"], rows).await;
        assert_eq!(data_rows(&first), vec![row(&["a", "1"])]);
        assert_eq!(data_rows(&last), vec![row(&["c", "3"])]);
        assert!(matches!(&first[0], Message::Header(s) if s.columns() == ["k", "v"]));
    }

    #[tokio::test]
    async fn missing_column_is_schema_error() {
        let mut reducer = create_reducer(&ReducerSpec::Sum {
            column: "nope".into(),
        });
        let (itx, mut irx) = pipe_with(4);
        itx.send(Message::Header(schema(&["x"]))).await.unwrap();
        itx.send(Message::Eos).await.unwrap();
        let (otx, _orx) = pipe_with(4);
        let err = reducer
            .run(&mut irx, otx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TdsError::Schema(_)));
    }
}
