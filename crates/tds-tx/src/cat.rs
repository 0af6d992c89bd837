//! Concatenation of schema-compatible streams

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tds_core::message::{Message, PipeTx, SchemaRef};
use tds_core::{Operator, Provenance, Source, TdsError};

use tds_io::StreamReader;

/// Reads several stream files in order as one stream: a single header, then
/// every input's rows and comments. Inputs must be schema-compatible.
pub struct CatSource {
    inputs: Vec<PathBuf>,
    provenance: Provenance,
}

impl CatSource {
    pub fn new(inputs: Vec<PathBuf>) -> Self {
        Self {
            inputs,
            provenance: Provenance::new("cat".to_string()),
        }
    }

    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}

#[async_trait]
impl Operator for CatSource {
    fn name(&self) -> &str {
        "cat"
    }
}

#[async_trait]
impl Source for CatSource {
    async fn run(&mut self, tx: PipeTx, cancel: CancellationToken) -> Result<(), TdsError> {
        if self.inputs.len() < 2 {
            return Err(TdsError::Config(format!(
                "need at least two inputs to concatenate, got {}",
                self.inputs.len()
            )));
        }
        let mut first: Option<SchemaRef> = None;
        for path in &self.inputs {
            let mut reader = StreamReader::open(path).await?;
            let schema = reader.header().await?;
            match &first {
                None => {
                    tx.send(Message::Header(schema.clone())).await?;
                    first = Some(schema);
                }
                Some(expected) => {
                    if !expected.compatible(&schema) {
                        return Err(TdsError::Schema(format!(
                            "cannot concatenate {}: [{}] does not match [{}]",
                            path.display(),
                            schema.columns().join(", "),
                            expected.columns().join(", ")
                        )));
                    }
                }
            }
            loop {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                match reader.next().await? {
                    Some(Message::Header(_)) => {}
                    Some(Message::Eos) | None => break,
                    Some(msg) => tx.send(msg).await?,
                }
            }
            debug!(input = %path.display(), "concatenated");
        }
        self.provenance.emit(&tx).await;
        tx.send_tail(Message::Eos).await;
        Ok(())
    }
}
