//! File and stdin sources feeding pipelines

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tds_core::message::{Message, PipeTx};
use tds_core::{Operator, Source, TdsError};

use crate::reader::StreamReader;

/// Reads one stream file (or stdin) into a pipe.
pub struct FileSource {
    id: String,
    path: Option<PathBuf>,
}

impl FileSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            id: format!("read {}", path.display()),
            path: Some(path),
        }
    }

    pub fn stdin() -> Self {
        Self {
            id: "read -".to_string(),
            path: None,
        }
    }
}

#[async_trait]
impl Operator for FileSource {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Source for FileSource {
    async fn run(&mut self, tx: PipeTx, cancel: CancellationToken) -> Result<(), TdsError> {
        let mut reader = match &self.path {
            Some(path) => StreamReader::open(path).await?,
            None => StreamReader::stdin(),
        };
        let mut rows = 0u64;
        while let Some(msg) = reader.next().await? {
            if cancel.is_cancelled() {
                debug!(input = reader.name(), "source cancelled");
                return Ok(());
            }
            if matches!(msg, Message::Row(_)) {
                rows += 1;
            }
            if matches!(msg, Message::Eos) {
                tx.send_tail(msg).await;
                break;
            }
            tx.send(msg).await?;
        }
        debug!(input = reader.name(), rows, "source finished");
        Ok(())
    }
}
