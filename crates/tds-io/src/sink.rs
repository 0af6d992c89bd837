//! File and stdout sinks terminating pipelines

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tds_core::message::{Message, PipeRx};
use tds_core::{Operator, Sink, TdsError};

use crate::writer::StreamWriter;

/// Drains a pipe into one stream file (or stdout).
pub struct FileSink {
    id: String,
    path: Option<PathBuf>,
}

impl FileSink {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            id: format!("write {}", path.display()),
            path: Some(path),
        }
    }

    pub fn stdout() -> Self {
        Self {
            id: "write -".to_string(),
            path: None,
        }
    }
}

#[async_trait]
impl Operator for FileSink {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn run(&mut self, rx: &mut PipeRx, cancel: CancellationToken) -> Result<(), TdsError> {
        let mut writer = match &self.path {
            Some(path) => StreamWriter::create(path).await?,
            None => StreamWriter::stdout(),
        };
        while let Some(msg) = rx.recv().await {
            writer.write(&msg).await?;
            if matches!(msg, Message::Eos) {
                writer.finish().await?;
                debug!(sink = self.id.as_str(), "sink finished");
                return Ok(());
            }
        }
        if cancel.is_cancelled() {
            return Ok(());
        }
        Err(rx.closed_early())
    }
}
