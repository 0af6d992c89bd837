//! Buffered stream writer over a file, stdout, or any byte writer
//!
//! [`StreamWriter`] accepts the same typed items the reader yields. The
//! schema arrives as the stream's `Header` message; constructing a writer
//! around the schema of an existing reader ("cloning" it) guarantees the
//! output is schema-compatible with the input.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use tds_core::message::{Message, SchemaRef};
use tds_core::TdsError;

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub struct StreamWriter {
    name: String,
    writer: BufWriter<BoxedWrite>,
    schema: Option<SchemaRef>,
}

impl StreamWriter {
    /// Create a stream file, truncating; `-` means stdout.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, TdsError> {
        let path = path.as_ref();
        if path.as_os_str() == "-" {
            return Ok(Self::stdout());
        }
        let file = File::create(path)
            .await
            .map_err(|e| TdsError::resource(format!("create {}", path.display()), e))?;
        Ok(Self::from_writer(
            path.display().to_string(),
            Box::new(file),
        ))
    }

    pub fn stdout() -> Self {
        Self::from_writer("-", Box::new(tokio::io::stdout()))
    }

    pub fn from_writer(name: impl Into<String>, writer: BoxedWrite) -> Self {
        Self {
            name: name.into(),
            writer: BufWriter::new(writer),
            schema: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The schema committed by the header written so far.
    pub fn schema(&self) -> Option<&SchemaRef> {
        self.schema.as_ref()
    }

    async fn write_line(&mut self, line: &str) -> Result<(), TdsError> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TdsError::resource(format!("write {}", self.name), e))?;
        self.writer
            .write_all(b"\n")
            .await
            .map_err(|e| TdsError::resource(format!("write {}", self.name), e))
    }

    /// Write one stream item. The header must come first and only once;
    /// `Eos` flushes.
    pub async fn write(&mut self, msg: &Message) -> Result<(), TdsError> {
        match msg {
            Message::Header(schema) => {
                if self.schema.is_some() {
                    return Err(TdsError::Schema(format!(
                        "{}: second header in one stream",
                        self.name
                    )));
                }
                self.schema = Some(schema.clone());
                let line = schema.header_line();
                self.write_line(&line).await
            }
            Message::Row(row) => {
                let Some(schema) = self.schema.clone() else {
                    return Err(TdsError::Schema(format!(
                        "{}: row written before header",
                        self.name
                    )));
                };
                let line = schema.format_row(row)?;
                self.write_line(&line).await
            }
            Message::Comment(text) => self.write_line(text).await,
            Message::Eos => self.flush().await,
        }
    }

    pub async fn flush(&mut self) -> Result<(), TdsError> {
        self.writer
            .flush()
            .await
            .map_err(|e| TdsError::resource(format!("flush {}", self.name), e))
    }

    /// Flush and drop the writer.
    pub async fn finish(mut self) -> Result<(), TdsError> {
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tds_core::schema::{Schema, Separator};

    use super::*;

    async fn collect(messages: &[Message]) -> String {
        let (mut w, buf) = sink_writer();
        for msg in messages {
            w.write(msg).await.unwrap();
        }
        w.finish().await.unwrap();
        let bytes = buf.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    type Shared = std::sync::Arc<std::sync::Mutex<Vec<u8>>>;

    struct SharedWrite(Shared);

    impl AsyncWrite for SharedWrite {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn sink_writer() -> (StreamWriter, Shared) {
        let buf: Shared = Arc::new(std::sync::Mutex::new(Vec::new()));
        let writer = StreamWriter::from_writer("test", Box::new(SharedWrite(buf.clone())));
        (writer, buf)
    }

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(Separator::Comma, vec!["a", "b"]).unwrap())
    }

    fn row(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    #[tokio::test]
    async fn writes_header_rows_comments() {
        let out = collect(&[
            Message::Header(schema()),
            Message::Row(row(&["1", "x"])),
            Message::Comment("# hello".into()),
            Message::Row(row(&["2", ""])),
            Message::Eos,
        ])
        .await;
        assert_eq!(out, "#tds -F C a b\n1,x\n# hello\n2,-\n");
    }

    #[tokio::test]
    async fn row_before_header_is_fatal() {
        let (mut w, _) = sink_writer();
        let err = w.write(&Message::Row(row(&["1", "2"]))).await.unwrap_err();
        assert!(matches!(err, TdsError::Schema(_)));
    }

    #[tokio::test]
    async fn double_header_is_fatal() {
        let (mut w, _) = sink_writer();
        w.write(&Message::Header(schema())).await.unwrap();
        let err = w.write(&Message::Header(schema())).await.unwrap_err();
        assert!(matches!(err, TdsError::Schema(_)));
    }
}
