//! Pull-based stream reader over a file, stdin, or any byte reader
//!
//! [`StreamReader`] turns buffered lines into the typed item sequence of a
//! stream: the header first, then rows and comments, then a synthesized
//! `Eos` at end of input. Reading past the end keeps returning
//! end-of-stream.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use tds_core::message::{Message, SchemaRef};
use tds_core::schema::Schema;
use tds_core::TdsError;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

pub struct StreamReader {
    name: String,
    reader: BufReader<BoxedRead>,
    schema: Option<SchemaRef>,
    line: String,
    state: State,
}

#[derive(PartialEq)]
enum State {
    Fresh,
    Streaming,
    Ended,
}

impl StreamReader {
    /// Open a stream file; `-` means stdin.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TdsError> {
        let path = path.as_ref();
        if path.as_os_str() == "-" {
            return Ok(Self::stdin());
        }
        let file = File::open(path)
            .await
            .map_err(|e| TdsError::resource(format!("open {}", path.display()), e))?;
        Ok(Self::from_reader(
            path.display().to_string(),
            Box::new(file),
        ))
    }

    pub fn stdin() -> Self {
        Self::from_reader("-", Box::new(tokio::io::stdin()))
    }

    pub fn from_reader(name: impl Into<String>, reader: BoxedRead) -> Self {
        Self {
            name: name.into(),
            reader: BufReader::new(reader),
            schema: None,
            line: String::new(),
            state: State::Fresh,
        }
    }

    /// The input's name for error messages (path or `-`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stream's schema, available once the header was read.
    pub fn schema(&self) -> Option<&SchemaRef> {
        self.schema.as_ref()
    }

    /// Fill `self.line` with the next line, without its terminator.
    /// Returns false at end of input.
    async fn fill_line(&mut self) -> Result<bool, TdsError> {
        self.line.clear();
        let n = self
            .reader
            .read_line(&mut self.line)
            .await
            .map_err(|e| TdsError::resource(format!("read {}", self.name), e))?;
        if n == 0 {
            return Ok(false);
        }
        while self.line.ends_with('\n') || self.line.ends_with('\r') {
            self.line.pop();
        }
        Ok(true)
    }

    /// Read and return the header, consuming the first line. Idempotent.
    pub async fn header(&mut self) -> Result<SchemaRef, TdsError> {
        if let Some(schema) = &self.schema {
            return Ok(schema.clone());
        }
        if !self.fill_line().await? {
            return Err(TdsError::Schema(format!(
                "{}: empty input, no stream header",
                self.name
            )));
        }
        let schema = SchemaRef::new(Schema::parse_header(&self.line)?);
        self.schema = Some(schema.clone());
        Ok(schema)
    }

    /// Next item of the stream. The first call yields `Header`; the last
    /// real item is `Eos`, after which `None` is returned forever.
    pub async fn next(&mut self) -> Result<Option<Message>, TdsError> {
        match self.state {
            State::Fresh => {
                let schema = self.header().await?;
                self.state = State::Streaming;
                return Ok(Some(Message::Header(schema)));
            }
            State::Ended => return Ok(None),
            State::Streaming => {}
        }
        if !self.fill_line().await? {
            self.state = State::Ended;
            return Ok(Some(Message::Eos));
        }
        if Schema::is_comment(&self.line) {
            return Ok(Some(Message::Comment(self.line.clone())));
        }
        let Some(schema) = self.schema.clone() else {
            return Err(TdsError::Schema(format!(
                "{}: row before stream header",
                self.name
            )));
        };
        let row = schema
            .parse_row(&self.line)
            .map_err(|e| match e {
                TdsError::Schema(msg) => TdsError::Schema(format!("{}: {msg}", self.name)),
                other => other,
            })?;
        Ok(Some(Message::Row(row)))
    }
}
