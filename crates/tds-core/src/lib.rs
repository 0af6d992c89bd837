//! # TDS Core - Tabular Data Stream Engine
//!
//! This crate provides the foundational types, traits, and abstractions for
//! building streaming pipelines over self-describing flat-text tables. It
//! defines the stream schema and wire codec, the bounded pipes operators
//! communicate through, key specifications for ordering, and the pipeline
//! builder that wires operators together.
//!
//! ## Key Components
//!
//! - **Schema & Codec**: header parsing, row split/join, field safing
//! - **Messaging**: bounded pipes carrying `Header`/`Row`/`Comment`/`Eos`
//! - **Operator Traits**: Source, Filter, and Sink abstractions
//! - **Key Specs**: per-column comparators resolved to indices at setup
//! - **Error Handling**: structured error types for pipeline operations
//!
//! ## Example Usage
//!
//! ```no_run
//! use tds_core::{Pipeline, Filter};
//!
//! # async fn example(source: Box<dyn tds_core::Source>,
//! #                  filter: Box<dyn Filter>,
//! #                  sink: Box<dyn tds_core::Sink>) -> Result<(), tds_core::TdsError> {
//! // source -> filter -> sink, each on its own worker
//! Pipeline::new(source, sink).filter(filter).run().await
//! # }
//! ```

pub mod error;
pub mod filter;
pub mod key;
pub mod message;
pub mod pipeline;
pub mod reducer;
pub mod schema;

pub use error::TdsError;
pub use filter::{send_provenance, Filter, Operator, Provenance, Sink, Source};
pub use key::{Comparator, Direction, KeyColumn, KeySpec, ResolvedKey};
pub use message::{
    default_pipe_capacity, pipe, pipe_with, set_default_pipe_capacity, Message, PipeRx, PipeTx,
    Row, SchemaRef, DEFAULT_PIPE_CAPACITY,
};
pub use pipeline::{Pipeline, PipelineHandle};
pub use reducer::ReducerSpec;
pub use schema::{Schema, Separator, COMMENT_PREFIX, DEFAULT_EMPTY, STREAM_MARKER};
