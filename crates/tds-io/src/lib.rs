//! # TDS I/O - Stream Sources and Sinks
//!
//! This crate connects TDS pipelines to the world outside the process:
//! reading and writing stream files (or stdin/stdout) through the wire
//! codec, and managing the spill files the external sort and merge write
//! under `TMPDIR`.
//!
//! ## Features
//!
//! - **StreamReader / StreamWriter**: pull-based codec I/O over any byte
//!   reader or writer, async and buffered
//! - **FileSource / FileSink**: pipeline edge operators over files and
//!   stdio
//! - **Spill registry**: uniquely named temp files, removed on exit and on
//!   fatal signals

/// Pull-based stream reading
pub mod reader;

/// Buffered stream writing
pub mod writer;

/// Pipeline source over files and stdin
pub mod source;

/// Pipeline sink over files and stdout
pub mod sink;

/// Spill-file registry and signal cleanup
pub mod tmpfiles;

pub use reader::StreamReader;
pub use sink::FileSink;
pub use source::FileSource;
pub use writer::StreamWriter;
