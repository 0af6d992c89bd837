//! # TDS Operators - Stream Transformations
//!
//! This crate provides the engine-level stream operators for TDS
//! pipelines: the external stable sort, the two-way merge and the
//! bounded-parallel N-way merge driver built on it, the sort-merge join,
//! the group-by driver with its per-group reducers, and stream
//! concatenation.
//!
//! Operators plug into `tds_core::Pipeline` as filters or sources, or run
//! standalone over [`merge2::Feed`]s when they take more than one input.

/// External stable sort with run spilling
pub mod sort;

/// Two-way ordered merge and the feed/output abstractions
pub mod merge2;

/// N-way merge driver with bounded parallelism and endgame
pub mod merge;

/// Sort-merge inner/outer join
pub mod join;

/// Group-by driver routing key groups through reducers
pub mod groupby;

/// Built-in reducers and the reducer factory
pub mod reducers;

/// Concatenation of schema-compatible streams
pub mod cat;

pub use cat::CatSource;
pub use groupby::GroupBy;
pub use join::{Join, JoinType, DEFAULT_RUN_WARN_ROWS};
pub use merge::MergeDriver;
pub use merge2::{Feed, Merge2, MergeOut, Removal};
pub use reducers::{create_reducer, ReducerFactory, SpecFactory};
pub use sort::{Sort, DEFAULT_RUN_ROWS};
