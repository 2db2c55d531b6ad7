//! PartitionCache: middleware that memoizes, per partition key, the set of
//! partition identifiers for which a query fragment yields at least one row,
//! so repeated analytical queries over the same partitioned dataset can be
//! rewritten to skip partitions that provably contribute no rows.
//!
//! See the module-level docs on [`hasher`], [`decompose`], [`cache`],
//! [`intersect`], [`rewrite`], [`queue`], [`processor`], and [`scheduler`]
//! for the eight core components (C1-C8).

pub mod cache;
pub mod catalog;
pub mod config;
pub mod decompose;
pub mod error;
pub mod hasher;
pub mod intersect;
pub mod processor;
pub mod queue;
pub mod rewrite;
pub mod scheduler;

pub use config::Config;
pub use error::{PartitionCacheError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
