//! Queue (C6), §4.6: a durable, priority-aware, two-stage queue. Items move
//! from [`Which::Original`] (awaiting decomposition) to [`Which::Fragment`]
//! (awaiting execution) as the processor pool (C7) works through them.
//!
//! Grounded on the teacher's `DashMap`-backed in-process stores (see
//! [`crate::cache::backends::dict`]) for the in-memory realization, and on
//! the `sqlx::PgPool` idiom in [`crate::cache::backends::postgres`] for the
//! durable one — the two queue tables use the same
//! `SELECT ... FOR UPDATE SKIP LOCKED` claim shape a production queue table
//! would.

pub mod memory;
pub mod postgres;

pub use memory::MemoryQueue;
pub use postgres::PostgresQueue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::Datatype;

/// Which logical queue an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    Original,
    Fragment,
    Both,
}

/// An item awaiting decomposition (§3 `OriginalItem`). Unique on
/// `(query_text, partition_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginalItem {
    pub query_text: String,
    pub partition_key: String,
    pub partition_datatype: Option<Datatype>,
    pub priority: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// An item awaiting fragment execution (§3 `FragmentItem`). Unique on
/// `(fragment_hash, partition_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentItem {
    pub query_text: String,
    pub fragment_hash: String,
    pub partition_key: String,
    pub partition_datatype: Datatype,
    pub priority: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Outcome of a push, per §4.6's operation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    /// No existing row; a new one was inserted.
    Inserted,
    /// An existing row's priority was bumped upward and `updated_at` refreshed (I4).
    Bumped,
    /// The existing row was locked by a concurrent writer; treated as success (§4.6).
    SkippedLocked,
}

/// Depth of each logical queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueLengths {
    pub original: u64,
    pub fragment: u64,
}

/// Two-stage durable priority queue abstraction (§4.6). Implementations must
/// make `pop_*` non-blocking: concurrent callers observe disjoint claims and
/// never wait on one another.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn push_original(
        &self,
        query_text: &str,
        partition_key: &str,
        partition_datatype: Option<Datatype>,
        priority: i64,
    ) -> crate::Result<PushStatus>;

    /// Batch form for FragmentQueue items sharing one partition key/datatype.
    async fn push_fragments(
        &self,
        items: &[(String, String)], // (query_text, fragment_hash)
        partition_key: &str,
        partition_datatype: Datatype,
        priority: i64,
    ) -> crate::Result<Vec<PushStatus>>;

    /// Claims and removes the highest-priority, oldest-created unclaimed
    /// OriginalQueue item. Non-blocking.
    async fn pop_original(&self) -> crate::Result<Option<OriginalItem>>;

    /// As [`Queue::pop_original`] for the FragmentQueue.
    async fn pop_fragment(&self) -> crate::Result<Option<FragmentItem>>;

    async fn lengths(&self) -> crate::Result<QueueLengths>;

    async fn clear(&self, which: Which) -> crate::Result<()>;
}
