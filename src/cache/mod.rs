// # Cache Store
//
// The cache is a partitioned key -> identifier-set store. The *value* for a
// given (partition key, fragment hash) pair is the set of partition
// identifiers for which the fragment's query matched at least one row.
//
// Multiple physical back-ends realize the same abstract contract
// ([`CacheStore`]): a sorted-array store, a fixed-width bitstring store, a
// compressed-bitmap store, an external key-value store, and a rich-dict
// store. Callers depend on the trait, never on a concrete back-end type;
// back-end-specific extras (lazy intersection, export/import, eviction) are
// exposed as additional trait methods with defaults, not via downcasting.

pub mod backends;
pub mod stats;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use stats::{CacheMetrics, EvictionReason};

/// A partition key's fixed datatype. Set on first registration and immutable
/// for the lifetime of the key (I1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datatype {
    Integer,
    Float,
    Text,
    Timestamp,
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Datatype::Integer => "integer",
            Datatype::Float => "float",
            Datatype::Text => "text",
            Datatype::Timestamp => "timestamp",
        };
        write!(f, "{s}")
    }
}

/// A single partition identifier. The datatype actually populated must match
/// the owning partition key's [`Datatype`] (I1).
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Identifier {
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(i64), // unix millis; kept as an integer for a total order
}

impl Identifier {
    pub fn datatype(&self) -> Datatype {
        match self {
            Identifier::Integer(_) => Datatype::Integer,
            Identifier::Float(_) => Datatype::Float,
            Identifier::Text(_) => Datatype::Text,
            Identifier::Timestamp(_) => Datatype::Timestamp,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Identifier::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Integer(v) => write!(f, "{v}"),
            Identifier::Float(v) => write!(f, "{v}"),
            Identifier::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
            Identifier::Timestamp(v) => write!(f, "{v}"),
        }
    }
}

/// Status recorded against a cache entry by the processor pool (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Ok,
    Timeout,
    Failed,
    Limit,
}

/// Metadata carried alongside a cache entry's value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub source_sql: Option<String>,
    pub last_seen: i64, // unix millis
    pub status: EntryStatus,
    pub count: u64,
    pub message: Option<String>, // populated for Failed/Timeout/Limit
}

impl EntryMetadata {
    pub fn ok(source_sql: Option<String>, count: u64, now_ms: i64) -> Self {
        Self {
            source_sql,
            last_seen: now_ms,
            status: EntryStatus::Ok,
            count,
            message: None,
        }
    }
}

/// The three-valued result of a cache lookup (§3 CacheEntry).
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// A finite, possibly-empty set of identifiers.
    Set(Vec<Identifier>),
    /// Explicit "evaluated, zero partitions matched" sentinel.
    Null,
    /// No entry recorded at all.
    Absent,
}

impl CacheValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, CacheValue::Absent)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CacheValue::Null)
    }

    pub fn into_set(self) -> Vec<Identifier> {
        match self {
            CacheValue::Set(ids) => ids,
            CacheValue::Null | CacheValue::Absent => Vec::new(),
        }
    }
}

/// One exported (partition_key, fragment_hash, value) tuple, used by the
/// export/import round trip (R3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub fragment_hash: String,
    pub value: CacheRecordValue,
    pub metadata: Option<EntryMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheRecordValue {
    Set(Vec<Identifier>),
    Null,
}

/// Result of [`CacheStore::intersect`]: the materialized intersection over
/// whichever fragment hashes were present, plus how many of the requested
/// hashes actually contributed (§4.3).
#[derive(Debug, Clone, PartialEq)]
pub struct IntersectionResult {
    pub ids: Vec<Identifier>,
    pub hits: usize,
}

/// Result of [`CacheStore::intersect_lazy`]: either a SQL subquery the
/// caller's database can execute directly, or `None` when the back-end
/// cannot express the intersection in-database (§4.4).
#[derive(Debug, Clone, PartialEq)]
pub struct LazyIntersection {
    pub subquery_sql: Option<String>,
    pub hits: usize,
}

/// Optional capability query result describing what a back-end can do,
/// consulted instead of downcasting to a concrete type (§9 "Design Notes").
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub lazy_intersection: bool,
    pub eviction: bool,
    pub datatypes: DatatypeSupport,
}

#[derive(Debug, Clone, Copy)]
pub struct DatatypeSupport {
    pub integer: bool,
    pub float: bool,
    pub text: bool,
    pub timestamp: bool,
}

impl Default for DatatypeSupport {
    fn default() -> Self {
        // conservative default matching the abstract contract's minimum
        Self {
            integer: true,
            float: true,
            text: true,
            timestamp: true,
        }
    }
}

impl DatatypeSupport {
    pub fn supports(&self, dt: Datatype) -> bool {
        match dt {
            Datatype::Integer => self.integer,
            Datatype::Float => self.float,
            Datatype::Text => self.text,
            Datatype::Timestamp => self.timestamp,
        }
    }
}

/// Eviction strategy, a back-end-optional capability (§B "Supplemented features").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionStrategy {
    Oldest,
    LeastRecentlyUsed,
}

/// The abstract cache-store contract (§4.3). Every back-end in
/// `cache::backends` implements this trait; the rest of the crate is written
/// entirely against it.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Idempotent; fails with `DatatypeConflict` if `p` already exists with a
    /// different datatype (I1).
    async fn register_partition(&self, partition_key: &str, datatype: Datatype) -> crate::Result<()>;

    async fn put_set(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        ids: Vec<Identifier>,
    ) -> crate::Result<()>;

    async fn put_null(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<()>;

    async fn put_entry(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        ids: Vec<Identifier>,
        source_sql: &str,
    ) -> crate::Result<()>;

    /// Records an entry with a non-`Ok` status (timeout/failed/limit) without
    /// a value; the prior value (if any) is left untouched per I5.
    async fn put_status(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        status: EntryStatus,
        message: Option<String>,
    ) -> crate::Result<()>;

    async fn get(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<CacheValue>;

    async fn exists(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<bool>;

    /// Idempotent; returns whether anything was actually removed.
    async fn delete(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<bool>;

    async fn filter_existing(
        &self,
        partition_key: &str,
        fragment_hashes: &[String],
    ) -> crate::Result<Vec<String>>;

    async fn intersect(
        &self,
        partition_key: &str,
        fragment_hashes: &[String],
    ) -> crate::Result<IntersectionResult>;

    /// Default lazy implementation: no back-end in `cache::backends` is
    /// "lazy-capable" unless it overrides this, so the generic default
    /// simply reports `None` (out-of-database fallback, §4.4).
    async fn intersect_lazy(
        &self,
        _partition_key: &str,
        _fragment_hashes: &[String],
    ) -> crate::Result<LazyIntersection> {
        Ok(LazyIntersection {
            subquery_sql: None,
            hits: 0,
        })
    }

    async fn list_partitions(&self) -> crate::Result<Vec<(String, Datatype)>>;

    async fn all_keys(&self, partition_key: &str) -> crate::Result<Vec<String>>;

    fn capabilities(&self) -> Capabilities;

    fn metrics(&self, partition_key: &str) -> CacheMetrics;

    /// Generic export built once against the abstract contract so every
    /// back-end gets round-trip support (R3) for free.
    async fn export(&self, partition_key: &str) -> crate::Result<Vec<CacheRecord>> {
        let mut out = Vec::new();
        for fragment_hash in self.all_keys(partition_key).await? {
            let value = match self.get(partition_key, &fragment_hash).await? {
                CacheValue::Set(ids) => CacheRecordValue::Set(ids),
                CacheValue::Null => CacheRecordValue::Null,
                CacheValue::Absent => continue,
            };
            out.push(CacheRecord {
                fragment_hash,
                value,
                metadata: None,
            });
        }
        Ok(out)
    }

    async fn import(&self, partition_key: &str, records: Vec<CacheRecord>) -> crate::Result<()> {
        for record in records {
            match record.value {
                CacheRecordValue::Set(ids) => {
                    self.put_set(partition_key, &record.fragment_hash, ids).await?;
                }
                CacheRecordValue::Null => {
                    self.put_null(partition_key, &record.fragment_hash).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datatype_support_defaults_permissive() {
        let support = DatatypeSupport::default();
        assert!(support.supports(Datatype::Integer));
        assert!(support.supports(Datatype::Text));
    }

    #[test]
    fn cache_value_into_set_treats_null_and_absent_as_empty() {
        assert_eq!(CacheValue::Null.into_set(), Vec::<Identifier>::new());
        assert_eq!(CacheValue::Absent.into_set(), Vec::<Identifier>::new());
        assert_eq!(
            CacheValue::Set(vec![Identifier::Integer(1)]).into_set(),
            vec![Identifier::Integer(1)]
        );
    }
}
