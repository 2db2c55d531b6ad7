// Rich-dict back-end (§4.3 family (e)): every datatype, metadata kept
// alongside the value rather than squeezed into a bit-packed encoding, and
// (uniquely among the back-ends in this crate) an actual eviction strategy
// (§B "Supplemented features") since nothing about its storage shape
// constrains it the way a fixed-width bitstring does.
//
// Grounded on the teacher's `cache/cache_statistics.rs` counters plus the
// generic embedded-storage shape of `storage::columnar` (since removed, no
// longer a dependency of this module): one `DashMap` per partition key
// holding a serializable, self-describing record per fragment hash.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::cache::backends::{check_datatype, check_ids_match, intersect_sorted};
use crate::cache::stats::{CacheCounters, EvictionReason};
use crate::cache::{
    CacheMetrics, CacheRecord, CacheRecordValue, CacheStore, CacheValue, Capabilities, Datatype,
    DatatypeSupport, EntryMetadata, EntryStatus, EvictionStrategy, Identifier, IntersectionResult,
};
use crate::error::PartitionCacheError;

#[derive(Debug, Clone)]
enum DictValue {
    Set(Vec<Identifier>),
    Null,
}

struct PartitionState {
    datatype: Datatype,
    entries: DashMap<String, (DictValue, EntryMetadata)>,
    counters: CacheCounters,
}

/// Rich-dict cache store. Holds every partition key's entries in an embedded
/// dictionary keyed by fragment hash; a real deployment backs this with an
/// on-disk embedded store, but the in-process shape used here is identical
/// to what callers see.
#[derive(Default)]
pub struct DictStore {
    partitions: DashMap<String, Arc<PartitionState>>,
    eviction_strategy: Option<EvictionStrategy>,
}

impl DictStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_eviction(strategy: EvictionStrategy) -> Self {
        Self {
            partitions: DashMap::new(),
            eviction_strategy: Some(strategy),
        }
    }

    fn partition(&self, partition_key: &str) -> crate::Result<Arc<PartitionState>> {
        self.partitions
            .get(partition_key)
            .map(|e| e.value().clone())
            .ok_or_else(|| PartitionCacheError::EntryNotFound {
                partition_key: partition_key.to_string(),
                fragment_hash: String::new(),
            })
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Evicts one entry from `partition_key` according to the configured
    /// strategy. Returns the evicted fragment hash, if the partition was
    /// non-empty and an eviction strategy is configured.
    pub fn evict_one(&self, partition_key: &str) -> crate::Result<Option<String>> {
        let Some(strategy) = self.eviction_strategy else {
            return Ok(None);
        };
        let state = self.partition(partition_key)?;
        let victim = match strategy {
            EvictionStrategy::Oldest | EvictionStrategy::LeastRecentlyUsed => state
                .entries
                .iter()
                .min_by_key(|e| e.value().1.last_seen)
                .map(|e| e.key().clone()),
        };
        if let Some(hash) = &victim {
            state.entries.remove(hash);
            state.counters.record_eviction(EvictionReason::Strategy);
        }
        Ok(victim)
    }
}

#[async_trait]
impl CacheStore for DictStore {
    async fn register_partition(&self, partition_key: &str, datatype: Datatype) -> crate::Result<()> {
        if let Some(existing) = self.partitions.get(partition_key) {
            return check_datatype(partition_key, existing.datatype, datatype);
        }
        self.partitions.insert(
            partition_key.to_string(),
            Arc::new(PartitionState {
                datatype,
                entries: DashMap::new(),
                counters: CacheCounters::new(),
            }),
        );
        Ok(())
    }

    async fn put_set(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        ids: Vec<Identifier>,
    ) -> crate::Result<()> {
        let state = self.partition(partition_key)?;
        check_ids_match(partition_key, state.datatype, &ids)?;
        let mut sorted = ids;
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sorted.dedup_by(|a, b| a == b);
        let count = sorted.len() as u64;
        state.entries.insert(
            fragment_hash.to_string(),
            (DictValue::Set(sorted), EntryMetadata::ok(None, count, Self::now_ms())),
        );
        state.counters.record_put();
        Ok(())
    }

    async fn put_null(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<()> {
        let state = self.partition(partition_key)?;
        state.entries.insert(
            fragment_hash.to_string(),
            (DictValue::Null, EntryMetadata::ok(None, 0, Self::now_ms())),
        );
        state.counters.record_put();
        Ok(())
    }

    async fn put_entry(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        ids: Vec<Identifier>,
        source_sql: &str,
    ) -> crate::Result<()> {
        let state = self.partition(partition_key)?;
        check_ids_match(partition_key, state.datatype, &ids)?;
        let mut sorted = ids;
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sorted.dedup_by(|a, b| a == b);
        let count = sorted.len() as u64;
        state.entries.insert(
            fragment_hash.to_string(),
            (
                DictValue::Set(sorted),
                EntryMetadata::ok(Some(source_sql.to_string()), count, Self::now_ms()),
            ),
        );
        state.counters.record_put();
        Ok(())
    }

    async fn put_status(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        status: EntryStatus,
        message: Option<String>,
    ) -> crate::Result<()> {
        let state = self.partition(partition_key)?;
        state.entries.insert(
            fragment_hash.to_string(),
            (
                DictValue::Null,
                EntryMetadata {
                    source_sql: None,
                    last_seen: Self::now_ms(),
                    status,
                    count: 0,
                    message,
                },
            ),
        );
        Ok(())
    }

    async fn get(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<CacheValue> {
        let state = self.partition(partition_key)?;
        let Some(entry) = state.entries.get(fragment_hash) else {
            state.counters.record_miss();
            return Ok(CacheValue::Absent);
        };
        let (value, meta) = entry.value();
        if meta.status != EntryStatus::Ok {
            state.counters.record_miss();
            return Ok(CacheValue::Absent);
        }
        state.counters.record_hit();
        Ok(match value {
            DictValue::Set(ids) => CacheValue::Set(ids.clone()),
            DictValue::Null => CacheValue::Null,
        })
    }

    async fn exists(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<bool> {
        Ok(!matches!(self.get(partition_key, fragment_hash).await?, CacheValue::Absent))
    }

    async fn delete(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<bool> {
        let state = self.partition(partition_key)?;
        let removed = state.entries.remove(fragment_hash).is_some();
        if removed {
            state.counters.record_eviction(EvictionReason::Manual);
        }
        Ok(removed)
    }

    async fn filter_existing(
        &self,
        partition_key: &str,
        fragment_hashes: &[String],
    ) -> crate::Result<Vec<String>> {
        let state = self.partition(partition_key)?;
        Ok(fragment_hashes
            .iter()
            .filter(|h| {
                state
                    .entries
                    .get(h.as_str())
                    .map(|e| e.value().1.status == EntryStatus::Ok)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn intersect(
        &self,
        partition_key: &str,
        fragment_hashes: &[String],
    ) -> crate::Result<IntersectionResult> {
        if fragment_hashes.is_empty() {
            return Ok(IntersectionResult { ids: Vec::new(), hits: 0 });
        }
        let state = self.partition(partition_key)?;
        let mut sets = Vec::new();
        for hash in fragment_hashes {
            let Some(entry) = state.entries.get(hash) else { continue };
            let (value, meta) = entry.value();
            if meta.status != EntryStatus::Ok {
                continue;
            }
            match value {
                DictValue::Null => {
                    return Ok(IntersectionResult { ids: Vec::new(), hits: fragment_hashes.len() });
                }
                DictValue::Set(ids) => sets.push(ids.clone()),
            }
        }
        let hits = sets.len();
        if hits == 0 {
            return Ok(IntersectionResult { ids: Vec::new(), hits: 0 });
        }
        Ok(IntersectionResult { ids: intersect_sorted(sets), hits })
    }

    async fn list_partitions(&self) -> crate::Result<Vec<(String, Datatype)>> {
        Ok(self.partitions.iter().map(|e| (e.key().clone(), e.value().datatype)).collect())
    }

    async fn all_keys(&self, partition_key: &str) -> crate::Result<Vec<String>> {
        let state = self.partition(partition_key)?;
        Ok(state.entries.iter().map(|e| e.key().clone()).collect())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            lazy_intersection: false,
            eviction: self.eviction_strategy.is_some(),
            datatypes: DatatypeSupport {
                integer: true,
                float: true,
                text: true,
                timestamp: true,
            },
        }
    }

    fn metrics(&self, partition_key: &str) -> CacheMetrics {
        match self.partition(partition_key) {
            Ok(state) => state.counters.snapshot(state.entries.len() as u64),
            Err(_) => CacheMetrics::default(),
        }
    }

    async fn export(&self, partition_key: &str) -> crate::Result<Vec<CacheRecord>> {
        let state = self.partition(partition_key)?;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.value().1.status == EntryStatus::Ok)
            .map(|e| {
                let (value, meta) = e.value();
                CacheRecord {
                    fragment_hash: e.key().clone(),
                    value: match value {
                        DictValue::Set(ids) => CacheRecordValue::Set(ids.clone()),
                        DictValue::Null => CacheRecordValue::Null,
                    },
                    metadata: Some(meta.clone()),
                }
            })
            .collect())
    }
}
