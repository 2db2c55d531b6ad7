// Sorted-array back-end (§4.3 family (a)).
//
// One physical container per partition key; each entry's value is a
// deduplicated sorted sequence of identifiers. Intersection is a multi-way
// merge over the smallest pair first. Grounded on the teacher's DashMap
// concurrency pattern (sharded locking in place of a single global
// `Arc<RwLock<HashMap>>`).

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use super::{check_datatype, check_ids_match, intersect_sorted};
use crate::cache::{
    CacheMetrics, CacheStore, CacheValue, Capabilities, DatatypeSupport, Datatype, EntryMetadata,
    EntryStatus, Identifier, IntersectionResult,
};
use crate::cache::stats::{CacheCounters, EvictionReason};
use crate::error::PartitionCacheError;

#[derive(Clone)]
enum StoredValue {
    Set(Vec<Identifier>),
    Null,
}

struct PartitionState {
    datatype: Datatype,
    entries: DashMap<String, (StoredValue, EntryMetadata)>,
    counters: CacheCounters,
}

/// In-memory sorted-array cache store. One [`PartitionState`] per partition
/// key, sharded entries keyed by fragment hash.
#[derive(Default, Clone)]
pub struct SortedArrayStore {
    partitions: Arc<DashMap<String, Arc<RwLock<PartitionState>>>>,
}

impl SortedArrayStore {
    pub fn new() -> Self {
        Self {
            partitions: Arc::new(DashMap::new()),
        }
    }

    fn partition(&self, partition_key: &str) -> Option<Arc<RwLock<PartitionState>>> {
        self.partitions.get(partition_key).map(|e| e.clone())
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn sorted_dedup(mut ids: Vec<Identifier>) -> Vec<Identifier> {
        ids.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        ids.dedup_by(|a, b| a == b);
        ids
    }
}

#[async_trait]
impl CacheStore for SortedArrayStore {
    async fn register_partition(&self, partition_key: &str, datatype: Datatype) -> crate::Result<()> {
        if let Some(existing) = self.partitions.get(partition_key) {
            let state = existing.read();
            return check_datatype(partition_key, state.datatype, datatype);
        }
        self.partitions.insert(
            partition_key.to_string(),
            Arc::new(RwLock::new(PartitionState {
                datatype,
                entries: DashMap::new(),
                counters: CacheCounters::new(),
            })),
        );
        Ok(())
    }

    async fn put_set(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        ids: Vec<Identifier>,
    ) -> crate::Result<()> {
        let partition = self
            .partition(partition_key)
            .ok_or_else(|| PartitionCacheError::EntryNotFound {
                partition_key: partition_key.to_string(),
                fragment_hash: fragment_hash.to_string(),
            })?;
        let state = partition.read();
        check_ids_match(partition_key, state.datatype, &ids)?;
        let sorted = Self::sorted_dedup(ids);
        let count = sorted.len() as u64;
        state.entries.insert(
            fragment_hash.to_string(),
            (StoredValue::Set(sorted), EntryMetadata::ok(None, count, Self::now_ms())),
        );
        state.counters.record_put();
        Ok(())
    }

    async fn put_null(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<()> {
        let partition = self
            .partition(partition_key)
            .ok_or_else(|| PartitionCacheError::EntryNotFound {
                partition_key: partition_key.to_string(),
                fragment_hash: fragment_hash.to_string(),
            })?;
        let state = partition.read();
        state.entries.insert(
            fragment_hash.to_string(),
            (StoredValue::Null, EntryMetadata::ok(None, 0, Self::now_ms())),
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
        let partition = self
            .partition(partition_key)
            .ok_or_else(|| PartitionCacheError::EntryNotFound {
                partition_key: partition_key.to_string(),
                fragment_hash: fragment_hash.to_string(),
            })?;
        let state = partition.read();
        check_ids_match(partition_key, state.datatype, &ids)?;
        let sorted = Self::sorted_dedup(ids);
        let count = sorted.len() as u64;
        state.entries.insert(
            fragment_hash.to_string(),
            (
                StoredValue::Set(sorted),
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
        let partition = self
            .partition(partition_key)
            .ok_or_else(|| PartitionCacheError::EntryNotFound {
                partition_key: partition_key.to_string(),
                fragment_hash: fragment_hash.to_string(),
            })?;
        let state = partition.read();
        // I5: failed/timeout entries are preserved, never silently replaced
        // with a value; only the status bookkeeping changes.
        state.entries.insert(
            fragment_hash.to_string(),
            (
                StoredValue::Null,
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
        let Some(partition) = self.partition(partition_key) else {
            return Ok(CacheValue::Absent);
        };
        let state = partition.read();
        let result = match state.entries.get(fragment_hash) {
            None => {
                state.counters.record_miss();
                Ok(CacheValue::Absent)
            }
            Some(entry) => {
                let (value, meta) = entry.value();
                // Open Question #3: `status=limit` (and failed/timeout) read
                // back as a miss, not as Null — only `Ok` entries resolve to
                // a real value. See SPEC_FULL.md §D.
                if meta.status != EntryStatus::Ok {
                    state.counters.record_miss();
                    return Ok(CacheValue::Absent);
                }
                state.counters.record_hit();
                Ok(match value {
                    StoredValue::Set(ids) => CacheValue::Set(ids.clone()),
                    StoredValue::Null => CacheValue::Null,
                })
            }
        };
        result
    }

    async fn exists(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<bool> {
        Ok(!matches!(
            self.get(partition_key, fragment_hash).await?,
            CacheValue::Absent
        ))
    }

    async fn delete(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<bool> {
        let Some(partition) = self.partition(partition_key) else {
            return Ok(false);
        };
        let state = partition.read();
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
        let mut out = Vec::new();
        for h in fragment_hashes {
            if self.exists(partition_key, h).await? {
                out.push(h.clone());
            }
        }
        Ok(out)
    }

    async fn intersect(
        &self,
        partition_key: &str,
        fragment_hashes: &[String],
    ) -> crate::Result<IntersectionResult> {
        if fragment_hashes.is_empty() {
            return Ok(IntersectionResult { ids: Vec::new(), hits: 0 });
        }
        let mut sets = Vec::new();
        let mut hits = 0usize;
        for h in fragment_hashes {
            match self.get(partition_key, h).await? {
                CacheValue::Absent => continue,
                CacheValue::Null => {
                    hits += 1;
                    // a null fragment contributes the empty set, excluding
                    // the partition key from the final intersection
                    return Ok(IntersectionResult { ids: Vec::new(), hits: fragment_hashes.len() });
                }
                CacheValue::Set(ids) => {
                    hits += 1;
                    sets.push(ids);
                }
            }
        }
        if hits == 0 {
            return Ok(IntersectionResult { ids: Vec::new(), hits: 0 });
        }
        Ok(IntersectionResult {
            ids: intersect_sorted(sets),
            hits,
        })
    }

    async fn list_partitions(&self) -> crate::Result<Vec<(String, Datatype)>> {
        Ok(self
            .partitions
            .iter()
            .map(|e| (e.key().clone(), e.value().read().datatype))
            .collect())
    }

    async fn all_keys(&self, partition_key: &str) -> crate::Result<Vec<String>> {
        let Some(partition) = self.partition(partition_key) else {
            return Ok(Vec::new());
        };
        let state = partition.read();
        Ok(state.entries.iter().map(|e| e.key().clone()).collect())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            lazy_intersection: false,
            eviction: true,
            datatypes: DatatypeSupport::default(),
        }
    }

    fn metrics(&self, partition_key: &str) -> CacheMetrics {
        match self.partition(partition_key) {
            Some(p) => {
                let state = p.read();
                state.counters.snapshot(state.entries.len() as u64)
            }
            None => CacheMetrics::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_partition() -> SortedArrayStore {
        let store = SortedArrayStore::new();
        store.register_partition("city_id", Datatype::Integer).await.unwrap();
        store
    }

    #[tokio::test]
    async fn register_partition_is_idempotent() {
        let store = store_with_partition().await;
        assert!(store.register_partition("city_id", Datatype::Integer).await.is_ok());
    }

    #[tokio::test]
    async fn register_partition_rejects_datatype_conflict() {
        let store = store_with_partition().await;
        let err = store.register_partition("city_id", Datatype::Text).await.unwrap_err();
        assert!(matches!(err, PartitionCacheError::DatatypeConflict { .. }));
    }

    #[tokio::test]
    async fn put_set_rejects_wrong_datatype_ids() {
        let store = store_with_partition().await;
        let err = store
            .put_set("city_id", "h1", vec![Identifier::Text("NYC".into())])
            .await
            .unwrap_err();
        assert!(matches!(err, PartitionCacheError::DatatypeConflict { .. }));
    }

    #[tokio::test]
    async fn put_then_get_round_trips_sorted_deduped_set() {
        let store = store_with_partition().await;
        store
            .put_set(
                "city_id",
                "h1",
                vec![Identifier::Integer(5), Identifier::Integer(1), Identifier::Integer(1)],
            )
            .await
            .unwrap();
        let value = store.get("city_id", "h1").await.unwrap();
        assert_eq!(value, CacheValue::Set(vec![Identifier::Integer(1), Identifier::Integer(5)]));
    }

    #[tokio::test]
    async fn null_is_distinct_from_absent_and_empty_set() {
        let store = store_with_partition().await;
        store.put_null("city_id", "h1").await.unwrap();
        store.put_set("city_id", "h2", Vec::new()).await.unwrap();

        assert_eq!(store.get("city_id", "h1").await.unwrap(), CacheValue::Null);
        assert_eq!(store.get("city_id", "h2").await.unwrap(), CacheValue::Set(Vec::new()));
        assert_eq!(store.get("city_id", "h3").await.unwrap(), CacheValue::Absent);
    }

    #[tokio::test]
    async fn intersect_of_empty_hash_set_is_empty_with_zero_hits() {
        let store = store_with_partition().await;
        let result = store.intersect("city_id", &[]).await.unwrap();
        assert_eq!(result, IntersectionResult { ids: Vec::new(), hits: 0 });
    }

    #[tokio::test]
    async fn intersect_two_overlapping_fragments() {
        let store = store_with_partition().await;
        store
            .put_set("city_id", "f1", (1..=5).map(Identifier::Integer).collect())
            .await
            .unwrap();
        store
            .put_set("city_id", "f2", (3..=7).map(Identifier::Integer).collect())
            .await
            .unwrap();
        let result = store
            .intersect("city_id", &["f1".into(), "f2".into()])
            .await
            .unwrap();
        assert_eq!(
            result.ids,
            vec![Identifier::Integer(3), Identifier::Integer(4), Identifier::Integer(5)]
        );
        assert_eq!(result.hits, 2);
    }

    #[tokio::test]
    async fn limit_status_reads_back_as_absent_not_null() {
        let store = store_with_partition().await;
        store
            .put_status("city_id", "h1", EntryStatus::Limit, Some("too many rows".into()))
            .await
            .unwrap();
        assert_eq!(store.get("city_id", "h1").await.unwrap(), CacheValue::Absent);
    }

    #[tokio::test]
    async fn export_import_round_trips_through_a_fresh_store() {
        let store = store_with_partition().await;
        store
            .put_set("city_id", "f1", vec![Identifier::Integer(1), Identifier::Integer(2)])
            .await
            .unwrap();
        store.put_null("city_id", "f2").await.unwrap();

        let exported = store.export("city_id").await.unwrap();

        let fresh = store_with_partition().await;
        fresh.import("city_id", exported).await.unwrap();

        assert_eq!(
            fresh.get("city_id", "f1").await.unwrap(),
            CacheValue::Set(vec![Identifier::Integer(1), Identifier::Integer(2)])
        );
        assert_eq!(fresh.get("city_id", "f2").await.unwrap(), CacheValue::Null);
    }
}
