// Fixed-width bitstring back-end (§4.3 family (b)).
//
// Only for `integer` partition keys. One physical container per partition
// key with a width `W` in its metadata; identifier `id` is represented by
// setting bit `id` in a `Vec<u64>` word array. Intersection is bitwise AND,
// cardinality is popcount. A width change re-encodes every entry under a
// writer barrier before any read sees the new width (I6, P9).

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::cache::{
    CacheMetrics, CacheStore, CacheValue, Capabilities, DatatypeSupport, Datatype, EntryMetadata,
    EntryStatus, Identifier, IntersectionResult,
};
use crate::cache::stats::{CacheCounters, EvictionReason};
use crate::error::PartitionCacheError;

const WORD_BITS: u32 = 64;

#[derive(Clone)]
struct Bits {
    words: Vec<u64>,
}

impl Bits {
    fn new(width: u32) -> Self {
        Self {
            words: vec![0u64; words_for(width)],
        }
    }

    fn set(&mut self, id: u32) {
        let (w, b) = (id / WORD_BITS, id % WORD_BITS);
        self.words[w as usize] |= 1u64 << b;
    }

    fn and(&self, other: &Self) -> Self {
        let len = self.words.len().max(other.words.len());
        let mut words = vec![0u64; len];
        for i in 0..len {
            let a = self.words.get(i).copied().unwrap_or(0);
            let b = other.words.get(i).copied().unwrap_or(0);
            words[i] = a & b;
        }
        Self { words }
    }

    fn popcount(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    fn to_ids(&self) -> Vec<Identifier> {
        let mut out = Vec::new();
        for (w, word) in self.words.iter().enumerate() {
            if *word == 0 {
                continue;
            }
            for b in 0..WORD_BITS {
                if word & (1u64 << b) != 0 {
                    out.push(Identifier::Integer((w as u32 * WORD_BITS + b) as i64));
                }
            }
        }
        out
    }

    fn reencode(&self, new_width: u32) -> Self {
        let mut new_bits = Bits::new(new_width);
        for id in self.to_ids() {
            if let Some(v) = id.as_integer() {
                new_bits.set(v as u32);
            }
        }
        new_bits
    }
}

fn words_for(width: u32) -> usize {
    ((width as usize) + WORD_BITS as usize - 1) / WORD_BITS as usize
}

struct PartitionState {
    width: u32,
    entries: DashMap<String, (Option<Bits>, EntryMetadata)>, // None == Null-marker
    counters: CacheCounters,
}

/// In-memory fixed-width bitstring cache store.
#[derive(Clone)]
pub struct BitstringStore {
    default_width: u32,
    partitions: Arc<DashMap<String, Arc<RwLock<PartitionState>>>>,
}

impl BitstringStore {
    pub fn new(default_width: u32) -> Self {
        Self {
            default_width,
            partitions: Arc::new(DashMap::new()),
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn partition(&self, partition_key: &str) -> Option<Arc<RwLock<PartitionState>>> {
        self.partitions.get(partition_key).map(|e| e.clone())
    }

    /// Atomically re-encodes every entry for `partition_key` under `new_width`.
    /// Holds the write lock for the partition's whole duration (I6): no
    /// reader observes a half-migrated partition.
    pub async fn set_width(&self, partition_key: &str, new_width: u32) -> crate::Result<()> {
        let Some(partition) = self.partition(partition_key) else {
            return Err(PartitionCacheError::EntryNotFound {
                partition_key: partition_key.to_string(),
                fragment_hash: String::new(),
            });
        };
        let mut state = partition.write();
        if state.width == new_width {
            return Ok(());
        }
        let reencoded: Vec<(String, (Option<Bits>, EntryMetadata))> = state
            .entries
            .iter()
            .map(|e| {
                let (bits, meta) = e.value();
                (e.key().clone(), (bits.as_ref().map(|b| b.reencode(new_width)), meta.clone()))
            })
            .collect();
        state.entries.clear();
        for (k, v) in reencoded {
            state.entries.insert(k, v);
        }
        state.width = new_width;
        Ok(())
    }

    pub fn width(&self, partition_key: &str) -> Option<u32> {
        self.partition(partition_key).map(|p| p.read().width)
    }
}

#[async_trait]
impl CacheStore for BitstringStore {
    async fn register_partition(&self, partition_key: &str, datatype: Datatype) -> crate::Result<()> {
        if datatype != Datatype::Integer {
            return Err(PartitionCacheError::DatatypeConflict {
                partition_key: partition_key.to_string(),
                expected: Datatype::Integer,
                actual: datatype,
            });
        }
        if let Some(existing) = self.partitions.get(partition_key) {
            let _ = existing.read();
            return Ok(());
        }
        self.partitions.insert(
            partition_key.to_string(),
            Arc::new(RwLock::new(PartitionState {
                width: self.default_width,
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
        let Some(partition) = self.partition(partition_key) else {
            return Err(PartitionCacheError::EntryNotFound {
                partition_key: partition_key.to_string(),
                fragment_hash: fragment_hash.to_string(),
            });
        };
        let state = partition.read();
        let mut bits = Bits::new(state.width);
        for id in &ids {
            let v = id.as_integer().ok_or_else(|| PartitionCacheError::DatatypeConflict {
                partition_key: partition_key.to_string(),
                expected: Datatype::Integer,
                actual: id.datatype(),
            })?;
            if v < 0 || v as u64 >= state.width as u64 {
                return Err(PartitionCacheError::BitRangeError { id: v, width: state.width });
            }
            bits.set(v as u32);
        }
        let count = bits.popcount();
        state.entries.insert(
            fragment_hash.to_string(),
            (Some(bits), EntryMetadata::ok(None, count, Self::now_ms())),
        );
        state.counters.record_put();
        Ok(())
    }

    async fn put_null(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<()> {
        let Some(partition) = self.partition(partition_key) else {
            return Err(PartitionCacheError::EntryNotFound {
                partition_key: partition_key.to_string(),
                fragment_hash: fragment_hash.to_string(),
            });
        };
        let state = partition.read();
        state.entries.insert(
            fragment_hash.to_string(),
            (None, EntryMetadata::ok(None, 0, Self::now_ms())),
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
        self.put_set(partition_key, fragment_hash, ids).await?;
        if let Some(partition) = self.partition(partition_key) {
            let state = partition.read();
            if let Some(mut entry) = state.entries.get_mut(fragment_hash) {
                entry.1.source_sql = Some(source_sql.to_string());
            };
        }
        Ok(())
    }

    async fn put_status(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        status: EntryStatus,
        message: Option<String>,
    ) -> crate::Result<()> {
        let Some(partition) = self.partition(partition_key) else {
            return Err(PartitionCacheError::EntryNotFound {
                partition_key: partition_key.to_string(),
                fragment_hash: fragment_hash.to_string(),
            });
        };
        let state = partition.read();
        state.entries.insert(
            fragment_hash.to_string(),
            (
                None,
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
                let (bits, meta) = entry.value();
                if meta.status != EntryStatus::Ok {
                    state.counters.record_miss();
                    return Ok(CacheValue::Absent);
                }
                state.counters.record_hit();
                Ok(match bits {
                    Some(b) => CacheValue::Set(b.to_ids()),
                    None => CacheValue::Null,
                })
            }
        };
        result
    }

    async fn exists(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<bool> {
        Ok(!matches!(self.get(partition_key, fragment_hash).await?, CacheValue::Absent))
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
        let Some(partition) = self.partition(partition_key) else {
            return Ok(IntersectionResult { ids: Vec::new(), hits: 0 });
        };
        let state = partition.read();
        let mut acc: Option<Bits> = None;
        let mut hits = 0usize;
        for h in fragment_hashes {
            let Some(entry) = state.entries.get(h) else { continue };
            let (bits, meta) = entry.value();
            if meta.status != EntryStatus::Ok {
                continue;
            }
            hits += 1;
            match bits {
                None => {
                    // null fragment: contributes nothing, but the whole
                    // intersection counts every requested hash as a hit.
                    return Ok(IntersectionResult { ids: Vec::new(), hits: fragment_hashes.len() });
                }
                Some(b) => {
                    acc = Some(match acc {
                        Some(a) => a.and(b),
                        None => b.clone(),
                    });
                }
            }
        }
        match acc {
            Some(bits) if hits > 0 => Ok(IntersectionResult { ids: bits.to_ids(), hits }),
            _ => Ok(IntersectionResult { ids: Vec::new(), hits: 0 }),
        }
    }

    async fn list_partitions(&self) -> crate::Result<Vec<(String, Datatype)>> {
        Ok(self.partitions.iter().map(|e| (e.key().clone(), Datatype::Integer)).collect())
    }

    async fn all_keys(&self, partition_key: &str) -> crate::Result<Vec<String>> {
        let Some(partition) = self.partition(partition_key) else {
            return Ok(Vec::new());
        };
        let keys: Vec<String> = partition.read().entries.iter().map(|e| e.key().clone()).collect();
        Ok(keys)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            lazy_intersection: false,
            eviction: true,
            datatypes: DatatypeSupport {
                integer: true,
                float: false,
                text: false,
                timestamp: false,
            },
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

    #[tokio::test]
    async fn rejects_non_integer_partition() {
        let store = BitstringStore::new(64);
        let err = store.register_partition("p", Datatype::Text).await.unwrap_err();
        assert!(matches!(err, PartitionCacheError::DatatypeConflict { .. }));
    }

    #[tokio::test]
    async fn id_at_width_minus_one_is_storable_but_width_fails() {
        let store = BitstringStore::new(8);
        store.register_partition("p", Datatype::Integer).await.unwrap();
        store.put_set("p", "h", vec![Identifier::Integer(7)]).await.unwrap();
        let err = store.put_set("p", "h2", vec![Identifier::Integer(8)]).await.unwrap_err();
        assert!(matches!(err, PartitionCacheError::BitRangeError { id: 8, width: 8 }));
    }

    #[tokio::test]
    async fn and_intersection_and_popcount() {
        let store = BitstringStore::new(16);
        store.register_partition("p", Datatype::Integer).await.unwrap();
        store
            .put_set("p", "f1", vec![1, 2, 3].into_iter().map(Identifier::Integer).collect())
            .await
            .unwrap();
        store
            .put_set("p", "f2", vec![2, 3, 4].into_iter().map(Identifier::Integer).collect())
            .await
            .unwrap();
        let result = store.intersect("p", &["f1".into(), "f2".into()]).await.unwrap();
        assert_eq!(result.ids, vec![Identifier::Integer(2), Identifier::Integer(3)]);
    }

    #[tokio::test]
    async fn width_change_reencodes_atomically_preserving_logical_set() {
        let store = BitstringStore::new(8);
        store.register_partition("p", Datatype::Integer).await.unwrap();
        store
            .put_set("p", "f1", vec![1, 6].into_iter().map(Identifier::Integer).collect())
            .await
            .unwrap();

        let before = store.get("p", "f1").await.unwrap();
        store.set_width("p", 32).await.unwrap();
        let after = store.get("p", "f1").await.unwrap();

        assert_eq!(before, after);
        assert_eq!(store.width("p"), Some(32));
    }
}
