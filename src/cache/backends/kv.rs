// External key-value set/bitmap back-end (§4.3 family (d), §6 namespacing).
//
// Same abstract contract, backed by any key-value store that can hold raw
// bytes under a string key — a distributed cache client or an embedded KV
// in a real deployment. The trait boundary here is exactly where the
// out-of-scope external collaborator (spec §1 "External queue/eviction
// schedulers" sibling) plugs in; [`MemoryKv`] is the in-process stand-in
// used by tests and by the default configuration.
//
// Namespacing follows §6 literally: `{prefix}:{partition_key}:{fragment_hash}`
// for data, `{prefix}:_meta:{partition_key}` for datatype metadata. Only
// `integer` and `text` partition keys are supported, per the family (d)
// capability matrix.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cache::{
    CacheMetrics, CacheStore, CacheValue, Capabilities, DatatypeSupport, Datatype, EntryMetadata,
    EntryStatus, Identifier, IntersectionResult,
};
use crate::cache::backends::{check_datatype, check_ids_match, intersect_sorted};
use crate::cache::stats::{CacheCounters, EvictionReason};
use crate::error::PartitionCacheError;

/// Minimal raw byte store a real external cache client implements.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> crate::Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> crate::Result<()>;
    async fn delete(&self, key: &str) -> crate::Result<bool>;
    /// Lists keys under a prefix; real clients implement this with a scan
    /// cursor, in-process ones with a plain filter.
    async fn keys_with_prefix(&self, prefix: &str) -> crate::Result<Vec<String>>;
}

/// In-process `KvBackend`, the default when no external cache is configured.
#[derive(Default, Clone)]
pub struct MemoryKv {
    data: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> crate::Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).map(|e| e.value().clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> crate::Result<()> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> crate::Result<bool> {
        Ok(self.data.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> crate::Result<Vec<String>> {
        Ok(self
            .data
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireValue {
    Set(Vec<Identifier>),
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEntry {
    value: WireValue,
    metadata: EntryMetadata,
}

/// External KV-backed cache store, namespaced per §6.
pub struct KvSetStore<B: KvBackend> {
    prefix: String,
    backend: B,
    counters: DashMap<String, Arc<CacheCounters>>,
}

impl<B: KvBackend> KvSetStore<B> {
    pub fn new(prefix: impl Into<String>, backend: B) -> Self {
        Self {
            prefix: prefix.into(),
            backend,
            counters: DashMap::new(),
        }
    }

    fn data_key(&self, partition_key: &str, fragment_hash: &str) -> String {
        format!("{}:{}:{}", self.prefix, partition_key, fragment_hash)
    }

    fn meta_key(&self, partition_key: &str) -> String {
        format!("{}:_meta:{}", self.prefix, partition_key)
    }

    fn meta_prefix(&self) -> String {
        format!("{}:_meta:", self.prefix)
    }

    fn data_prefix(&self, partition_key: &str) -> String {
        format!("{}:{}:", self.prefix, partition_key)
    }

    fn counters(&self, partition_key: &str) -> Arc<CacheCounters> {
        self.counters
            .entry(partition_key.to_string())
            .or_insert_with(|| Arc::new(CacheCounters::new()))
            .clone()
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[async_trait]
impl<B: KvBackend> CacheStore for KvSetStore<B> {
    async fn register_partition(&self, partition_key: &str, datatype: Datatype) -> crate::Result<()> {
        if !matches!(datatype, Datatype::Integer | Datatype::Text) {
            return Err(PartitionCacheError::DatatypeConflict {
                partition_key: partition_key.to_string(),
                expected: Datatype::Integer,
                actual: datatype,
            });
        }
        let key = self.meta_key(partition_key);
        if let Some(bytes) = self.backend.get(&key).await? {
            let existing: Datatype = serde_json::from_slice(&bytes)?;
            return check_datatype(partition_key, existing, datatype);
        }
        self.backend.set(&key, serde_json::to_vec(&datatype)?).await
    }

    async fn put_set(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        ids: Vec<Identifier>,
    ) -> crate::Result<()> {
        let datatype = self.partition_datatype(partition_key).await?;
        check_ids_match(partition_key, datatype, &ids)?;
        let mut sorted = ids;
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sorted.dedup_by(|a, b| a == b);
        let count = sorted.len() as u64;
        let entry = WireEntry {
            value: WireValue::Set(sorted),
            metadata: EntryMetadata::ok(None, count, Self::now_ms()),
        };
        self.backend
            .set(&self.data_key(partition_key, fragment_hash), serde_json::to_vec(&entry)?)
            .await?;
        self.counters(partition_key).record_put();
        Ok(())
    }

    async fn put_null(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<()> {
        let entry = WireEntry {
            value: WireValue::Null,
            metadata: EntryMetadata::ok(None, 0, Self::now_ms()),
        };
        self.backend
            .set(&self.data_key(partition_key, fragment_hash), serde_json::to_vec(&entry)?)
            .await?;
        self.counters(partition_key).record_put();
        Ok(())
    }

    async fn put_entry(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        ids: Vec<Identifier>,
        source_sql: &str,
    ) -> crate::Result<()> {
        let datatype = self.partition_datatype(partition_key).await?;
        check_ids_match(partition_key, datatype, &ids)?;
        let mut sorted = ids;
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sorted.dedup_by(|a, b| a == b);
        let count = sorted.len() as u64;
        let entry = WireEntry {
            value: WireValue::Set(sorted),
            metadata: EntryMetadata::ok(Some(source_sql.to_string()), count, Self::now_ms()),
        };
        self.backend
            .set(&self.data_key(partition_key, fragment_hash), serde_json::to_vec(&entry)?)
            .await?;
        self.counters(partition_key).record_put();
        Ok(())
    }

    async fn put_status(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        status: EntryStatus,
        message: Option<String>,
    ) -> crate::Result<()> {
        let entry = WireEntry {
            value: WireValue::Null,
            metadata: EntryMetadata {
                source_sql: None,
                last_seen: Self::now_ms(),
                status,
                count: 0,
                message,
            },
        };
        self.backend
            .set(&self.data_key(partition_key, fragment_hash), serde_json::to_vec(&entry)?)
            .await
    }

    async fn get(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<CacheValue> {
        let counters = self.counters(partition_key);
        let Some(bytes) = self.backend.get(&self.data_key(partition_key, fragment_hash)).await? else {
            counters.record_miss();
            return Ok(CacheValue::Absent);
        };
        let entry: WireEntry = serde_json::from_slice(&bytes)?;
        if entry.metadata.status != EntryStatus::Ok {
            counters.record_miss();
            return Ok(CacheValue::Absent);
        }
        counters.record_hit();
        Ok(match entry.value {
            WireValue::Set(ids) => CacheValue::Set(ids),
            WireValue::Null => CacheValue::Null,
        })
    }

    async fn exists(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<bool> {
        Ok(!matches!(self.get(partition_key, fragment_hash).await?, CacheValue::Absent))
    }

    async fn delete(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<bool> {
        let removed = self.backend.delete(&self.data_key(partition_key, fragment_hash)).await?;
        if removed {
            self.counters(partition_key).record_eviction(EvictionReason::Manual);
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
                CacheValue::Null => return Ok(IntersectionResult { ids: Vec::new(), hits: fragment_hashes.len() }),
                CacheValue::Set(ids) => {
                    hits += 1;
                    sets.push(ids);
                }
            }
        }
        if hits == 0 {
            return Ok(IntersectionResult { ids: Vec::new(), hits: 0 });
        }
        Ok(IntersectionResult { ids: intersect_sorted(sets), hits })
    }

    async fn list_partitions(&self) -> crate::Result<Vec<(String, Datatype)>> {
        let mut out = Vec::new();
        for key in self.backend.keys_with_prefix(&self.meta_prefix()).await? {
            let Some(name) = key.strip_prefix(&self.meta_prefix()) else { continue };
            if let Some(bytes) = self.backend.get(&key).await? {
                let datatype: Datatype = serde_json::from_slice(&bytes)?;
                out.push((name.to_string(), datatype));
            }
        }
        Ok(out)
    }

    async fn all_keys(&self, partition_key: &str) -> crate::Result<Vec<String>> {
        let prefix = self.data_prefix(partition_key);
        Ok(self
            .backend
            .keys_with_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(|s| s.to_string()))
            .collect())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            lazy_intersection: false,
            eviction: false,
            datatypes: DatatypeSupport {
                integer: true,
                float: false,
                text: true,
                timestamp: false,
            },
        }
    }

    fn metrics(&self, partition_key: &str) -> CacheMetrics {
        self.counters(partition_key).snapshot(0)
    }
}

impl<B: KvBackend> KvSetStore<B> {
    async fn partition_datatype(&self, partition_key: &str) -> crate::Result<Datatype> {
        let key = self.meta_key(partition_key);
        match self.backend.get(&key).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(PartitionCacheError::EntryNotFound {
                partition_key: partition_key.to_string(),
                fragment_hash: String::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> KvSetStore<MemoryKv> {
        KvSetStore::new("pc", MemoryKv::new())
    }

    #[tokio::test]
    async fn namespacing_matches_spec_format() {
        let store = store();
        store.register_partition("city_id", Datatype::Integer).await.unwrap();
        store.put_set("city_id", "abc123", vec![Identifier::Integer(1)]).await.unwrap();

        assert!(store
            .backend
            .get("pc:_meta:city_id")
            .await
            .unwrap()
            .is_some());
        assert!(store.backend.get("pc:city_id:abc123").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rejects_float_partition() {
        let store = store();
        let err = store.register_partition("p", Datatype::Float).await.unwrap_err();
        assert!(matches!(err, PartitionCacheError::DatatypeConflict { .. }));
    }

    #[tokio::test]
    async fn text_identifiers_round_trip() {
        let store = store();
        store.register_partition("region", Datatype::Text).await.unwrap();
        store
            .put_set("region", "h1", vec![Identifier::Text("eu-west".into())])
            .await
            .unwrap();
        assert_eq!(
            store.get("region", "h1").await.unwrap(),
            CacheValue::Set(vec![Identifier::Text("eu-west".into())])
        );
    }
}
