// Partition-key registry: tracks each partition key's fixed datatype (I1)
// and which `(table, column)` pairs carry it, so the decomposer (C2) can
// recognize partition-key columns inside an arbitrary FROM/WHERE graph
// without being told explicitly on every call.
//
// Grounded on the teacher's catalog module: a `RwLock<HashMap<..>>` behind
// a cheaply-cloned handle, the same shape as its table/view registries,
// repurposed from SQL schema metadata to partition-key metadata.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::Datatype;
use crate::error::PartitionCacheError;

#[derive(Debug, Clone)]
struct PartitionKeyInfo {
    datatype: Datatype,
    columns: Vec<(String, String)>, // (table, column)
}

/// Registry of known partition keys and the table columns that carry them.
#[derive(Clone, Default)]
pub struct PartitionRegistry {
    keys: Arc<RwLock<HashMap<String, PartitionKeyInfo>>>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `partition_key` with `datatype` if new; fails with
    /// `DatatypeConflict` if it already exists under a different datatype (I1).
    pub fn register(&self, partition_key: &str, datatype: Datatype) -> crate::Result<()> {
        let mut keys = self.keys.write();
        match keys.get(partition_key) {
            Some(existing) if existing.datatype != datatype => {
                Err(PartitionCacheError::DatatypeConflict {
                    partition_key: partition_key.to_string(),
                    expected: existing.datatype,
                    actual: datatype,
                })
            }
            Some(_) => Ok(()),
            None => {
                keys.insert(
                    partition_key.to_string(),
                    PartitionKeyInfo { datatype, columns: Vec::new() },
                );
                Ok(())
            }
        }
    }

    /// Declares that `table.column` carries `partition_key`'s values.
    /// Idempotent: re-declaring the same mapping is a no-op.
    pub fn bind_column(&self, partition_key: &str, table: &str, column: &str) -> crate::Result<()> {
        let mut keys = self.keys.write();
        let info = keys.get_mut(partition_key).ok_or_else(|| PartitionCacheError::EntryNotFound {
            partition_key: partition_key.to_string(),
            fragment_hash: String::new(),
        })?;
        let pair = (table.to_string(), column.to_string());
        if !info.columns.contains(&pair) {
            info.columns.push(pair);
        }
        Ok(())
    }

    pub fn datatype_of(&self, partition_key: &str) -> Option<Datatype> {
        self.keys.read().get(partition_key).map(|info| info.datatype)
    }

    /// Returns the column name carrying `partition_key` in `table`, if bound.
    pub fn column_in(&self, partition_key: &str, table: &str) -> Option<String> {
        self.keys.read().get(partition_key).and_then(|info| {
            info.columns
                .iter()
                .find(|(t, _)| t == table)
                .map(|(_, c)| c.clone())
        })
    }

    /// Partition keys carried by `table`, for decomposer star-join detection
    /// (R4): a table binding more than one partition key is itself a
    /// candidate "partition-join" table.
    pub fn keys_for_table(&self, table: &str) -> Vec<String> {
        self.keys
            .read()
            .iter()
            .filter(|(_, info)| info.columns.iter().any(|(t, _)| t == table))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn list(&self) -> Vec<(String, Datatype)> {
        self.keys.read().iter().map(|(name, info)| (name.clone(), info.datatype)).collect()
    }

    pub fn drop_key(&self, partition_key: &str) -> bool {
        self.keys.write().remove(partition_key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_for_matching_datatype() {
        let reg = PartitionRegistry::new();
        reg.register("city_id", Datatype::Integer).unwrap();
        reg.register("city_id", Datatype::Integer).unwrap();
        assert_eq!(reg.datatype_of("city_id"), Some(Datatype::Integer));
    }

    #[test]
    fn register_rejects_datatype_conflict() {
        let reg = PartitionRegistry::new();
        reg.register("city_id", Datatype::Integer).unwrap();
        let err = reg.register("city_id", Datatype::Text).unwrap_err();
        assert!(matches!(err, PartitionCacheError::DatatypeConflict { .. }));
    }

    #[test]
    fn bind_column_requires_existing_key() {
        let reg = PartitionRegistry::new();
        let err = reg.bind_column("city_id", "orders", "city_id").unwrap_err();
        assert!(matches!(err, PartitionCacheError::EntryNotFound { .. }));
    }

    #[test]
    fn keys_for_table_finds_star_join_candidates() {
        let reg = PartitionRegistry::new();
        reg.register("city_id", Datatype::Integer).unwrap();
        reg.register("shop_id", Datatype::Integer).unwrap();
        reg.bind_column("city_id", "shops", "city_id").unwrap();
        reg.bind_column("shop_id", "shops", "id").unwrap();

        let mut keys = reg.keys_for_table("shops");
        keys.sort();
        assert_eq!(keys, vec!["city_id".to_string(), "shop_id".to_string()]);
    }
}
