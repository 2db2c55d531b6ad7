//! In-process queue realization, grounded on the `DashMap`-per-row shape used
//! by [`crate::cache::backends::dict::DictStore`]. `dashmap::DashMap::try_entry`
//! stands in for the Postgres `FOR UPDATE SKIP LOCKED` primitive: if a shard
//! is already locked by a concurrent writer, the bump is reported as
//! [`PushStatus::SkippedLocked`] rather than blocking.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{FragmentItem, OriginalItem, PushStatus, Queue, QueueLengths, Which};
use crate::cache::Datatype;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct Stored<T> {
    item: T,
    seq: u64,
}

fn original_key(query_text: &str, partition_key: &str) -> String {
    format!("{query_text}\u{0}{partition_key}")
}

fn fragment_key(fragment_hash: &str, partition_key: &str) -> String {
    format!("{fragment_hash}\u{0}{partition_key}")
}

/// In-memory [`Queue`], suitable for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryQueue {
    original: DashMap<String, Stored<OriginalItem>>,
    fragment: DashMap<String, Stored<FragmentItem>>,
    seq: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn push_original(
        &self,
        query_text: &str,
        partition_key: &str,
        partition_datatype: Option<Datatype>,
        priority: i64,
    ) -> crate::Result<PushStatus> {
        let key = original_key(query_text, partition_key);
        let Some(entry) = self.original.try_entry(key) else {
            return Ok(PushStatus::SkippedLocked);
        };
        let now = now_ms();
        Ok(match entry {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                let stored = e.get_mut();
                stored.item.priority = stored.item.priority.saturating_add(priority.max(1));
                stored.item.updated_at = now;
                PushStatus::Bumped
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(Stored {
                    item: OriginalItem {
                        query_text: query_text.to_string(),
                        partition_key: partition_key.to_string(),
                        partition_datatype,
                        priority: priority.max(1),
                        created_at: now,
                        updated_at: now,
                    },
                    seq: self.next_seq(),
                });
                PushStatus::Inserted
            }
        })
    }

    async fn push_fragments(
        &self,
        items: &[(String, String)],
        partition_key: &str,
        partition_datatype: Datatype,
        priority: i64,
    ) -> crate::Result<Vec<PushStatus>> {
        let mut statuses = Vec::with_capacity(items.len());
        for (query_text, fragment_hash) in items {
            let key = fragment_key(fragment_hash, partition_key);
            let Some(entry) = self.fragment.try_entry(key) else {
                statuses.push(PushStatus::SkippedLocked);
                continue;
            };
            let now = now_ms();
            statuses.push(match entry {
                dashmap::mapref::entry::Entry::Occupied(mut e) => {
                    let stored = e.get_mut();
                    stored.item.priority = stored.item.priority.saturating_add(priority.max(1));
                    stored.item.updated_at = now;
                    PushStatus::Bumped
                }
                dashmap::mapref::entry::Entry::Vacant(e) => {
                    e.insert(Stored {
                        item: FragmentItem {
                            query_text: query_text.clone(),
                            fragment_hash: fragment_hash.clone(),
                            partition_key: partition_key.to_string(),
                            partition_datatype,
                            priority: priority.max(1),
                            created_at: now,
                            updated_at: now,
                        },
                        seq: self.next_seq(),
                    });
                    PushStatus::Inserted
                }
            });
        }
        Ok(statuses)
    }

    async fn pop_original(&self) -> crate::Result<Option<OriginalItem>> {
        let best = self
            .original
            .iter()
            .map(|e| (e.key().clone(), e.value().item.priority, e.value().item.created_at, e.value().seq))
            .max_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)).then(b.3.cmp(&a.3)));
        let Some((key, ..)) = best else { return Ok(None) };
        Ok(self.original.remove(&key).map(|(_, stored)| stored.item))
    }

    async fn pop_fragment(&self) -> crate::Result<Option<FragmentItem>> {
        let best = self
            .fragment
            .iter()
            .map(|e| (e.key().clone(), e.value().item.priority, e.value().item.created_at, e.value().seq))
            .max_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)).then(b.3.cmp(&a.3)));
        let Some((key, ..)) = best else { return Ok(None) };
        Ok(self.fragment.remove(&key).map(|(_, stored)| stored.item))
    }

    async fn lengths(&self) -> crate::Result<QueueLengths> {
        Ok(QueueLengths { original: self.original.len() as u64, fragment: self.fragment.len() as u64 })
    }

    async fn clear(&self, which: Which) -> crate::Result<()> {
        match which {
            Which::Original => self.original.clear(),
            Which::Fragment => self.fragment.clear(),
            Which::Both => {
                self.original.clear();
                self.fragment.clear();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_original_inserts_then_bumps_on_duplicate() {
        let queue = MemoryQueue::new();
        let first = queue.push_original("SELECT 1", "city_id", None, 1).await.unwrap();
        assert_eq!(first, PushStatus::Inserted);

        let second = queue.push_original("SELECT 1", "city_id", None, 2).await.unwrap();
        assert_eq!(second, PushStatus::Bumped);

        let lengths = queue.lengths().await.unwrap();
        assert_eq!(lengths.original, 1);
    }

    #[tokio::test]
    async fn pop_original_claims_highest_priority_first() {
        let queue = MemoryQueue::new();
        queue.push_original("SELECT 1", "city_id", None, 1).await.unwrap();
        queue.push_original("SELECT 2", "city_id", None, 5).await.unwrap();

        let popped = queue.pop_original().await.unwrap().unwrap();
        assert_eq!(popped.query_text, "SELECT 2");
        assert_eq!(queue.lengths().await.unwrap().original, 1);
    }

    #[tokio::test]
    async fn pop_original_is_fifo_among_equal_priority() {
        let queue = MemoryQueue::new();
        queue.push_original("SELECT 1", "city_id", None, 1).await.unwrap();
        queue.push_original("SELECT 2", "city_id", None, 1).await.unwrap();

        let popped = queue.pop_original().await.unwrap().unwrap();
        assert_eq!(popped.query_text, "SELECT 1");
    }

    #[tokio::test]
    async fn pop_on_empty_queue_returns_none() {
        let queue = MemoryQueue::new();
        assert_eq!(queue.pop_original().await.unwrap(), None);
        assert_eq!(queue.pop_fragment().await.unwrap(), None);
    }

    #[tokio::test]
    async fn push_fragments_is_unique_on_hash_and_partition_key() {
        let queue = MemoryQueue::new();
        let items = vec![("SELECT 1".to_string(), "h1".to_string()), ("SELECT 1".to_string(), "h1".to_string())];
        let statuses = queue.push_fragments(&items, "city_id", Datatype::Integer, 1).await.unwrap();
        assert_eq!(statuses, vec![PushStatus::Inserted, PushStatus::Bumped]);
        assert_eq!(queue.lengths().await.unwrap().fragment, 1);
    }

    #[tokio::test]
    async fn clear_truncates_the_requested_queue() {
        let queue = MemoryQueue::new();
        queue.push_original("SELECT 1", "city_id", None, 1).await.unwrap();
        queue
            .push_fragments(&[("SELECT 1".to_string(), "h1".to_string())], "city_id", Datatype::Integer, 1)
            .await
            .unwrap();

        queue.clear(Which::Original).await.unwrap();
        let lengths = queue.lengths().await.unwrap();
        assert_eq!(lengths.original, 0);
        assert_eq!(lengths.fragment, 1);

        queue.clear(Which::Both).await.unwrap();
        assert_eq!(queue.lengths().await.unwrap().fragment, 0);
    }
}
