//! Processor Pool (C7), §4.7: decomposer workers turn OriginalQueue items
//! into FragmentQueue items via the Query Decomposer (C2); executor workers
//! pop FragmentQueue items, run them against the caller's dataset, and write
//! the result into the Cache Store (C3).
//!
//! The at-most-one-in-flight bookkeeping ([`ActiveJobTracker`]) is the same
//! deadline-table shape as the teacher's
//! `transaction::timeout::TimeoutManager`: a map from key to deadline,
//! guarded by `parking_lot::RwLock`, with a sweep that returns everything
//! past its deadline.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::cache::{CacheStore, Datatype, EntryStatus, Identifier};
use crate::catalog::PartitionRegistry;
use crate::decompose::{DecomposerConfig, QueryDecomposer};
use crate::queue::Queue;

/// One in-flight fragment execution (§3 `ActiveJob`).
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub worker_id: String,
    pub started_at: i64,
}

fn active_job_key(fragment_hash: &str, partition_key: &str) -> String {
    format!("{fragment_hash}\u{0}{partition_key}")
}

/// Enforces I3 (at-most-one-in-flight per (fragment_hash, partition_key))
/// and recovers jobs whose worker never reported back, grounded on
/// `transaction::timeout::TimeoutManager`'s deadline-table shape.
#[derive(Default)]
pub struct ActiveJobTracker {
    jobs: RwLock<HashMap<String, (ActiveJob, i64)>>, // key -> (job, deadline_ms)
}

impl ActiveJobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to claim `(fragment_hash, partition_key)`. Returns `false`
    /// (I3 violation avoided) if a job is already active for that key.
    pub fn try_start(&self, fragment_hash: &str, partition_key: &str, worker_id: &str, timeout: Duration) -> bool {
        let key = active_job_key(fragment_hash, partition_key);
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&key) {
            return false;
        }
        let now = now_ms();
        jobs.insert(
            key,
            (ActiveJob { worker_id: worker_id.to_string(), started_at: now }, now + timeout.as_millis() as i64),
        );
        true
    }

    pub fn finish(&self, fragment_hash: &str, partition_key: &str) {
        self.jobs.write().remove(&active_job_key(fragment_hash, partition_key));
    }

    pub fn active_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Returns `(fragment_hash, partition_key)` pairs whose deadline has
    /// passed, removing them so the caller can restore the FragmentQueue
    /// item and log a timeout status (§4.7 "Timeouts and recovery").
    pub fn sweep_expired(&self) -> Vec<(String, String)> {
        let now = now_ms();
        let mut jobs = self.jobs.write();
        let expired: Vec<String> =
            jobs.iter().filter(|(_, (_, deadline))| now > *deadline).map(|(k, _)| k.clone()).collect();
        expired
            .iter()
            .filter_map(|k| {
                jobs.remove(k);
                k.split_once('\u{0}').map(|(hash, pk)| (hash.to_string(), pk.to_string()))
            })
            .collect()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Executes a fragment's SQL against the caller's own dataset database and
/// returns the matched partition identifiers. Intentionally abstract: this
/// crate owns caching, not the dataset connection.
#[async_trait]
pub trait FragmentExecutor: Send + Sync {
    async fn execute(&self, fragment_sql: &str, partition_key: &str) -> crate::Result<Vec<Identifier>>;
}

/// Tuning knobs for the pool (mirrors §3 `ProcessorConfig`).
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub max_parallel_jobs: usize,
    pub fragment_timeout: Duration,
    pub row_limit: Option<u64>,
    pub worker_id: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 4,
            fragment_timeout: Duration::from_secs(30),
            row_limit: None,
            worker_id: "worker-0".to_string(),
        }
    }
}

/// Outcome of processing a single fragment, matching §4.7's outcome table
/// one-to-one, used by tests and callers that want to observe what happened
/// beyond the cache/queue side effects.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentOutcome {
    RowsFound(usize),
    NoRows,
    OverLimit(u64),
    Timeout,
    Failed(String),
}

/// C7: pairs a [`Queue`] and a [`CacheStore`] with the workers that move
/// items from one to the other.
pub struct ProcessorPool<Q: Queue, S: CacheStore> {
    queue: Arc<Q>,
    store: Arc<S>,
    registry: PartitionRegistry,
    decomposer: QueryDecomposer,
    executor: Arc<dyn FragmentExecutor>,
    active_jobs: Arc<ActiveJobTracker>,
    config: ProcessorConfig,
    in_flight: Arc<Semaphore>,
    processed: AtomicUsize,
}

impl<Q: Queue, S: CacheStore> ProcessorPool<Q, S> {
    pub fn new(
        queue: Arc<Q>,
        store: Arc<S>,
        registry: PartitionRegistry,
        decomposer: QueryDecomposer,
        executor: Arc<dyn FragmentExecutor>,
        config: ProcessorConfig,
    ) -> Self {
        let permits = config.max_parallel_jobs.max(1);
        Self {
            queue,
            store,
            registry,
            decomposer,
            executor,
            active_jobs: Arc::new(ActiveJobTracker::new()),
            config,
            in_flight: Arc::new(Semaphore::new(permits)),
            processed: AtomicUsize::new(0),
        }
    }

    pub fn active_jobs(&self) -> &Arc<ActiveJobTracker> {
        &self.active_jobs
    }

    pub fn processed_count(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// One decomposer-worker tick: pop an OriginalQueue item, decompose it,
    /// push the resulting fragments. Returns the number of fragments pushed,
    /// or `None` if the OriginalQueue was empty.
    pub async fn run_decomposer_once(&self, decomposer_config: &DecomposerConfig) -> crate::Result<Option<usize>> {
        let Some(item) = self.queue.pop_original().await? else {
            return Ok(None);
        };
        let datatype = match item.partition_datatype {
            Some(dt) => dt,
            None => self.registry.datatype_of(&item.partition_key).unwrap_or(Datatype::Integer),
        };
        let fragments = self.decomposer.decompose(&item.query_text, &item.partition_key, decomposer_config)?;
        let pairs: Vec<(String, String)> =
            fragments.iter().map(|f| (f.sql.clone(), f.hash.clone())).collect();
        self.queue.push_fragments(&pairs, &item.partition_key, datatype, item.priority).await?;
        Ok(Some(pairs.len()))
    }

    /// One executor-worker tick: pop a FragmentQueue item (blocking only on
    /// queue contention, never on execution) and process it to completion.
    /// Returns `None` if the FragmentQueue was empty.
    pub async fn run_executor_once(&self) -> crate::Result<Option<FragmentOutcome>> {
        let Some(item) = self.queue.pop_fragment().await? else {
            return Ok(None);
        };
        let _permit = self.in_flight.acquire().await.expect("semaphore not closed");
        if !self.active_jobs.try_start(
            &item.fragment_hash,
            &item.partition_key,
            &self.config.worker_id,
            self.config.fragment_timeout,
        ) {
            // I3: another worker already holds this (fragment_hash, partition_key);
            // re-enqueue ours rather than double-execute.
            self.queue
                .push_fragments(
                    &[(item.query_text.clone(), item.fragment_hash.clone())],
                    &item.partition_key,
                    item.partition_datatype,
                    item.priority,
                )
                .await?;
            return Ok(None);
        }

        let outcome = self.execute_and_record(&item.fragment_hash, &item.partition_key, &item.query_text).await;
        self.active_jobs.finish(&item.fragment_hash, &item.partition_key);
        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(Some(outcome))
    }

    async fn execute_and_record(
        &self,
        fragment_hash: &str,
        partition_key: &str,
        fragment_sql: &str,
    ) -> FragmentOutcome {
        self.store.register_partition(partition_key, self.registry_datatype_or_default(partition_key)).await.ok();

        let run = self.executor.execute(fragment_sql, partition_key);
        let result = tokio::time::timeout(self.config.fragment_timeout, run).await;

        match result {
            Err(_elapsed) => {
                let _ = self.store.put_status(partition_key, fragment_hash, EntryStatus::Timeout, None).await;
                tracing::warn!(fragment_hash, partition_key, "processor: fragment execution timed out");
                FragmentOutcome::Timeout
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                let _ =
                    self.store.put_status(partition_key, fragment_hash, EntryStatus::Failed, Some(message.clone())).await;
                tracing::warn!(fragment_hash, partition_key, error = %message, "processor: fragment execution failed");
                FragmentOutcome::Failed(message)
            }
            Ok(Ok(ids)) => {
                if let Some(limit) = self.config.row_limit {
                    if ids.len() as u64 > limit {
                        let _ = self.store.put_status(partition_key, fragment_hash, EntryStatus::Limit, None).await;
                        tracing::warn!(fragment_hash, partition_key, count = ids.len(), limit, "processor: fragment exceeded row limit");
                        return FragmentOutcome::OverLimit(limit);
                    }
                }
                if ids.is_empty() {
                    let _ = self.store.put_null(partition_key, fragment_hash).await;
                    tracing::debug!(fragment_hash, partition_key, "processor: fragment matched no rows");
                    FragmentOutcome::NoRows
                } else {
                    let count = ids.len();
                    let _ = self.store.put_entry(partition_key, fragment_hash, ids, fragment_sql).await;
                    tracing::debug!(fragment_hash, partition_key, count, "processor: fragment cached");
                    FragmentOutcome::RowsFound(count)
                }
            }
        }
    }

    fn registry_datatype_or_default(&self, partition_key: &str) -> Datatype {
        self.registry.datatype_of(partition_key).unwrap_or(Datatype::Integer)
    }

    /// Housekeeping tick (§4.7 "Timeouts and recovery"): restores
    /// FragmentQueue items for any ActiveJob past its deadline and logs a
    /// timeout status against the entry.
    pub async fn sweep_timeouts(&self) -> crate::Result<usize> {
        let expired = self.active_jobs.sweep_expired();
        let count = expired.len();
        for (fragment_hash, partition_key) in expired {
            let datatype = self.registry.datatype_of(&partition_key).unwrap_or(Datatype::Integer);
            let status = self
                .queue
                .push_fragments(&[(String::new(), fragment_hash.clone())], &partition_key, datatype, 1)
                .await?;
            self.store.register_partition(&partition_key, datatype).await.ok();
            let _ = self.store.put_status(&partition_key, &fragment_hash, EntryStatus::Timeout, None).await;
            tracing::warn!(
                fragment_hash,
                partition_key,
                restored = ?status,
                "processor: reclaimed active job past its deadline"
            );
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backends::array::SortedArrayStore;
    use crate::hasher::FragmentHasher;
    use crate::queue::MemoryQueue;

    struct StaticExecutor {
        ids: Vec<Identifier>,
    }

    #[async_trait]
    impl FragmentExecutor for StaticExecutor {
        async fn execute(&self, _fragment_sql: &str, _partition_key: &str) -> crate::Result<Vec<Identifier>> {
            Ok(self.ids.clone())
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl FragmentExecutor for FailingExecutor {
        async fn execute(&self, _fragment_sql: &str, _partition_key: &str) -> crate::Result<Vec<Identifier>> {
            Err(crate::PartitionCacheError::Internal("dataset connection refused".into()))
        }
    }

    fn pool_with(
        executor: Arc<dyn FragmentExecutor>,
        config: ProcessorConfig,
    ) -> ProcessorPool<MemoryQueue, SortedArrayStore> {
        let registry = PartitionRegistry::default();
        registry.register("city_id", Datatype::Integer).unwrap();
        let decomposer = QueryDecomposer::new(FragmentHasher::new(), registry.clone());
        ProcessorPool::new(
            Arc::new(MemoryQueue::new()),
            Arc::new(SortedArrayStore::new()),
            registry,
            decomposer,
            executor,
            config,
        )
    }

    #[tokio::test]
    async fn executor_tick_on_empty_queue_returns_none() {
        let pool = pool_with(Arc::new(StaticExecutor { ids: vec![] }), ProcessorConfig::default());
        assert_eq!(pool.run_executor_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn rows_found_is_cached_and_dequeued() {
        let pool = pool_with(
            Arc::new(StaticExecutor { ids: vec![Identifier::Integer(1), Identifier::Integer(2)] }),
            ProcessorConfig::default(),
        );
        pool.queue
            .push_fragments(&[("SELECT 1".into(), "h1".into())], "city_id", Datatype::Integer, 1)
            .await
            .unwrap();

        let outcome = pool.run_executor_once().await.unwrap();
        assert_eq!(outcome, Some(FragmentOutcome::RowsFound(2)));
        assert_eq!(pool.active_jobs().active_count(), 0);
        assert_eq!(pool.queue.lengths().await.unwrap().fragment, 0);
    }

    #[tokio::test]
    async fn no_rows_records_null_entry() {
        let pool = pool_with(Arc::new(StaticExecutor { ids: vec![] }), ProcessorConfig::default());
        pool.queue
            .push_fragments(&[("SELECT 1".into(), "h1".into())], "city_id", Datatype::Integer, 1)
            .await
            .unwrap();

        let outcome = pool.run_executor_once().await.unwrap();
        assert_eq!(outcome, Some(FragmentOutcome::NoRows));
        let value = pool.store.get("city_id", "h1").await.unwrap();
        assert!(value.is_null());
    }

    #[tokio::test]
    async fn over_row_limit_is_flagged_without_caching_a_set() {
        let pool = pool_with(
            Arc::new(StaticExecutor {
                ids: vec![Identifier::Integer(1), Identifier::Integer(2), Identifier::Integer(3)],
            }),
            ProcessorConfig { row_limit: Some(2), ..ProcessorConfig::default() },
        );
        pool.queue
            .push_fragments(&[("SELECT 1".into(), "h1".into())], "city_id", Datatype::Integer, 1)
            .await
            .unwrap();

        let outcome = pool.run_executor_once().await.unwrap();
        assert_eq!(outcome, Some(FragmentOutcome::OverLimit(2)));
        assert!(pool.store.get("city_id", "h1").await.unwrap().is_absent());
    }

    #[tokio::test]
    async fn execution_failure_records_failed_status() {
        let pool = pool_with(Arc::new(FailingExecutor), ProcessorConfig::default());
        pool.queue
            .push_fragments(&[("SELECT 1".into(), "h1".into())], "city_id", Datatype::Integer, 1)
            .await
            .unwrap();

        let outcome = pool.run_executor_once().await.unwrap();
        assert!(matches!(outcome, Some(FragmentOutcome::Failed(_))));
    }

    #[tokio::test]
    async fn active_job_tracker_enforces_at_most_one_in_flight() {
        let tracker = ActiveJobTracker::new();
        assert!(tracker.try_start("h1", "city_id", "w1", Duration::from_secs(30)));
        assert!(!tracker.try_start("h1", "city_id", "w2", Duration::from_secs(30)));
        tracker.finish("h1", "city_id");
        assert!(tracker.try_start("h1", "city_id", "w2", Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn active_job_tracker_sweeps_expired_jobs() {
        let tracker = ActiveJobTracker::new();
        tracker.try_start("h1", "city_id", "w1", Duration::from_millis(0));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = tracker.sweep_expired();
        assert_eq!(expired, vec![("h1".to_string(), "city_id".to_string())]);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn decomposer_tick_pushes_fragments_from_original_queue() {
        let pool = pool_with(Arc::new(StaticExecutor { ids: vec![] }), ProcessorConfig::default());
        pool.queue.push_original("SELECT * FROM orders o WHERE o.city_id = 1", "city_id", None, 1).await.unwrap();

        let pushed = pool.run_decomposer_once(&DecomposerConfig::default()).await.unwrap();
        assert_eq!(pushed, Some(1));
        assert_eq!(pool.queue.lengths().await.unwrap().fragment, 1);
    }
}
