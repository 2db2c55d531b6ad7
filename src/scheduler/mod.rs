//! Scheduler Bridge (C8), §4.8: an alternative to the long-lived worker
//! loop in [`crate::processor`] where the same decomposer/executor ticks
//! run as scheduled jobs inside a database's own job scheduler instead of a
//! process's task pool. Semantically equivalent to C7; this module produces
//! the SQL that wires it up and a trait that tracks whether it's wired up.
//!
//! Grounded on the queue back-ends' migration-string idiom
//! ([`crate::cache::backends::postgres`], [`crate::queue::postgres`]): a
//! fixed-shape DDL/DML string templated per job, rather than a query
//! builder, matching how this crate issues schema statements elsewhere.

use async_trait::async_trait;

/// One scheduled job definition the bridge wants to exist in the scheduler
/// database.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJob {
    pub name: String,
    /// Cron-style schedule expression (scheduler-specific grammar; passed through verbatim).
    pub schedule: String,
    /// SQL to run on each tick.
    pub command: String,
    /// The database the command runs against, which may differ from the
    /// scheduler's own database (§4.8 "cross-database scheduling").
    pub target_database: Option<String>,
    pub active: bool,
}

/// Row-level configuration driving job (re)generation (§3 `ProcessorConfig`,
/// scheduler-bridge variant).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_parallel_jobs: usize,
    pub frequency: String, // e.g. "10 seconds", passed straight to the scheduler
    pub timeout_sweep_frequency: String,
    pub table_prefix: String,
    pub target_database: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 4,
            frequency: "10 seconds".to_string(),
            timeout_sweep_frequency: "1 minute".to_string(),
            table_prefix: "pc".to_string(),
            target_database: None,
        }
    }
}

/// A scheduler database capable of creating, enabling/disabling, and
/// dropping cron-like jobs (e.g. `pg_cron`). Implementations issue the SQL
/// [`generate_jobs`] produces against their own connection.
#[async_trait]
pub trait SchedulerBridge: Send + Sync {
    async fn apply(&self, jobs: &[ScheduledJob]) -> crate::Result<()>;

    /// Toggles a job's `active` flag without touching process lifetime
    /// (§4.8 "Enabling/disabling toggles `active`... not process lifetime").
    async fn set_active(&self, job_name: &str, active: bool) -> crate::Result<()>;

    async fn list(&self) -> crate::Result<Vec<ScheduledJob>>;
}

fn worker_job_name(prefix: &str, index: usize) -> String {
    format!("{prefix}_worker_{index}")
}

fn sweeper_job_name(prefix: &str) -> String {
    format!("{prefix}_timeout_sweeper")
}

/// One decomposer+executor tick, expressed as a single SQL statement a
/// scheduler can invoke. Each of `max_parallel_jobs` identical jobs pops and
/// processes at most one item per tick (§4.8).
fn worker_tick_sql(table_prefix: &str) -> String {
    format!(
        "SELECT {table_prefix}_process_one_original(); SELECT {table_prefix}_process_one_fragment();"
    )
}

fn sweeper_tick_sql(table_prefix: &str) -> String {
    format!("SELECT {table_prefix}_sweep_timeouts();")
}

/// Generates the `max_parallel_jobs` identical worker jobs plus the one
/// timeout-sweeper job the scheduler database should run (§4.8).
pub fn generate_jobs(config: &SchedulerConfig) -> Vec<ScheduledJob> {
    let mut jobs: Vec<ScheduledJob> = (0..config.max_parallel_jobs.max(1))
        .map(|i| ScheduledJob {
            name: worker_job_name(&config.table_prefix, i),
            schedule: config.frequency.clone(),
            command: worker_tick_sql(&config.table_prefix),
            target_database: config.target_database.clone(),
            active: true,
        })
        .collect();
    jobs.push(ScheduledJob {
        name: sweeper_job_name(&config.table_prefix),
        schedule: config.timeout_sweep_frequency.clone(),
        command: sweeper_tick_sql(&config.table_prefix),
        target_database: config.target_database.clone(),
        active: true,
    });
    jobs
}

/// In-memory [`SchedulerBridge`] for tests and for documenting the expected
/// call shape without a real `pg_cron`-style scheduler attached.
#[derive(Default)]
pub struct MemorySchedulerBridge {
    jobs: parking_lot::RwLock<Vec<ScheduledJob>>,
}

impl MemorySchedulerBridge {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchedulerBridge for MemorySchedulerBridge {
    async fn apply(&self, jobs: &[ScheduledJob]) -> crate::Result<()> {
        *self.jobs.write() = jobs.to_vec();
        Ok(())
    }

    async fn set_active(&self, job_name: &str, active: bool) -> crate::Result<()> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .iter_mut()
            .find(|j| j.name == job_name)
            .ok_or_else(|| crate::PartitionCacheError::EntryNotFound {
                partition_key: job_name.to_string(),
                fragment_hash: String::new(),
            })?;
        job.active = active;
        Ok(())
    }

    async fn list(&self) -> crate::Result<Vec<ScheduledJob>> {
        Ok(self.jobs.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_jobs_creates_one_per_worker_plus_a_sweeper() {
        let config = SchedulerConfig { max_parallel_jobs: 3, ..SchedulerConfig::default() };
        let jobs = generate_jobs(&config);
        assert_eq!(jobs.len(), 4);
        assert!(jobs.iter().filter(|j| j.name.contains("sweeper")).count() == 1);
        assert!(jobs.iter().all(|j| j.active));
    }

    #[test]
    fn generate_jobs_carries_cross_database_target() {
        let config = SchedulerConfig { target_database: Some("analytics".to_string()), ..SchedulerConfig::default() };
        let jobs = generate_jobs(&config);
        assert!(jobs.iter().all(|j| j.target_database.as_deref() == Some("analytics")));
    }

    #[tokio::test]
    async fn set_active_toggles_without_removing_the_job() {
        let bridge = MemorySchedulerBridge::new();
        let jobs = generate_jobs(&SchedulerConfig::default());
        bridge.apply(&jobs).await.unwrap();

        let sweeper = sweeper_job_name("pc");
        bridge.set_active(&sweeper, false).await.unwrap();

        let listed = bridge.list().await.unwrap();
        let job = listed.iter().find(|j| j.name == sweeper).unwrap();
        assert!(!job.active);
    }

    #[tokio::test]
    async fn set_active_on_unknown_job_is_an_error() {
        let bridge = MemorySchedulerBridge::new();
        assert!(bridge.set_active("nonexistent", false).await.is_err());
    }
}
