//! Process-wide configuration, read once at startup (§9 "No globally mutable
//! singletons"): the environment is converted into an explicit struct here
//! and threaded into constructors; nothing downstream reaches back into
//! `std::env` on its own.

use std::time::Duration;

use crate::error::PartitionCacheError;

/// Env var names recognized by [`Config::from_env`].
pub mod env_keys {
    pub const DATABASE_URL: &str = "PARTITION_CACHE_DATABASE_URL";
    pub const CACHE_BACKEND: &str = "PARTITION_CACHE_BACKEND";
    pub const BUCKET_STEP: &str = "PARTITION_CACHE_BUCKET_STEP";
    pub const PROCESSOR_WORKERS: &str = "PARTITION_CACHE_PROCESSOR_WORKERS";
    pub const FRAGMENT_TIMEOUT_MS: &str = "PARTITION_CACHE_FRAGMENT_TIMEOUT_MS";
    pub const FRAGMENT_ROW_LIMIT: &str = "PARTITION_CACHE_FRAGMENT_ROW_LIMIT";
    pub const ACTIVE_JOB_SWEEP_INTERVAL_MS: &str = "PARTITION_CACHE_ACTIVE_JOB_SWEEP_INTERVAL_MS";
}

/// Which [`crate::cache::backends`] module a deployment is configured to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Array,
    Bitstring,
    Bitmap,
    Kv,
    Dict,
    Postgres,
}

impl BackendKind {
    fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "array" => Ok(Self::Array),
            "bitstring" => Ok(Self::Bitstring),
            "bitmap" => Ok(Self::Bitmap),
            "kv" => Ok(Self::Kv),
            "dict" => Ok(Self::Dict),
            "postgres" => Ok(Self::Postgres),
            other => Err(PartitionCacheError::Config(format!("unknown cache backend: {other}"))),
        }
    }
}

/// Explicit configuration struct built once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection string for the queue/cache database; required when
    /// `backend` is [`BackendKind::Postgres`] or the queue is enabled.
    pub database_url: Option<String>,
    pub backend: BackendKind,
    /// Distance-predicate bucket step used by the fragment hasher (§4.1).
    pub bucket_step: f64,
    /// Number of processor-pool workers (C7).
    pub processor_workers: usize,
    /// Per-fragment execution timeout (§4.7).
    pub fragment_timeout: Duration,
    /// Per-fragment row-count limit before a fragment is marked `Limit` (§4.7).
    pub fragment_row_limit: Option<u64>,
    /// How often the housekeeping sweeper reclaims timed-out `ActiveJob` rows.
    pub active_job_sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            backend: BackendKind::Array,
            bucket_step: crate::hasher::DEFAULT_BUCKET_STEP,
            processor_workers: num_cpus::get().max(1),
            fragment_timeout: Duration::from_secs(30),
            fragment_row_limit: None,
            active_job_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Reads the recognized `PARTITION_CACHE_*` environment variables,
    /// falling back to [`Config::default`] for anything unset.
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var(env_keys::DATABASE_URL) {
            config.database_url = Some(url);
        }
        if let Ok(backend) = std::env::var(env_keys::CACHE_BACKEND) {
            config.backend = BackendKind::parse(&backend)?;
        }
        if let Ok(step) = std::env::var(env_keys::BUCKET_STEP) {
            config.bucket_step = step
                .parse()
                .map_err(|_| PartitionCacheError::Config(format!("invalid {}: {step}", env_keys::BUCKET_STEP)))?;
        }
        if let Ok(workers) = std::env::var(env_keys::PROCESSOR_WORKERS) {
            config.processor_workers = workers.parse().map_err(|_| {
                PartitionCacheError::Config(format!("invalid {}: {workers}", env_keys::PROCESSOR_WORKERS))
            })?;
        }
        if let Ok(ms) = std::env::var(env_keys::FRAGMENT_TIMEOUT_MS) {
            let ms: u64 = ms.parse().map_err(|_| {
                PartitionCacheError::Config(format!("invalid {}: {ms}", env_keys::FRAGMENT_TIMEOUT_MS))
            })?;
            config.fragment_timeout = Duration::from_millis(ms);
        }
        if let Ok(limit) = std::env::var(env_keys::FRAGMENT_ROW_LIMIT) {
            config.fragment_row_limit = Some(limit.parse().map_err(|_| {
                PartitionCacheError::Config(format!("invalid {}: {limit}", env_keys::FRAGMENT_ROW_LIMIT))
            })?);
        }
        if let Ok(ms) = std::env::var(env_keys::ACTIVE_JOB_SWEEP_INTERVAL_MS) {
            let ms: u64 = ms.parse().map_err(|_| {
                PartitionCacheError::Config(format!(
                    "invalid {}: {ms}",
                    env_keys::ACTIVE_JOB_SWEEP_INTERVAL_MS
                ))
            })?;
            config.active_job_sweep_interval = Duration::from_millis(ms);
        }

        if config.backend == BackendKind::Postgres && config.database_url.is_none() {
            return Err(PartitionCacheError::Config(
                "postgres backend requires PARTITION_CACHE_DATABASE_URL".into(),
            ));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_any_env() {
        let config = Config::default();
        assert_eq!(config.backend, BackendKind::Array);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn postgres_backend_without_url_is_rejected() {
        std::env::set_var(env_keys::CACHE_BACKEND, "postgres");
        std::env::remove_var(env_keys::DATABASE_URL);
        let result = Config::from_env();
        std::env::remove_var(env_keys::CACHE_BACKEND);
        assert!(matches!(result, Err(PartitionCacheError::Config(_))));
    }
}
