use thiserror::Error;

/// Error taxonomy for PartitionCache.
///
/// Every variant maps onto one row of the error taxonomy in the design docs:
/// callers match on the variant, not on the message text, to decide whether
/// an error is retryable, fatal, or purely informational.
#[derive(Error, Debug)]
pub enum PartitionCacheError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error("datatype conflict for partition key '{partition_key}': expected {expected:?}, got {actual:?}")]
    DatatypeConflict {
        partition_key: String,
        expected: crate::cache::Datatype,
        actual: crate::cache::Datatype,
    },

    #[error("unsupported SQL syntax: {0}")]
    UnsupportedSyntax(String),

    #[error("identifier {id} out of bit range [0, {width})")]
    BitRangeError { id: i64, width: u32 },

    #[error("entry not found for partition key '{partition_key}', fragment {fragment_hash}")]
    EntryNotFound {
        partition_key: String,
        fragment_hash: String,
    },

    #[error("fragment execution exceeded timeout after {elapsed_ms}ms")]
    ExecutionTimeout { elapsed_ms: u64 },

    #[error("fragment row count {count} exceeded limit {limit}")]
    ExecutionLimit { count: u64, limit: u64 },

    #[error("fragment execution failed: {0}")]
    ExecutionFailed(String),

    #[error("queue upsert skipped: row locked by a concurrent writer")]
    ConcurrencySkipped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PartitionCacheError {
    /// Whether a caller may usefully retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PartitionCacheError::Connectivity(_))
    }

    /// Only ConfigError and ConnectivityError warrant a nonzero exit from a
    /// CLI-style front end; everything else is handled inline.
    pub fn is_exit_worthy(&self) -> bool {
        matches!(
            self,
            PartitionCacheError::Config(_) | PartitionCacheError::Connectivity(_)
        )
    }
}

impl From<serde_json::Error> for PartitionCacheError {
    fn from(e: serde_json::Error) -> Self {
        PartitionCacheError::Serialization(e.to_string())
    }
}

impl From<sqlparser::parser::ParserError> for PartitionCacheError {
    fn from(e: sqlparser::parser::ParserError) -> Self {
        PartitionCacheError::UnsupportedSyntax(e.to_string())
    }
}

impl From<sqlx::Error> for PartitionCacheError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                PartitionCacheError::Connectivity(e.to_string())
            }
            _ => PartitionCacheError::Internal(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PartitionCacheError>;
