// In-database realization of back-end families (a)/(b)/(c) over a real
// PostgreSQL connection pool (§4.3). The only back-end in this crate that
// can honestly answer `intersect_lazy` with a SQL expression the caller's
// own database executes, per §4.4.
//
// Grounded on the `sqlx::PgPool` connect-and-migrate idiom used throughout
// the retrieval pack's Postgres-backed stores (e.g. `postgres_store.rs`'s
// `CREATE TABLE IF NOT EXISTS` migration block run once at `connect`).

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::cache::{
    CacheMetrics, CacheStore, CacheValue, Capabilities, Datatype, DatatypeSupport, EntryStatus,
    Identifier, IntersectionResult, LazyIntersection,
};
use crate::error::PartitionCacheError;

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS pc_partitions (
    partition_key TEXT PRIMARY KEY,
    datatype      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pc_entries (
    partition_key TEXT NOT NULL,
    fragment_hash TEXT NOT NULL,
    status        TEXT NOT NULL,
    is_null       BOOLEAN NOT NULL DEFAULT FALSE,
    ids_int       BIGINT[],
    ids_float     DOUBLE PRECISION[],
    ids_text      TEXT[],
    ids_ts        BIGINT[],
    source_sql    TEXT,
    message       TEXT,
    last_seen     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (partition_key, fragment_hash)
);
"#;

/// PostgreSQL-backed [`CacheStore`], realizing the sorted-array encoding
/// (family (a)) via native Postgres array columns so that intersection can
/// be pushed down with `ARRAY(SELECT UNNEST(...) INTERSECT SELECT UNNEST(...))`.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let pool = PgPool::connect(url)
            .await
            .map_err(PartitionCacheError::from)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Exposes the underlying pool so a caller can execute a lazy
    /// intersection's subquery directly against the same database (§4.4).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn migrate(&self) -> crate::Result<()> {
        sqlx::query(MIGRATIONS)
            .execute(&self.pool)
            .await
            .map_err(PartitionCacheError::from)?;
        Ok(())
    }

    fn column_for(datatype: Datatype) -> &'static str {
        match datatype {
            Datatype::Integer => "ids_int",
            Datatype::Float => "ids_float",
            Datatype::Text => "ids_text",
            Datatype::Timestamp => "ids_ts",
        }
    }

    async fn datatype_of(&self, partition_key: &str) -> crate::Result<Datatype> {
        let row = sqlx::query("SELECT datatype FROM pc_partitions WHERE partition_key = $1")
            .bind(partition_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(PartitionCacheError::from)?
            .ok_or_else(|| PartitionCacheError::EntryNotFound {
                partition_key: partition_key.to_string(),
                fragment_hash: String::new(),
            })?;
        parse_datatype(row.get::<String, _>("datatype"))
    }
}

fn parse_datatype(s: String) -> crate::Result<Datatype> {
    match s.as_str() {
        "integer" => Ok(Datatype::Integer),
        "float" => Ok(Datatype::Float),
        "text" => Ok(Datatype::Text),
        "timestamp" => Ok(Datatype::Timestamp),
        other => Err(PartitionCacheError::Internal(format!("unknown stored datatype {other}"))),
    }
}

#[async_trait]
impl CacheStore for PostgresStore {
    async fn register_partition(&self, partition_key: &str, datatype: Datatype) -> crate::Result<()> {
        if let Ok(existing) = self.datatype_of(partition_key).await {
            if existing != datatype {
                return Err(PartitionCacheError::DatatypeConflict {
                    partition_key: partition_key.to_string(),
                    expected: existing,
                    actual: datatype,
                });
            }
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO pc_partitions (partition_key, datatype) VALUES ($1, $2)
             ON CONFLICT (partition_key) DO NOTHING",
        )
        .bind(partition_key)
        .bind(datatype.to_string())
        .execute(&self.pool)
        .await
        .map_err(PartitionCacheError::from)?;
        Ok(())
    }

    async fn put_set(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        ids: Vec<Identifier>,
    ) -> crate::Result<()> {
        self.put_entry_inner(partition_key, fragment_hash, Some(ids), None)
            .await
    }

    async fn put_null(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<()> {
        self.put_entry_inner(partition_key, fragment_hash, None, None).await
    }

    async fn put_entry(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        ids: Vec<Identifier>,
        source_sql: &str,
    ) -> crate::Result<()> {
        self.put_entry_inner(partition_key, fragment_hash, Some(ids), Some(source_sql))
            .await
    }

    async fn put_status(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        status: EntryStatus,
        message: Option<String>,
    ) -> crate::Result<()> {
        let status_str = status_str(status);
        sqlx::query(
            "INSERT INTO pc_entries (partition_key, fragment_hash, status, is_null, message)
             VALUES ($1, $2, $3, TRUE, $4)
             ON CONFLICT (partition_key, fragment_hash)
             DO UPDATE SET status = EXCLUDED.status, message = EXCLUDED.message, last_seen = NOW()",
        )
        .bind(partition_key)
        .bind(fragment_hash)
        .bind(status_str)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(PartitionCacheError::from)?;
        Ok(())
    }

    async fn get(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<CacheValue> {
        let datatype = self.datatype_of(partition_key).await?;
        let column = Self::column_for(datatype);
        let query = format!(
            "SELECT status, is_null, {column} AS ids FROM pc_entries \
             WHERE partition_key = $1 AND fragment_hash = $2"
        );
        let Some(row) = sqlx::query(&query)
            .bind(partition_key)
            .bind(fragment_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(PartitionCacheError::from)?
        else {
            return Ok(CacheValue::Absent);
        };
        let status: String = row.get("status");
        if status != "ok" {
            return Ok(CacheValue::Absent);
        }
        if row.get::<bool, _>("is_null") {
            return Ok(CacheValue::Null);
        }
        Ok(CacheValue::Set(decode_ids(&row, datatype)?))
    }

    async fn exists(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<bool> {
        Ok(!matches!(self.get(partition_key, fragment_hash).await?, CacheValue::Absent))
    }

    async fn delete(&self, partition_key: &str, fragment_hash: &str) -> crate::Result<bool> {
        let result = sqlx::query("DELETE FROM pc_entries WHERE partition_key = $1 AND fragment_hash = $2")
            .bind(partition_key)
            .bind(fragment_hash)
            .execute(&self.pool)
            .await
            .map_err(PartitionCacheError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn filter_existing(
        &self,
        partition_key: &str,
        fragment_hashes: &[String],
    ) -> crate::Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT fragment_hash FROM pc_entries \
             WHERE partition_key = $1 AND fragment_hash = ANY($2) AND status = 'ok'",
        )
        .bind(partition_key)
        .bind(fragment_hashes)
        .fetch_all(&self.pool)
        .await
        .map_err(PartitionCacheError::from)?;
        Ok(rows.into_iter().map(|r| r.get("fragment_hash")).collect())
    }

    async fn intersect(
        &self,
        partition_key: &str,
        fragment_hashes: &[String],
    ) -> crate::Result<IntersectionResult> {
        if fragment_hashes.is_empty() {
            return Ok(IntersectionResult { ids: Vec::new(), hits: 0 });
        }
        let datatype = self.datatype_of(partition_key).await?;
        let column = Self::column_for(datatype);
        let query = format!(
            "SELECT status, is_null, {column} AS ids FROM pc_entries \
             WHERE partition_key = $1 AND fragment_hash = ANY($2)"
        );
        let rows = sqlx::query(&query)
            .bind(partition_key)
            .bind(fragment_hashes)
            .fetch_all(&self.pool)
            .await
            .map_err(PartitionCacheError::from)?;

        let mut sets = Vec::new();
        for row in &rows {
            let status: String = row.get("status");
            if status != "ok" {
                continue;
            }
            if row.get::<bool, _>("is_null") {
                return Ok(IntersectionResult { ids: Vec::new(), hits: fragment_hashes.len() });
            }
            sets.push(decode_ids(row, datatype)?);
        }
        let hits = sets.len();
        if hits == 0 {
            return Ok(IntersectionResult { ids: Vec::new(), hits: 0 });
        }
        Ok(IntersectionResult {
            ids: crate::cache::backends::intersect_sorted(sets),
            hits,
        })
    }

    /// Real pushdown per §4.4: intersection expressed as nested
    /// `ARRAY(... INTERSECT ...)` over the same `pc_entries` table the
    /// client would otherwise have to read row-by-row.
    async fn intersect_lazy(
        &self,
        partition_key: &str,
        fragment_hashes: &[String],
    ) -> crate::Result<LazyIntersection> {
        if fragment_hashes.is_empty() {
            return Ok(LazyIntersection { subquery_sql: None, hits: 0 });
        }
        let datatype = self.datatype_of(partition_key).await?;
        let column = Self::column_for(datatype);

        let present = self.filter_existing(partition_key, fragment_hashes).await?;
        let hits = present.len();
        if hits == 0 {
            return Ok(LazyIntersection { subquery_sql: None, hits: 0 });
        }

        // Per §4.4: fold is INTERSECT over each ok-status entry's unnested
        // array, one subquery per present hash. A requested hash with no
        // row must be skipped here, not turned into an empty branch: an
        // INTERSECT against an empty branch collapses the whole result to
        // empty, which would make this path disagree with the eager
        // `intersect` above, which already intersects over present
        // fragments only.
        let branches = present
            .iter()
            .map(|h| {
                format!(
                    "SELECT UNNEST({column}) FROM pc_entries \
                     WHERE partition_key = '{pk}' AND fragment_hash = '{h}' \
                     AND status = 'ok' AND is_null = FALSE",
                    pk = partition_key.replace('\'', "''"),
                    h = h.replace('\'', "''"),
                )
            })
            .collect::<Vec<_>>()
            .join(" INTERSECT ");

        let subquery = format!(
            "/* partition_key={partition_key}, fragments={n} */ {branches}",
            n = present.len()
        );
        Ok(LazyIntersection { subquery_sql: Some(subquery), hits })
    }

    async fn list_partitions(&self) -> crate::Result<Vec<(String, Datatype)>> {
        let rows = sqlx::query("SELECT partition_key, datatype FROM pc_partitions")
            .fetch_all(&self.pool)
            .await
            .map_err(PartitionCacheError::from)?;
        rows.into_iter()
            .map(|r| {
                let dt = parse_datatype(r.get::<String, _>("datatype"))?;
                Ok((r.get::<String, _>("partition_key"), dt))
            })
            .collect()
    }

    async fn all_keys(&self, partition_key: &str) -> crate::Result<Vec<String>> {
        let rows = sqlx::query("SELECT fragment_hash FROM pc_entries WHERE partition_key = $1")
            .bind(partition_key)
            .fetch_all(&self.pool)
            .await
            .map_err(PartitionCacheError::from)?;
        Ok(rows.into_iter().map(|r| r.get("fragment_hash")).collect())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            lazy_intersection: true,
            eviction: false,
            datatypes: DatatypeSupport {
                integer: true,
                float: true,
                text: true,
                timestamp: true,
            },
        }
    }

    fn metrics(&self, _partition_key: &str) -> CacheMetrics {
        // Real hit/miss counters for this back-end live in the calling
        // process's `cache::stats` layer, not in the database itself.
        CacheMetrics::default()
    }
}

fn status_str(status: EntryStatus) -> &'static str {
    match status {
        EntryStatus::Ok => "ok",
        EntryStatus::Timeout => "timeout",
        EntryStatus::Failed => "failed",
        EntryStatus::Limit => "limit",
    }
}

fn decode_ids(row: &sqlx::postgres::PgRow, datatype: Datatype) -> crate::Result<Vec<Identifier>> {
    Ok(match datatype {
        Datatype::Integer => row
            .get::<Option<Vec<i64>>, _>("ids")
            .unwrap_or_default()
            .into_iter()
            .map(Identifier::Integer)
            .collect(),
        Datatype::Float => row
            .get::<Option<Vec<f64>>, _>("ids")
            .unwrap_or_default()
            .into_iter()
            .map(Identifier::Float)
            .collect(),
        Datatype::Text => row
            .get::<Option<Vec<String>>, _>("ids")
            .unwrap_or_default()
            .into_iter()
            .map(Identifier::Text)
            .collect(),
        Datatype::Timestamp => row
            .get::<Option<Vec<i64>>, _>("ids")
            .unwrap_or_default()
            .into_iter()
            .map(Identifier::Timestamp)
            .collect(),
    })
}

impl PostgresStore {
    async fn put_entry_inner(
        &self,
        partition_key: &str,
        fragment_hash: &str,
        ids: Option<Vec<Identifier>>,
        source_sql: Option<&str>,
    ) -> crate::Result<()> {
        let datatype = self.datatype_of(partition_key).await?;
        let column = Self::column_for(datatype);
        let is_null = ids.is_none();
        let mut ids = ids.unwrap_or_default();
        crate::cache::backends::check_ids_match(partition_key, datatype, &ids)?;
        ids.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        ids.dedup_by(|a, b| a == b);

        let query = format!(
            "INSERT INTO pc_entries (partition_key, fragment_hash, status, is_null, {column}, source_sql) \
             VALUES ($1, $2, 'ok', $3, $4, $5) \
             ON CONFLICT (partition_key, fragment_hash) \
             DO UPDATE SET status = 'ok', is_null = EXCLUDED.is_null, {column} = EXCLUDED.{column}, \
                            source_sql = EXCLUDED.source_sql, last_seen = NOW()"
        );
        let builder = sqlx::query(&query)
            .bind(partition_key)
            .bind(fragment_hash)
            .bind(is_null);

        match datatype {
            Datatype::Integer => {
                let vals: Vec<i64> = ids.iter().filter_map(Identifier::as_integer).collect();
                builder.bind(vals).bind(source_sql).execute(&self.pool).await
            }
            Datatype::Float => {
                let vals: Vec<f64> = ids
                    .iter()
                    .map(|id| match id {
                        Identifier::Float(v) => *v,
                        _ => unreachable!("checked by check_ids_match"),
                    })
                    .collect();
                builder.bind(vals).bind(source_sql).execute(&self.pool).await
            }
            Datatype::Text => {
                let vals: Vec<String> = ids
                    .iter()
                    .map(|id| match id {
                        Identifier::Text(v) => v.clone(),
                        _ => unreachable!("checked by check_ids_match"),
                    })
                    .collect();
                builder.bind(vals).bind(source_sql).execute(&self.pool).await
            }
            Datatype::Timestamp => {
                let vals: Vec<i64> = ids
                    .iter()
                    .map(|id| match id {
                        Identifier::Timestamp(v) => *v,
                        _ => unreachable!("checked by check_ids_match"),
                    })
                    .collect();
                builder.bind(vals).bind(source_sql).execute(&self.pool).await
            }
        }
        .map_err(PartitionCacheError::from)?;
        Ok(())
    }
}
