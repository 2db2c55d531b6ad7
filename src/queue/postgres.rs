//! Durable queue realization over `sqlx::PgPool` (§4.6), grounded on the
//! same connect-and-migrate idiom as
//! [`crate::cache::backends::postgres::PostgresStore`]. `pop_*` is a single
//! `FOR UPDATE SKIP LOCKED` claim-and-delete statement so concurrent pops
//! never block each other; `push_*` uses the try-acquire protocol described
//! in §4.6 ("Priority bump under contention").

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::{FragmentItem, OriginalItem, PushStatus, Queue, QueueLengths, Which};
use crate::cache::Datatype;

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS pc_queue_original (
    id                  BIGSERIAL PRIMARY KEY,
    query_text          TEXT NOT NULL,
    partition_key       TEXT NOT NULL,
    partition_datatype  TEXT,
    priority            BIGINT NOT NULL DEFAULT 1,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (query_text, partition_key)
);

CREATE TABLE IF NOT EXISTS pc_queue_fragment (
    id                  BIGSERIAL PRIMARY KEY,
    query_text          TEXT NOT NULL,
    fragment_hash       TEXT NOT NULL,
    partition_key       TEXT NOT NULL,
    partition_datatype  TEXT NOT NULL,
    priority            BIGINT NOT NULL DEFAULT 1,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (fragment_hash, partition_key)
);
"#;

fn parse_datatype(s: &str) -> Option<Datatype> {
    match s {
        "integer" => Some(Datatype::Integer),
        "float" => Some(Datatype::Float),
        "text" => Some(Datatype::Text),
        "timestamp" => Some(Datatype::Timestamp),
        _ => None,
    }
}

fn datatype_name(dt: Datatype) -> &'static str {
    match dt {
        Datatype::Integer => "integer",
        Datatype::Float => "float",
        Datatype::Text => "text",
        Datatype::Timestamp => "timestamp",
    }
}

pub struct PostgresQueue {
    pool: PgPool,
}

impl PostgresQueue {
    pub async fn connect(database_url: &str) -> crate::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> crate::Result<()> {
        sqlx::query(MIGRATIONS).execute(&self.pool).await?;
        Ok(())
    }

    /// Try-acquire bump protocol (§4.6): prefer claiming the row with
    /// `FOR UPDATE SKIP LOCKED`; if it's held by a concurrent writer, a
    /// plain (non-locking) existence check distinguishes "someone else will
    /// bump it" (`SkippedLocked`) from "truly absent" (fall through to
    /// insert, which itself may lose a race and report `SkippedLocked`).
    async fn bump_or_insert_original(
        &self,
        query_text: &str,
        partition_key: &str,
        partition_datatype: Option<Datatype>,
        priority: i64,
    ) -> crate::Result<PushStatus> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            "SELECT id FROM pc_queue_original WHERE query_text = $1 AND partition_key = $2 \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(query_text)
        .bind(partition_key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = claimed {
            let id: i64 = row.get("id");
            sqlx::query(
                "UPDATE pc_queue_original SET priority = priority + $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(id)
            .bind(priority.max(1))
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(PushStatus::Bumped);
        }

        let exists: bool = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM pc_queue_original WHERE query_text = $1 AND partition_key = $2)",
        )
        .bind(query_text)
        .bind(partition_key)
        .fetch_one(&mut *tx)
        .await?
        .get(0);
        if exists {
            tx.commit().await?;
            return Ok(PushStatus::SkippedLocked);
        }

        let inserted = sqlx::query(
            "INSERT INTO pc_queue_original (query_text, partition_key, partition_datatype, priority) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (query_text, partition_key) DO NOTHING",
        )
        .bind(query_text)
        .bind(partition_key)
        .bind(partition_datatype.map(datatype_name))
        .bind(priority.max(1))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(if inserted.rows_affected() > 0 { PushStatus::Inserted } else { PushStatus::SkippedLocked })
    }

    async fn bump_or_insert_fragment(
        &self,
        query_text: &str,
        fragment_hash: &str,
        partition_key: &str,
        partition_datatype: Datatype,
        priority: i64,
    ) -> crate::Result<PushStatus> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            "SELECT id FROM pc_queue_fragment WHERE fragment_hash = $1 AND partition_key = $2 \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(fragment_hash)
        .bind(partition_key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = claimed {
            let id: i64 = row.get("id");
            sqlx::query(
                "UPDATE pc_queue_fragment SET priority = priority + $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(id)
            .bind(priority.max(1))
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(PushStatus::Bumped);
        }

        let exists: bool = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM pc_queue_fragment WHERE fragment_hash = $1 AND partition_key = $2)",
        )
        .bind(fragment_hash)
        .bind(partition_key)
        .fetch_one(&mut *tx)
        .await?
        .get(0);
        if exists {
            tx.commit().await?;
            return Ok(PushStatus::SkippedLocked);
        }

        let inserted = sqlx::query(
            "INSERT INTO pc_queue_fragment (query_text, fragment_hash, partition_key, partition_datatype, priority) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (fragment_hash, partition_key) DO NOTHING",
        )
        .bind(query_text)
        .bind(fragment_hash)
        .bind(partition_key)
        .bind(datatype_name(partition_datatype))
        .bind(priority.max(1))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(if inserted.rows_affected() > 0 { PushStatus::Inserted } else { PushStatus::SkippedLocked })
    }
}

#[async_trait]
impl Queue for PostgresQueue {
    async fn push_original(
        &self,
        query_text: &str,
        partition_key: &str,
        partition_datatype: Option<Datatype>,
        priority: i64,
    ) -> crate::Result<PushStatus> {
        self.bump_or_insert_original(query_text, partition_key, partition_datatype, priority).await
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
            statuses.push(
                self.bump_or_insert_fragment(query_text, fragment_hash, partition_key, partition_datatype, priority)
                    .await?,
            );
        }
        Ok(statuses)
    }

    async fn pop_original(&self) -> crate::Result<Option<OriginalItem>> {
        let row = sqlx::query(
            "DELETE FROM pc_queue_original WHERE id = ( \
                SELECT id FROM pc_queue_original \
                ORDER BY priority DESC, created_at ASC \
                FOR UPDATE SKIP LOCKED LIMIT 1 \
             ) RETURNING query_text, partition_key, partition_datatype, priority, created_at, updated_at",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| OriginalItem {
            query_text: r.get("query_text"),
            partition_key: r.get("partition_key"),
            partition_datatype: r.get::<Option<String>, _>("partition_datatype").and_then(|s| parse_datatype(&s)),
            priority: r.get("priority"),
            created_at: r.get::<chrono::DateTime<chrono::Utc>, _>("created_at").timestamp_millis(),
            updated_at: r.get::<chrono::DateTime<chrono::Utc>, _>("updated_at").timestamp_millis(),
        }))
    }

    async fn pop_fragment(&self) -> crate::Result<Option<FragmentItem>> {
        let row = sqlx::query(
            "DELETE FROM pc_queue_fragment WHERE id = ( \
                SELECT id FROM pc_queue_fragment \
                ORDER BY priority DESC, created_at ASC \
                FOR UPDATE SKIP LOCKED LIMIT 1 \
             ) RETURNING query_text, fragment_hash, partition_key, partition_datatype, priority, created_at, updated_at",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| {
            let dt_name: String = r.get("partition_datatype");
            FragmentItem {
                query_text: r.get("query_text"),
                fragment_hash: r.get("fragment_hash"),
                partition_key: r.get("partition_key"),
                partition_datatype: parse_datatype(&dt_name).unwrap_or(Datatype::Integer),
                priority: r.get("priority"),
                created_at: r.get::<chrono::DateTime<chrono::Utc>, _>("created_at").timestamp_millis(),
                updated_at: r.get::<chrono::DateTime<chrono::Utc>, _>("updated_at").timestamp_millis(),
            }
        }))
    }

    async fn lengths(&self) -> crate::Result<QueueLengths> {
        let original: i64 = sqlx::query("SELECT COUNT(*) FROM pc_queue_original")
            .fetch_one(&self.pool)
            .await?
            .get(0);
        let fragment: i64 = sqlx::query("SELECT COUNT(*) FROM pc_queue_fragment")
            .fetch_one(&self.pool)
            .await?
            .get(0);
        Ok(QueueLengths { original: original as u64, fragment: fragment as u64 })
    }

    async fn clear(&self, which: Which) -> crate::Result<()> {
        match which {
            Which::Original => {
                sqlx::query("TRUNCATE pc_queue_original").execute(&self.pool).await?;
            }
            Which::Fragment => {
                sqlx::query("TRUNCATE pc_queue_fragment").execute(&self.pool).await?;
            }
            Which::Both => {
                sqlx::query("TRUNCATE pc_queue_original, pc_queue_fragment").execute(&self.pool).await?;
            }
        }
        Ok(())
    }
}
