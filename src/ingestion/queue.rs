//! Durable ingestion FIFO with a de-duplication set of known addresses.
//!
//! Both live in the store: `ingest_queue` rows ordered by id form the FIFO,
//! `url_sets` rows keyed by set name form the address sets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::domain::TaskError;
use crate::infrastructure::config::IngestionConfig;

/// Result of a producer submission. Known addresses are not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub already_known: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub address: String,
    /// Raw JSON as submitted
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
}

/// A named set of addresses.
#[derive(Clone)]
pub struct UrlSet {
    pool: SqlitePool,
    key: String,
}

impl UrlSet {
    pub fn new(pool: SqlitePool, key: impl Into<String>) -> Self {
        Self { pool, key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns true when the address was not yet a member.
    pub async fn add(&self, url: &str) -> Result<bool, TaskError> {
        let mut conn = self.pool.acquire().await?;
        self.add_on(&mut conn, url).await
    }

    /// [`UrlSet::add`] on the caller's connection, usually inside its transaction.
    async fn add_on(&self, conn: &mut SqliteConnection, url: &str) -> Result<bool, TaskError> {
        let result = sqlx::query("INSERT OR IGNORE INTO url_sets (set_key, url, added_at) VALUES (?, ?, ?)")
            .bind(&self.key)
            .bind(url)
            .bind(Utc::now())
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn contains(&self, url: &str) -> Result<bool, TaskError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM url_sets WHERE set_key = ? AND url = ?")
            .bind(&self.key)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn len(&self) -> Result<i64, TaskError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM url_sets WHERE set_key = ?")
            .bind(&self.key)
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn is_empty(&self) -> Result<bool, TaskError> {
        Ok(self.len().await? == 0)
    }

    /// Up to `count` members in random order.
    pub async fn random(&self, count: i64) -> Result<Vec<String>, TaskError> {
        Ok(
            sqlx::query_scalar("SELECT url FROM url_sets WHERE set_key = ? ORDER BY RANDOM() LIMIT ?")
                .bind(&self.key)
                .bind(count.max(0))
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn clear(&self) -> Result<u64, TaskError> {
        let result = sqlx::query("DELETE FROM url_sets WHERE set_key = ?")
            .bind(&self.key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Replaces the members with every persisted record address.
    pub async fn reload_from_records(&self) -> Result<u64, TaskError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM url_sets WHERE set_key = ?")
            .bind(&self.key)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("INSERT OR IGNORE INTO url_sets (set_key, url, added_at) SELECT ?, answer_url, ? FROM records")
            .bind(&self.key)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

/// Producer side of ingestion plus the destructive pop used by the consumer.
#[derive(Clone)]
pub struct IngestionQueue {
    pool: SqlitePool,
    queue_key: String,
    seen: UrlSet,
    recommendations: UrlSet,
}

impl IngestionQueue {
    pub fn new(pool: SqlitePool, config: &IngestionConfig) -> Self {
        Self {
            seen: UrlSet::new(pool.clone(), &config.seen_set_key),
            recommendations: UrlSet::new(pool.clone(), &config.recommendation_set_key),
            queue_key: config.queue_key.clone(),
            pool,
        }
    }

    pub const fn seen(&self) -> &UrlSet {
        &self.seen
    }

    pub const fn recommendations(&self) -> &UrlSet {
        &self.recommendations
    }

    /// Enqueues `payload` unless `address` was seen before.
    ///
    /// Membership is claimed by the set insert itself, so two concurrent
    /// submissions of one address enqueue it once. The claim and the enqueue
    /// share one transaction; a failed enqueue leaves the address unseen.
    pub async fn submit(&self, address: &str, payload: &serde_json::Value) -> Result<SubmitOutcome, TaskError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(TaskError::precondition("submission address must not be empty"));
        }
        let encoded = serde_json::to_string(payload)?;

        let mut tx = self.pool.begin().await?;
        if !self.seen.add_on(&mut tx, address).await? {
            tx.rollback().await?;
            debug!(address, "Submission already known");
            return Ok(SubmitOutcome {
                accepted: true,
                already_known: true,
            });
        }
        self.recommendations.add_on(&mut tx, address).await?;
        sqlx::query("INSERT INTO ingest_queue (queue_key, address, payload, enqueued_at) VALUES (?, ?, ?, ?)")
            .bind(&self.queue_key)
            .bind(address)
            .bind(encoded)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(address, "Submission enqueued");
        Ok(SubmitOutcome {
            accepted: true,
            already_known: false,
        })
    }

    pub async fn size(&self) -> Result<i64, TaskError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM ingest_queue WHERE queue_key = ?")
            .bind(&self.queue_key)
            .fetch_one(&self.pool)
            .await?)
    }

    /// The first `n` items without removing them.
    pub async fn peek(&self, n: usize) -> Result<Vec<QueueItem>, TaskError> {
        let rows = sqlx::query(
            "SELECT id, address, payload, enqueued_at FROM ingest_queue WHERE queue_key = ? ORDER BY id LIMIT ?",
        )
        .bind(&self.queue_key)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Removes and returns up to `n` items from the head in one statement.
    ///
    /// Popped items are gone from the store; a crash before they are persisted loses them.
    pub async fn pop_batch(&self, n: usize) -> Result<Vec<QueueItem>, TaskError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM ingest_queue
            WHERE id IN (SELECT id FROM ingest_queue WHERE queue_key = ? ORDER BY id LIMIT ?)
            RETURNING id, address, payload, enqueued_at
            "#,
        )
        .bind(&self.queue_key)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut items = rows.iter().map(item_from_row).collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified
        items.sort_by_key(|item| item.id);
        Ok(items)
    }

    /// Empties the queue and the de-duplication set.
    pub async fn clear(&self) -> Result<(), TaskError> {
        let dropped = sqlx::query("DELETE FROM ingest_queue WHERE queue_key = ?")
            .bind(&self.queue_key)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let forgotten = self.seen.clear().await?;
        info!(dropped, forgotten, "Ingestion cache cleared");
        Ok(())
    }

    /// Rebuilds the de-duplication set from persisted record addresses.
    pub async fn rebuild_seen_from_records(&self) -> Result<u64, TaskError> {
        let loaded = self.seen.reload_from_records().await?;
        info!(loaded, set = self.seen.key(), "De-duplication set rebuilt from records");
        Ok(loaded)
    }
}

fn item_from_row(row: &SqliteRow) -> Result<QueueItem, TaskError> {
    Ok(QueueItem {
        id: row.try_get("id")?,
        address: row.try_get("address")?,
        payload: row.try_get("payload")?,
        enqueued_at: row.try_get("enqueued_at")?,
    })
}
