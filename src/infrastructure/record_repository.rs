//! Record persistence. Comments go to the record's month shard in the same transaction.

use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::domain::{PreparedRecord, Record, TaskError};
use crate::infrastructure::comment_shards::CommentShards;

const RECORD_COLUMNS: &str = "id, title, content, publish_time, answer_url, author, author_url, author_field, author_cert, author_fans, year, task_id, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted { record_id: i64, comments: usize },
    /// A record with the same address already exists; nothing was written.
    Duplicate,
}

#[derive(Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts the record and its comments atomically. Idempotent on `answer_url`.
    pub async fn insert_with_comments(
        &self,
        prepared: &PreparedRecord,
        shards: &CommentShards,
    ) -> Result<PersistOutcome, TaskError> {
        let shard = shards.resolve(prepared.shard).await?;
        let record = &prepared.record;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO records
                (title, content, publish_time, answer_url, author, author_url, author_field, author_cert, author_fans, year, task_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (answer_url) DO NOTHING
            "#,
        )
        .bind(&record.title)
        .bind(&record.content)
        .bind(&record.publish_time)
        .bind(&record.answer_url)
        .bind(&record.author)
        .bind(&record.author_url)
        .bind(&record.author_field)
        .bind(&record.author_cert)
        .bind(record.author_fans)
        .bind(record.year)
        .bind(record.task_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(url = %record.answer_url, "Record already stored");
            return Ok(PersistOutcome::Duplicate);
        }

        let record_id = result.last_insert_rowid();
        let comments = shards
            .insert_comments(&mut *tx, &shard, record_id, &prepared.comments)
            .await?;
        tx.commit().await?;

        Ok(PersistOutcome::Inserted { record_id, comments })
    }

    pub async fn get(&self, id: i64) -> Result<Option<Record>, TaskError> {
        let row = sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    pub async fn find_by_url(&self, answer_url: &str) -> Result<Option<Record>, TaskError> {
        let row = sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM records WHERE answer_url = ?"))
            .bind(answer_url)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    pub async fn count(&self) -> Result<i64, TaskError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_by_year(&self, year: i32) -> Result<i64, TaskError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE year = ?")
            .bind(year)
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn counts_by_year(&self) -> Result<BTreeMap<i32, i64>, TaskError> {
        let rows = sqlx::query("SELECT year, COUNT(*) AS total FROM records GROUP BY year")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<(i32, i64), TaskError> { Ok((row.try_get("year")?, row.try_get("total")?)) })
            .collect()
    }

    /// One page of a year's records in insertion order.
    pub async fn page_by_year(&self, year: i32, limit: i64, offset: i64) -> Result<Vec<Record>, TaskError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE year = ? ORDER BY id LIMIT ? OFFSET ?"
        ))
        .bind(year)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn all_urls(&self) -> Result<Vec<String>, TaskError> {
        Ok(sqlx::query_scalar("SELECT answer_url FROM records ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    /// Deletes one record; its shard comments cascade.
    pub async fn delete(&self, id: i64) -> Result<(), TaskError> {
        let result = sqlx::query("DELETE FROM records WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TaskError::not_found("record", id));
        }
        Ok(())
    }

    pub async fn delete_by_task(&self, task_id: i64) -> Result<u64, TaskError> {
        let result = sqlx::query("DELETE FROM records WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<Record, TaskError> {
    Ok(Record {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        publish_time: row.try_get("publish_time")?,
        answer_url: row.try_get("answer_url")?,
        author: row.try_get("author")?,
        author_url: row.try_get("author_url")?,
        author_field: row.try_get("author_field")?,
        author_cert: row.try_get("author_cert")?,
        author_fans: row.try_get("author_fans")?,
        year: row.try_get("year")?,
        task_id: row.try_get("task_id")?,
        created_at: row.try_get("created_at")?,
    })
}
