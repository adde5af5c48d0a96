//! Month-partitioned comment storage.
//!
//! Every `(year, month)` key owns one physical table. Handles live in an
//! arena indexed by key; the first resolution of a key creates its table and
//! later resolutions are a map lookup.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::{Comment, NewComment, ShardKey, TaskError};

/// A resolved partition. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardHandle {
    key: ShardKey,
    table: Arc<str>,
}

impl ShardHandle {
    pub const fn key(&self) -> ShardKey {
        self.key
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[derive(Default)]
struct ShardArena {
    handles: Vec<ShardHandle>,
    by_key: HashMap<ShardKey, usize>,
}

impl ShardArena {
    fn get(&self, key: ShardKey) -> Option<ShardHandle> {
        self.by_key.get(&key).map(|&index| self.handles[index].clone())
    }
}

pub struct CommentShards {
    pool: SqlitePool,
    arena: RwLock<ShardArena>,
}

impl CommentShards {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            arena: RwLock::new(ShardArena::default()),
        }
    }

    /// Returns the handle for `key`, creating the partition on first use.
    pub async fn resolve(&self, key: ShardKey) -> Result<ShardHandle, TaskError> {
        if let Some(handle) = self.arena.read().await.get(key) {
            return Ok(handle);
        }

        let mut arena = self.arena.write().await;
        if let Some(handle) = arena.get(key) {
            return Ok(handle);
        }

        let table = key.table_name();
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id INTEGER NOT NULL REFERENCES records (id) ON DELETE CASCADE,
                author TEXT,
                author_url TEXT,
                content TEXT NOT NULL DEFAULT '',
                like_count INTEGER NOT NULL DEFAULT 0,
                time TEXT,
                year INTEGER NOT NULL,
                month INTEGER NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_record ON {table} (record_id)"
        ))
        .execute(&self.pool)
        .await?;

        let handle = ShardHandle {
            key,
            table: Arc::from(table),
        };
        let index = arena.handles.len();
        arena.handles.push(handle.clone());
        arena.by_key.insert(key, index);
        info!(shard = %key, table = handle.table(), "Comment shard ready");
        Ok(handle)
    }

    /// Number of partitions resolved by this process.
    pub async fn resolved_count(&self) -> usize {
        self.arena.read().await.handles.len()
    }

    /// Partition tables present in the store, including ones created by earlier runs.
    pub async fn existing_tables(&self) -> Result<Vec<String>, TaskError> {
        let names = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'comment_data_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    /// Writes comments for `record_id` on the caller's connection, usually inside
    /// the transaction that inserted the record.
    pub async fn insert_comments(
        &self,
        conn: &mut SqliteConnection,
        shard: &ShardHandle,
        record_id: i64,
        comments: &[NewComment],
    ) -> Result<usize, TaskError> {
        let sql = format!(
            "INSERT INTO {} (record_id, author, author_url, content, like_count, time, year, month) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            shard.table()
        );
        for comment in comments {
            sqlx::query(&sql)
                .bind(record_id)
                .bind(&comment.author)
                .bind(&comment.author_url)
                .bind(&comment.content)
                .bind(comment.like_count)
                .bind(&comment.time)
                .bind(shard.key().year())
                .bind(i64::from(shard.key().month()))
                .execute(&mut *conn)
                .await?;
        }
        debug!(shard = %shard.key(), record_id, count = comments.len(), "Stored comments");
        Ok(comments.len())
    }

    pub async fn comments_for(&self, shard: &ShardHandle, record_id: i64) -> Result<Vec<Comment>, TaskError> {
        let rows = sqlx::query(&format!(
            "SELECT id, record_id, author, author_url, content, like_count, time, year, month \
             FROM {} WHERE record_id = ? ORDER BY id",
            shard.table()
        ))
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(comment_from_row).collect()
    }
}

fn comment_from_row(row: &SqliteRow) -> Result<Comment, TaskError> {
    let month: i64 = row.try_get("month")?;
    Ok(Comment {
        id: row.try_get("id")?,
        record_id: row.try_get("record_id")?,
        author: row.try_get("author")?,
        author_url: row.try_get("author_url")?,
        content: row.try_get("content")?,
        like_count: row.try_get("like_count")?,
        time: row.try_get("time")?,
        year: row.try_get("year")?,
        month: month.clamp(1, 12) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestDatabase;

    #[tokio::test]
    async fn test_resolve_creates_table_once() {
        let db = TestDatabase::new().await.unwrap();
        let shards = CommentShards::new(db.pool());
        let key = ShardKey::new(2021, 3).unwrap();

        let first = shards.resolve(key).await.unwrap();
        let second = shards.resolve(key).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.table(), "comment_data_2021_03");
        assert_eq!(shards.resolved_count().await, 1);
        assert_eq!(shards.existing_tables().await.unwrap(), vec!["comment_data_2021_03".to_string()]);
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_tables() {
        let db = TestDatabase::new().await.unwrap();
        let shards = CommentShards::new(db.pool());

        let march = shards.resolve(ShardKey::new(2021, 3).unwrap()).await.unwrap();
        let april = shards.resolve(ShardKey::new(2021, 4).unwrap()).await.unwrap();

        assert_ne!(march.table(), april.table());
        assert_eq!(shards.resolved_count().await, 2);
    }

    #[tokio::test]
    async fn test_fresh_resolver_reuses_existing_table() {
        let db = TestDatabase::new().await.unwrap();
        let key = ShardKey::new(2020, 12).unwrap();
        CommentShards::new(db.pool()).resolve(key).await.unwrap();

        let restarted = CommentShards::new(db.pool());
        let handle = restarted.resolve(key).await.unwrap();
        assert_eq!(handle.table(), "comment_data_2020_12");
        assert_eq!(restarted.existing_tables().await.unwrap().len(), 1);
    }
}
