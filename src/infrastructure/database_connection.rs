// Database connection and pool management
// SQLite through sqlx; the schema is created idempotently by `migrate`.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

#[derive(Clone)]
pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let db_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);

        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create database directory {:?}", parent))?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url '{database_url}'"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to {database_url}"))?;

        info!("Connected to database {}", database_url);
        Ok(Self { pool })
    }

    /// A private in-memory database. The pool holds exactly one connection,
    /// which keeps the database alive and shared by every caller.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for (name, sql) in SCHEMA {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to apply schema step '{name}'"))?;
        }
        for &(table, column, definition) in ADDED_COLUMNS {
            let present: Option<i64> = sqlx::query_scalar("SELECT 1 FROM pragma_table_info(?) WHERE name = ?")
                .bind(table)
                .bind(column)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("Failed to inspect table '{table}'"))?;
            if present.is_none() {
                sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("Failed to add column '{table}.{column}'"))?;
                info!(table, column, "Added missing column");
            }
        }
        info!("Database schema is up to date");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Columns introduced after a table was first created: `(table, column, definition)`.
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[(
    "jobs",
    "account_id",
    "INTEGER REFERENCES accounts (id) ON DELETE SET NULL",
)];

// Comment partitions (comment_data_YYYY_MM) are created on demand by the shard resolver.
const SCHEMA: &[(&str, &str)] = &[
    (
        "job_parameters",
        r#"
        CREATE TABLE IF NOT EXISTS job_parameters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            target_url TEXT NOT NULL,
            interval_ms INTEGER NOT NULL DEFAULT 5000,
            restart_interval_ms INTEGER NOT NULL DEFAULT 3600000,
            window_start INTEGER NOT NULL DEFAULT 0,
            window_end INTEGER NOT NULL DEFAULT 24,
            max_exceptions INTEGER NOT NULL DEFAULT 3,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
    "#,
    ),
    (
        "accounts",
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            cookies TEXT NOT NULL DEFAULT '{}',
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )
    "#,
    ),
    (
        "jobs",
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            start_time TEXT,
            end_time TEXT,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            progress INTEGER NOT NULL DEFAULT 0,
            parameters_id INTEGER REFERENCES job_parameters (id) ON DELETE SET NULL,
            account_id INTEGER REFERENCES accounts (id) ON DELETE SET NULL,
            created_at TEXT NOT NULL
        )
    "#,
    ),
    (
        "records",
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            publish_time TEXT,
            answer_url TEXT NOT NULL UNIQUE,
            author TEXT,
            author_url TEXT,
            author_field TEXT,
            author_cert TEXT,
            author_fans INTEGER NOT NULL DEFAULT 0,
            year INTEGER NOT NULL,
            task_id INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )
    "#,
    ),
    (
        "records_year_index",
        "CREATE INDEX IF NOT EXISTS idx_records_year ON records (year, id)",
    ),
    (
        "records_task_index",
        "CREATE INDEX IF NOT EXISTS idx_records_task ON records (task_id)",
    ),
    (
        "year_quotas",
        r#"
        CREATE TABLE IF NOT EXISTS year_quotas (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            start_year INTEGER NOT NULL,
            end_year INTEGER NOT NULL,
            stock_ratio REAL NOT NULL DEFAULT 1.0,
            sample_num INTEGER NOT NULL
        )
    "#,
    ),
    (
        "proxies",
        r#"
        CREATE TABLE IF NOT EXISTS proxies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            address TEXT NOT NULL UNIQUE,
            active INTEGER NOT NULL DEFAULT 1,
            strategy TEXT NOT NULL DEFAULT 'round_robin',
            created_at TEXT NOT NULL
        )
    "#,
    ),
    (
        "url_sets",
        r#"
        CREATE TABLE IF NOT EXISTS url_sets (
            set_key TEXT NOT NULL,
            url TEXT NOT NULL,
            added_at TEXT NOT NULL,
            PRIMARY KEY (set_key, url)
        )
    "#,
    ),
    (
        "ingest_queue",
        r#"
        CREATE TABLE IF NOT EXISTS ingest_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue_key TEXT NOT NULL,
            address TEXT NOT NULL,
            payload TEXT NOT NULL,
            enqueued_at TEXT NOT NULL
        )
    "#,
    ),
    (
        "ingest_queue_index",
        "CREATE INDEX IF NOT EXISTS idx_ingest_queue_key ON ingest_queue (queue_key, id)",
    ),
];
