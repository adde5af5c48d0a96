//! Proxy pool persistence and per-launch proxy selection.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::domain::{NewProxy, Proxy, ProxyKind, ProxyStrategy, TaskError};

#[derive(Clone)]
pub struct ProxyRepository {
    pool: SqlitePool,
}

impl ProxyRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, proxy: &NewProxy) -> Result<Proxy, TaskError> {
        let result = sqlx::query(
            "INSERT INTO proxies (kind, address, active, strategy, created_at) VALUES (?, ?, 1, ?, ?)",
        )
        .bind(proxy.kind.scheme())
        .bind(&proxy.address)
        .bind(proxy.strategy.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                TaskError::precondition(format!("proxy {} already exists", proxy.address))
            }
            other => other.into(),
        })?;
        let id = result.last_insert_rowid();
        self.get(id).await?.ok_or_else(|| TaskError::not_found("proxy", id))
    }

    pub async fn get(&self, id: i64) -> Result<Option<Proxy>, TaskError> {
        let row = sqlx::query("SELECT id, kind, address, active, strategy FROM proxies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| proxy_from_row(&r)).transpose()
    }

    /// Active proxies, oldest first.
    pub async fn list_active(&self) -> Result<Vec<Proxy>, TaskError> {
        let rows = sqlx::query("SELECT id, kind, address, active, strategy FROM proxies WHERE active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(proxy_from_row).collect()
    }

    pub async fn set_active(&self, id: i64, active: bool) -> Result<(), TaskError> {
        let result = sqlx::query("UPDATE proxies SET active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TaskError::not_found("proxy", id));
        }
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<bool, TaskError> {
        let result = sqlx::query("DELETE FROM proxies WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn proxy_from_row(row: &SqliteRow) -> Result<Proxy, TaskError> {
    let kind: String = row.try_get("kind")?;
    let strategy: String = row.try_get("strategy")?;
    Ok(Proxy {
        id: row.try_get("id")?,
        kind: kind
            .parse::<ProxyKind>()
            .map_err(|e| TaskError::PersistenceFailed(e.to_string()))?,
        address: row.try_get("address")?,
        active: row.try_get("active")?,
        strategy: strategy
            .parse::<ProxyStrategy>()
            .map_err(|e| TaskError::PersistenceFailed(e.to_string()))?,
    })
}

/// Picks an active proxy for each new browser session.
///
/// The strategy of the oldest active proxy governs the pool.
pub struct ProxySelector {
    repository: ProxyRepository,
    cursor: AtomicUsize,
    rng: Mutex<fastrand::Rng>,
}

impl ProxySelector {
    pub fn new(repository: ProxyRepository) -> Self {
        Self {
            repository,
            cursor: AtomicUsize::new(0),
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    pub fn shared(repository: ProxyRepository) -> Arc<Self> {
        Arc::new(Self::new(repository))
    }

    /// `None` when the pool has no active proxy; sessions then connect directly.
    pub async fn select(&self) -> Result<Option<Proxy>, TaskError> {
        let active = self.repository.list_active().await?;
        let Some(first) = active.first() else {
            return Ok(None);
        };
        let index = match first.strategy {
            ProxyStrategy::Failover => 0,
            ProxyStrategy::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed) % active.len(),
            ProxyStrategy::Random => self
                .rng
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .usize(..active.len()),
        };
        let chosen = active.into_iter().nth(index);
        if let Some(proxy) = &chosen {
            info!(proxy = %proxy.address, strategy = %proxy.strategy, "Selected proxy");
        }
        Ok(chosen)
    }

    /// Takes a proxy out of rotation after a session using it failed.
    pub async fn mark_failed(&self, proxy_id: i64) -> Result<(), TaskError> {
        warn!(proxy_id, "Deactivating proxy after failed session");
        self.repository.set_active(proxy_id, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestDatabase;

    async fn pool_with(strategy: ProxyStrategy, count: usize) -> (TestDatabase, ProxyRepository) {
        let db = TestDatabase::new().await.unwrap();
        let repo = ProxyRepository::new(db.pool());
        for i in 0..count {
            repo.create(&NewProxy {
                kind: ProxyKind::Http,
                address: format!("10.0.0.{i}:8080"),
                strategy,
            })
            .await
            .unwrap();
        }
        (db, repo)
    }

    #[tokio::test]
    async fn test_round_robin_cycles_active_proxies() {
        let (_db, repo) = pool_with(ProxyStrategy::RoundRobin, 3).await;
        let selector = ProxySelector::new(repo);

        let mut picked = Vec::new();
        for _ in 0..4 {
            picked.push(selector.select().await.unwrap().unwrap().address);
        }
        assert_eq!(picked, vec!["10.0.0.0:8080", "10.0.0.1:8080", "10.0.0.2:8080", "10.0.0.0:8080"]);
    }

    #[tokio::test]
    async fn test_failover_skips_failed_proxy() {
        let (_db, repo) = pool_with(ProxyStrategy::Failover, 2).await;
        let selector = ProxySelector::new(repo.clone());

        let first = selector.select().await.unwrap().unwrap();
        selector.mark_failed(first.id).await.unwrap();
        let next = selector.select().await.unwrap().unwrap();

        assert_ne!(first.id, next.id);
        assert!(!repo.get(first.id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_empty_pool_selects_nothing() {
        let (_db, repo) = pool_with(ProxyStrategy::Random, 0).await;
        assert!(ProxySelector::new(repo).select().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_address_is_rejected() {
        let (_db, repo) = pool_with(ProxyStrategy::Random, 1).await;
        let duplicate = repo
            .create(&NewProxy {
                kind: ProxyKind::Socks5,
                address: "10.0.0.0:8080".into(),
                strategy: ProxyStrategy::Random,
            })
            .await;
        assert!(matches!(duplicate, Err(TaskError::PreconditionFailed(_))));
    }
}
