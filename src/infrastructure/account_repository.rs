//! Account persistence.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::domain::{Account, NewAccount, TaskError};

const ACCOUNT_COLUMNS: &str = "id, name, cookies, active";

#[derive(Clone)]
pub struct AccountRepository {
    pool: SqlitePool,
}

impl AccountRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, account: &NewAccount) -> Result<Account, TaskError> {
        account.validate()?;
        let result = sqlx::query("INSERT INTO accounts (name, cookies, active, created_at) VALUES (?, ?, 1, ?)")
            .bind(account.name.trim())
            .bind(&account.cookies)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| unique_name(e, &account.name))?;
        let id = result.last_insert_rowid();
        self.get(id).await?.ok_or_else(|| TaskError::not_found("account", id))
    }

    pub async fn get(&self, id: i64) -> Result<Option<Account>, TaskError> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| account_from_row(&r)).transpose()
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Account>, TaskError> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE name = ?"))
            .bind(name.trim())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| account_from_row(&r)).transpose()
    }

    pub async fn list(&self, offset: i64, limit: i64) -> Result<Vec<Account>, TaskError> {
        let rows = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id LIMIT ? OFFSET ?"))
            .bind(limit.max(0))
            .bind(offset.max(0))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(account_from_row).collect()
    }

    pub async fn update(&self, id: i64, account: &NewAccount) -> Result<Account, TaskError> {
        account.validate()?;
        let result = sqlx::query("UPDATE accounts SET name = ?, cookies = ? WHERE id = ?")
            .bind(account.name.trim())
            .bind(&account.cookies)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| unique_name(e, &account.name))?;
        if result.rows_affected() == 0 {
            return Err(TaskError::not_found("account", id));
        }
        self.get(id).await?.ok_or_else(|| TaskError::not_found("account", id))
    }

    pub async fn set_active(&self, id: i64, active: bool) -> Result<(), TaskError> {
        let result = sqlx::query("UPDATE accounts SET active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TaskError::not_found("account", id));
        }
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<bool, TaskError> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn unique_name(err: sqlx::Error, name: &str) -> TaskError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            TaskError::precondition(format!("account {} already exists", name.trim()))
        }
        other => other.into(),
    }
}

fn account_from_row(row: &SqliteRow) -> Result<Account, TaskError> {
    Ok(Account {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        cookies: row.try_get("cookies")?,
        active: row.try_get("active")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestDatabase;

    fn reader() -> NewAccount {
        NewAccount {
            name: "reader".into(),
            cookies: r#"{"z_c0": "token"}"#.into(),
        }
    }

    #[tokio::test]
    async fn test_account_crud() {
        let db = TestDatabase::new().await.unwrap();
        let repo = AccountRepository::new(db.pool());

        let created = repo.create(&reader()).await.unwrap();
        assert!(created.active);
        assert_eq!(repo.find_by_name("reader").await.unwrap(), Some(created.clone()));

        let updated = repo
            .update(
                created.id,
                &NewAccount {
                    cookies: r#"{"z_c0": "fresh"}"#.into(),
                    ..reader()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.session_cookies().unwrap()[0].value, "fresh");

        repo.set_active(created.id, false).await.unwrap();
        assert!(!repo.get(created.id).await.unwrap().unwrap().active);
        assert_eq!(repo.list(0, 10).await.unwrap().len(), 1);

        assert!(repo.delete(created.id).await.unwrap());
        assert!(!repo.delete(created.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_and_malformed_accounts_are_rejected() {
        let db = TestDatabase::new().await.unwrap();
        let repo = AccountRepository::new(db.pool());
        repo.create(&reader()).await.unwrap();

        assert!(matches!(repo.create(&reader()).await, Err(TaskError::PreconditionFailed(_))));
        let malformed = NewAccount {
            name: "other".into(),
            cookies: "z_c0=token".into(),
        };
        assert!(matches!(repo.create(&malformed).await, Err(TaskError::PreconditionFailed(_))));
        assert!(matches!(
            repo.set_active(9999, true).await,
            Err(TaskError::NotFound { .. })
        ));
    }
}
