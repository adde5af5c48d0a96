//! Year quota persistence. Saved ranges never overlap.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::domain::{NewYearQuota, TaskError, YearQuota, validate_quotas};

#[derive(Clone)]
pub struct QuotaRepository {
    pool: SqlitePool,
}

impl QuotaRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, quota: &NewYearQuota) -> Result<YearQuota, TaskError> {
        quota.validate()?;
        self.ensure_no_overlap(None, quota).await?;

        let result = sqlx::query(
            "INSERT INTO year_quotas (start_year, end_year, stock_ratio, sample_num) VALUES (?, ?, ?, ?)",
        )
        .bind(quota.start_year)
        .bind(quota.end_year)
        .bind(quota.stock_ratio)
        .bind(i64::from(quota.sample_num))
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();
        self.get(id).await?.ok_or_else(|| TaskError::not_found("year quota", id))
    }

    pub async fn get(&self, id: i64) -> Result<Option<YearQuota>, TaskError> {
        let row = sqlx::query("SELECT id, start_year, end_year, stock_ratio, sample_num FROM year_quotas WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| quota_from_row(&r)).transpose()
    }

    /// Ordered by start year.
    pub async fn list(&self) -> Result<Vec<YearQuota>, TaskError> {
        let rows = sqlx::query(
            "SELECT id, start_year, end_year, stock_ratio, sample_num FROM year_quotas ORDER BY start_year, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(quota_from_row).collect()
    }

    pub async fn update(&self, id: i64, quota: &NewYearQuota) -> Result<YearQuota, TaskError> {
        quota.validate()?;
        self.ensure_no_overlap(Some(id), quota).await?;

        let result = sqlx::query(
            "UPDATE year_quotas SET start_year = ?, end_year = ?, stock_ratio = ?, sample_num = ? WHERE id = ?",
        )
        .bind(quota.start_year)
        .bind(quota.end_year)
        .bind(quota.stock_ratio)
        .bind(i64::from(quota.sample_num))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TaskError::not_found("year quota", id));
        }
        self.get(id).await?.ok_or_else(|| TaskError::not_found("year quota", id))
    }

    pub async fn delete(&self, id: i64) -> Result<bool, TaskError> {
        let result = sqlx::query("DELETE FROM year_quotas WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ensure_no_overlap(&self, replacing: Option<i64>, quota: &NewYearQuota) -> Result<(), TaskError> {
        let mut quotas: Vec<YearQuota> = self
            .list()
            .await?
            .into_iter()
            .filter(|q| Some(q.id) != replacing)
            .collect();
        quotas.push(YearQuota {
            id: replacing.unwrap_or(0),
            start_year: quota.start_year,
            end_year: quota.end_year,
            stock_ratio: quota.stock_ratio,
            sample_num: quota.sample_num,
        });
        validate_quotas(&quotas)
    }
}

fn quota_from_row(row: &SqliteRow) -> Result<YearQuota, TaskError> {
    let sample_num: i64 = row.try_get("sample_num")?;
    Ok(YearQuota {
        id: row.try_get("id")?,
        start_year: row.try_get("start_year")?,
        end_year: row.try_get("end_year")?,
        stock_ratio: row.try_get("stock_ratio")?,
        sample_num: sample_num.max(0) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestDatabase;

    fn range(start_year: i32, end_year: i32) -> NewYearQuota {
        NewYearQuota {
            start_year,
            end_year,
            stock_ratio: 0.25,
            sample_num: 2,
        }
    }

    #[tokio::test]
    async fn test_create_and_list_in_year_order() {
        let db = TestDatabase::new().await.unwrap();
        let quotas = QuotaRepository::new(db.pool());
        quotas.create(&range(2022, 2023)).await.unwrap();
        quotas.create(&range(2018, 2020)).await.unwrap();

        let listed = quotas.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].start_year, 2018);
        assert!((listed[0].stock_ratio - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_overlapping_quota_is_rejected() {
        let db = TestDatabase::new().await.unwrap();
        let quotas = QuotaRepository::new(db.pool());
        quotas.create(&range(2018, 2020)).await.unwrap();

        assert!(matches!(
            quotas.create(&range(2020, 2021)).await,
            Err(TaskError::PreconditionFailed(_))
        ));
        assert_eq!(quotas.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_may_keep_its_own_range() {
        let db = TestDatabase::new().await.unwrap();
        let quotas = QuotaRepository::new(db.pool());
        let quota = quotas.create(&range(2018, 2020)).await.unwrap();

        let mut widened = range(2017, 2020);
        widened.sample_num = 7;
        let updated = quotas.update(quota.id, &widened).await.unwrap();
        assert_eq!(updated.start_year, 2017);
        assert_eq!(updated.sample_num, 7);

        assert!(quotas.delete(quota.id).await.unwrap());
        assert!(!quotas.delete(quota.id).await.unwrap());
    }
}
