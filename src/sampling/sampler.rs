//! Per-year quota sampling over persisted records.
//!
//! Each year of each quota is paged through in pages of `sample_num` rows and
//! fed into a fixed-size reservoir, so memory stays bounded by the quota
//! while every record of the year has the same chance of being kept.

use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::{
    Record, SampleSheets, SampledRecord, TaskError, YearQuota, format_comment_summary, validate_quotas,
};
use crate::infrastructure::comment_shards::CommentShards;
use crate::infrastructure::quota_repository::QuotaRepository;
use crate::infrastructure::record_repository::RecordRepository;

/// Uniform sample without replacement over a stream of unknown length.
///
/// While fewer than `capacity` items were offered the reservoir keeps all of
/// them in arrival order.
#[derive(Debug, Clone)]
pub struct Reservoir<T> {
    capacity: usize,
    offered: usize,
    items: Vec<T>,
}

impl<T> Reservoir<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            offered: 0,
            items: Vec::with_capacity(capacity.min(1024)),
        }
    }

    pub fn offer(&mut self, item: T, rng: &mut fastrand::Rng) {
        self.offered += 1;
        if self.items.len() < self.capacity {
            self.items.push(item);
            return;
        }
        let slot = rng.usize(..self.offered);
        if slot < self.capacity {
            self.items[slot] = item;
        }
    }

    /// Items seen so far, kept or not.
    pub const fn offered(&self) -> usize {
        self.offered
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

pub struct QuotaSampler {
    records: RecordRepository,
    quotas: QuotaRepository,
    shards: Arc<CommentShards>,
    seed: Option<u64>,
}

impl QuotaSampler {
    pub const fn new(
        records: RecordRepository,
        quotas: QuotaRepository,
        shards: Arc<CommentShards>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            records,
            quotas,
            shards,
            seed,
        }
    }

    /// Draws up to `sample_num` distinct records for every year covered by a
    /// quota. Years without records are left out.
    pub async fn sample(&self) -> Result<SampleSheets, TaskError> {
        let quotas = self.quotas.list().await?;
        if quotas.is_empty() {
            return Err(TaskError::precondition("no year quotas configured"));
        }
        validate_quotas(&quotas)?;

        let mut rng = self.seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed);
        let mut sheets = SampleSheets::new();
        for quota in &quotas {
            for year in quota.years() {
                let (available, mut chosen) = self.draw_year(year, quota.sample_num, &mut rng).await?;
                if chosen.is_empty() {
                    debug!(year, "No records for year");
                    continue;
                }
                chosen.sort_by_key(|r| r.id);

                let mut rows = Vec::with_capacity(chosen.len());
                for record in chosen {
                    rows.push(self.attach_comments(record, quota).await?);
                }
                info!(year, available, sampled = rows.len(), "Year sampled");
                sheets.insert(year, rows);
            }
        }
        Ok(sheets)
    }

    async fn draw_year(
        &self,
        year: i32,
        sample_num: u32,
        rng: &mut fastrand::Rng,
    ) -> Result<(usize, Vec<Record>), TaskError> {
        let page_size = i64::from(sample_num.max(1));
        let mut reservoir = Reservoir::new(sample_num as usize);
        let mut offset = 0;
        loop {
            let page = self.records.page_by_year(year, page_size, offset).await?;
            let fetched = page.len() as i64;
            for record in page {
                reservoir.offer(record, rng);
            }
            if fetched < page_size {
                break;
            }
            offset += page_size;
        }
        Ok((reservoir.offered(), reservoir.into_items()))
    }

    async fn attach_comments(&self, record: Record, quota: &YearQuota) -> Result<SampledRecord, TaskError> {
        let shard = self.shards.resolve(record.shard_key()).await?;
        let comments = self.shards.comments_for(&shard, record.id).await?;
        Ok(SampledRecord {
            comment_summary: format_comment_summary(&comments),
            comments,
            record,
            stock_ratio: quota.stock_ratio,
            sample_num: quota.sample_num,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewComment, NewRecord, NewYearQuota, PreparedRecord, ShardKey};
    use crate::test_utils::TestDatabase;
    use proptest::prelude::*;
    use std::collections::HashSet;

    struct Fixture {
        _db: TestDatabase,
        records: RecordRepository,
        quotas: QuotaRepository,
        shards: Arc<CommentShards>,
    }

    impl Fixture {
        async fn new() -> Self {
            let db = TestDatabase::new().await.unwrap();
            Self {
                records: RecordRepository::new(db.pool()),
                quotas: QuotaRepository::new(db.pool()),
                shards: Arc::new(CommentShards::new(db.pool())),
                _db: db,
            }
        }

        fn sampler(&self, seed: u64) -> QuotaSampler {
            QuotaSampler::new(self.records.clone(), self.quotas.clone(), Arc::clone(&self.shards), Some(seed))
        }

        async fn record(&self, n: usize, publish_time: Option<&str>, year: i32, comments: Vec<NewComment>) {
            let prepared = PreparedRecord {
                record: NewRecord {
                    title: format!("question {n}"),
                    answer_url: format!("https://www.zhihu.com/question/{year}/answer/{n}"),
                    publish_time: publish_time.map(str::to_string),
                    year,
                    ..NewRecord::default()
                },
                comments,
                shard: ShardKey::from_publish_date(publish_time, year),
            };
            self.records.insert_with_comments(&prepared, &self.shards).await.unwrap();
        }

        async fn quota(&self, start_year: i32, end_year: i32, sample_num: u32) {
            self.quotas
                .create(&NewYearQuota {
                    start_year,
                    end_year,
                    stock_ratio: 0.5,
                    sample_num,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_without_quotas_is_precondition_failure() {
        let fx = Fixture::new().await;
        assert!(matches!(
            fx.sampler(1).sample().await,
            Err(TaskError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_sample_is_bounded_and_distinct() {
        let fx = Fixture::new().await;
        for n in 0..5 {
            fx.record(n, Some("2020-05-01"), 2020, Vec::new()).await;
        }
        fx.record(99, None, 2021, Vec::new()).await;
        fx.quota(2020, 2022, 2).await;

        let sheets = fx.sampler(7).sample().await.unwrap();

        assert_eq!(sheets.len(), 2, "2022 has no records and gets no sheet");
        let ids: HashSet<i64> = sheets[&2020].iter().map(|s| s.record.id).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(sheets[&2021].len(), 1);
        assert!(sheets[&2020].iter().all(|s| s.record.year == 2020));
    }

    #[tokio::test]
    async fn test_comments_come_from_the_record_shard() {
        let fx = Fixture::new().await;
        let comment = NewComment {
            author: Some("reader".into()),
            content: "agreed".into(),
            like_count: 4,
            ..NewComment::default()
        };
        fx.record(1, Some("2019-11-20"), 2019, vec![comment.clone()]).await;
        fx.record(2, Some("someday"), 2019, vec![comment]).await;
        fx.quota(2019, 2019, 10).await;

        let sheets = fx.sampler(3).sample().await.unwrap();
        let rows = &sheets[&2019];

        assert_eq!(rows.len(), 2);
        for row in rows {
            assert_eq!(row.comments.len(), 1);
            assert_eq!(row.comment_summary, "1. reader (4 likes): agreed");
            assert_eq!(row.sample_num, 10);
        }
        let tables = fx.shards.existing_tables().await.unwrap();
        assert_eq!(tables, vec!["comment_data_2019_01", "comment_data_2019_11"]);
    }

    #[tokio::test]
    async fn test_same_seed_same_sample() {
        let fx = Fixture::new().await;
        for n in 0..20 {
            fx.record(n, None, 2018, Vec::new()).await;
        }
        fx.quota(2018, 2018, 3).await;

        let ids = |sheets: SampleSheets| sheets[&2018].iter().map(|s| s.record.id).collect::<Vec<_>>();
        let first = ids(fx.sampler(42).sample().await.unwrap());
        let second = ids(fx.sampler(42).sample().await.unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_reservoir_keeps_everything_below_capacity() {
        let mut rng = fastrand::Rng::with_seed(1);
        let mut reservoir = Reservoir::new(5);
        for n in 0..3 {
            reservoir.offer(n, &mut rng);
        }
        assert_eq!(reservoir.offered(), 3);
        assert_eq!(reservoir.into_items(), vec![0, 1, 2]);
    }

    #[test]
    fn test_reservoir_zero_capacity_keeps_nothing() {
        let mut rng = fastrand::Rng::with_seed(1);
        let mut reservoir = Reservoir::new(0);
        reservoir.offer(1, &mut rng);
        assert!(reservoir.into_items().is_empty());
    }

    proptest! {
        #[test]
        fn reservoir_sample_size_and_uniqueness(total in 0usize..200, capacity in 1usize..50, seed in any::<u64>()) {
            let mut rng = fastrand::Rng::with_seed(seed);
            let mut reservoir = Reservoir::new(capacity);
            for n in 0..total {
                reservoir.offer(n, &mut rng);
            }
            let items = reservoir.into_items();
            prop_assert_eq!(items.len(), total.min(capacity));
            let unique: HashSet<usize> = items.iter().copied().collect();
            prop_assert_eq!(unique.len(), items.len());
            prop_assert!(items.iter().all(|&n| n < total));
        }
    }
}
