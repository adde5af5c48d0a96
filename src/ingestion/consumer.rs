//! Background consumer that drains the ingestion queue into the record store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{SubmittedRecord, TaskError};
use crate::infrastructure::comment_shards::CommentShards;
use crate::infrastructure::config::{IngestionConfig, defaults};
use crate::infrastructure::record_repository::{PersistOutcome, RecordRepository};
use crate::ingestion::queue::{IngestionQueue, QueueItem};

/// Per-batch counters. `duplicates` are included in `processed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub processed: u32,
    pub failed: u32,
    pub duplicates: u32,
}

impl DrainReport {
    pub const fn total(&self) -> u32 {
        self.processed + self.failed
    }
}

pub struct QueueConsumer {
    queue: IngestionQueue,
    records: RecordRepository,
    shards: Arc<CommentShards>,
    batch_size: usize,
    poll_interval: Duration,
}

impl QueueConsumer {
    pub fn new(
        queue: IngestionQueue,
        records: RecordRepository,
        shards: Arc<CommentShards>,
        config: &IngestionConfig,
    ) -> Self {
        Self {
            queue,
            records,
            shards,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval(),
        }
    }

    /// Pops up to `batch_size` items and persists each one.
    ///
    /// An item that fails to persist is counted and skipped; the rest of the batch continues.
    pub async fn drain(&self, batch_size: usize) -> Result<DrainReport, TaskError> {
        if !(1..=defaults::MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(TaskError::precondition(format!(
                "batch_size must be within 1..={}, got {batch_size}",
                defaults::MAX_BATCH_SIZE
            )));
        }

        let items = self.queue.pop_batch(batch_size).await?;
        let mut report = DrainReport::default();
        for item in &items {
            match self.persist(item).await {
                Ok(PersistOutcome::Inserted { record_id, comments }) => {
                    report.processed += 1;
                    debug!(record_id, comments, address = %item.address, "Persisted queued record");
                }
                Ok(PersistOutcome::Duplicate) => {
                    report.processed += 1;
                    report.duplicates += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(queue_item = item.id, address = %item.address, error = %e, "Failed to persist queued record");
                }
            }
        }

        if !items.is_empty() {
            info!(
                processed = report.processed,
                failed = report.failed,
                duplicates = report.duplicates,
                "Drained ingestion batch"
            );
        }
        Ok(report)
    }

    async fn persist(&self, item: &QueueItem) -> Result<PersistOutcome, TaskError> {
        let submitted: SubmittedRecord = serde_json::from_str(&item.payload)?;
        let prepared = submitted.prepare(&item.address, Local::now().date_naive());
        self.records.insert_with_comments(&prepared, &self.shards).await
    }

    /// Drains on the configured cadence until `token` is cancelled.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                batch_size = self.batch_size,
                interval_ms = self.poll_interval.as_millis() as u64,
                "Queue consumer started"
            );
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(self.poll_interval) => {}
                }
                if let Err(e) = self.drain(self.batch_size).await {
                    error!(error = %e, "Queue drain failed");
                }
            }
            info!("Queue consumer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ShardKey;
    use crate::test_utils::TestDatabase;
    use serde_json::json;

    async fn consumer() -> (TestDatabase, Arc<QueueConsumer>, IngestionQueue, Arc<CommentShards>) {
        let db = TestDatabase::new().await.unwrap();
        let config = IngestionConfig::default();
        let queue = IngestionQueue::new(db.pool(), &config);
        let shards = Arc::new(CommentShards::new(db.pool()));
        let consumer = Arc::new(QueueConsumer::new(
            queue.clone(),
            RecordRepository::new(db.pool()),
            shards.clone(),
            &config,
        ));
        (db, consumer, queue, shards)
    }

    #[tokio::test]
    async fn test_bad_payload_does_not_abort_batch() {
        let (_db, consumer, queue, _shards) = consumer().await;
        queue
            .submit("https://e.com/good/1", &json!({"title": "ok", "publish_time": "2020-02-02"}))
            .await
            .unwrap();
        queue
            .submit("https://e.com/bad", &json!({"title": ["not", "a", "string"]}))
            .await
            .unwrap();
        queue
            .submit("https://e.com/good/2", &json!({"title": "also ok"}))
            .await
            .unwrap();

        let report = consumer.drain(10).await.unwrap();
        assert_eq!(report, DrainReport { processed: 2, failed: 1, duplicates: 0 });
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_comments_land_in_publish_month_shard() {
        let (db, consumer, queue, shards) = consumer().await;
        queue
            .submit(
                "https://e.com/c/1",
                &json!({
                    "title": "q",
                    "publish_time": "2021-03-04",
                    "comments_structured": [
                        {"author": "a", "content": "one", "like_count": 1, "time": "2021-03-05"},
                        {"author": "b", "content": "two", "like_count": 0}
                    ]
                }),
            )
            .await
            .unwrap();
        consumer.drain(5).await.unwrap();

        let record = RecordRepository::new(db.pool())
            .find_by_url("https://e.com/c/1")
            .await
            .unwrap()
            .unwrap();
        let shard = shards.resolve(ShardKey::new(2021, 3).unwrap()).await.unwrap();
        let comments = shards.comments_for(&shard, record.id).await.unwrap();
        assert_eq!(comments.iter().map(|c| c.content.as_str()).collect::<Vec<_>>(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_batch_size_bounds() {
        let (_db, consumer, _queue, _shards) = consumer().await;
        assert!(matches!(consumer.drain(0).await, Err(TaskError::PreconditionFailed(_))));
        assert!(matches!(consumer.drain(101).await, Err(TaskError::PreconditionFailed(_))));
        assert_eq!(consumer.drain(100).await.unwrap(), DrainReport::default());
    }

    #[tokio::test]
    async fn test_background_loop_stops_on_cancel() {
        let (_db, consumer, queue, _shards) = consumer().await;
        let mut config = IngestionConfig::default();
        config.poll_interval_ms = 10;
        let fast = Arc::new(QueueConsumer::new(
            queue.clone(),
            consumer.records.clone(),
            consumer.shards.clone(),
            &config,
        ));
        queue.submit("https://e.com/loop", &json!({"title": "l"})).await.unwrap();

        let token = CancellationToken::new();
        let handle = fast.spawn(token.clone());
        for _ in 0..100 {
            if queue.size().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        handle.await.unwrap();
        assert_eq!(queue.size().await.unwrap(), 0);
    }
}
