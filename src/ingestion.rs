//! Ingestion path: producers submit into a durable queue, a consumer drains it into storage.

pub mod consumer;
pub mod queue;

pub use consumer::{DrainReport, QueueConsumer};
pub use queue::{IngestionQueue, QueueItem, SubmitOutcome, UrlSet};
