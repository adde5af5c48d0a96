//! QA Harvester - supervised Q&A page collection
//!
//! Collection jobs drive a browser session against a target page under an
//! hour window and restart schedule. Producers push collected records into a
//! durable ingestion queue that a background consumer persists into
//! month-sharded storage, and export jobs draw per-year quota samples.

// Module declarations
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod ingestion;
pub mod orchestration;
pub mod sampling;

// Shared fixtures for unit and integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use application::AppContext;
