//! Job control, crawl workers and their supervision.

pub mod bridge;
pub mod controller;
pub mod registry;
pub mod worker;

pub use bridge::{BridgeConfig, BridgeOutcome, OrchestrationBridge};
pub use controller::TaskStateController;
pub use registry::{WorkerControl, WorkerRegistration, WorkerRegistry};
pub use worker::{
    CapturedPage, Clock, CrawlWorker, SystemClock, WorkerExit, WorkerReport, WorkerSettings, WorkerState, WorkerStats,
};
