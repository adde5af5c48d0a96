//! Quota sampling and the export job built on it.

pub mod export;
pub mod sampler;

pub use export::ExportRunner;
pub use sampler::{QuotaSampler, Reservoir};
