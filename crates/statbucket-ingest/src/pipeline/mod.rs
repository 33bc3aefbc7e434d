//! Pipeline orchestration
//!
//! The [`Orchestrator`] owns the schema catalog, checkpoint store and
//! migration registry, and drives each registered [`DatasetPipeline`] through
//! fetch, extract, diff and persist.

pub mod dataset;
pub mod fetcher;
pub mod orchestrator;
pub mod report;
pub mod retry;

pub use dataset::DatasetPipeline;
pub use fetcher::{CachingFetcher, Fetcher, HttpFetcher, SourceUnit};
pub use orchestrator::{Orchestrator, PipelineSettings};
pub use report::{PersistTarget, RunOptions, RunReport, RunStatus, UnitOutcome, UnitReport};
pub use retry::{with_retry, Attempted, RetryPolicy};
