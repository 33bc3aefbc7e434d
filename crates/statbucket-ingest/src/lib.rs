//! Statbucket Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Schema-drift aware ingestion of scraped tabular sports data.
//!
//! # Components
//!
//! - **Extraction**: turns a located HTML table into named values through
//!   per-column handlers ([`extract`])
//! - **Schema catalog**: versioned snapshots, drift detection and the guard
//!   that halts a dataset on unreviewed drift ([`schema`])
//! - **Migrations**: the only path that changes destination structure, with
//!   resumable batched backfills ([`migration`])
//! - **Checkpoints**: per-unit progress and per-dataset leases ([`checkpoint`])
//! - **Orchestration**: runs, retries and operator actions ([`pipeline`])
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use statbucket_ingest::config::IngestConfig;
//! use statbucket_ingest::pipeline::{DatasetPipeline, HttpFetcher, Orchestrator, PipelineSettings, RunOptions};
//! use statbucket_ingest::store::MemoryStore;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load(None)?;
//!     let fetcher = HttpFetcher::new(config.http.timeout(), &config.http.user_agent, config.http.request_delay())?;
//!     let mut orchestrator = Orchestrator::new(
//!         Arc::new(fetcher),
//!         Arc::new(MemoryStore::new()),
//!         PipelineSettings::from_config(&config),
//!     );
//!     for dataset in &config.datasets {
//!         orchestrator.register(DatasetPipeline::from_definition(dataset.clone())?);
//!     }
//!     let report = orchestrator
//!         .run("team_season", RunOptions::default(), CancellationToken::new())
//!         .await?;
//!     println!("{}: {} rows", report.status, report.rows_persisted);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod extract;
pub mod migration;
pub mod pipeline;
pub mod schema;
pub mod state;
pub mod store;

pub use error::{IngestError, Result};
pub use pipeline::{Orchestrator, RunOptions, RunReport};
