//! Migration registry
//!
//! Migrations are the only path that changes destination structure. Each
//! bundles approved schema changes with optional backfill and rollback
//! transforms, and applies strictly in creation order per dataset.

pub mod backfill;
pub mod registry;
pub mod types;

pub use backfill::{preview_backfill, run_backfill, BackfillConfig, BackfillFailure, BackfillProgress};
pub use registry::{ApplyPlan, MigrationRegistry, RollbackPlan};
pub use types::{transform, DryRunReport, Migration, MigrationReport, MigrationStatus, Transform};
