//! Migration records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statbucket_common::Row;
use std::sync::Arc;

use crate::error::TransformError;

/// Pure row transform used for backfill and rollback
pub type Transform = Arc<dyn Fn(Row) -> Result<Row, TransformError> + Send + Sync>;

/// Wrap a closure as a [`Transform`]
pub fn transform<F>(f: F) -> Transform
where
    F: Fn(Row) -> Result<Row, TransformError> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Applied,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Applied => "applied",
            MigrationStatus::Failed => "failed",
            MigrationStatus::RolledBack => "rolled_back",
        }
    }
}

impl From<String> for MigrationStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "applied" => MigrationStatus::Applied,
            "failed" => MigrationStatus::Failed,
            "rolled_back" => MigrationStatus::RolledBack,
            _ => MigrationStatus::Pending,
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered bundle of approved schema changes.
///
/// Transforms are not serialized; after a restart they must be re-attached
/// before a migration that declares them can run.
#[derive(Clone, Serialize, Deserialize)]
pub struct Migration {
    pub id: u64,
    pub dataset: String,
    pub change_ids: Vec<u64>,
    pub status: MigrationStatus,
    /// Structure was changed in the store and a snapshot published
    pub structure_applied: bool,
    /// Backfill resume marker
    pub last_committed_batch: Option<u64>,
    /// Resume marker of the rollback transform, kept across failed rollbacks
    #[serde(default)]
    pub rollback_committed_batch: Option<u64>,
    /// Copy of the destination table taken before the structural step
    #[serde(default)]
    pub backup_table: Option<String>,
    pub has_backfill: bool,
    pub has_rollback: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) backfill: Option<Transform>,
    #[serde(skip)]
    pub(crate) rollback: Option<Transform>,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("dataset", &self.dataset)
            .field("change_ids", &self.change_ids)
            .field("status", &self.status)
            .field("structure_applied", &self.structure_applied)
            .field("last_committed_batch", &self.last_committed_batch)
            .field("rollback_committed_batch", &self.rollback_committed_batch)
            .field("backup_table", &self.backup_table)
            .field("backfill_attached", &self.backfill.is_some())
            .field("rollback_attached", &self.rollback.is_some())
            .finish()
    }
}

/// Summary of a successful apply or rollback
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub migration_id: u64,
    /// Snapshot version published by the structural step
    pub schema_version: Option<u32>,
    pub batches_committed: u64,
    pub rows_transformed: u64,
    pub backup_table: Option<String>,
}

/// What applying a migration would do, computed without changing anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunReport {
    pub migration_id: u64,
    /// Structural operations still to run, in order
    pub operations: Vec<String>,
    /// Column names of the snapshot the migration would publish
    pub columns: Vec<String>,
    pub batches_checked: u64,
    pub rows_checked: u64,
    /// First batch the backfill transform rejected, with the reason
    pub failed_batch: Option<(u64, String)>,
}
