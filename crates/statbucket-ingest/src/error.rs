//! Error kinds raised by the ingestion core
//!
//! Each subsystem has its own enum so callers can tell a retryable fetch
//! failure from a schema halt without string matching. [`IngestError`] is the
//! umbrella used at the orchestrator and operator boundaries.

use serde::{Deserialize, Serialize};
use statbucket_common::StatbucketError;
use thiserror::Error;

/// Failure fetching a raw page for a source unit
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("Transport error fetching {url}: {message}")]
    Transport { url: String, message: String },

    #[error("Invalid fetch request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Server errors, throttling and transport failures are worth retrying;
    /// other client errors will not change on a second attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            FetchError::Transport { .. } => true,
            FetchError::InvalidRequest(_) => false,
        }
    }
}

/// Failure turning a page into named values
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExtractionError {
    #[error("No table found{}", .0.as_deref().map(|id| format!(" with id '{}'", id)).unwrap_or_default())]
    TableNotFound(Option<String>),

    #[error("Row {row} rejected: required column '{column}' is empty")]
    MissingRequired { row: usize, column: String },

    #[error("Invalid handler pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Handler for '{column}' declares {declared} outputs but its pattern has {groups} capture groups")]
    OutputMismatch {
        column: String,
        declared: usize,
        groups: usize,
    },

    #[error("Malformed page: {0}")]
    Malformed(String),
}

/// Raised when schema drift stops a dataset run
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Schema drift halted dataset '{dataset}' at unit '{source_unit}' (added: {added:?}, removed: {removed:?})")]
pub struct SchemaGuardHalt {
    pub dataset: String,
    pub source_unit: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Changes recorded (or reused) for the drift, awaiting review
    pub change_ids: Vec<u64>,
}

/// Catalog bookkeeping errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("No schema recorded for dataset '{0}'")]
    UnknownDataset(String),

    #[error("Dataset '{0}' already has a schema")]
    AlreadyInitialized(String),

    #[error("Schema change {0} not found")]
    UnknownChange(u64),

    #[error("Cannot {action} change {id}: status is {status}")]
    InvalidStatus {
        id: u64,
        status: String,
        action: &'static str,
    },

    #[error("Column '{column}' {problem} in dataset '{dataset}'")]
    InvalidColumn {
        dataset: String,
        column: String,
        problem: &'static str,
    },
}

/// Errors raised by the relational store boundary
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Table '{0}' does not exist")]
    TableNotFound(String),

    #[error("Column '{column}' already exists in '{table}'")]
    ColumnExists { table: String, column: String },

    #[error("Column '{column}' does not exist in '{table}'")]
    ColumnNotFound { table: String, column: String },

    #[error("Row references column '{column}' missing from '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Unavailable(err.to_string())
            },
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// A backfill or rollback transform rejected a row
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Transform failed: {0}")]
pub struct TransformError(pub String);

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Migration lifecycle errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MigrationError {
    #[error("Migration {0} not found")]
    NotFound(u64),

    #[error("Migration must bundle at least one change")]
    Empty,

    #[error("Migration {0} is already applied")]
    AlreadyApplied(u64),

    #[error("Migration {0} was rolled back and cannot be re-applied")]
    RolledBack(u64),

    #[error("Migration {0} is not applied")]
    NotApplied(u64),

    #[error("Change {change_id} is {status}, expected approved")]
    ChangeNotApproved { change_id: u64, status: String },

    #[error("Change {change_id} belongs to dataset '{actual}', not '{expected}'")]
    WrongDataset {
        change_id: u64,
        expected: String,
        actual: String,
    },

    #[error("Change {change_id} is already bundled in migration {migration_id}")]
    AlreadyBundled { change_id: u64, migration_id: u64 },

    #[error("Migration {migration_id} must wait for earlier migration {blocking_id}")]
    OutOfOrder { migration_id: u64, blocking_id: u64 },

    #[error("Migration {migration_id} is not the latest applied migration (migration {later_id} depends on it)")]
    NotLatest { migration_id: u64, later_id: u64 },

    #[error("Migration {0} changes data but has no rollback transform")]
    MissingRollbackTransform(u64),

    #[error("Migration {migration_id} needs its {which} transform re-attached")]
    TransformNotAttached {
        migration_id: u64,
        which: &'static str,
    },

    #[error("Invalid structure for migration {migration_id}: {message}")]
    InvalidStructure { migration_id: u64, message: String },

    #[error("Structural step of migration {migration_id} failed: {source}")]
    Structural {
        migration_id: u64,
        #[source]
        source: StoreError,
    },

    #[error("Backfill of migration {migration_id} failed at batch {batch} (last committed: {last_committed:?}): {message}")]
    Backfill {
        migration_id: u64,
        batch: u64,
        last_committed: Option<u64>,
        message: String,
    },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Checkpoint state machine and lease errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckpointLeaseError {
    #[error("Dataset '{dataset}' is leased by run {holder}")]
    Held { dataset: String, holder: uuid::Uuid },

    #[error("Lease on dataset '{0}' expired")]
    Expired(String),

    #[error("Invalid checkpoint transition for {dataset}/{unit}: {from} -> {to}")]
    InvalidTransition {
        dataset: String,
        unit: String,
        from: String,
        to: String,
    },

    #[error("No checkpoint for {dataset}/{unit}")]
    UnknownUnit { dataset: String, unit: String },
}

/// Umbrella error for orchestrator and operator actions
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Halted(#[from] SchemaGuardHalt),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointLeaseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("Circular dependency detected involving dataset '{0}'")]
    DependencyCycle(String),

    #[error(transparent)]
    Common(#[from] StatbucketError),
}

pub type Result<T> = std::result::Result<T, IngestError>;
