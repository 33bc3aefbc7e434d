//! Relational storage boundary
//!
//! The ingestion core talks to storage only through [`RelationalStore`].
//! Destination tables hold typed rows tagged with their source unit;
//! intermediate tables hold one JSON document per extracted row.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use statbucket_common::{Row, Value, ValueKind};

use crate::error::StoreError;
use crate::extract::handlers::first_number;
use crate::schema::{ChangeKind, ColumnDescriptor, SchemaChange, SchemaSnapshot};

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "database")]
pub use postgres::PostgresStore;

/// A destination row with its store-assigned id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub id: i64,
    pub values: Row,
}

/// A row document in an intermediate table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRow {
    pub source_unit: String,
    pub record: serde_json::Value,
}

/// One structural change to a destination table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StructuralOp {
    AddColumn { name: String, kind: ValueKind },
    DropColumn { name: String },
    RenameColumn { from: String, to: String },
    RetypeColumn { name: String, kind: ValueKind },
}

impl StructuralOp {
    pub fn from_change(change: &SchemaChange) -> Self {
        match &change.kind {
            ChangeKind::Add { kind, .. } => StructuralOp::AddColumn {
                name: change.column.clone(),
                kind: *kind,
            },
            ChangeKind::Remove => StructuralOp::DropColumn {
                name: change.column.clone(),
            },
            ChangeKind::Rename { to } => StructuralOp::RenameColumn {
                from: change.column.clone(),
                to: to.clone(),
            },
            ChangeKind::Retype { to, .. } => StructuralOp::RetypeColumn {
                name: change.column.clone(),
                kind: *to,
            },
        }
    }

    /// Operation undoing `self`, given the structure it was applied to
    pub fn inverse(&self, before: &SchemaSnapshot) -> Option<StructuralOp> {
        match self {
            StructuralOp::AddColumn { name, .. } => Some(StructuralOp::DropColumn { name: name.clone() }),
            StructuralOp::DropColumn { name } => before.column(name).map(|c| StructuralOp::AddColumn {
                name: name.clone(),
                kind: c.kind,
            }),
            StructuralOp::RenameColumn { from, to } => Some(StructuralOp::RenameColumn {
                from: to.clone(),
                to: from.clone(),
            }),
            StructuralOp::RetypeColumn { name, .. } => before.column(name).map(|c| StructuralOp::RetypeColumn {
                name: name.clone(),
                kind: c.kind,
            }),
        }
    }
}

impl StructuralOp {
    /// Apply this operation to one row held in memory
    pub fn reshape(&self, row: &mut Row) {
        match self {
            StructuralOp::AddColumn { name, .. } => {
                if !row.contains(name) {
                    row.push(name.clone(), Value::Empty);
                }
            },
            StructuralOp::DropColumn { name } => {
                row.remove(name);
            },
            StructuralOp::RenameColumn { from, to } => {
                row.rename(from, to);
            },
            StructuralOp::RetypeColumn { name, kind } => {
                if let Some(value) = row.remove(name) {
                    row.push(name.clone(), retype_value(value, *kind));
                }
            },
        }
    }
}

impl std::fmt::Display for StructuralOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StructuralOp::AddColumn { name, kind } => write!(f, "add column {} ({})", name, kind),
            StructuralOp::DropColumn { name } => write!(f, "drop column {}", name),
            StructuralOp::RenameColumn { from, to } => write!(f, "rename column {} to {}", from, to),
            StructuralOp::RetypeColumn { name, kind } => write!(f, "retype column {} to {}", name, kind),
        }
    }
}

/// Convert a stored value for a retyped column. Text becomes its first
/// numeric token, so stores agree with numeric extraction.
pub fn retype_value(value: Value, kind: ValueKind) -> Value {
    match (kind, value) {
        (_, Value::Empty) => Value::Empty,
        (ValueKind::Number, Value::Text(s)) => first_number(&s),
        (ValueKind::Text, Value::Number(n)) => Value::Text(Value::Number(n).to_string()),
        (_, value) => value,
    }
}

/// Data-access boundary used by the orchestrator and migrations
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Create a destination table if it does not exist yet
    async fn create_table(&self, table: &str, columns: &[ColumnDescriptor]) -> Result<(), StoreError>;

    /// Apply one structural change; the only way destination structure changes
    async fn apply_structural(&self, table: &str, op: &StructuralOp) -> Result<(), StoreError>;

    /// Append rows; every row column must exist in the table
    async fn insert_rows(&self, table: &str, source_unit: &str, rows: &[Row]) -> Result<usize, StoreError>;

    /// Delete destination rows previously written for a source unit
    async fn delete_unit_rows(&self, table: &str, source_unit: &str) -> Result<u64, StoreError>;

    /// Replace the intermediate documents of a source unit
    async fn stage_rows(&self, table: &str, source_unit: &str, rows: &[Row]) -> Result<usize, StoreError>;

    /// Rows `[offset, offset + limit)` ordered by id
    async fn select_batch(&self, table: &str, offset: u64, limit: u64) -> Result<Vec<StoredRow>, StoreError>;

    /// Overwrite the given columns of existing rows
    async fn update_rows(&self, table: &str, rows: &[StoredRow]) -> Result<usize, StoreError>;

    async fn count(&self, table: &str) -> Result<u64, StoreError>;

    /// Replace `backup` with a copy of `table`; returns the rows copied
    async fn backup_table(&self, table: &str, backup: &str) -> Result<u64, StoreError>;
}
