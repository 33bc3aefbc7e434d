//! Catalog data model: column descriptors, snapshots and change records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statbucket_common::ValueKind;

/// One column of a dataset schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub position: usize,
    /// Name of the handler that produces the column (`identity`, `numeric`, ...)
    pub handler: String,
    pub kind: ValueKind,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, handler: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            position: 0,
            handler: handler.into(),
            kind,
        }
    }
}

/// Ordered, name-unique column set of a dataset at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub dataset: String,
    /// 1-based, increases by one per published snapshot
    pub version: u32,
    pub columns: Vec<ColumnDescriptor>,
    /// Migration that produced this snapshot; `None` for the initial one
    pub migration_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

/// What a schema change does to one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeKind {
    Add { kind: ValueKind, handler: String },
    Remove,
    Rename { to: String },
    Retype { from: ValueKind, to: ValueKind },
}

impl ChangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeKind::Add { .. } => "add",
            ChangeKind::Remove => "remove",
            ChangeKind::Rename { .. } => "rename",
            ChangeKind::Retype { .. } => "retype",
        }
    }

    /// Whether two kinds describe the same operation, ignoring details
    pub fn same_op(&self, other: &ChangeKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Review status of a schema change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    Approved,
    Applied,
    Rejected,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Approved => "approved",
            ChangeStatus::Applied => "applied",
            ChangeStatus::Rejected => "rejected",
        }
    }
}

impl From<String> for ChangeStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "approved" => ChangeStatus::Approved,
            "applied" => ChangeStatus::Applied,
            "rejected" => ChangeStatus::Rejected,
            _ => ChangeStatus::Pending,
        }
    }
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a detected or operator-authored change.
///
/// Only the catalog mutates these, and never after `Applied`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub id: u64,
    pub dataset: String,
    pub column: String,
    pub kind: ChangeKind,
    pub status: ChangeStatus,
    /// Source unit whose extraction surfaced the drift
    pub source_unit: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
    /// Migration that applied this change (or that it compensates)
    pub migration_id: Option<u64>,
}
