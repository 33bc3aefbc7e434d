//! Run options and run reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchemaGuardHalt;

/// Where rows of a passing unit are written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PersistTarget {
    /// JSON documents tagged with the source unit
    #[default]
    Intermediate,
    /// Typed rows in the destination table
    Destination,
    Both,
}

impl PersistTarget {
    pub fn intermediate(&self) -> bool {
        matches!(self, PersistTarget::Intermediate | PersistTarget::Both)
    }

    pub fn destination(&self) -> bool {
        matches!(self, PersistTarget::Destination | PersistTarget::Both)
    }
}

/// Scope and behavior of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Reprocess units that are already done
    pub force: bool,
    pub target: PersistTarget,
    /// Restrict the run to these unit keys; all configured units when unset
    pub units: Option<Vec<String>>,
}

impl RunOptions {
    pub fn destination() -> Self {
        Self {
            target: PersistTarget::Destination,
            ..Default::default()
        }
    }
}

/// What happened to one unit during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Done { rows_persisted: usize, rows_rejected: usize },
    /// Already done and not forced
    Skipped,
    Failed { error: String, attempts: u32 },
    Halted,
    /// Not processed because the run stopped earlier
    NotReached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit: String,
    #[serde(flatten)]
    pub outcome: UnitOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithFailures,
    Halted,
    Cancelled,
    LeaseExpired,
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithFailures => "completed_with_failures",
            RunStatus::Halted => "halted",
            RunStatus::Cancelled => "cancelled",
            RunStatus::LeaseExpired => "lease_expired",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one dataset run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub dataset: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub units: Vec<UnitReport>,
    pub rows_persisted: usize,
    pub rows_rejected: usize,
    /// Migrations applied automatically for auto-add datasets
    pub auto_migrations: Vec<u64>,
    pub halt: Option<SchemaGuardHalt>,
}

impl RunReport {
    pub fn outcome(&self, unit: &str) -> Option<&UnitOutcome> {
        self.units.iter().find(|u| u.unit == unit).map(|u| &u.outcome)
    }

    pub fn count(&self, matches: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.units.iter().filter(|u| matches(&u.outcome)).count()
    }

    pub fn is_halted(&self) -> bool {
        self.status == RunStatus::Halted
    }
}
