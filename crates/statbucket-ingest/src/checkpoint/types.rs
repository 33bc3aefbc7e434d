//! Checkpoint records and their state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extract::Extraction;

/// Progress of one source unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    #[default]
    Pending,
    Fetching,
    Extracting,
    Diffing,
    Persisting,
    Done,
    Failed,
    Halted,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Fetching => "fetching",
            CheckpointStatus::Extracting => "extracting",
            CheckpointStatus::Diffing => "diffing",
            CheckpointStatus::Persisting => "persisting",
            CheckpointStatus::Done => "done",
            CheckpointStatus::Failed => "failed",
            CheckpointStatus::Halted => "halted",
        }
    }

    /// Phase completed when moving from `self` to the next state
    fn completed_phase(&self) -> Option<Phase> {
        match self {
            CheckpointStatus::Fetching => Some(Phase::Fetch),
            CheckpointStatus::Extracting => Some(Phase::Extract),
            CheckpointStatus::Diffing => Some(Phase::Diff),
            CheckpointStatus::Persisting => Some(Phase::Persist),
            _ => None,
        }
    }

    fn is_in_flight(&self) -> bool {
        matches!(
            self,
            CheckpointStatus::Fetching
                | CheckpointStatus::Extracting
                | CheckpointStatus::Diffing
                | CheckpointStatus::Persisting
        )
    }

    /// Whether the state machine allows `self -> to`.
    ///
    /// `done` is terminal; only an explicit reset leaves it.
    pub fn can_transition(&self, to: CheckpointStatus) -> bool {
        use CheckpointStatus::*;
        match (*self, to) {
            (Done, _) => false,
            (Pending, Fetching) => true,
            (Fetching, Extracting) | (Extracting, Diffing) | (Diffing, Persisting) | (Persisting, Done) => true,
            (Diffing, Halted) => true,
            (Halted, Diffing) | (Halted, Fetching) => true,
            (Failed, Fetching) => true,
            (from, Fetching) if from.is_in_flight() => true,
            (from, Failed) => from != Failed,
            _ => false,
        }
    }
}

impl From<String> for CheckpointStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "fetching" => CheckpointStatus::Fetching,
            "extracting" => CheckpointStatus::Extracting,
            "diffing" => CheckpointStatus::Diffing,
            "persisting" => CheckpointStatus::Persisting,
            "done" => CheckpointStatus::Done,
            "failed" => CheckpointStatus::Failed,
            "halted" => CheckpointStatus::Halted,
            _ => CheckpointStatus::Pending,
        }
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline phases a unit completes in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fetch,
    Extract,
    Diff,
    Persist,
}

/// Progress marker for one (dataset, source unit)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub dataset: String,
    pub source_unit: String,
    pub status: CheckpointStatus,
    /// Fetch and persist attempts across all runs
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_completed_phase: Option<Phase>,
    /// Extraction kept while the unit waits for schema review
    #[serde(default)]
    pub parked: Option<Extraction>,
    pub rows_persisted: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(dataset: impl Into<String>, source_unit: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            dataset: dataset.into(),
            source_unit: source_unit.into(),
            status: CheckpointStatus::Pending,
            attempts: 0,
            last_error: None,
            last_completed_phase: None,
            parked: None,
            rows_persisted: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// State a new run enters for this unit: halted units with a parked
    /// extraction go straight back to diffing, everything else refetches.
    pub fn restart_status(&self) -> CheckpointStatus {
        match (self.status, &self.parked) {
            (CheckpointStatus::Halted, Some(_)) => CheckpointStatus::Diffing,
            _ => CheckpointStatus::Fetching,
        }
    }

    pub(crate) fn advance(&mut self, to: CheckpointStatus) {
        let forward = matches!(
            (self.status, to),
            (CheckpointStatus::Fetching, CheckpointStatus::Extracting)
                | (CheckpointStatus::Extracting, CheckpointStatus::Diffing)
                | (CheckpointStatus::Diffing, CheckpointStatus::Persisting)
                | (CheckpointStatus::Persisting, CheckpointStatus::Done)
        );
        if forward {
            self.last_completed_phase = self.status.completed_phase();
        } else if to == CheckpointStatus::Fetching {
            self.last_completed_phase = None;
        }
        self.status = to;
        self.updated_at = Utc::now();
    }
}
