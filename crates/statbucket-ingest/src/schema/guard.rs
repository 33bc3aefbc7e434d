//! Halt policy applied to schema diffs

use serde::{Deserialize, Serialize};

use super::diff::SchemaDiff;
use crate::error::SchemaGuardHalt;

/// Per-dataset drift policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardPolicy {
    /// Widen the destination automatically when new columns appear
    #[serde(default)]
    pub auto_add: bool,
}

impl GuardPolicy {
    pub fn auto_add() -> Self {
        Self { auto_add: true }
    }

    /// Removals always halt; additions halt unless `auto_add`.
    pub fn halts(&self, diff: &SchemaDiff) -> bool {
        !diff.removed.is_empty() || (!diff.added.is_empty() && !self.auto_add)
    }
}

/// Result of observing an extraction against the catalog
#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome {
    /// First observation; version 1 snapshot published
    Initialized { version: u32 },
    /// Rows may be persisted
    Pass {
        diff: SchemaDiff,
        /// Approved add changes that still need a migration
        auto_added: Vec<u64>,
        /// Columns whose addition was rejected; stripped from rows
        ignored: Vec<String>,
        /// Columns whose removal was rejected; padded with empty values
        tolerated_missing: Vec<String>,
    },
    Halt(SchemaGuardHalt),
}

impl GuardOutcome {
    pub fn is_halt(&self) -> bool {
        matches!(self, GuardOutcome::Halt(_))
    }
}
