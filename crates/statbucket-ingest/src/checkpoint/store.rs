//! Per-dataset, per-unit checkpoint bookkeeping

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::types::{Checkpoint, CheckpointStatus};
use crate::error::CheckpointLeaseError;
use crate::extract::Extraction;

/// All checkpoints, keyed by dataset then source unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointStore {
    checkpoints: BTreeMap<String, BTreeMap<String, Checkpoint>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dataset: &str, unit: &str) -> Option<&Checkpoint> {
        self.checkpoints.get(dataset).and_then(|units| units.get(unit))
    }

    /// Status of a unit; units never attempted are `pending`
    pub fn status(&self, dataset: &str, unit: &str) -> CheckpointStatus {
        self.get(dataset, unit).map(|cp| cp.status).unwrap_or_default()
    }

    /// Checkpoints of a dataset ordered by unit key
    pub fn list(&self, dataset: &str) -> Vec<&Checkpoint> {
        self.checkpoints
            .get(dataset)
            .map(|units| units.values().collect())
            .unwrap_or_default()
    }

    pub fn datasets(&self) -> impl Iterator<Item = &str> {
        self.checkpoints.keys().map(String::as_str)
    }

    pub fn get_or_create(&mut self, dataset: &str, unit: &str) -> &mut Checkpoint {
        self.checkpoints
            .entry(dataset.to_string())
            .or_default()
            .entry(unit.to_string())
            .or_insert_with(|| Checkpoint::new(dataset, unit))
    }

    fn existing_mut(&mut self, dataset: &str, unit: &str) -> Result<&mut Checkpoint, CheckpointLeaseError> {
        self.checkpoints
            .get_mut(dataset)
            .and_then(|units| units.get_mut(unit))
            .ok_or_else(|| CheckpointLeaseError::UnknownUnit {
                dataset: dataset.to_string(),
                unit: unit.to_string(),
            })
    }

    /// Move a unit to `to`, creating its checkpoint on first attempt
    pub fn transition(
        &mut self,
        dataset: &str,
        unit: &str,
        to: CheckpointStatus,
    ) -> Result<&mut Checkpoint, CheckpointLeaseError> {
        let cp = self.get_or_create(dataset, unit);
        if !cp.status.can_transition(to) {
            return Err(CheckpointLeaseError::InvalidTransition {
                dataset: dataset.to_string(),
                unit: unit.to_string(),
                from: cp.status.to_string(),
                to: to.to_string(),
            });
        }
        debug!(dataset = %dataset, unit = %unit, from = %cp.status, to = %to, "Checkpoint transition");
        cp.advance(to);
        Ok(cp)
    }

    pub fn add_attempts(&mut self, dataset: &str, unit: &str, attempts: u32) {
        let cp = self.get_or_create(dataset, unit);
        cp.attempts += attempts;
        cp.updated_at = Utc::now();
    }

    pub fn fail(&mut self, dataset: &str, unit: &str, error: impl ToString) -> Result<(), CheckpointLeaseError> {
        let cp = self.transition(dataset, unit, CheckpointStatus::Failed)?;
        cp.last_error = Some(error.to_string());
        Ok(())
    }

    /// Halt a unit in diffing, parking its extraction for the next run
    pub fn halt(&mut self, dataset: &str, unit: &str, parked: Extraction, reason: impl ToString) -> Result<(), CheckpointLeaseError> {
        let cp = self.transition(dataset, unit, CheckpointStatus::Halted)?;
        cp.parked = Some(parked);
        cp.last_error = Some(reason.to_string());
        Ok(())
    }

    pub fn complete(&mut self, dataset: &str, unit: &str, rows_persisted: usize) -> Result<(), CheckpointLeaseError> {
        let cp = self.transition(dataset, unit, CheckpointStatus::Done)?;
        cp.rows_persisted = rows_persisted;
        cp.parked = None;
        cp.last_error = None;
        Ok(())
    }

    /// Return a unit to `pending` so the next run processes it again
    pub fn reset(&mut self, dataset: &str, unit: &str) -> Result<(), CheckpointLeaseError> {
        let cp = self.existing_mut(dataset, unit)?;
        info!(dataset = %dataset, unit = %unit, from = %cp.status, "Reset checkpoint");
        cp.status = CheckpointStatus::Pending;
        cp.last_error = None;
        cp.last_completed_phase = None;
        cp.parked = None;
        cp.rows_persisted = 0;
        cp.updated_at = Utc::now();
        Ok(())
    }
}
