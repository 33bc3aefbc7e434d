//! Authoritative schema per dataset plus the full change log

use chrono::Utc;
use serde::{Deserialize, Serialize};
use statbucket_common::ValueKind;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::diff::SchemaDiff;
use super::guard::{GuardOutcome, GuardPolicy};
use super::types::{ChangeKind, ChangeStatus, ColumnDescriptor, SchemaChange, SchemaSnapshot};
use crate::error::{CatalogError, SchemaGuardHalt};

/// Snapshot history and change log for every dataset.
///
/// Snapshots are append-only; the last one per dataset is current. Only
/// migrations publish new snapshots after the initial one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaCatalog {
    snapshots: BTreeMap<String, Vec<SchemaSnapshot>>,
    changes: Vec<SchemaChange>,
    next_change_id: u64,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, dataset: &str) -> Option<&SchemaSnapshot> {
        self.snapshots.get(dataset).and_then(|h| h.last())
    }

    pub fn history(&self, dataset: &str) -> &[SchemaSnapshot] {
        self.snapshots.get(dataset).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn datasets(&self) -> impl Iterator<Item = &str> {
        self.snapshots.keys().map(String::as_str)
    }

    fn current_or_err(&self, dataset: &str) -> Result<&SchemaSnapshot, CatalogError> {
        self.current(dataset)
            .ok_or_else(|| CatalogError::UnknownDataset(dataset.to_string()))
    }

    /// Publish version 1 for a dataset seen for the first time
    pub fn initialize(
        &mut self,
        dataset: &str,
        columns: &[ColumnDescriptor],
    ) -> Result<&SchemaSnapshot, CatalogError> {
        if self.current(dataset).is_some() {
            return Err(CatalogError::AlreadyInitialized(dataset.to_string()));
        }
        self.publish(dataset, columns.to_vec(), None)?;
        info!(dataset = %dataset, columns = columns.len(), "Initialized dataset schema");
        self.current_or_err(dataset)
    }

    /// Classify observed column names against the current snapshot
    pub fn diff<S: AsRef<str>>(&self, dataset: &str, observed: &[S]) -> Result<SchemaDiff, CatalogError> {
        let current = self.current_or_err(dataset)?.column_names();
        Ok(SchemaDiff::compute(&current, observed))
    }

    /// Diff an extraction's columns and apply the guard policy.
    ///
    /// Records (or reuses) a change for every unresolved column. Never
    /// touches rows or the snapshot.
    pub fn observe(
        &mut self,
        dataset: &str,
        observed: &[ColumnDescriptor],
        source_unit: &str,
        policy: GuardPolicy,
    ) -> Result<GuardOutcome, CatalogError> {
        let names: Vec<&str> = observed.iter().map(|c| c.name.as_str()).collect();
        let diff = self.diff(dataset, &names)?;

        let mut ignored = Vec::new();
        let mut tolerated_missing = Vec::new();
        let mut auto_added = Vec::new();
        let mut halt_added = Vec::new();
        let mut halt_removed = Vec::new();
        let mut change_ids = Vec::new();

        for column in &diff.added {
            if self.is_rejected(dataset, column, "add") {
                ignored.push(column.clone());
                continue;
            }
            let (kind, handler) = observed
                .iter()
                .find(|c| &c.name == column)
                .map(|c| (c.kind, c.handler.clone()))
                .unwrap_or((ValueKind::Unknown, "identity".to_string()));
            let change = ChangeKind::Add { kind, handler };
            let status = if policy.auto_add {
                ChangeStatus::Approved
            } else {
                ChangeStatus::Pending
            };
            let id = self.find_or_record(dataset, column, change, status, source_unit);
            if policy.auto_add {
                auto_added.push(id);
            } else {
                halt_added.push(column.clone());
            }
            change_ids.push(id);
        }

        for column in &diff.removed {
            if self.is_rejected(dataset, column, "remove") {
                tolerated_missing.push(column.clone());
                continue;
            }
            let id = self.find_or_record(dataset, column, ChangeKind::Remove, ChangeStatus::Pending, source_unit);
            halt_removed.push(column.clone());
            change_ids.push(id);
        }

        if !halt_added.is_empty() || !halt_removed.is_empty() {
            warn!(
                dataset = %dataset,
                source_unit = %source_unit,
                added = ?halt_added,
                removed = ?halt_removed,
                "Schema drift requires review"
            );
            return Ok(GuardOutcome::Halt(SchemaGuardHalt {
                dataset: dataset.to_string(),
                source_unit: source_unit.to_string(),
                added: halt_added,
                removed: halt_removed,
                change_ids,
            }));
        }

        Ok(GuardOutcome::Pass {
            diff,
            auto_added,
            ignored,
            tolerated_missing,
        })
    }

    /// The latest `op` decision for the column was a rejection
    fn is_rejected(&self, dataset: &str, column: &str, op: &str) -> bool {
        self.changes
            .iter()
            .rev()
            .find(|c| c.dataset == dataset && c.column == column && c.kind.as_str() == op)
            .is_some_and(|c| c.status == ChangeStatus::Rejected)
    }

    /// Latest change for (dataset, column, op) in one of `statuses`;
    /// pending or approved when `statuses` is empty.
    fn find(&self, dataset: &str, column: &str, kind: &ChangeKind, statuses: &[ChangeStatus]) -> Option<u64> {
        let open = [ChangeStatus::Pending, ChangeStatus::Approved];
        let statuses = if statuses.is_empty() { &open[..] } else { statuses };
        self.changes
            .iter()
            .rev()
            .find(|c| {
                c.dataset == dataset
                    && c.column == column
                    && c.kind.same_op(kind)
                    && statuses.contains(&c.status)
            })
            .map(|c| c.id)
    }

    fn find_or_record(
        &mut self,
        dataset: &str,
        column: &str,
        kind: ChangeKind,
        status: ChangeStatus,
        source_unit: &str,
    ) -> u64 {
        if let Some(id) = self.find(dataset, column, &kind, &[]) {
            // An auto-add policy promotes an earlier pending detection.
            if status == ChangeStatus::Approved {
                if let Some(change) = self.changes.iter_mut().find(|c| c.id == id) {
                    if change.status == ChangeStatus::Pending {
                        change.status = ChangeStatus::Approved;
                        change.decided_at = Some(Utc::now());
                    }
                }
            }
            return id;
        }
        self.record(dataset, column, kind, status, Some(source_unit.to_string()), None)
    }

    fn record(
        &mut self,
        dataset: &str,
        column: &str,
        kind: ChangeKind,
        status: ChangeStatus,
        source_unit: Option<String>,
        migration_id: Option<u64>,
    ) -> u64 {
        self.next_change_id += 1;
        let id = self.next_change_id;
        let now = Utc::now();
        info!(
            change_id = id,
            dataset = %dataset,
            column = %column,
            op = kind.as_str(),
            status = status.as_str(),
            "Recorded schema change"
        );
        self.changes.push(SchemaChange {
            id,
            dataset: dataset.to_string(),
            column: column.to_string(),
            kind,
            status,
            source_unit,
            detected_at: now,
            decided_at: (status != ChangeStatus::Pending).then_some(now),
            applied_at: (status == ChangeStatus::Applied).then_some(now),
            migration_id,
        });
        id
    }

    pub fn change(&self, id: u64) -> Option<&SchemaChange> {
        self.changes.iter().find(|c| c.id == id)
    }

    /// Change log, oldest first
    pub fn changes(&self, dataset: Option<&str>, pending_only: bool) -> Vec<&SchemaChange> {
        self.changes
            .iter()
            .filter(|c| dataset.map_or(true, |d| c.dataset == d))
            .filter(|c| !pending_only || c.status == ChangeStatus::Pending)
            .collect()
    }

    fn decide(&mut self, id: u64, to: ChangeStatus, action: &'static str) -> Result<&SchemaChange, CatalogError> {
        let change = self
            .changes
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(CatalogError::UnknownChange(id))?;
        if change.status != ChangeStatus::Pending {
            return Err(CatalogError::InvalidStatus {
                id,
                status: change.status.to_string(),
                action,
            });
        }
        change.status = to;
        change.decided_at = Some(Utc::now());
        info!(change_id = id, dataset = %change.dataset, column = %change.column, status = to.as_str(), "Schema change reviewed");
        Ok(change)
    }

    pub fn approve(&mut self, id: u64) -> Result<&SchemaChange, CatalogError> {
        self.decide(id, ChangeStatus::Approved, "approve")
    }

    pub fn reject(&mut self, id: u64) -> Result<&SchemaChange, CatalogError> {
        self.decide(id, ChangeStatus::Rejected, "reject")
    }

    /// Record an operator-authored rename or retype, already approved
    pub fn record_manual(&mut self, dataset: &str, column: &str, kind: ChangeKind) -> Result<u64, CatalogError> {
        let snapshot = self.current_or_err(dataset)?;
        let invalid = |problem| CatalogError::InvalidColumn {
            dataset: dataset.to_string(),
            column: column.to_string(),
            problem,
        };
        let existing = snapshot.column(column).ok_or_else(|| invalid("does not exist"))?;
        let kind = match kind {
            ChangeKind::Rename { to } => {
                if snapshot.contains(&to) {
                    return Err(CatalogError::InvalidColumn {
                        dataset: dataset.to_string(),
                        column: to,
                        problem: "already exists",
                    });
                }
                ChangeKind::Rename { to }
            },
            ChangeKind::Retype { to, .. } => ChangeKind::Retype {
                from: existing.kind,
                to,
            },
            ChangeKind::Add { .. } | ChangeKind::Remove => {
                return Err(invalid("can only be renamed or retyped manually"));
            },
        };
        Ok(self.record(dataset, column, kind, ChangeStatus::Approved, None, None))
    }

    pub(crate) fn mark_applied(&mut self, ids: &[u64], migration_id: u64) {
        let now = Utc::now();
        for change in self.changes.iter_mut().filter(|c| ids.contains(&c.id)) {
            change.status = ChangeStatus::Applied;
            change.applied_at = Some(now);
            change.migration_id = Some(migration_id);
        }
    }

    pub(crate) fn record_compensating(
        &mut self,
        dataset: &str,
        column: &str,
        kind: ChangeKind,
        migration_id: u64,
    ) -> u64 {
        self.record(dataset, column, kind, ChangeStatus::Applied, None, Some(migration_id))
    }

    /// Append a snapshot; positions are renumbered from the column order
    pub(crate) fn publish(
        &mut self,
        dataset: &str,
        mut columns: Vec<ColumnDescriptor>,
        migration_id: Option<u64>,
    ) -> Result<u32, CatalogError> {
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(CatalogError::InvalidColumn {
                    dataset: dataset.to_string(),
                    column: column.name.clone(),
                    problem: "is duplicated",
                });
            }
        }
        for (position, column) in columns.iter_mut().enumerate() {
            column.position = position;
        }

        let history = self.snapshots.entry(dataset.to_string()).or_default();
        let version = history.last().map_or(1, |s| s.version + 1);
        history.push(SchemaSnapshot {
            dataset: dataset.to_string(),
            version,
            columns,
            migration_id,
            created_at: Utc::now(),
        });
        Ok(version)
    }
}

/// Column list after applying `changes` to `snapshot`, in order
pub fn plan_structure(snapshot: &SchemaSnapshot, changes: &[&SchemaChange]) -> Result<Vec<ColumnDescriptor>, String> {
    let mut columns = snapshot.columns.clone();
    for change in changes {
        let index = columns.iter().position(|c| c.name == change.column);
        match (&change.kind, index) {
            (ChangeKind::Add { kind, handler }, None) => {
                columns.push(ColumnDescriptor::new(change.column.clone(), handler.clone(), *kind));
            },
            (ChangeKind::Add { .. }, Some(_)) => {
                return Err(format!("column '{}' already exists", change.column));
            },
            (ChangeKind::Remove, Some(i)) => {
                columns.remove(i);
            },
            (ChangeKind::Rename { to }, Some(i)) => {
                if columns.iter().any(|c| &c.name == to) {
                    return Err(format!("cannot rename '{}' to existing column '{}'", change.column, to));
                }
                columns[i].name = to.clone();
            },
            (ChangeKind::Retype { to, .. }, Some(i)) => {
                columns[i].kind = *to;
            },
            (_, None) => {
                return Err(format!("column '{}' does not exist", change.column));
            },
        }
    }
    Ok(columns)
}
