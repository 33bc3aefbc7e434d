//! Ordered, resumable schema migrations

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::backfill::{preview_backfill, run_backfill, BackfillConfig, BackfillProgress};
use super::types::{DryRunReport, Migration, MigrationReport, MigrationStatus, Transform};
use crate::error::MigrationError;
use crate::schema::{
    plan_structure, ChangeKind, ChangeStatus, ColumnDescriptor, SchemaCatalog, SchemaChange, SchemaSnapshot,
};
use crate::store::{RelationalStore, StructuralOp};

/// All migrations in creation order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationRegistry {
    migrations: Vec<Migration>,
    next_id: u64,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u64) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.id == id)
    }

    pub fn list(&self, dataset: Option<&str>) -> Vec<&Migration> {
        self.migrations
            .iter()
            .filter(|m| dataset.map_or(true, |d| m.dataset == d))
            .collect()
    }

    fn index(&self, id: u64) -> Result<usize, MigrationError> {
        self.migrations
            .iter()
            .position(|m| m.id == id)
            .ok_or(MigrationError::NotFound(id))
    }

    /// Live (not rolled back) migration that bundles `change_id`
    pub fn bundling(&self, change_id: u64) -> Option<&Migration> {
        self.migrations
            .iter()
            .find(|m| m.status != MigrationStatus::RolledBack && m.change_ids.contains(&change_id))
    }

    /// Bundle approved changes of one dataset into a new migration
    pub fn create(
        &mut self,
        catalog: &SchemaCatalog,
        dataset: &str,
        change_ids: &[u64],
        backfill: Option<Transform>,
        rollback: Option<Transform>,
    ) -> Result<u64, MigrationError> {
        if change_ids.is_empty() {
            return Err(MigrationError::Empty);
        }
        for &change_id in change_ids {
            let change = catalog
                .change(change_id)
                .ok_or(crate::error::CatalogError::UnknownChange(change_id))?;
            if change.dataset != dataset {
                return Err(MigrationError::WrongDataset {
                    change_id,
                    expected: dataset.to_string(),
                    actual: change.dataset.clone(),
                });
            }
            if change.status != ChangeStatus::Approved {
                return Err(MigrationError::ChangeNotApproved {
                    change_id,
                    status: change.status.to_string(),
                });
            }
            if let Some(existing) = self.bundling(change_id) {
                return Err(MigrationError::AlreadyBundled {
                    change_id,
                    migration_id: existing.id,
                });
            }
        }

        self.next_id += 1;
        let id = self.next_id;
        self.migrations.push(Migration {
            id,
            dataset: dataset.to_string(),
            change_ids: change_ids.to_vec(),
            status: MigrationStatus::Pending,
            structure_applied: false,
            last_committed_batch: None,
            rollback_committed_batch: None,
            backup_table: None,
            has_backfill: backfill.is_some(),
            has_rollback: rollback.is_some(),
            last_error: None,
            created_at: Utc::now(),
            applied_at: None,
            rolled_back_at: None,
            backfill,
            rollback,
        });
        info!(migration_id = id, dataset = %dataset, changes = ?change_ids, "Created migration");
        Ok(id)
    }

    /// Re-attach transforms after the registry was reloaded from disk
    pub fn attach_transforms(
        &mut self,
        id: u64,
        backfill: Option<Transform>,
        rollback: Option<Transform>,
    ) -> Result<(), MigrationError> {
        let idx = self.index(id)?;
        let migration = &mut self.migrations[idx];
        if backfill.is_some() {
            migration.has_backfill = true;
            migration.backfill = backfill;
        }
        if rollback.is_some() {
            migration.has_rollback = true;
            migration.rollback = rollback;
        }
        Ok(())
    }

    fn check_order(&self, idx: usize) -> Result<(), MigrationError> {
        let migration = &self.migrations[idx];
        let blocking = self.migrations[..idx].iter().find(|m| {
            m.dataset == migration.dataset && matches!(m.status, MigrationStatus::Pending | MigrationStatus::Failed)
        });
        match blocking {
            Some(earlier) => Err(MigrationError::OutOfOrder {
                migration_id: migration.id,
                blocking_id: earlier.id,
            }),
            None => Ok(()),
        }
    }

    /// Migrations of `dataset` that still need applying, up to and including
    /// `last`, in creation order
    pub fn unapplied_through(&self, dataset: &str, last: u64) -> Vec<u64> {
        self.migrations
            .iter()
            .filter(|m| m.dataset == dataset && m.id <= last)
            .filter(|m| matches!(m.status, MigrationStatus::Pending | MigrationStatus::Failed))
            .map(|m| m.id)
            .collect()
    }

    fn check_runnable(&self, idx: usize) -> Result<(), MigrationError> {
        let migration = &self.migrations[idx];
        match migration.status {
            MigrationStatus::Applied => return Err(MigrationError::AlreadyApplied(migration.id)),
            MigrationStatus::RolledBack => return Err(MigrationError::RolledBack(migration.id)),
            MigrationStatus::Pending | MigrationStatus::Failed => {},
        }
        self.check_order(idx)?;
        if migration.has_backfill && migration.backfill.is_none() {
            return Err(MigrationError::TransformNotAttached {
                migration_id: migration.id,
                which: "backfill",
            });
        }
        Ok(())
    }

    fn plan(&self, idx: usize, catalog: &SchemaCatalog) -> Result<ApplyPlan, MigrationError> {
        let migration = &self.migrations[idx];
        let structure = if migration.structure_applied {
            None
        } else {
            Some(plan_structure_for(migration, catalog)?)
        };
        let columns = match &structure {
            Some(planned) => planned.columns.iter().map(|c| c.name.clone()).collect(),
            None => catalog
                .current(&migration.dataset)
                .map(|s| s.column_names())
                .unwrap_or_default(),
        };
        Ok(ApplyPlan {
            migration_id: migration.id,
            dataset: migration.dataset.clone(),
            structure,
            columns,
            backfill: migration.backfill.clone(),
            resume_after: migration.last_committed_batch,
        })
    }

    /// Validate a migration and plan its store work.
    ///
    /// Only checks order, status and structure; the store is not touched, so
    /// the caller can release its locks before running the plan. Callers
    /// serialize work per dataset.
    pub fn begin_apply(&mut self, id: u64, catalog: &SchemaCatalog) -> Result<ApplyPlan, MigrationError> {
        let idx = self.index(id)?;
        self.check_runnable(idx)?;
        match self.plan(idx, catalog) {
            Ok(plan) => Ok(plan),
            Err(e) => {
                let migration = &mut self.migrations[idx];
                migration.status = MigrationStatus::Failed;
                migration.last_error = Some(e.to_string());
                error!(migration_id = id, error = %e, "Migration structure is invalid");
                Err(e)
            },
        }
    }

    /// Plan a migration for a dry run; nothing is recorded
    pub fn plan_dry_run(&self, id: u64, catalog: &SchemaCatalog) -> Result<ApplyPlan, MigrationError> {
        let idx = self.index(id)?;
        self.check_runnable(idx)?;
        self.plan(idx, catalog)
    }

    /// Record the result of an executed [`ApplyPlan`].
    ///
    /// A newly applied structure is published even when the backfill failed
    /// afterwards, so a retry resumes at the backfill.
    pub fn finish_apply(
        &mut self,
        catalog: &mut SchemaCatalog,
        outcome: ApplyOutcome,
    ) -> Result<MigrationReport, MigrationError> {
        let ApplyOutcome {
            plan,
            backup_table,
            structure_done,
            marker,
            progress,
            mut error,
        } = outcome;
        let id = plan.migration_id;
        let idx = self.index(id)?;
        let migration = &mut self.migrations[idx];
        let mut report = MigrationReport {
            migration_id: id,
            batches_committed: progress.batches,
            rows_transformed: progress.rows,
            ..Default::default()
        };

        if let Some(backup) = backup_table {
            migration.backup_table = Some(backup.clone());
            report.backup_table = Some(backup);
        }
        if let (true, Some(planned)) = (structure_done, plan.structure) {
            match catalog.publish(&plan.dataset, planned.columns, Some(id)) {
                Ok(version) => {
                    migration.structure_applied = true;
                    report.schema_version = Some(version);
                },
                Err(e) => error = error.or(Some(e.into())),
            }
        }
        migration.last_committed_batch = marker;

        if let Some(err) = error {
            migration.status = MigrationStatus::Failed;
            migration.last_error = Some(err.to_string());
            error!(migration_id = id, error = %err, "Migration failed");
            return Err(err);
        }

        catalog.mark_applied(&migration.change_ids, id);
        migration.status = MigrationStatus::Applied;
        migration.applied_at = Some(Utc::now());
        migration.last_error = None;
        info!(
            migration_id = id,
            dataset = %migration.dataset,
            batches = report.batches_committed,
            "Migration applied"
        );
        Ok(report)
    }

    /// Apply structure, then backfill, then mark everything applied.
    ///
    /// A failed migration resumes where it stopped: the structural step is
    /// not repeated and backfill continues after the last committed batch.
    pub async fn apply(
        &mut self,
        id: u64,
        catalog: &mut SchemaCatalog,
        store: &dyn RelationalStore,
        table: &str,
        config: &BackfillConfig,
    ) -> Result<MigrationReport, MigrationError> {
        let plan = self.begin_apply(id, catalog)?;
        let outcome = plan.execute(store, table, config).await;
        self.finish_apply(catalog, outcome)
    }

    /// Validate a rollback and plan its store work
    pub fn begin_rollback(&self, id: u64, catalog: &SchemaCatalog) -> Result<RollbackPlan, MigrationError> {
        let idx = self.index(id)?;
        let migration = &self.migrations[idx];
        if migration.status != MigrationStatus::Applied {
            return Err(MigrationError::NotApplied(id));
        }
        if let Some(later) = self.migrations[idx + 1..].iter().find(|m| {
            m.dataset == migration.dataset
                && (m.status == MigrationStatus::Applied
                    || (m.structure_applied && m.status != MigrationStatus::RolledBack))
        }) {
            return Err(MigrationError::NotLatest {
                migration_id: id,
                later_id: later.id,
            });
        }

        let changes = collect_changes(catalog, &migration.change_ids)?;
        let data_affecting = migration.has_backfill
            || changes
                .iter()
                .any(|c| matches!(c.kind, ChangeKind::Remove | ChangeKind::Retype { .. }));
        if data_affecting && !migration.has_rollback {
            return Err(MigrationError::MissingRollbackTransform(id));
        }
        if migration.has_rollback && migration.rollback.is_none() {
            return Err(MigrationError::TransformNotAttached {
                migration_id: id,
                which: "rollback",
            });
        }

        let history = catalog.history(&migration.dataset);
        let produced = history
            .iter()
            .rposition(|s| s.migration_id == Some(id))
            .ok_or_else(|| MigrationError::InvalidStructure {
                migration_id: id,
                message: "no snapshot published by this migration".into(),
            })?;
        let before = produced
            .checked_sub(1)
            .map(|i| history[i].clone())
            .ok_or_else(|| MigrationError::InvalidStructure {
                migration_id: id,
                message: "no snapshot precedes this migration".into(),
            })?;
        let current = history[history.len() - 1].clone();

        // Undo structure in reverse change order.
        let mut inverse = Vec::with_capacity(changes.len());
        for op in changes.iter().map(StructuralOp::from_change).rev() {
            let undo = op.inverse(&before).ok_or_else(|| MigrationError::InvalidStructure {
                migration_id: id,
                message: format!("cannot invert {:?}", op),
            })?;
            inverse.push(undo);
        }

        let compensating: Vec<(String, ChangeKind)> = changes
            .iter()
            .rev()
            .map(|c| compensating_change(c, &before))
            .collect();
        let columns = restored_columns(current.columns.clone(), &compensating, &before);

        Ok(RollbackPlan {
            migration_id: id,
            dataset: migration.dataset.clone(),
            transform: migration.rollback.clone(),
            resume_after: migration.rollback_committed_batch,
            inverse,
            current,
            compensating,
            columns,
        })
    }

    /// Record the result of an executed [`RollbackPlan`].
    ///
    /// The rollback transform's progress is kept even when the rollback
    /// fails, so a retry continues after the last committed batch instead of
    /// transforming committed rows twice. The migration stays applied until
    /// the structure is undone.
    pub fn finish_rollback(
        &mut self,
        catalog: &mut SchemaCatalog,
        outcome: RollbackOutcome,
    ) -> Result<MigrationReport, MigrationError> {
        let RollbackOutcome {
            plan,
            marker,
            progress,
            error,
        } = outcome;
        let id = plan.migration_id;
        let idx = self.index(id)?;
        let migration = &mut self.migrations[idx];
        migration.rollback_committed_batch = marker;

        if let Some(err) = error {
            migration.last_error = Some(err.to_string());
            error!(migration_id = id, error = %err, "Rollback failed");
            return Err(err);
        }

        for (column, kind) in plan.compensating {
            catalog.record_compensating(&plan.dataset, &column, kind, id);
        }
        let version = catalog.publish(&plan.dataset, plan.columns, Some(id))?;

        migration.status = MigrationStatus::RolledBack;
        migration.rolled_back_at = Some(Utc::now());
        migration.last_error = None;
        info!(migration_id = id, dataset = %plan.dataset, "Migration rolled back");
        Ok(MigrationReport {
            migration_id: id,
            schema_version: Some(version),
            batches_committed: progress.batches,
            rows_transformed: progress.rows,
            backup_table: None,
        })
    }

    /// Undo the most recently applied migration of its dataset
    pub async fn rollback(
        &mut self,
        id: u64,
        catalog: &mut SchemaCatalog,
        store: &dyn RelationalStore,
        table: &str,
        config: &BackfillConfig,
    ) -> Result<MigrationReport, MigrationError> {
        let plan = self.begin_rollback(id, catalog)?;
        let outcome = plan.execute(store, table, config).await;
        self.finish_rollback(catalog, outcome)
    }
}

struct PlannedStructure {
    ops: Vec<StructuralOp>,
    before: SchemaSnapshot,
    columns: Vec<ColumnDescriptor>,
}

/// Store work of one apply, detached from the registry
pub struct ApplyPlan {
    migration_id: u64,
    dataset: String,
    structure: Option<PlannedStructure>,
    columns: Vec<String>,
    backfill: Option<Transform>,
    resume_after: Option<u64>,
}

/// What running an [`ApplyPlan`] did to the store
pub struct ApplyOutcome {
    plan: ApplyPlan,
    backup_table: Option<String>,
    structure_done: bool,
    marker: Option<u64>,
    progress: BackfillProgress,
    error: Option<MigrationError>,
}

impl ApplyPlan {
    pub fn migration_id(&self) -> u64 {
        self.migration_id
    }

    /// Back up (if configured), change structure, then backfill
    pub async fn execute(self, store: &dyn RelationalStore, table: &str, config: &BackfillConfig) -> ApplyOutcome {
        let id = self.migration_id;
        let mut outcome = ApplyOutcome {
            marker: self.resume_after,
            plan: self,
            backup_table: None,
            structure_done: false,
            progress: BackfillProgress::default(),
            error: None,
        };

        if let Some(planned) = &outcome.plan.structure {
            if config.backup {
                let backup = format!("{}_backup_{}", table, id);
                match store.backup_table(table, &backup).await {
                    Ok(rows) => {
                        info!(migration_id = id, backup = %backup, rows, "Backed up destination table");
                        outcome.backup_table = Some(backup);
                    },
                    Err(source) => {
                        outcome.error = Some(MigrationError::Structural {
                            migration_id: id,
                            source,
                        });
                        return outcome;
                    },
                }
            }
            if let Err(e) = run_ops(store, table, &planned.ops, &planned.before, id).await {
                outcome.error = Some(e);
                return outcome;
            }
            outcome.structure_done = true;
            outcome.marker = None;
        }

        if let Some(transform) = &outcome.plan.backfill {
            match run_backfill(store, table, transform, config, &mut outcome.marker).await {
                Ok(progress) => outcome.progress = progress,
                Err(failure) => {
                    outcome.error = Some(MigrationError::Backfill {
                        migration_id: id,
                        batch: failure.batch,
                        last_committed: outcome.marker,
                        message: failure.message,
                    });
                },
            }
        }
        outcome
    }

    /// Report what [`ApplyPlan::execute`] would do without writing anything.
    ///
    /// The backfill transform sees each row reshaped by the planned
    /// structural operations.
    pub async fn preview(&self, store: &dyn RelationalStore, table: &str, config: &BackfillConfig) -> DryRunReport {
        let ops: &[StructuralOp] = self.structure.as_ref().map_or(&[], |s| &s.ops);
        let mut report = DryRunReport {
            migration_id: self.migration_id,
            operations: ops.iter().map(ToString::to_string).collect(),
            columns: self.columns.clone(),
            ..Default::default()
        };
        if let Some(transform) = &self.backfill {
            let (progress, failure) = preview_backfill(store, table, transform, config, ops).await;
            report.batches_checked = progress.batches;
            report.rows_checked = progress.rows;
            report.failed_batch = failure.map(|f| (f.batch, f.message));
        }
        info!(
            migration_id = self.migration_id,
            operations = report.operations.len(),
            rows = report.rows_checked,
            "Dry run finished"
        );
        report
    }
}

/// Store work of one rollback, detached from the registry
pub struct RollbackPlan {
    migration_id: u64,
    dataset: String,
    transform: Option<Transform>,
    resume_after: Option<u64>,
    inverse: Vec<StructuralOp>,
    current: SchemaSnapshot,
    compensating: Vec<(String, ChangeKind)>,
    columns: Vec<ColumnDescriptor>,
}

/// What running a [`RollbackPlan`] did to the store
pub struct RollbackOutcome {
    plan: RollbackPlan,
    marker: Option<u64>,
    progress: BackfillProgress,
    error: Option<MigrationError>,
}

impl RollbackPlan {
    /// Run the rollback transform over the migrated structure, then undo the structure
    pub async fn execute(self, store: &dyn RelationalStore, table: &str, config: &BackfillConfig) -> RollbackOutcome {
        let id = self.migration_id;
        let mut outcome = RollbackOutcome {
            marker: self.resume_after,
            plan: self,
            progress: BackfillProgress::default(),
            error: None,
        };

        if let Some(transform) = &outcome.plan.transform {
            match run_backfill(store, table, transform, config, &mut outcome.marker).await {
                Ok(progress) => outcome.progress = progress,
                Err(failure) => {
                    outcome.error = Some(MigrationError::Backfill {
                        migration_id: id,
                        batch: failure.batch,
                        last_committed: outcome.marker,
                        message: failure.message,
                    });
                    return outcome;
                },
            }
        }

        if let Err(e) = run_ops(store, table, &outcome.plan.inverse, &outcome.plan.current, id).await {
            outcome.error = Some(e);
        }
        outcome
    }
}

fn collect_changes(catalog: &SchemaCatalog, ids: &[u64]) -> Result<Vec<SchemaChange>, MigrationError> {
    ids.iter()
        .map(|id| {
            catalog
                .change(*id)
                .cloned()
                .ok_or(MigrationError::Catalog(crate::error::CatalogError::UnknownChange(*id)))
        })
        .collect()
}

fn compensating_change(change: &SchemaChange, before: &SchemaSnapshot) -> (String, ChangeKind) {
    match &change.kind {
        ChangeKind::Add { .. } => (change.column.clone(), ChangeKind::Remove),
        ChangeKind::Remove => {
            let (kind, handler) = before
                .column(&change.column)
                .map(|c| (c.kind, c.handler.clone()))
                .unwrap_or_default();
            (change.column.clone(), ChangeKind::Add { kind, handler })
        },
        ChangeKind::Rename { to } => (
            to.clone(),
            ChangeKind::Rename {
                to: change.column.clone(),
            },
        ),
        ChangeKind::Retype { from, to } => (
            change.column.clone(),
            ChangeKind::Retype { from: *to, to: *from },
        ),
    }
}

/// Columns after applying compensating changes to the migrated structure
fn restored_columns(
    mut columns: Vec<ColumnDescriptor>,
    compensating: &[(String, ChangeKind)],
    before: &SchemaSnapshot,
) -> Vec<ColumnDescriptor> {
    for (column, kind) in compensating {
        match kind {
            ChangeKind::Add { kind, handler } => {
                let position = before
                    .column(column)
                    .map_or(columns.len(), |c| c.position.min(columns.len()));
                columns.insert(position, ColumnDescriptor::new(column.clone(), handler.clone(), *kind));
            },
            ChangeKind::Remove => columns.retain(|c| &c.name != column),
            ChangeKind::Rename { to } => {
                if let Some(c) = columns.iter_mut().find(|c| &c.name == column) {
                    c.name = to.clone();
                }
            },
            ChangeKind::Retype { to, .. } => {
                if let Some(c) = columns.iter_mut().find(|c| &c.name == column) {
                    c.kind = *to;
                }
            },
        }
    }
    columns
}

/// Run ops in order, reverting completed ones best-effort if one fails
async fn run_ops(
    store: &dyn RelationalStore,
    table: &str,
    ops: &[StructuralOp],
    before: &SchemaSnapshot,
    migration_id: u64,
) -> Result<(), MigrationError> {
    for (i, op) in ops.iter().enumerate() {
        if let Err(source) = store.apply_structural(table, op).await {
            for done in ops[..i].iter().rev() {
                let Some(undo) = done.inverse(before) else {
                    warn!(migration_id, op = ?done, "No inverse for structural op");
                    continue;
                };
                if let Err(e) = store.apply_structural(table, &undo).await {
                    warn!(migration_id, op = ?undo, error = %e, "Failed to revert structural op");
                }
            }
            return Err(MigrationError::Structural { migration_id, source });
        }
    }
    Ok(())
}

/// Validate the bundled changes against the current snapshot and plan the
/// structural operations and resulting columns
fn plan_structure_for(migration: &Migration, catalog: &SchemaCatalog) -> Result<PlannedStructure, MigrationError> {
    let changes = collect_changes(catalog, &migration.change_ids)?;
    if let Some(change) = changes.iter().find(|c| c.status != ChangeStatus::Approved) {
        return Err(MigrationError::ChangeNotApproved {
            change_id: change.id,
            status: change.status.to_string(),
        });
    }

    let before = catalog
        .current(&migration.dataset)
        .cloned()
        .ok_or_else(|| crate::error::CatalogError::UnknownDataset(migration.dataset.clone()))?;
    let refs: Vec<&SchemaChange> = changes.iter().collect();
    let columns = plan_structure(&before, &refs).map_err(|message| MigrationError::InvalidStructure {
        migration_id: migration.id,
        message,
    })?;

    Ok(PlannedStructure {
        ops: changes.iter().map(StructuralOp::from_change).collect(),
        before,
        columns,
    })
}
