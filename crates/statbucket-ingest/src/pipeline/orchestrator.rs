//! Dataset run orchestration
//!
//! A run walks the dataset's source units in order:
//! fetch → extract → diff/guard → persist. Pages are fetched ahead with
//! `buffered`, which keeps unit order, while diffing stays strictly
//! sequential. A schema halt stops the whole dataset run and leaves the
//! remaining units pending. Runs over one dataset are serialized by a lease;
//! every unit is bounded by the lease deadline and the lease is renewed after
//! each unit.
//!
//! Shared state sits behind short-lived locks. Store I/O (table creation,
//! structural changes, backfills) runs with no lock held, so work on one
//! dataset never waits on another dataset's migration.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use statbucket_common::{Row, Value};

use super::dataset::DatasetPipeline;
use super::fetcher::{Fetcher, SourceUnit};
use super::report::{PersistTarget, RunOptions, RunReport, RunStatus, UnitOutcome, UnitReport};
use super::retry::{with_retry, Attempted, RetryPolicy};
use crate::checkpoint::{Checkpoint, CheckpointStatus, CheckpointStore, LeaseGuard, LeaseManager};
use crate::config::{dependency_order, IngestConfig};
use crate::error::{
    CheckpointLeaseError, ExtractionError, FetchError, IngestError, Result, SchemaGuardHalt, StoreError,
};
use crate::extract::Extraction;
use crate::migration::{BackfillConfig, DryRunReport, Migration, MigrationRegistry, MigrationReport, Transform};
use crate::schema::{ChangeKind, GuardOutcome, SchemaCatalog, SchemaChange, SchemaSnapshot};
use crate::state::IngestState;
use crate::store::RelationalStore;

/// Runtime knobs shared by every dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub retry: RetryPolicy,
    pub lease_ttl: Duration,
    /// Pages fetched ahead of the unit being processed
    pub fetch_concurrency: usize,
    pub backfill: BackfillConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lease_ttl: Duration::from_secs(crate::config::DEFAULT_LEASE_TIMEOUT_SECS),
            fetch_concurrency: crate::config::DEFAULT_FETCH_CONCURRENCY,
            backfill: BackfillConfig::default(),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            retry: config.retry,
            lease_ttl: config.lease_timeout(),
            fetch_concurrency: config.fetch_concurrency,
            backfill: config.backfill,
        }
    }
}

/// Diff rounds per unit; a round after auto-add migrations checks the new structure
const MAX_GUARD_ROUNDS: usize = 3;

/// How far a single unit got
enum Processed {
    Done { rows_persisted: usize, rows_rejected: usize },
    Halted(SchemaGuardHalt),
}

/// A unit selected for this run
struct Planned {
    key: String,
    skip: bool,
    /// Halted units with a parked extraction resume at diffing
    needs_fetch: bool,
}

/// Runs datasets and exposes the operator actions on shared state.
///
/// Shared state is locked in the order catalog → migrations → checkpoints.
pub struct Orchestrator {
    catalog: Arc<Mutex<SchemaCatalog>>,
    migrations: Arc<Mutex<MigrationRegistry>>,
    checkpoints: Arc<Mutex<CheckpointStore>>,
    leases: LeaseManager,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn RelationalStore>,
    settings: PipelineSettings,
    datasets: HashMap<String, DatasetPipeline>,
    /// Dataset names in registration order
    registered: Vec<String>,
}

impl Orchestrator {
    pub fn new(fetcher: Arc<dyn Fetcher>, store: Arc<dyn RelationalStore>, settings: PipelineSettings) -> Self {
        Self::with_state(fetcher, store, settings, IngestState::default())
    }

    /// Start from previously persisted state
    pub fn with_state(
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn RelationalStore>,
        settings: PipelineSettings,
        state: IngestState,
    ) -> Self {
        Self {
            catalog: Arc::new(Mutex::new(state.catalog)),
            migrations: Arc::new(Mutex::new(state.migrations)),
            checkpoints: Arc::new(Mutex::new(state.checkpoints)),
            leases: LeaseManager::new(),
            fetcher,
            store,
            settings,
            datasets: HashMap::new(),
            registered: Vec::new(),
        }
    }

    pub fn register(&mut self, pipeline: DatasetPipeline) {
        info!(dataset = %pipeline.name(), "Registered dataset");
        let name = pipeline.name().to_string();
        if self.datasets.insert(name.clone(), pipeline).is_none() {
            self.registered.push(name);
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    fn pipeline(&self, dataset: &str) -> Result<&DatasetPipeline> {
        self.datasets
            .get(dataset)
            .ok_or_else(|| IngestError::UnknownDataset(dataset.to_string()))
    }

    /// Consistent copy of all shared state, for persisting
    pub async fn state(&self) -> IngestState {
        let catalog = self.catalog.lock().await;
        let migrations = self.migrations.lock().await;
        let checkpoints = self.checkpoints.lock().await;
        IngestState {
            catalog: catalog.clone(),
            checkpoints: checkpoints.clone(),
            migrations: migrations.clone(),
        }
    }

    // ========================================================================
    // Runs
    // ========================================================================

    /// Run one dataset under its lease.
    ///
    /// Fails only if the dataset is unknown or another run holds the lease;
    /// halts, unit failures and cancellation are reported in the [`RunReport`].
    pub async fn run(&self, dataset: &str, options: RunOptions, cancel: CancellationToken) -> Result<RunReport> {
        let pipeline = self.pipeline(dataset)?;
        let mut lease = self.leases.acquire(dataset, self.settings.lease_ttl)?;
        let run_id = Uuid::new_v4();

        let span = info_span!("dataset_run", dataset = %dataset, run_id = %run_id);
        self.run_with_lease(pipeline, &options, &cancel, &mut lease, run_id)
            .instrument(span)
            .await
    }

    /// Run every enabled dataset, dependencies first.
    ///
    /// The sequence stops after the first dataset whose run does not
    /// complete cleanly, since later datasets may depend on it.
    pub async fn run_all(&self, options: RunOptions, cancel: CancellationToken) -> Result<Vec<RunReport>> {
        let order = self.run_order()?;
        info!(datasets = ?order, "Running all datasets");

        let mut reports = Vec::with_capacity(order.len());
        for dataset in order {
            if cancel.is_cancelled() {
                info!(dataset = %dataset, "Cancelled before dataset");
                break;
            }
            let report = self.run(&dataset, options.clone(), cancel.clone()).await?;
            let status = report.status;
            reports.push(report);
            if status != RunStatus::Completed {
                warn!(dataset = %dataset, status = %status, "Stopping before the remaining datasets");
                break;
            }
        }
        Ok(reports)
    }

    /// Enabled datasets in dependency order
    pub fn run_order(&self) -> Result<Vec<String>> {
        let definitions: Vec<_> = self
            .registered
            .iter()
            .filter_map(|name| self.datasets.get(name))
            .map(DatasetPipeline::definition)
            .collect();
        let order = dependency_order(definitions.iter().copied())?;
        Ok(order
            .into_iter()
            .filter(|name| {
                let enabled = self.datasets.get(name).is_some_and(|p| p.definition().enabled);
                if !enabled {
                    debug!(dataset = %name, "Dataset disabled, skipping");
                }
                enabled
            })
            .collect())
    }

    async fn run_with_lease(
        &self,
        pipeline: &DatasetPipeline,
        options: &RunOptions,
        cancel: &CancellationToken,
        lease: &mut LeaseGuard,
        run_id: Uuid,
    ) -> Result<RunReport> {
        let dataset = pipeline.name();
        let mut report = RunReport {
            run_id,
            dataset: dataset.to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            status: RunStatus::Completed,
            units: Vec::new(),
            rows_persisted: 0,
            rows_rejected: 0,
            auto_migrations: Vec::new(),
            halt: None,
        };

        let plan = self.plan(pipeline, options).await?;
        if options.target.destination() {
            self.ensure_destination(pipeline.name(), &pipeline.destination_table())
                .await?;
        }
        info!(
            units = plan.len(),
            skipped = plan.iter().filter(|p| p.skip).count(),
            target = ?options.target,
            "Starting dataset run"
        );

        let mut fetches = Box::pin(
            stream::iter(
                plan.iter()
                    .filter(|p| !p.skip && p.needs_fetch)
                    .map(|p| pipeline.unit(&p.key))
                    .collect::<Vec<_>>(),
            )
            .map(|unit| self.fetch_with_retry(unit))
            .buffered(self.settings.fetch_concurrency.max(1)),
        );

        let mut stopped = false;
        for planned in &plan {
            if planned.skip {
                report.units.push(UnitReport {
                    unit: planned.key.clone(),
                    outcome: UnitOutcome::Skipped,
                });
                continue;
            }
            if stopped {
                report.units.push(UnitReport {
                    unit: planned.key.clone(),
                    outcome: UnitOutcome::NotReached,
                });
                continue;
            }
            if cancel.is_cancelled() {
                info!(unit = %planned.key, "Run cancelled before unit");
                report.status = RunStatus::Cancelled;
                stopped = true;
                report.units.push(UnitReport {
                    unit: planned.key.clone(),
                    outcome: UnitOutcome::NotReached,
                });
                continue;
            }

            let mut attempts = 0;
            let processed = if lease.is_valid() {
                let unit_work = async {
                    let fetched = if planned.needs_fetch {
                        fetches.next().await
                    } else {
                        None
                    };
                    self.process_unit(pipeline, &planned.key, fetched, options.target, &mut attempts, &mut report)
                        .await
                };
                tokio::time::timeout_at(lease.deadline(), unit_work).await.ok()
            } else {
                None
            };

            if processed.is_some() && !matches!(processed, Some(Ok(Processed::Halted(_)))) {
                if let Err(e) = lease.renew(self.settings.lease_ttl) {
                    error!(unit = %planned.key, error = %e, "Could not renew lease, stopping run");
                    report.status = RunStatus::LeaseExpired;
                    stopped = true;
                }
            }

            let outcome = match processed {
                None => {
                    let err = CheckpointLeaseError::Expired(dataset.to_string());
                    error!(unit = %planned.key, "Lease expired, stopping run");
                    self.record_failure(dataset, &planned.key, &err).await;
                    report.status = RunStatus::LeaseExpired;
                    stopped = true;
                    UnitOutcome::Failed {
                        error: err.to_string(),
                        attempts,
                    }
                },
                Some(Ok(Processed::Done {
                    rows_persisted,
                    rows_rejected,
                })) => {
                    report.rows_persisted += rows_persisted;
                    report.rows_rejected += rows_rejected;
                    UnitOutcome::Done {
                        rows_persisted,
                        rows_rejected,
                    }
                },
                Some(Ok(Processed::Halted(halt))) => {
                    warn!(
                        unit = %planned.key,
                        added = ?halt.added,
                        removed = ?halt.removed,
                        changes = ?halt.change_ids,
                        "Schema drift halted dataset run"
                    );
                    report.halt = Some(halt);
                    report.status = RunStatus::Halted;
                    stopped = true;
                    UnitOutcome::Halted
                },
                Some(Err(e)) => {
                    error!(unit = %planned.key, attempts, error = %e, "Unit failed");
                    self.record_failure(dataset, &planned.key, &e).await;
                    UnitOutcome::Failed {
                        error: e.to_string(),
                        attempts,
                    }
                },
            };
            report.units.push(UnitReport {
                unit: planned.key.clone(),
                outcome,
            });
        }

        if report.status == RunStatus::Completed
            && report.count(|o| matches!(o, UnitOutcome::Failed { .. })) > 0
        {
            report.status = RunStatus::CompletedWithFailures;
        }
        report.finished_at = Utc::now();
        info!(
            status = %report.status,
            rows_persisted = report.rows_persisted,
            rows_rejected = report.rows_rejected,
            "Finished dataset run"
        );
        Ok(report)
    }

    /// Decide per unit whether to skip it and whether it needs a fetch
    async fn plan(&self, pipeline: &DatasetPipeline, options: &RunOptions) -> Result<Vec<Planned>> {
        let dataset = pipeline.name();
        let keys = options
            .units
            .clone()
            .unwrap_or_else(|| pipeline.definition().units.clone());

        let mut checkpoints = self.checkpoints.lock().await;
        let mut plan = Vec::with_capacity(keys.len());
        for key in keys {
            let status = checkpoints.status(dataset, &key);
            if status == CheckpointStatus::Done {
                if !options.force {
                    debug!(unit = %key, "Unit already done, skipping");
                    plan.push(Planned {
                        key,
                        skip: true,
                        needs_fetch: false,
                    });
                    continue;
                }
                checkpoints.reset(dataset, &key)?;
            }
            let needs_fetch = checkpoints
                .get(dataset, &key)
                .map_or(true, |cp| cp.restart_status() == CheckpointStatus::Fetching);
            plan.push(Planned {
                key,
                skip: false,
                needs_fetch,
            });
        }
        Ok(plan)
    }

    async fn fetch_with_retry(&self, unit: SourceUnit) -> Attempted<String, FetchError> {
        let what = format!("fetch {}", unit.key);
        with_retry(&self.settings.retry, &what, FetchError::is_retryable, || self.fetcher.fetch(&unit)).await
    }

    async fn record_failure(&self, dataset: &str, unit: &str, error: &impl ToString) {
        let mut checkpoints = self.checkpoints.lock().await;
        if let Err(e) = checkpoints.fail(dataset, unit, error.to_string()) {
            warn!(unit = %unit, error = %e, "Could not mark unit failed");
        }
    }

    /// Drive one unit from its restart state to done or halted
    async fn process_unit(
        &self,
        pipeline: &DatasetPipeline,
        key: &str,
        fetched: Option<Attempted<String, FetchError>>,
        target: PersistTarget,
        attempts: &mut u32,
        report: &mut RunReport,
    ) -> Result<Processed> {
        let dataset = pipeline.name();

        let extraction = match fetched {
            Some(fetched) => {
                {
                    let mut checkpoints = self.checkpoints.lock().await;
                    checkpoints.transition(dataset, key, CheckpointStatus::Fetching)?;
                    checkpoints.add_attempts(dataset, key, fetched.attempts);
                }
                *attempts += fetched.attempts;
                let page = fetched.result?;

                self.checkpoints
                    .lock()
                    .await
                    .transition(dataset, key, CheckpointStatus::Extracting)?;
                let table = pipeline.locator().locate(&page)?;
                let extraction = pipeline.extractor().extract(&table);
                debug!(
                    unit = %key,
                    columns = extraction.columns.len(),
                    rows = extraction.rows.len(),
                    rejected = extraction.rejected.len(),
                    "Extracted unit"
                );

                self.checkpoints
                    .lock()
                    .await
                    .transition(dataset, key, CheckpointStatus::Diffing)?;
                extraction
            },
            None => {
                let mut checkpoints = self.checkpoints.lock().await;
                let checkpoint = checkpoints.transition(dataset, key, CheckpointStatus::Diffing)?;
                info!(unit = %key, "Resuming parked extraction");
                checkpoint.parked.clone().ok_or_else(|| {
                    ExtractionError::Malformed(format!("unit '{}' has no parked extraction", key))
                })?
            },
        };

        let mut outcome = self.guard(pipeline, key, &extraction).await?;
        for _ in 1..MAX_GUARD_ROUNDS {
            let GuardOutcome::Pass { auto_added, .. } = &outcome else {
                break;
            };
            if auto_added.is_empty() {
                break;
            }
            let applied = self.apply_auto_add(pipeline, auto_added).await?;
            report.auto_migrations.extend(applied);
            // Migrations queued ahead of the auto-add may have reshaped the table.
            outcome = self.guard(pipeline, key, &extraction).await?;
        }

        let (ignored, tolerated_missing) = match outcome {
            GuardOutcome::Halt(halt) => {
                self.checkpoints
                    .lock()
                    .await
                    .halt(dataset, key, extraction, &halt)?;
                return Ok(Processed::Halted(halt));
            },
            GuardOutcome::Initialized { version } => {
                info!(unit = %key, version, "Initialized dataset schema");
                (Vec::new(), Vec::new())
            },
            GuardOutcome::Pass {
                ignored,
                tolerated_missing,
                ..
            } => (ignored, tolerated_missing),
        };

        let rows_rejected = extraction.rejected.len();
        let rows = shape_rows(extraction, &ignored, &tolerated_missing);

        self.checkpoints
            .lock()
            .await
            .transition(dataset, key, CheckpointStatus::Persisting)?;
        if target.destination() {
            self.check_destination_columns(dataset, &pipeline.destination_table(), &rows)
                .await?;
        }

        let persisted = with_retry(
            &self.settings.retry,
            "persist",
            StoreError::is_transient,
            || self.persist(pipeline, key, &rows, target),
        )
        .await;
        *attempts += persisted.attempts;
        self.checkpoints
            .lock()
            .await
            .add_attempts(dataset, key, persisted.attempts);
        let rows_persisted = persisted.result?;

        self.checkpoints
            .lock()
            .await
            .complete(dataset, key, rows_persisted)?;
        info!(unit = %key, rows = rows_persisted, rejected = rows_rejected, "Unit done");
        Ok(Processed::Done {
            rows_persisted,
            rows_rejected,
        })
    }

    /// Initialize the dataset on first sight, otherwise diff and apply the guard
    async fn guard(&self, pipeline: &DatasetPipeline, key: &str, extraction: &Extraction) -> Result<GuardOutcome> {
        let dataset = pipeline.name();
        {
            let mut catalog = self.catalog.lock().await;
            if catalog.current(dataset).is_some() {
                return Ok(catalog.observe(dataset, &extraction.columns, key, pipeline.policy())?);
            }
        }
        // The dataset lease keeps anyone else from initializing it meanwhile.
        self.store
            .create_table(&pipeline.destination_table(), &extraction.columns)
            .await?;
        let version = self
            .catalog
            .lock()
            .await
            .initialize(dataset, &extraction.columns)?
            .version;
        Ok(GuardOutcome::Initialized { version })
    }

    /// Bundle approved auto-add changes and apply their migration, along
    /// with any earlier migrations of the dataset still waiting, in order
    async fn apply_auto_add(&self, pipeline: &DatasetPipeline, change_ids: &[u64]) -> Result<Vec<u64>> {
        let dataset = pipeline.name();
        let table = pipeline.destination_table();
        let queue = {
            let catalog = self.catalog.lock().await;
            let mut registry = self.migrations.lock().await;
            let unbundled: Vec<u64> = change_ids
                .iter()
                .copied()
                .filter(|id| registry.bundling(*id).is_none())
                .collect();
            if !unbundled.is_empty() {
                registry.create(&catalog, dataset, &unbundled, None, None)?;
            }
            let bundling: BTreeSet<u64> = change_ids
                .iter()
                .filter_map(|id| registry.bundling(*id))
                .map(|m| m.id)
                .collect();
            match bundling.last() {
                Some(&last) => registry.unapplied_through(dataset, last),
                None => Vec::new(),
            }
        };

        let mut applied = Vec::with_capacity(queue.len());
        for id in queue {
            let migration = self.apply_planned(id, &table).await?;
            info!(migration_id = id, version = ?migration.schema_version, "Applied migration for auto-added columns");
            applied.push(id);
        }
        Ok(applied)
    }

    /// Apply one migration; locks are held only to plan and to record
    async fn apply_planned(&self, id: u64, table: &str) -> Result<MigrationReport> {
        let plan = {
            let catalog = self.catalog.lock().await;
            let mut registry = self.migrations.lock().await;
            registry.begin_apply(id, &catalog)?
        };
        let outcome = plan.execute(self.store.as_ref(), table, &self.settings.backfill).await;
        let mut catalog = self.catalog.lock().await;
        let mut registry = self.migrations.lock().await;
        Ok(registry.finish_apply(&mut catalog, outcome)?)
    }

    /// Create the destination table from the current snapshot when the
    /// store does not have it, e.g. a fresh database under existing state
    async fn ensure_destination(&self, dataset: &str, table: &str) -> Result<()> {
        let columns = match self.catalog.lock().await.current(dataset) {
            Some(snapshot) => snapshot.columns.clone(),
            None => return Ok(()),
        };
        self.store.create_table(table, &columns).await?;
        debug!(table = %table, "Destination table present");
        Ok(())
    }

    async fn check_destination_columns(&self, dataset: &str, table: &str, rows: &[Row]) -> Result<()> {
        let catalog = self.catalog.lock().await;
        let snapshot = catalog
            .current(dataset)
            .ok_or_else(|| crate::error::CatalogError::UnknownDataset(dataset.to_string()))?;
        let unknown = rows
            .iter()
            .flat_map(|row| row.columns())
            .find(|column| !snapshot.contains(column));
        match unknown {
            Some(column) => Err(StoreError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Write one unit's rows; replaces whatever the unit wrote before
    async fn persist(
        &self,
        pipeline: &DatasetPipeline,
        key: &str,
        rows: &[Row],
        target: PersistTarget,
    ) -> std::result::Result<usize, StoreError> {
        let mut written = 0;
        if target.intermediate() {
            written = self
                .store
                .stage_rows(&pipeline.intermediate_table(), key, rows)
                .await?;
        }
        if target.destination() {
            let table = pipeline.destination_table();
            let replaced = self.store.delete_unit_rows(&table, key).await?;
            if replaced > 0 {
                debug!(unit = %key, rows = replaced, "Replaced rows from an earlier run");
            }
            written = self.store.insert_rows(&table, key, rows).await?;
        }
        Ok(written)
    }

    // ========================================================================
    // Operator actions
    // ========================================================================

    pub async fn snapshot(&self, dataset: &str) -> Option<SchemaSnapshot> {
        self.catalog.lock().await.current(dataset).cloned()
    }

    pub async fn changes(&self, dataset: Option<&str>, pending_only: bool) -> Vec<SchemaChange> {
        self.catalog
            .lock()
            .await
            .changes(dataset, pending_only)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn approve_change(&self, id: u64) -> Result<SchemaChange> {
        Ok(self.catalog.lock().await.approve(id)?.clone())
    }

    pub async fn reject_change(&self, id: u64) -> Result<SchemaChange> {
        Ok(self.catalog.lock().await.reject(id)?.clone())
    }

    /// Record an operator-initiated rename or retype as an approved change
    pub async fn record_change(&self, dataset: &str, column: &str, kind: ChangeKind) -> Result<u64> {
        Ok(self.catalog.lock().await.record_manual(dataset, column, kind)?)
    }

    pub async fn create_migration(
        &self,
        dataset: &str,
        change_ids: &[u64],
        backfill: Option<Transform>,
        rollback: Option<Transform>,
    ) -> Result<u64> {
        let catalog = self.catalog.lock().await;
        let mut registry = self.migrations.lock().await;
        Ok(registry.create(&catalog, dataset, change_ids, backfill, rollback)?)
    }

    pub async fn attach_transforms(
        &self,
        id: u64,
        backfill: Option<Transform>,
        rollback: Option<Transform>,
    ) -> Result<()> {
        Ok(self
            .migrations
            .lock()
            .await
            .attach_transforms(id, backfill, rollback)?)
    }

    pub async fn migrations(&self, dataset: Option<&str>) -> Vec<Migration> {
        self.migrations
            .lock()
            .await
            .list(dataset)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Dataset and destination table a migration operates on
    async fn migration_target(&self, id: u64) -> Result<(String, String)> {
        let dataset = self
            .migrations
            .lock()
            .await
            .get(id)
            .map(|m| m.dataset.clone())
            .ok_or(crate::error::MigrationError::NotFound(id))?;
        let table = self.pipeline(&dataset)?.destination_table();
        Ok((dataset, table))
    }

    /// Apply a migration while holding the dataset lease
    pub async fn apply_migration(&self, id: u64) -> Result<MigrationReport> {
        let (dataset, table) = self.migration_target(id).await?;
        let _lease = self.leases.acquire(&dataset, self.settings.lease_ttl)?;
        self.ensure_destination(&dataset, &table).await?;
        self.apply_planned(id, &table).await
    }

    /// Report what applying a migration would do; nothing is changed
    pub async fn dry_run_migration(&self, id: u64) -> Result<DryRunReport> {
        let (dataset, table) = self.migration_target(id).await?;
        let _lease = self.leases.acquire(&dataset, self.settings.lease_ttl)?;
        let plan = {
            let catalog = self.catalog.lock().await;
            self.migrations.lock().await.plan_dry_run(id, &catalog)?
        };
        Ok(plan.preview(self.store.as_ref(), &table, &self.settings.backfill).await)
    }

    /// Roll back a migration while holding the dataset lease
    pub async fn rollback_migration(&self, id: u64) -> Result<MigrationReport> {
        let (dataset, table) = self.migration_target(id).await?;
        let _lease = self.leases.acquire(&dataset, self.settings.lease_ttl)?;
        self.ensure_destination(&dataset, &table).await?;

        let plan = {
            let catalog = self.catalog.lock().await;
            self.migrations.lock().await.begin_rollback(id, &catalog)?
        };
        let outcome = plan.execute(self.store.as_ref(), &table, &self.settings.backfill).await;
        let mut catalog = self.catalog.lock().await;
        let mut registry = self.migrations.lock().await;
        Ok(registry.finish_rollback(&mut catalog, outcome)?)
    }

    /// Return a unit to pending so the next run processes it again
    pub async fn reset(&self, dataset: &str, unit: &str) -> Result<()> {
        Ok(self.checkpoints.lock().await.reset(dataset, unit)?)
    }

    pub async fn checkpoints(&self, dataset: &str) -> Vec<Checkpoint> {
        self.checkpoints
            .lock()
            .await
            .list(dataset)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn checkpoint(&self, dataset: &str, unit: &str) -> Option<Checkpoint> {
        self.checkpoints.lock().await.get(dataset, unit).cloned()
    }
}

/// Drop columns whose addition was rejected and pad columns whose removal was rejected
fn shape_rows(extraction: Extraction, ignored: &[String], tolerated_missing: &[String]) -> Vec<Row> {
    let mut rows = extraction.into_rows();
    if ignored.is_empty() && tolerated_missing.is_empty() {
        return rows;
    }
    for row in &mut rows {
        for column in ignored {
            row.remove(column);
        }
        for column in tolerated_missing {
            if !row.contains(column) {
                row.push(column.clone(), Value::Empty);
            }
        }
    }
    rows
}
