//! Orchestrator integration tests
//!
//! Drive whole dataset runs over a mock fetcher and the in-memory store:
//! drift halts, review and resume, restart behavior, retries, leases,
//! cancellation and multi-dataset runs.

mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::*;
use statbucket_common::{Row, Value, ValueKind};
use statbucket_ingest::checkpoint::CheckpointStatus;
use statbucket_ingest::config::DatasetDefinition;
use statbucket_ingest::error::{CheckpointLeaseError, FetchError, IngestError, StoreError};
use statbucket_ingest::migration::{transform, MigrationStatus};
use statbucket_ingest::pipeline::{
    DatasetPipeline, Fetcher, Orchestrator, PipelineSettings, RunOptions, RunStatus, SourceUnit, UnitOutcome,
};
use statbucket_ingest::schema::{ChangeKind, ChangeStatus, ColumnDescriptor};
use statbucket_ingest::store::{MemoryStore, RelationalStore, StoredRow, StructuralOp};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TABLE: &str = "team_season";

fn seasons_with_drift(fetcher: &MockFetcher) {
    fetcher.set_page("2023", base_season(2023));
    fetcher.set_page("2024", base_season(2024));
    fetcher.set_page("2025", season_with_net_rating(2025));
    fetcher.set_page("2026", season_with_net_rating(2026));
}

#[tokio::test]
async fn test_new_column_halts_whole_dataset_run() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    seasons_with_drift(&fetcher);
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(
        fetcher.clone(),
        store.clone(),
        definition(&["2023", "2024", "2025", "2026"], false),
        fast_settings(),
    )?;

    let report = orchestrator
        .run(DATASET, RunOptions::destination(), CancellationToken::new())
        .await?;

    assert_eq!(report.status, RunStatus::Halted);
    assert!(matches!(report.outcome("2023"), Some(UnitOutcome::Done { rows_persisted: 2, .. })));
    assert!(matches!(report.outcome("2024"), Some(UnitOutcome::Done { .. })));
    assert_eq!(report.outcome("2025"), Some(&UnitOutcome::Halted));
    assert_eq!(report.outcome("2026"), Some(&UnitOutcome::NotReached));

    let halt = report.halt.expect("halt report");
    assert_eq!(halt.source_unit, "2025");
    assert_eq!(halt.added, vec!["net_rating"]);
    assert!(halt.removed.is_empty());

    // Nothing from the drifted unit reached the destination; earlier units stay.
    assert!(store.rows_for_unit(TABLE, "2025").is_empty());
    assert_eq!(store.rows_for_unit(TABLE, "2023").len(), 2);

    let halted = orchestrator.checkpoint(DATASET, "2025").await.expect("checkpoint");
    assert_eq!(halted.status, CheckpointStatus::Halted);
    assert!(halted.parked.is_some());
    let untouched = orchestrator.checkpoint(DATASET, "2026").await;
    assert!(untouched.map_or(true, |cp| cp.status == CheckpointStatus::Pending));

    let snapshot = orchestrator.snapshot(DATASET).await.expect("snapshot");
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.column_names(), vec!["team", "wins", "ortg"]);

    let pending = orchestrator.changes(Some(DATASET), true).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].column, "net_rating");
    assert_eq!(pending[0].source_unit.as_deref(), Some("2025"));
    Ok(())
}

#[tokio::test]
async fn test_halted_unit_resumes_from_diffing_after_migration() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    seasons_with_drift(&fetcher);
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(
        fetcher.clone(),
        store.clone(),
        definition(&["2023", "2024", "2025", "2026"], false),
        fast_settings(),
    )?;

    let first = orchestrator
        .run(DATASET, RunOptions::destination(), CancellationToken::new())
        .await?;
    let change_id = first.halt.expect("halt").change_ids[0];

    orchestrator.approve_change(change_id).await?;
    let migration = orchestrator.create_migration(DATASET, &[change_id], None, None).await?;
    let applied = orchestrator.apply_migration(migration).await?;
    assert_eq!(applied.schema_version, Some(2));

    let second = orchestrator
        .run(DATASET, RunOptions::destination(), CancellationToken::new())
        .await?;

    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.outcome("2023"), Some(&UnitOutcome::Skipped));
    assert_eq!(second.outcome("2024"), Some(&UnitOutcome::Skipped));
    assert!(matches!(second.outcome("2025"), Some(UnitOutcome::Done { rows_persisted: 2, .. })));
    assert!(matches!(second.outcome("2026"), Some(UnitOutcome::Done { .. })));

    // The parked extraction was used; the page was not fetched again.
    assert_eq!(fetcher.calls("2025"), 1);

    let rows = store.rows_for_unit(TABLE, "2025");
    assert_eq!(rows[0].get("net_rating"), Some(&Value::Number(11.7)));
    assert_eq!(
        orchestrator.changes(Some(DATASET), false).await[0].status,
        ChangeStatus::Applied
    );
    let done = orchestrator.checkpoint(DATASET, "2025").await.expect("checkpoint");
    assert_eq!(done.status, CheckpointStatus::Done);
    assert!(done.parked.is_none());
    Ok(())
}

#[tokio::test]
async fn test_rejected_column_is_stripped_on_resume() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    seasons_with_drift(&fetcher);
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(
        fetcher.clone(),
        store.clone(),
        definition(&["2023", "2024", "2025", "2026"], false),
        fast_settings(),
    )?;

    let first = orchestrator
        .run(DATASET, RunOptions::destination(), CancellationToken::new())
        .await?;
    let change_id = first.halt.expect("halt").change_ids[0];
    orchestrator.reject_change(change_id).await?;

    let second = orchestrator
        .run(DATASET, RunOptions::destination(), CancellationToken::new())
        .await?;

    assert_eq!(second.status, RunStatus::Completed);
    let rows = store.rows_for_unit(TABLE, "2026");
    assert_eq!(rows.len(), 2);
    assert!(!rows[0].contains("net_rating"));
    assert_eq!(orchestrator.snapshot(DATASET).await.expect("snapshot").version, 1);
    // The rejection is remembered; no new change was recorded for 2026.
    assert_eq!(orchestrator.changes(Some(DATASET), false).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_removed_column_halts_even_with_auto_add() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    fetcher.set_page("2023", base_season(2023));
    fetcher.set_page(
        "2024",
        season_page(&["team", "wins"], &[vec!["Boston Celtics", "64"]]),
    );
    let orchestrator = orchestrator(
        fetcher.clone(),
        Arc::new(MemoryStore::new()),
        definition(&["2023", "2024"], true),
        fast_settings(),
    )?;

    let report = orchestrator
        .run(DATASET, RunOptions::default(), CancellationToken::new())
        .await?;

    assert!(report.is_halted());
    let halt = report.halt.expect("halt");
    assert_eq!(halt.removed, vec!["ortg"]);
    assert!(halt.added.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_auto_add_applies_migration_and_persists() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    fetcher.set_page("2023", base_season(2023));
    fetcher.set_page("2024", season_with_net_rating(2024));
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(
        fetcher.clone(),
        store.clone(),
        definition(&["2023", "2024"], true),
        fast_settings(),
    )?;

    let report = orchestrator
        .run(DATASET, RunOptions::destination(), CancellationToken::new())
        .await?;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.auto_migrations.len(), 1);
    let snapshot = orchestrator.snapshot(DATASET).await.expect("snapshot");
    assert_eq!(snapshot.version, 2);
    assert_eq!(snapshot.column_names(), vec!["team", "wins", "ortg", "net_rating"]);
    assert_eq!(
        store.rows_for_unit(TABLE, "2024")[1].get("net_rating"),
        Some(&Value::Number(-1.4))
    );
    Ok(())
}

#[tokio::test]
async fn test_restart_reprocesses_only_unfinished_units() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    fetcher.set_page("2023", base_season(2023));
    fetcher.set_page("2025", base_season(2025));
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(
        fetcher.clone(),
        store.clone(),
        definition(&["2023", "2024", "2025"], false),
        fast_settings(),
    )?;

    // 2024 has no page yet: a 404 is permanent and fails only that unit.
    let first = orchestrator
        .run(DATASET, RunOptions::destination(), CancellationToken::new())
        .await?;
    assert_eq!(first.status, RunStatus::CompletedWithFailures);
    assert!(matches!(first.outcome("2024"), Some(UnitOutcome::Failed { attempts: 1, .. })));
    assert!(matches!(first.outcome("2025"), Some(UnitOutcome::Done { .. })));

    fetcher.set_page("2024", base_season(2024));
    let second = orchestrator
        .run(DATASET, RunOptions::destination(), CancellationToken::new())
        .await?;

    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.outcome("2023"), Some(&UnitOutcome::Skipped));
    assert!(matches!(second.outcome("2024"), Some(UnitOutcome::Done { .. })));
    assert_eq!(second.outcome("2025"), Some(&UnitOutcome::Skipped));
    assert_eq!(fetcher.calls("2023"), 1);
    assert_eq!(fetcher.calls("2025"), 1);
    assert_eq!(fetcher.calls("2024"), 2);
    Ok(())
}

#[tokio::test]
async fn test_forced_rerun_replaces_rows() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    fetcher.set_page("2023", base_season(2023));
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(
        fetcher.clone(),
        store.clone(),
        definition(&["2023"], false),
        fast_settings(),
    )?;

    orchestrator
        .run(DATASET, RunOptions::destination(), CancellationToken::new())
        .await?;
    let forced = RunOptions {
        force: true,
        ..RunOptions::destination()
    };
    let report = orchestrator.run(DATASET, forced, CancellationToken::new()).await?;

    assert!(matches!(report.outcome("2023"), Some(UnitOutcome::Done { .. })));
    assert_eq!(fetcher.calls("2023"), 2);
    assert_eq!(store.rows_for_unit(TABLE, "2023").len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_intermediate_target_stages_documents() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    fetcher.set_page("2023", base_season(2023));
    fetcher.set_page("2024", base_season(2024));
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(
        fetcher.clone(),
        store.clone(),
        definition(&["2023", "2024"], false),
        fast_settings(),
    )?;

    let report = orchestrator
        .run(DATASET, RunOptions::default(), CancellationToken::new())
        .await?;

    assert_eq!(report.rows_persisted, 4);
    let staged = store.staged("team_season_staging");
    assert_eq!(staged.len(), 4);
    assert_eq!(staged[0].source_unit, "2023");
    assert_eq!(staged[0].record["team"], "Boston Celtics");
    assert!(store.rows(TABLE).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_rows_missing_required_column_are_rejected() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    fetcher.set_page(
        "2023",
        season_page(
            &["team", "wins", "ortg"],
            &[vec!["Boston Celtics", "64", "122.2"], vec!["", "41", "110.0"]],
        ),
    );
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(
        fetcher.clone(),
        store.clone(),
        definition(&["2023"], false),
        fast_settings(),
    )?;

    let report = orchestrator
        .run(DATASET, RunOptions::destination(), CancellationToken::new())
        .await?;

    assert_eq!(report.rows_persisted, 1);
    assert_eq!(report.rows_rejected, 1);
    assert_eq!(store.rows_for_unit(TABLE, "2023").len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transient_fetch_failures_are_retried() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    fetcher.set_page("2023", base_season(2023));
    fetcher.set_page("2024", base_season(2024));
    fetcher.fail_next("2024", 2, server_error("2024"));
    let orchestrator = orchestrator(
        fetcher.clone(),
        Arc::new(MemoryStore::new()),
        definition(&["2023", "2024"], false),
        fast_settings(),
    )?;

    let report = orchestrator
        .run(DATASET, RunOptions::default(), CancellationToken::new())
        .await?;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(fetcher.calls("2024"), 3);
    // Three fetch attempts plus one persist attempt.
    let checkpoint = orchestrator.checkpoint(DATASET, "2024").await.expect("checkpoint");
    assert_eq!(checkpoint.attempts, 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_only_that_unit() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    for unit in ["2023", "2024", "2025"] {
        fetcher.set_page(unit, base_season(2023));
    }
    fetcher.fail_next("2024", 5, server_error("2024"));
    let orchestrator = orchestrator(
        fetcher.clone(),
        Arc::new(MemoryStore::new()),
        definition(&["2023", "2024", "2025"], false),
        fast_settings(),
    )?;

    let report = orchestrator
        .run(DATASET, RunOptions::default(), CancellationToken::new())
        .await?;

    assert_eq!(report.status, RunStatus::CompletedWithFailures);
    assert!(matches!(report.outcome("2024"), Some(UnitOutcome::Failed { attempts: 3, .. })));
    assert!(matches!(report.outcome("2025"), Some(UnitOutcome::Done { .. })));

    let failed = orchestrator.checkpoint(DATASET, "2024").await.expect("checkpoint");
    assert_eq!(failed.status, CheckpointStatus::Failed);
    assert!(failed.last_error.is_some_and(|e| e.contains("503")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transient_persist_failures_are_retried() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    fetcher.set_page("2023", base_season(2023));
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(
        fetcher.clone(),
        store.clone(),
        definition(&["2023"], false),
        fast_settings(),
    )?;

    store.fail_next_writes(2);
    let report = orchestrator
        .run(DATASET, RunOptions::default(), CancellationToken::new())
        .await?;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(store.staged("team_season_staging").len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_runs_over_one_dataset_are_exclusive() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    fetcher.set_page("2023", base_season(2023));
    let orchestrator = orchestrator(
        fetcher.clone(),
        Arc::new(MemoryStore::new()),
        definition(&["2023"], false),
        fast_settings(),
    )?;

    let held = orchestrator.leases().acquire(DATASET, Duration::from_secs(60))?;
    let blocked = orchestrator
        .run(DATASET, RunOptions::default(), CancellationToken::new())
        .await;
    assert!(matches!(
        blocked,
        Err(IngestError::Checkpoint(CheckpointLeaseError::Held { .. }))
    ));
    assert_eq!(fetcher.total_calls(), 0);

    drop(held);
    let report = orchestrator
        .run(DATASET, RunOptions::default(), CancellationToken::new())
        .await?;
    assert_eq!(report.status, RunStatus::Completed);
    assert!(orchestrator.leases().holder(DATASET).is_none());
    Ok(())
}

/// Cancels the run token while fetching one unit
struct CancelOnFetch {
    inner: Arc<MockFetcher>,
    unit: String,
    token: CancellationToken,
}

#[async_trait]
impl Fetcher for CancelOnFetch {
    async fn fetch(&self, unit: &SourceUnit) -> Result<String, FetchError> {
        if unit.key == self.unit {
            self.token.cancel();
        }
        self.inner.fetch(unit).await
    }
}

#[tokio::test]
async fn test_cancellation_stops_at_unit_boundary() -> Result<()> {
    init_tracing();
    let pages = MockFetcher::new();
    for unit in ["2023", "2024", "2025"] {
        pages.set_page(unit, base_season(2023));
    }
    let token = CancellationToken::new();
    let fetcher = Arc::new(CancelOnFetch {
        inner: pages,
        unit: "2023".into(),
        token: token.clone(),
    });
    let orchestrator = orchestrator(
        fetcher,
        Arc::new(MemoryStore::new()),
        definition(&["2023", "2024", "2025"], false),
        fast_settings(),
    )?;

    let report = orchestrator.run(DATASET, RunOptions::default(), token).await?;

    // The unit in progress when the token fired still completes.
    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(matches!(report.outcome("2023"), Some(UnitOutcome::Done { .. })));
    assert_eq!(report.outcome("2024"), Some(&UnitOutcome::NotReached));
    assert_eq!(report.outcome("2025"), Some(&UnitOutcome::NotReached));
    assert!(orchestrator.checkpoint(DATASET, "2024").await.is_none());
    Ok(())
}

/// Never answers for one unit
struct StallingFetcher {
    inner: Arc<MockFetcher>,
    unit: String,
}

#[async_trait]
impl Fetcher for StallingFetcher {
    async fn fetch(&self, unit: &SourceUnit) -> Result<String, FetchError> {
        if unit.key == self.unit {
            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        }
        self.inner.fetch(unit).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_lease_expiry_fails_run_and_releases_lease() -> Result<()> {
    init_tracing();
    let pages = MockFetcher::new();
    for unit in ["2023", "2024", "2025"] {
        pages.set_page(unit, base_season(2023));
    }
    let fetcher = Arc::new(StallingFetcher {
        inner: pages,
        unit: "2024".into(),
    });
    let orchestrator = orchestrator(
        fetcher,
        Arc::new(MemoryStore::new()),
        definition(&["2023", "2024", "2025"], false),
        fast_settings(),
    )?;

    let report = orchestrator
        .run(DATASET, RunOptions::default(), CancellationToken::new())
        .await?;

    assert_eq!(report.status, RunStatus::LeaseExpired);
    assert!(matches!(report.outcome("2023"), Some(UnitOutcome::Done { .. })));
    assert!(matches!(report.outcome("2024"), Some(UnitOutcome::Failed { .. })));
    assert_eq!(report.outcome("2025"), Some(&UnitOutcome::NotReached));
    assert_eq!(
        orchestrator.checkpoint(DATASET, "2024").await.map(|cp| cp.status),
        Some(CheckpointStatus::Failed)
    );
    assert!(orchestrator.leases().holder(DATASET).is_none());
    Ok(())
}

#[tokio::test]
async fn test_reset_returns_unit_to_pending() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    fetcher.set_page("2023", base_season(2023));
    let orchestrator = orchestrator(
        fetcher.clone(),
        Arc::new(MemoryStore::new()),
        definition(&["2023"], false),
        fast_settings(),
    )?;

    orchestrator
        .run(DATASET, RunOptions::default(), CancellationToken::new())
        .await?;
    orchestrator.reset(DATASET, "2023").await?;
    assert_eq!(
        orchestrator.checkpoint(DATASET, "2023").await.map(|cp| cp.status),
        Some(CheckpointStatus::Pending)
    );

    let report = orchestrator
        .run(DATASET, RunOptions::default(), CancellationToken::new())
        .await?;
    assert!(matches!(report.outcome("2023"), Some(UnitOutcome::Done { .. })));
    assert_eq!(fetcher.calls("2023"), 2);

    assert!(matches!(
        orchestrator.reset(DATASET, "1999").await,
        Err(IngestError::Checkpoint(CheckpointLeaseError::UnknownUnit { .. }))
    ));
    Ok(())
}

#[tokio::test]
async fn test_unknown_dataset_is_rejected() -> Result<()> {
    let orchestrator = orchestrator(
        MockFetcher::new(),
        Arc::new(MemoryStore::new()),
        definition(&[], false),
        fast_settings(),
    )?;
    let result = orchestrator
        .run("player_totals", RunOptions::default(), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(IngestError::UnknownDataset(_))));
    Ok(())
}

#[tokio::test]
async fn test_auto_add_applies_earlier_pending_migration_first() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    fetcher.set_page("2023", base_season(2023));
    fetcher.set_page("2024", season_with_net_rating(2024));
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(
        fetcher.clone(),
        store.clone(),
        definition(&["2023", "2024"], true),
        fast_settings(),
    )?;

    let options = RunOptions {
        units: Some(vec!["2023".into()]),
        ..RunOptions::destination()
    };
    orchestrator.run(DATASET, options, CancellationToken::new()).await?;

    // An operator retype waiting to be applied when drift arrives
    let retype = orchestrator
        .record_change(
            DATASET,
            "ortg",
            ChangeKind::Retype {
                from: ValueKind::Number,
                to: ValueKind::Text,
            },
        )
        .await?;
    let waiting = orchestrator.create_migration(DATASET, &[retype], None, None).await?;

    let report = orchestrator
        .run(DATASET, RunOptions::destination(), CancellationToken::new())
        .await?;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.auto_migrations.len(), 2);
    assert_eq!(report.auto_migrations[0], waiting);
    let migrations = orchestrator.migrations(Some(DATASET)).await;
    assert!(migrations.iter().all(|m| m.status == MigrationStatus::Applied));

    let snapshot = orchestrator.snapshot(DATASET).await.expect("snapshot");
    assert_eq!(snapshot.column_names(), vec!["team", "wins", "ortg", "net_rating"]);
    assert_eq!(snapshot.column("ortg").map(|c| c.kind), Some(ValueKind::Text));
    assert_eq!(store.rows_for_unit(TABLE, "2023")[0].get("ortg"), Some(&Value::text("118.2")));
    assert_eq!(store.rows_for_unit(TABLE, "2024").len(), 2);
    Ok(())
}

/// Memory store whose backfill writes take three seconds
struct SlowBackfillStore {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl RelationalStore for SlowBackfillStore {
    async fn create_table(&self, table: &str, columns: &[ColumnDescriptor]) -> Result<(), StoreError> {
        self.inner.create_table(table, columns).await
    }

    async fn apply_structural(&self, table: &str, op: &StructuralOp) -> Result<(), StoreError> {
        self.inner.apply_structural(table, op).await
    }

    async fn insert_rows(&self, table: &str, source_unit: &str, rows: &[Row]) -> Result<usize, StoreError> {
        self.inner.insert_rows(table, source_unit, rows).await
    }

    async fn delete_unit_rows(&self, table: &str, source_unit: &str) -> Result<u64, StoreError> {
        self.inner.delete_unit_rows(table, source_unit).await
    }

    async fn stage_rows(&self, table: &str, source_unit: &str, rows: &[Row]) -> Result<usize, StoreError> {
        self.inner.stage_rows(table, source_unit, rows).await
    }

    async fn select_batch(&self, table: &str, offset: u64, limit: u64) -> Result<Vec<StoredRow>, StoreError> {
        self.inner.select_batch(table, offset, limit).await
    }

    async fn update_rows(&self, table: &str, rows: &[StoredRow]) -> Result<usize, StoreError> {
        tokio::time::sleep(Duration::from_secs(3)).await;
        self.inner.update_rows(table, rows).await
    }

    async fn count(&self, table: &str) -> Result<u64, StoreError> {
        self.inner.count(table).await
    }

    async fn backup_table(&self, table: &str, backup: &str) -> Result<u64, StoreError> {
        self.inner.backup_table(table, backup).await
    }
}

fn renamed(definition: DatasetDefinition, name: &str) -> DatasetDefinition {
    DatasetDefinition {
        name: name.to_string(),
        ..definition
    }
}

#[tokio::test(start_paused = true)]
async fn test_migration_backfill_does_not_block_other_datasets() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    fetcher.set_page("2023", base_season(2023));
    let memory = Arc::new(MemoryStore::new());
    let settings = PipelineSettings {
        lease_ttl: Duration::from_secs(2),
        ..fast_settings()
    };
    let mut orchestrator = Orchestrator::new(
        fetcher.clone(),
        Arc::new(SlowBackfillStore { inner: memory.clone() }),
        settings,
    );
    orchestrator.register(DatasetPipeline::from_definition(definition(&["2023"], false))?);
    orchestrator.register(DatasetPipeline::from_definition(renamed(
        definition(&["2023"], false),
        "player_totals",
    ))?);

    orchestrator
        .run(DATASET, RunOptions::destination(), CancellationToken::new())
        .await?;
    let rename = orchestrator
        .record_change(DATASET, "ortg", ChangeKind::Rename { to: "off_rating".into() })
        .await?;
    let migration = orchestrator
        .create_migration(DATASET, &[rename], Some(transform(|row: Row| Ok(row))), None)
        .await?;

    let (applied, report) = tokio::join!(
        orchestrator.apply_migration(migration),
        orchestrator.run("player_totals", RunOptions::destination(), CancellationToken::new()),
    );

    assert_eq!(applied?.batches_committed, 1);
    let report = report?;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(memory.rows_for_unit("player_totals", "2023").len(), 2);
    assert!(memory.rows(TABLE)[0].contains("off_rating"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_lease_is_renewed_after_each_unit() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    for unit in ["2023", "2024", "2025"] {
        fetcher.set_page(unit, base_season(2023));
    }
    fetcher.set_delay(Duration::from_millis(1500));
    let settings = PipelineSettings {
        lease_ttl: Duration::from_secs(2),
        fetch_concurrency: 1,
        ..fast_settings()
    };
    let orchestrator = orchestrator(
        fetcher.clone(),
        Arc::new(MemoryStore::new()),
        definition(&["2023", "2024", "2025"], false),
        settings,
    )?;

    // The whole run takes longer than one lease term
    let report = orchestrator
        .run(DATASET, RunOptions::default(), CancellationToken::new())
        .await?;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.count(|o| matches!(o, UnitOutcome::Done { .. })), 3);
    assert!(orchestrator.leases().holder(DATASET).is_none());
    Ok(())
}

fn dependent(name: &str, depends_on: &[&str], enabled: bool) -> DatasetDefinition {
    let mut definition = renamed(definition(&["2023"], false), name);
    definition.depends_on = depends_on.iter().map(|d| d.to_string()).collect();
    definition.enabled = enabled;
    definition
}

fn multi_dataset(fetcher: Arc<MockFetcher>, definitions: Vec<DatasetDefinition>) -> Result<Orchestrator> {
    let mut orchestrator = Orchestrator::new(fetcher, Arc::new(MemoryStore::new()), fast_settings());
    for definition in definitions {
        orchestrator.register(DatasetPipeline::from_definition(definition)?);
    }
    Ok(orchestrator)
}

#[tokio::test]
async fn test_run_all_follows_dependencies_and_skips_disabled() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    fetcher.set_page("2023", base_season(2023));
    let orchestrator = multi_dataset(
        fetcher.clone(),
        vec![
            dependent("player_totals", &["team_season"], true),
            dependent("archive", &[], false),
            dependent("team_season", &["standings"], true),
            dependent("standings", &[], true),
        ],
    )?;

    assert_eq!(orchestrator.run_order()?, vec!["standings", "team_season", "player_totals"]);
    let reports = orchestrator
        .run_all(RunOptions::default(), CancellationToken::new())
        .await?;
    let ran: Vec<&str> = reports.iter().map(|r| r.dataset.as_str()).collect();
    assert_eq!(ran, vec!["standings", "team_season", "player_totals"]);
    assert!(reports.iter().all(|r| r.status == RunStatus::Completed));
    assert!(orchestrator.checkpoints("archive").await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_run_all_stops_after_halted_dataset() -> Result<()> {
    init_tracing();
    let fetcher = MockFetcher::new();
    fetcher.set_page("2023", base_season(2023));
    fetcher.set_page("2024", season_with_net_rating(2024));
    let mut team_season = dependent(DATASET, &[], true);
    team_season.units = vec!["2023".into(), "2024".into()];
    let orchestrator = multi_dataset(
        fetcher.clone(),
        vec![dependent("player_totals", &[DATASET], true), team_season],
    )?;

    let reports = orchestrator
        .run_all(RunOptions::default(), CancellationToken::new())
        .await?;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, RunStatus::Halted);
    assert!(orchestrator.checkpoints("player_totals").await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_run_all_rejects_dependency_cycle() -> Result<()> {
    let orchestrator = multi_dataset(
        MockFetcher::new(),
        vec![dependent("a", &["b"], true), dependent("b", &["a"], true)],
    )?;
    let result = orchestrator
        .run_all(RunOptions::default(), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(IngestError::DependencyCycle(_))));
    Ok(())
}
