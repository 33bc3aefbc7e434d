//! Batched data backfill
//!
//! Rows are processed in fixed windows ordered by row id: batch `k` covers
//! rows `[k * batch_size, (k + 1) * batch_size)`. Up to `parallelism` batches
//! are transformed at once on the blocking pool, but commits happen strictly
//! in batch order and stop at the first failure, so the last committed batch
//! is always a safe resume point.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::types::Transform;
use crate::store::{RelationalStore, StoredRow, StructuralOp};

fn default_batch_size() -> usize {
    500
}

fn default_parallelism() -> usize {
    4
}

/// Batch sizing for backfills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Copy the destination table before a migration changes its structure
    #[serde(default)]
    pub backup: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            parallelism: default_parallelism(),
            backup: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillProgress {
    pub batches: u64,
    pub rows: u64,
}

/// Batch that could not be transformed or committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillFailure {
    pub batch: u64,
    pub message: String,
}

fn transform_batch(transform: &Transform, rows: Vec<StoredRow>) -> Result<Vec<StoredRow>, String> {
    rows.into_iter()
        .map(|row| {
            let id = row.id;
            transform(row.values)
                .map(|values| StoredRow { id, values })
                .map_err(|e| format!("row {}: {}", id, e))
        })
        .collect()
}

/// Run `transform` over every row of `table`, resuming after
/// `last_committed` and advancing it after each committed batch.
pub async fn run_backfill(
    store: &dyn RelationalStore,
    table: &str,
    transform: &Transform,
    config: &BackfillConfig,
    last_committed: &mut Option<u64>,
) -> Result<BackfillProgress, BackfillFailure> {
    let size = config.batch_size.max(1) as u64;
    let parallelism = config.parallelism.max(1) as u64;
    let mut next = last_committed.map_or(0, |b| b + 1);

    let total = store.count(table).await.map_err(|e| BackfillFailure {
        batch: next,
        message: e.to_string(),
    })?;
    let batches = total.div_ceil(size);
    info!(table = %table, rows = total, batches, resume_from = next, "Starting backfill");

    let mut progress = BackfillProgress::default();
    while next < batches {
        let window_end = (next + parallelism).min(batches);

        let mut loaded = Vec::new();
        for batch in next..window_end {
            let rows = store
                .select_batch(table, batch * size, size)
                .await
                .map_err(|e| BackfillFailure {
                    batch,
                    message: e.to_string(),
                })?;
            loaded.push((batch, rows));
        }

        let handles = loaded.into_iter().map(|(batch, rows)| {
            let transform = transform.clone();
            tokio::task::spawn_blocking(move || (batch, transform_batch(&transform, rows)))
        });

        let mut expected = next;
        for joined in join_all(handles).await {
            let (batch, result) = joined.map_err(|e| BackfillFailure {
                batch: expected,
                message: format!("transform task panicked: {}", e),
            })?;
            let rows = result.map_err(|message| BackfillFailure { batch, message })?;
            store.update_rows(table, &rows).await.map_err(|e| BackfillFailure {
                batch,
                message: e.to_string(),
            })?;

            *last_committed = Some(batch);
            progress.batches += 1;
            progress.rows += rows.len() as u64;
            debug!(table = %table, batch, rows = rows.len(), "Committed backfill batch");
            expected = batch + 1;
        }

        next = window_end;
    }

    Ok(progress)
}

/// Run `transform` over every batch without writing anything back. Rows are
/// first reshaped by `pending_ops`, structure the store does not have yet.
///
/// Stops at the first batch the transform rejects; `progress` counts the
/// batches checked before it.
pub async fn preview_backfill(
    store: &dyn RelationalStore,
    table: &str,
    transform: &Transform,
    config: &BackfillConfig,
    pending_ops: &[StructuralOp],
) -> (BackfillProgress, Option<BackfillFailure>) {
    let size = config.batch_size.max(1) as u64;
    let mut progress = BackfillProgress::default();
    let total = match store.count(table).await {
        Ok(total) => total,
        Err(e) => {
            let failure = BackfillFailure {
                batch: 0,
                message: e.to_string(),
            };
            return (progress, Some(failure));
        },
    };

    for batch in 0..total.div_ceil(size) {
        let checked = match store.select_batch(table, batch * size, size).await {
            Ok(mut rows) => {
                for row in &mut rows {
                    pending_ops.iter().for_each(|op| op.reshape(&mut row.values));
                }
                transform_batch(transform, rows)
            },
            Err(e) => Err(e.to_string()),
        };
        match checked {
            Ok(rows) => {
                progress.batches += 1;
                progress.rows += rows.len() as u64;
            },
            Err(message) => return (progress, Some(BackfillFailure { batch, message })),
        }
    }
    debug!(table = %table, batches = progress.batches, "Previewed backfill");
    (progress, None)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::TransformError;
    use crate::migration::transform;
    use crate::schema::ColumnDescriptor;
    use crate::store::MemoryStore;
    use statbucket_common::{Row, Value, ValueKind};

    async fn store_with_rows(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_table(
                "t",
                &[
                    ColumnDescriptor::new("wins", "numeric", ValueKind::Number),
                    ColumnDescriptor::new("double_wins", "numeric", ValueKind::Number),
                ],
            )
            .await
            .unwrap();
        let rows: Vec<Row> = (0..n)
            .map(|i| vec![("wins", Value::Number(i as f64))].into_iter().collect())
            .collect();
        store.insert_rows("t", "2024", &rows).await.unwrap();
        store
    }

    fn doubler() -> Transform {
        transform(|mut row: Row| {
            let wins = row.get("wins").and_then(Value::as_f64).ok_or_else(|| TransformError::new("no wins"))?;
            row.push("double_wins", Value::Number(wins * 2.0));
            Ok(row)
        })
    }

    #[tokio::test]
    async fn test_processes_every_batch_in_order() {
        let store = store_with_rows(7).await;
        let config = BackfillConfig {
            batch_size: 3,
            parallelism: 2,
            ..Default::default()
        };
        let mut marker = None;
        let progress = run_backfill(&store, "t", &doubler(), &config, &mut marker).await.unwrap();

        assert_eq!(progress, BackfillProgress { batches: 3, rows: 7 });
        assert_eq!(marker, Some(2));
        let rows = store.rows("t");
        assert!(rows
            .iter()
            .all(|r| r.get("double_wins").and_then(Value::as_f64) == r.get("wins").and_then(Value::as_f64).map(|w| w * 2.0)));
    }

    #[tokio::test]
    async fn test_stops_at_first_failed_batch() {
        let store = store_with_rows(6).await;
        let config = BackfillConfig {
            batch_size: 2,
            parallelism: 3,
            ..Default::default()
        };
        let failing = transform(|row: Row| {
            if row.get("wins") == Some(&Value::Number(3.0)) {
                return Err(TransformError::new("bad row"));
            }
            Ok(row)
        });
        let mut marker = None;
        let failure = run_backfill(&store, "t", &failing, &config, &mut marker).await.unwrap_err();

        assert_eq!(failure.batch, 1);
        assert_eq!(marker, Some(0));
    }

    #[tokio::test]
    async fn test_empty_table_is_a_no_op() {
        let store = store_with_rows(0).await;
        let mut marker = None;
        let progress = run_backfill(&store, "t", &doubler(), &BackfillConfig::default(), &mut marker)
            .await
            .unwrap();
        assert_eq!(progress.batches, 0);
        assert_eq!(marker, None);
    }

    #[tokio::test]
    async fn test_preview_leaves_rows_untouched() {
        let store = store_with_rows(5).await;
        let config = BackfillConfig {
            batch_size: 2,
            ..Default::default()
        };
        let (progress, failure) = preview_backfill(&store, "t", &doubler(), &config, &[]).await;

        assert_eq!(progress, BackfillProgress { batches: 3, rows: 5 });
        assert!(failure.is_none());
        assert!(store.rows("t").iter().all(|r| r.get("double_wins") == Some(&Value::Empty)));
    }
}
