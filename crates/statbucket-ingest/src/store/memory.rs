//! In-process relational store
//!
//! Enforces the same structural rules as the PostgreSQL store so the
//! orchestrator and migrations can be exercised without a database. The
//! tables can be written to a JSON file and loaded again, which lets the CLI
//! keep destination data between invocations when no database is configured.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use statbucket_common::{Row, ValueKind};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{RelationalStore, StagedRow, StoredRow, StructuralOp};
use crate::error::StoreError;
use crate::schema::ColumnDescriptor;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryRow {
    id: i64,
    source_unit: String,
    values: Row,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryTable {
    columns: Vec<(String, ValueKind)>,
    rows: Vec<MemoryRow>,
    next_id: i64,
}

impl MemoryTable {
    fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(c, _)| c == name)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inner {
    tables: HashMap<String, MemoryTable>,
    staged: HashMap<String, Vec<StagedRow>>,
}

/// Thread-safe in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    insert_failures: AtomicUsize,
    failing_column: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load tables saved by [`MemoryStore::save`]; a missing file is an empty store
    pub fn load(path: &Path) -> statbucket_common::Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No saved tables, starting empty");
            return Ok(Self::new());
        }
        let inner: Inner = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        info!(path = %path.display(), tables = inner.tables.len(), "Loaded saved tables");
        Ok(Self {
            inner: Mutex::new(inner),
            ..Default::default()
        })
    }

    /// Write every table and staged document to `path`, replacing it atomically
    pub fn save(&self, path: &Path) -> statbucket_common::Result<()> {
        let json = serde_json::to_string(&*self.lock())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Fail the next `n` inserts or stages with a transient error
    pub fn fail_next_writes(&self, n: usize) {
        self.insert_failures.store(n, Ordering::SeqCst);
    }

    /// Fail any structural op touching `column`
    pub fn fail_structural_on(&self, column: Option<&str>) {
        *self
            .failing_column
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = column.map(str::to_string);
    }

    fn take_write_failure(&self) -> Result<(), StoreError> {
        let injected = self
            .insert_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    /// Destination rows in id order, every table column present
    pub fn rows(&self, table: &str) -> Vec<Row> {
        let inner = self.lock();
        inner
            .tables
            .get(table)
            .map(|t| t.rows.iter().map(|r| full_row(t, &r.values)).collect())
            .unwrap_or_default()
    }

    pub fn rows_for_unit(&self, table: &str, source_unit: &str) -> Vec<Row> {
        let inner = self.lock();
        inner
            .tables
            .get(table)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|r| r.source_unit == source_unit)
                    .map(|r| full_row(t, &r.values))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn staged(&self, table: &str) -> Vec<StagedRow> {
        self.lock().staged.get(table).cloned().unwrap_or_default()
    }

    pub fn table_columns(&self, table: &str) -> Option<Vec<(String, ValueKind)>> {
        self.lock().tables.get(table).map(|t| t.columns.clone())
    }
}

fn full_row(table: &MemoryTable, values: &Row) -> Row {
    table
        .columns
        .iter()
        .map(|(name, _)| (name.clone(), values.get(name).cloned().unwrap_or_default()))
        .collect()
}

fn table_mut<'a>(inner: &'a mut Inner, table: &str) -> Result<&'a mut MemoryTable, StoreError> {
    inner
        .tables
        .get_mut(table)
        .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn create_table(&self, table: &str, columns: &[ColumnDescriptor]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.tables.entry(table.to_string()).or_insert_with(|| MemoryTable {
            columns: columns.iter().map(|c| (c.name.clone(), c.kind)).collect(),
            rows: Vec::new(),
            next_id: 1,
        });
        Ok(())
    }

    async fn apply_structural(&self, table: &str, op: &StructuralOp) -> Result<(), StoreError> {
        let failing = self
            .failing_column
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let touched = match op {
            StructuralOp::AddColumn { name, .. }
            | StructuralOp::DropColumn { name }
            | StructuralOp::RetypeColumn { name, .. } => vec![name],
            StructuralOp::RenameColumn { from, to } => vec![from, to],
        };
        if let Some(col) = failing.filter(|c| touched.contains(&c)) {
            return Err(StoreError::Backend(format!("injected failure on column '{}'", col)));
        }

        let mut inner = self.lock();
        let t = table_mut(&mut inner, table)?;
        let missing = |column: &str| StoreError::ColumnNotFound {
            table: table.to_string(),
            column: column.to_string(),
        };

        match op {
            StructuralOp::AddColumn { name, kind } => {
                if t.has_column(name) {
                    return Err(StoreError::ColumnExists {
                        table: table.to_string(),
                        column: name.clone(),
                    });
                }
                t.columns.push((name.clone(), *kind));
            },
            StructuralOp::DropColumn { name } => {
                let idx = t.columns.iter().position(|(c, _)| c == name).ok_or_else(|| missing(name))?;
                t.columns.remove(idx);
            },
            StructuralOp::RenameColumn { from, to } => {
                if t.has_column(to) {
                    return Err(StoreError::ColumnExists {
                        table: table.to_string(),
                        column: to.clone(),
                    });
                }
                let col = t.columns.iter_mut().find(|(c, _)| c == from).ok_or_else(|| missing(from))?;
                col.0 = to.clone();
            },
            StructuralOp::RetypeColumn { name, kind } => {
                let col = t.columns.iter_mut().find(|(c, _)| c == name).ok_or_else(|| missing(name))?;
                col.1 = *kind;
            },
        }
        for row in &mut t.rows {
            op.reshape(&mut row.values);
        }
        Ok(())
    }

    async fn insert_rows(&self, table: &str, source_unit: &str, rows: &[Row]) -> Result<usize, StoreError> {
        self.take_write_failure()?;
        let mut inner = self.lock();
        let t = table_mut(&mut inner, table)?;
        for row in rows {
            if let Some(column) = row.columns().find(|c| !t.has_column(c)) {
                return Err(StoreError::UnknownColumn {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }
        }
        for row in rows {
            let id = t.next_id;
            t.next_id += 1;
            t.rows.push(MemoryRow {
                id,
                source_unit: source_unit.to_string(),
                values: row.clone(),
            });
        }
        Ok(rows.len())
    }

    async fn delete_unit_rows(&self, table: &str, source_unit: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let t = table_mut(&mut inner, table)?;
        let before = t.rows.len();
        t.rows.retain(|r| r.source_unit != source_unit);
        Ok((before - t.rows.len()) as u64)
    }

    async fn stage_rows(&self, table: &str, source_unit: &str, rows: &[Row]) -> Result<usize, StoreError> {
        self.take_write_failure()?;
        let mut inner = self.lock();
        let staged = inner.staged.entry(table.to_string()).or_default();
        staged.retain(|r| r.source_unit != source_unit);
        staged.extend(rows.iter().map(|row| StagedRow {
            source_unit: source_unit.to_string(),
            record: row.to_json(),
        }));
        Ok(rows.len())
    }

    async fn select_batch(&self, table: &str, offset: u64, limit: u64) -> Result<Vec<StoredRow>, StoreError> {
        let inner = self.lock();
        let t = inner
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        Ok(t.rows
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|r| StoredRow {
                id: r.id,
                values: full_row(t, &r.values),
            })
            .collect())
    }

    async fn update_rows(&self, table: &str, rows: &[StoredRow]) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let t = table_mut(&mut inner, table)?;
        for row in rows {
            if let Some(column) = row.values.columns().find(|c| !t.has_column(c)) {
                return Err(StoreError::UnknownColumn {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }
        }
        let mut updated = 0;
        for row in rows {
            if let Some(existing) = t.rows.iter_mut().find(|r| r.id == row.id) {
                for (name, value) in row.values.iter() {
                    existing.values.push(name, value.clone());
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn count(&self, table: &str) -> Result<u64, StoreError> {
        let inner = self.lock();
        inner
            .tables
            .get(table)
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }

    async fn backup_table(&self, table: &str, backup: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let copy = inner
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let rows = copy.rows.len() as u64;
        inner.tables.insert(backup.to_string(), copy);
        Ok(rows)
    }
}
