//! PostgreSQL relational store
//!
//! Destination tables carry `id BIGSERIAL` and `_source_unit` next to the
//! data columns. Numbers map to `DOUBLE PRECISION`, everything else to `TEXT`.
//! Values are bound as text and cast server-side to the column type.
//!
//! Retyping text to a number keeps the first numeric token of each value
//! after dropping thousands separators, the same rule numeric extraction
//! uses; values without one become NULL.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row as _;
use statbucket_common::{Row, Value, ValueKind};
use std::collections::HashMap;
use tracing::debug;

use super::{RelationalStore, StoredRow, StructuralOp};
use crate::error::StoreError;
use crate::schema::ColumnDescriptor;

/// Quote an identifier for interpolation into SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Number => "DOUBLE PRECISION",
        ValueKind::Text | ValueKind::Unknown => "TEXT",
    }
}

/// Server-side counterpart of the default numeric extraction pattern, applied
/// after commas are removed. Groups must stay non-capturing for `substring`.
const NUMERIC_TOKEN_SQL: &str = r"[-+]?[0-9]+(?:\.[0-9]+)?|[-+]?\.[0-9]+";

fn bind_text(value: &Value) -> Option<String> {
    match value {
        Value::Empty => None,
        other => Some(other.to_string()),
    }
}

/// Store backed by a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Data columns of a destination table with their SQL types, in order
    async fn data_columns(&self, table: &str) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::TEXT, data_type::TEXT
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
              AND column_name NOT IN ('id', '_source_unit')
            ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() && !self.table_exists(table).await? {
            return Err(StoreError::TableNotFound(table.to_string()));
        }

        rows.iter()
            .map(|r| Ok((r.try_get::<String, _>(0)?, r.try_get::<String, _>(1)?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = $1)",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn ensure_staging(&self, table: &str) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                source_unit TEXT NOT NULL,
                record_data JSONB NOT NULL,
                staged_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            quote_ident(table)
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn cast_for(types: &HashMap<String, String>, table: &str, column: &str) -> Result<&'static str, StoreError> {
        match types.get(column).map(String::as_str) {
            Some("double precision") => Ok("DOUBLE PRECISION"),
            Some(_) => Ok("TEXT"),
            None => Err(StoreError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            }),
        }
    }

    fn decode_row(columns: &[(String, String)], row: &PgRow) -> Result<StoredRow, StoreError> {
        let id: i64 = row.try_get("id")?;
        let data: serde_json::Value = row.try_get("data")?;
        let values = columns
            .iter()
            .map(|(name, _)| (name.clone(), data.get(name).map(Value::from_json).unwrap_or_default()))
            .collect();
        Ok(StoredRow { id, values })
    }
}

#[async_trait]
impl RelationalStore for PostgresStore {
    async fn create_table(&self, table: &str, columns: &[ColumnDescriptor]) -> Result<(), StoreError> {
        let mut defs = vec![
            "id BIGSERIAL PRIMARY KEY".to_string(),
            "_source_unit TEXT NOT NULL".to_string(),
        ];
        defs.extend(
            columns
                .iter()
                .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(c.kind))),
        );
        let sql = format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_ident(table), defs.join(", "));
        sqlx::query(&sql).execute(&self.pool).await?;
        debug!(table = %table, columns = columns.len(), "Ensured destination table");
        Ok(())
    }

    async fn apply_structural(&self, table: &str, op: &StructuralOp) -> Result<(), StoreError> {
        let t = quote_ident(table);
        let sql = match op {
            StructuralOp::AddColumn { name, kind } => {
                format!("ALTER TABLE {} ADD COLUMN {} {}", t, quote_ident(name), sql_type(*kind))
            },
            StructuralOp::DropColumn { name } => format!("ALTER TABLE {} DROP COLUMN {}", t, quote_ident(name)),
            StructuralOp::RenameColumn { from, to } => format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                t,
                quote_ident(from),
                quote_ident(to)
            ),
            StructuralOp::RetypeColumn { name, kind } => {
                let col = quote_ident(name);
                match kind {
                    ValueKind::Number => format!(
                        "ALTER TABLE {t} ALTER COLUMN {col} TYPE DOUBLE PRECISION \
                         USING substring(replace({col}::TEXT, ',', '') from '{NUMERIC_TOKEN_SQL}')::DOUBLE PRECISION"
                    ),
                    _ => format!("ALTER TABLE {t} ALTER COLUMN {col} TYPE TEXT USING {col}::TEXT"),
                }
            },
        };
        sqlx::query(&sql).execute(&self.pool).await?;
        debug!(table = %table, op = ?op, "Applied structural change");
        Ok(())
    }

    async fn insert_rows(&self, table: &str, source_unit: &str, rows: &[Row]) -> Result<usize, StoreError> {
        let types: HashMap<String, String> = self.data_columns(table).await?.into_iter().collect();
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let mut names = vec!["_source_unit".to_string()];
            let mut params = vec!["$1".to_string()];
            for (i, (name, _)) in row.iter().enumerate() {
                names.push(quote_ident(name));
                params.push(format!("CAST(${} AS {})", i + 2, Self::cast_for(&types, table, name)?));
            }
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                names.join(", "),
                params.join(", ")
            );
            let mut query = sqlx::query(&sql).bind(source_unit);
            for (_, value) in row.iter() {
                query = query.bind(bind_text(value));
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    async fn delete_unit_rows(&self, table: &str, source_unit: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE _source_unit = $1", quote_ident(table)))
            .bind(source_unit)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stage_rows(&self, table: &str, source_unit: &str, rows: &[Row]) -> Result<usize, StoreError> {
        self.ensure_staging(table).await?;
        let t = quote_ident(table);
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {} WHERE source_unit = $1", t))
            .bind(source_unit)
            .execute(&mut *tx)
            .await?;
        let insert = format!("INSERT INTO {} (source_unit, record_data) VALUES ($1, $2)", t);
        for row in rows {
            sqlx::query(&insert)
                .bind(source_unit)
                .bind(row.to_json())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    async fn select_batch(&self, table: &str, offset: u64, limit: u64) -> Result<Vec<StoredRow>, StoreError> {
        let columns = self.data_columns(table).await?;
        let sql = format!(
            "SELECT id, to_jsonb(t) - 'id' - '_source_unit' AS data FROM {} t ORDER BY id OFFSET $1 LIMIT $2",
            quote_ident(table)
        );
        let rows = sqlx::query(&sql)
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| Self::decode_row(&columns, r)).collect()
    }

    async fn update_rows(&self, table: &str, rows: &[StoredRow]) -> Result<usize, StoreError> {
        let types: HashMap<String, String> = self.data_columns(table).await?.into_iter().collect();
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for row in rows {
            if row.values.is_empty() {
                continue;
            }
            let mut sets = Vec::with_capacity(row.values.len());
            for (i, (name, _)) in row.values.iter().enumerate() {
                sets.push(format!(
                    "{} = CAST(${} AS {})",
                    quote_ident(name),
                    i + 1,
                    Self::cast_for(&types, table, name)?
                ));
            }
            let sql = format!(
                "UPDATE {} SET {} WHERE id = ${}",
                quote_ident(table),
                sets.join(", "),
                row.values.len() + 1
            );
            let mut query = sqlx::query(&sql);
            for (_, value) in row.values.iter() {
                query = query.bind(bind_text(value));
            }
            updated += query.bind(row.id).execute(&mut *tx).await?.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn count(&self, table: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn backup_table(&self, table: &str, backup: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(backup)))
            .execute(&mut *tx)
            .await?;
        let copied = sqlx::query(&format!(
            "CREATE TABLE {} AS SELECT * FROM {}",
            quote_ident(backup),
            quote_ident(table)
        ))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        debug!(table = %table, backup = %backup, rows = copied, "Backed up table");
        Ok(copied)
    }
}
