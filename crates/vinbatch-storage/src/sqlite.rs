//! SQLite storage backend.
//!
//! Uses `sqlx` with WAL mode for file-backed databases. Every operation runs
//! in its own transaction taken from the pool; connection acquisition is
//! retried under the configured [`RetryPolicy`].
//!
//! # Usage
//! ```rust,no_run
//! use vinbatch_storage::sqlite::SqliteStorage;
//! use vinbatch_storage::StorageOptions;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./vins.db", StorageOptions::default()).await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use vinbatch_core::error::StoreError;
use vinbatch_core::retry::RetryPolicy;
use vinbatch_core::store::{PreparedUpsert, RecordBatch, RecordStore};
use vinbatch_core::types::{OnConflict, Rows, SqlValue};

use crate::StorageOptions;

/// Bound parameters per statement, below SQLite's `SQLITE_MAX_VARIABLE_NUMBER`.
const MAX_PARAMS: usize = 30_000;

/// SQLite-backed record store.
pub struct SqliteStorage {
    pool: SqlitePool,
    connect: RetryPolicy,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./vins.db"`) or a full
    /// SQLite URL (`"sqlite:./vins.db"`).
    pub async fn open(path: &str, opts: StorageOptions) -> Result<Self, StoreError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| StoreError::Query(format!("invalid sqlite url: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let max_connections = opts.max_connections;
        let pool = opts
            .connect
            .run(
                move |_| {
                    SqlitePoolOptions::new()
                        .max_connections(max_connections)
                        .connect_with(options.clone())
                },
                |_: &sqlx::Error| true,
            )
            .await
            .map_err(|(e, attempts)| StoreError::Connection {
                attempts,
                reason: e.to_string(),
            })?;

        info!(path = %url, "SqliteStorage opened");
        Ok(Self {
            pool,
            connect: opts.connect,
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// The pool holds exactly one connection that never expires, so every
    /// operation sees the same database. All data is lost when the store is
    /// dropped.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::Connection {
                attempts: 1,
                reason: e.to_string(),
            })?;
        Ok(Self {
            pool,
            connect: RetryPolicy::default(),
        })
    }

    /// Start a transaction, retrying connection acquisition.
    async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        let pool = &self.pool;
        self.connect
            .run(move |_| pool.begin(), |_: &sqlx::Error| true)
            .await
            .map_err(|(e, attempts)| StoreError::Connection {
                attempts,
                reason: e.to_string(),
            })
    }
}

async fn finish<T>(
    tx: Transaction<'static, Sqlite>,
    result: Result<T, sqlx::Error>,
) -> Result<T, StoreError> {
    match result {
        Ok(v) => {
            tx.commit()
                .await
                .map_err(|e| StoreError::Query(format!("commit: {e}")))?;
            Ok(v)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                debug!(error = %rb, "rollback failed");
            }
            Err(StoreError::Query(e.to_string()))
        }
    }
}

fn cell(row: &SqliteRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map_or(Value::Null, Value::String);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map_or(Value::Null, |b| Value::String(String::from_utf8_lossy(&b).into_owned()));
    }
    Value::Null
}

fn to_rows(rows: Vec<SqliteRow>) -> Rows {
    use sqlx::Column;

    let columns = rows
        .first()
        .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let rows = rows
        .iter()
        .map(|r| (0..r.len()).map(|i| cell(r, i)).collect())
        .collect();
    Rows { columns, rows }
}

#[async_trait]
impl RecordStore for SqliteStorage {
    async fn select(&self, query: &str) -> Result<Rows, StoreError> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(query).fetch_all(&mut *tx).await;
        let rows = finish(tx, result).await?;
        debug!(rows = rows.len(), "select complete");
        Ok(to_rows(rows))
    }

    async fn upsert(
        &self,
        batch: &RecordBatch,
        table: &str,
        primary_keys: &[&str],
        on_conflict: OnConflict,
    ) -> Result<u64, StoreError> {
        let prepared = PreparedUpsert::new(batch, table, primary_keys, on_conflict)?;
        if prepared.rows.is_empty() {
            return Ok(0);
        }
        let rows_per_statement = (MAX_PARAMS / prepared.columns.len()).max(1);

        let mut tx = self.begin().await?;
        let mut result: Result<u64, sqlx::Error> = Ok(0);
        for rows in prepared.rows.chunks(rows_per_statement) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(prepared.insert_prefix());
            qb.push_values(rows, |mut b, row| {
                for value in row {
                    match value {
                        SqlValue::Null => {
                            b.push_bind(None::<String>);
                        }
                        SqlValue::Bool(v) => {
                            b.push_bind(*v);
                        }
                        SqlValue::Int(v) => {
                            b.push_bind(*v);
                        }
                        SqlValue::Float(v) => {
                            b.push_bind(*v);
                        }
                        SqlValue::Text(v) => {
                            b.push_bind(v.clone());
                        }
                    }
                }
            });
            qb.push(prepared.conflict_clause());

            match qb.build().execute(&mut *tx).await {
                Ok(done) => {
                    if let Ok(total) = result.as_mut() {
                        *total += done.rows_affected();
                    }
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        let written = finish(tx, result).await?;
        debug!(table = %prepared.table, rows = prepared.rows.len(), written, "upsert committed");
        Ok(written)
    }

    async fn execute(&self, statement: &str) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map(|r| r.rows_affected());
        finish(tx, result).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
