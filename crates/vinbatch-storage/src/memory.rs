//! In-memory storage backend.
//!
//! Keeps tables as row vectors in RAM with the same upsert semantics as the
//! SQL backends. `select` understands only `SELECT <cols | *> FROM <table>`.
//! Useful for tests and dry runs; all data is lost when the process exits.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use vinbatch_core::error::StoreError;
use vinbatch_core::store::{validate_identifier, PreparedUpsert, RecordBatch, RecordStore};
use vinbatch_core::types::{OnConflict, Rows, SqlValue};

#[derive(Debug, Default, Clone)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    /// Primary key → row position.
    index: HashMap<String, usize>,
}

/// In-memory record store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<HashMap<String, Table>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, Table>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert rows verbatim (no key handling), creating the table if needed.
    pub fn seed(&self, table: &str, columns: &[&str], rows: Vec<Vec<SqlValue>>) {
        let mut tables = self.tables();
        let t = tables.entry(table.to_string()).or_insert_with(|| Table {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        });
        t.rows.extend(rows);
    }

    /// Rows of `table` in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Vec<SqlValue>> {
        self.tables()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables().get(table).map_or(0, |t| t.rows.len())
    }
}

/// Parse `SELECT a, b FROM t` / `SELECT * FROM t`.
fn parse_select(query: &str) -> Option<(Vec<String>, String)> {
    let q = query.trim().trim_end_matches(';').trim();
    let lower = q.to_ascii_lowercase();
    let rest = lower.strip_prefix("select ")?;
    let from = rest.find(" from ")?;
    // ASCII lowercasing keeps byte offsets, so they index `q` too.
    let start = "select ".len();
    let cols = q[start..start + from].trim();
    let table = q[start + from + " from ".len()..].trim();
    if cols.is_empty() {
        return None;
    }
    if table.contains(char::is_whitespace) || validate_identifier(table).is_err() {
        return None;
    }
    let columns = if cols == "*" {
        vec![]
    } else {
        let list: Vec<String> = cols.split(',').map(|c| c.trim().to_string()).collect();
        if list.iter().any(|c| validate_identifier(c).is_err()) {
            return None;
        }
        list
    };
    Some((columns, table.to_string()))
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn select(&self, query: &str) -> Result<Rows, StoreError> {
        let (wanted, table) = parse_select(query)
            .ok_or_else(|| StoreError::Query(format!("unsupported query for in-memory store: {query}")))?;
        let tables = self.tables();
        let t = tables
            .get(&table)
            .ok_or_else(|| StoreError::Query(format!("no such table: {table}")))?;

        let columns = if wanted.is_empty() { t.columns.clone() } else { wanted };
        let mut positions = Vec::with_capacity(columns.len());
        for c in &columns {
            let pos = t
                .columns
                .iter()
                .position(|tc| tc == c)
                .ok_or_else(|| StoreError::Query(format!("no such column: {c}")))?;
            positions.push(pos);
        }

        let rows = t
            .rows
            .iter()
            .map(|r| positions.iter().map(|&p| r[p].to_json()).collect::<Vec<Value>>())
            .collect();
        Ok(Rows { columns, rows })
    }

    async fn upsert(
        &self,
        batch: &RecordBatch,
        table: &str,
        primary_keys: &[&str],
        on_conflict: OnConflict,
    ) -> Result<u64, StoreError> {
        let prepared = PreparedUpsert::new(batch, table, primary_keys, on_conflict)?;
        let mut tables = self.tables();
        let t = tables.entry(prepared.table.clone()).or_insert_with(|| Table {
            columns: prepared.columns.clone(),
            ..Default::default()
        });
        if t.columns != prepared.columns {
            return Err(StoreError::Query(format!(
                "column mismatch for {}: table has {:?}",
                prepared.table, t.columns
            )));
        }

        let mut written = 0u64;
        for row in &prepared.rows {
            if prepared.primary_keys.is_empty() {
                t.rows.push(row.clone());
                written += 1;
                continue;
            }
            let key = prepared.row_key(row);
            match t.index.get(&key) {
                Some(&pos) if on_conflict == OnConflict::Update => {
                    t.rows[pos] = row.clone();
                    written += 1;
                }
                Some(_) => {}
                None => {
                    t.index.insert(key, t.rows.len());
                    t.rows.push(row.clone());
                    written += 1;
                }
            }
        }
        debug!(table = %prepared.table, written, "in-memory upsert");
        Ok(written)
    }

    async fn execute(&self, statement: &str) -> Result<u64, StoreError> {
        let lower = statement.trim().to_ascii_lowercase();
        if lower.starts_with("create table") {
            return Ok(0);
        }
        Err(StoreError::Query(format!(
            "unsupported statement for in-memory store: {statement}"
        )))
    }
}
