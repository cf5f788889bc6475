//! The `RecordStore` trait and the backend-independent half of a bulk upsert.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{OnConflict, Record, Rows, SqlValue};

/// A batch of rows sharing one column layout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl RecordBatch {
    pub fn from_records<R: Record>(records: &[R]) -> Self {
        Self {
            columns: R::columns().iter().map(|c| c.to_string()).collect(),
            rows: records.iter().map(Record::values).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Relational store consumed by the pipeline.
///
/// Every method acquires its own connection/transaction and releases it
/// before returning: commit on success, rollback on failure.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Run a read query and return every row.
    async fn select(&self, query: &str) -> Result<Rows, StoreError>;

    /// Bulk insert `batch` into `table` in one transaction.
    ///
    /// Rows whose `primary_keys` collide with existing rows are overwritten
    /// ([`OnConflict::Update`]) or left untouched ([`OnConflict::Ignore`]).
    /// Returns the number of rows inserted or updated.
    async fn upsert(
        &self,
        batch: &RecordBatch,
        table: &str,
        primary_keys: &[&str],
        on_conflict: OnConflict,
    ) -> Result<u64, StoreError>;

    /// Run an arbitrary statement; returns the number of affected rows.
    async fn execute(&self, statement: &str) -> Result<u64, StoreError>;
}

/// Reject anything that is not a plain (optionally schema-qualified) identifier.
///
/// Table and column names cannot be bound as parameters, so they are
/// validated before being placed into statement text.
pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|p| valid_part(p)) {
        return Err(StoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

/// A validated, de-duplicated upsert ready to be rendered by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedUpsert {
    pub table: String,
    pub columns: Vec<String>,
    pub primary_keys: Vec<String>,
    pub on_conflict: OnConflict,
    pub rows: Vec<Vec<SqlValue>>,
}

impl PreparedUpsert {
    /// Validate identifiers and row shapes, then collapse duplicate keys.
    ///
    /// Within one batch, the first row per key is kept for
    /// [`OnConflict::Ignore`] and the last for [`OnConflict::Update`], so the
    /// statement never touches the same row twice.
    pub fn new(
        batch: &RecordBatch,
        table: &str,
        primary_keys: &[&str],
        on_conflict: OnConflict,
    ) -> Result<Self, StoreError> {
        validate_identifier(table)?;
        if batch.columns.is_empty() {
            return Err(StoreError::Malformed("no columns".into()));
        }
        for col in &batch.columns {
            validate_identifier(col)?;
        }
        let width = batch.columns.len();
        if let Some(bad) = batch.rows.iter().position(|r| r.len() != width) {
            return Err(StoreError::Malformed(format!(
                "row {bad} has {} values, expected {width}",
                batch.rows[bad].len()
            )));
        }

        let mut key_idx = Vec::with_capacity(primary_keys.len());
        for pk in primary_keys {
            let idx = batch
                .columns
                .iter()
                .position(|c| c == pk)
                .ok_or_else(|| StoreError::Malformed(format!("primary key {pk:?} not in columns")))?;
            key_idx.push(idx);
        }

        let rows = if key_idx.is_empty() {
            batch.rows.clone()
        } else {
            dedupe_rows(&batch.rows, &key_idx, on_conflict)
        };

        Ok(Self {
            table: table.to_string(),
            columns: batch.columns.clone(),
            primary_keys: primary_keys.iter().map(|s| s.to_string()).collect(),
            on_conflict,
            rows,
        })
    }

    /// Non-key columns, overwritten on conflict in update mode.
    pub fn update_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !self.primary_keys.contains(c))
            .map(String::as_str)
            .collect()
    }

    /// `INSERT INTO <table> (<cols>) `: the values list is appended by the backend.
    pub fn insert_prefix(&self) -> String {
        format!("INSERT INTO {} ({}) ", self.table, self.columns.join(", "))
    }

    /// The `ON CONFLICT` tail shared by SQLite and PostgreSQL.
    pub fn conflict_clause(&self) -> String {
        let updates = self.update_columns();
        match self.on_conflict {
            OnConflict::Update if !self.primary_keys.is_empty() && !updates.is_empty() => {
                let set = updates
                    .iter()
                    .map(|c| format!("{c} = excluded.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    " ON CONFLICT ({}) DO UPDATE SET {set}",
                    self.primary_keys.join(", ")
                )
            }
            _ => " ON CONFLICT DO NOTHING".to_string(),
        }
    }

    /// Key of `row` built from the primary key columns.
    pub fn row_key(&self, row: &[SqlValue]) -> String {
        self.primary_keys
            .iter()
            .filter_map(|pk| self.columns.iter().position(|c| c == pk))
            .map(|i| row[i].key_fragment())
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }
}

fn dedupe_rows(rows: &[Vec<SqlValue>], key_idx: &[usize], on_conflict: OnConflict) -> Vec<Vec<SqlValue>> {
    let mut seen: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<Vec<SqlValue>> = Vec::with_capacity(rows.len());
    for row in rows {
        let key = key_idx
            .iter()
            .map(|&i| row[i].key_fragment())
            .collect::<Vec<_>>()
            .join("\u{1f}");
        match seen.get(&key) {
            Some(&pos) => {
                if on_conflict == OnConflict::Update {
                    out[pos] = row.clone();
                }
            }
            None => {
                seen.insert(key, out.len());
                out.push(row.clone());
            }
        }
    }
    out
}
