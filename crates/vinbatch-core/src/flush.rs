//! Flush controller: owns the record buffer and decides when to persist it.
//!
//! Records accumulate in memory and are written in one bulk upsert when:
//! - the flush window (VINs submitted since the last window boundary) fills,
//! - the run finishes (end-of-run drain),
//! - the run aborts with an error (failure drain).
//!
//! Each flush is its own unit of work; no connection is held between flushes.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::retry::{Backoff, RetryPolicy};
use crate::store::{RecordBatch, RecordStore};
use crate::types::{DecodedRecord, OnConflict};

/// What a single flush did with the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered.
    Empty,
    /// Records were written; `rows_written` excludes ignored conflicts.
    Persisted { records: usize, rows_written: u64 },
    /// Every attempt failed and the records were discarded.
    Dropped { records: usize, error: String },
}

/// Where the flushed records go and how conflicts resolve.
#[derive(Debug, Clone)]
pub struct FlushTarget {
    pub table: String,
    pub primary_keys: Vec<String>,
    pub on_conflict: OnConflict,
    /// Upsert attempts per flush before the records are dropped.
    pub attempts: u32,
}

impl Default for FlushTarget {
    fn default() -> Self {
        Self {
            table: "vin_model_match".into(),
            primary_keys: vec!["vin".into()],
            on_conflict: OnConflict::Ignore,
            attempts: 2,
        }
    }
}

impl FlushTarget {
    /// Results table from `config`, keyed on `vin`.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            table: config.table.clone(),
            primary_keys: vec!["vin".into()],
            on_conflict: config.on_conflict,
            attempts: config.flush_attempts,
        }
    }
}

/// Running totals across every flush of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub flushes: usize,
    pub persisted: usize,
    pub dropped: usize,
}

/// Buffers decoded records and writes them to a [`RecordStore`].
pub struct FlushController {
    store: Arc<dyn RecordStore>,
    target: FlushTarget,
    flush_every: usize,
    buffer: Vec<DecodedRecord>,
    /// VINs submitted since the last window boundary.
    window: usize,
    stats: FlushStats,
}

impl FlushController {
    pub fn new(store: Arc<dyn RecordStore>, target: FlushTarget, flush_every: usize) -> Self {
        Self {
            store,
            target,
            flush_every: flush_every.max(1),
            buffer: Vec::new(),
            window: 0,
            stats: FlushStats::default(),
        }
    }

    /// Append records to the buffer.
    pub fn push(&mut self, records: impl IntoIterator<Item = DecodedRecord>) {
        self.buffer.extend(records);
    }

    pub fn buffered(&self) -> &[DecodedRecord] {
        &self.buffer
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn stats(&self) -> FlushStats {
        self.stats
    }

    /// Count `vins` submitted VINs toward the window and flush when it fills.
    ///
    /// The window rolls over at every boundary even when the buffer is empty,
    /// carrying the overshoot, so boundaries stay aligned to multiples of
    /// `flush_every` submitted VINs.
    pub async fn advance(&mut self, vins: usize) -> Result<Option<FlushOutcome>, StoreError> {
        self.window += vins;
        if self.window < self.flush_every {
            return Ok(None);
        }
        self.window %= self.flush_every;
        if self.buffer.is_empty() {
            debug!(flush_every = self.flush_every, "flush window reached with empty buffer");
            return Ok(None);
        }
        self.flush("window").await.map(Some)
    }

    /// Persist the whole buffer in one bulk upsert and clear it.
    ///
    /// Query failures are retried up to `attempts` times, after which the
    /// records are dropped and reported as [`FlushOutcome::Dropped`]. A
    /// connection failure is returned as an error and the buffer is kept.
    pub async fn flush(&mut self, reason: &str) -> Result<FlushOutcome, StoreError> {
        if self.buffer.is_empty() {
            return Ok(FlushOutcome::Empty);
        }
        let records = self.buffer.len();
        debug!(reason, records, table = %self.target.table, "start writing records to store");

        let result = {
            let batch = RecordBatch::from_records(&self.buffer);
            let pks: Vec<&str> = self.target.primary_keys.iter().map(String::as_str).collect();
            let policy = RetryPolicy::new(self.target.attempts, Backoff::None);

            let store = &*self.store;
            let batch = &batch;
            let table = self.target.table.as_str();
            let pks = pks.as_slice();
            let on_conflict = self.target.on_conflict;
            policy
                .run(
                    move |_| store.upsert(batch, table, pks, on_conflict),
                    |e: &StoreError| !e.is_connection(),
                )
                .await
        };

        match result {
            Ok(rows_written) => {
                self.buffer.clear();
                self.stats.flushes += 1;
                self.stats.persisted += records;
                info!(
                    reason,
                    records,
                    rows_written,
                    outcome = "success",
                    "records written to store"
                );
                Ok(FlushOutcome::Persisted {
                    records,
                    rows_written,
                })
            }
            Err((e, _)) if e.is_connection() => {
                error!(reason, records, error = %e, "store unreachable, flush aborted");
                Err(e)
            }
            Err((e, attempts)) => {
                self.buffer.clear();
                self.stats.dropped += records;
                error!(
                    reason,
                    records,
                    attempts,
                    error = %e,
                    "flush failed, dropping buffered records"
                );
                Ok(FlushOutcome::Dropped {
                    records,
                    error: e.to_string(),
                })
            }
        }
    }
}
