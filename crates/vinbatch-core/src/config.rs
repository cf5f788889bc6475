//! Decoder and store configuration.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::retry::{Backoff, RetryPolicy};
use crate::store::validate_identifier;
use crate::transport::MAX_BATCH_SIZE;
use crate::types::OnConflict;

pub const DEFAULT_ENDPOINT: &str = "https://vpic.nhtsa.dot.gov/api/vehicles/DecodeVINValuesBatch/";

/// Settings for chunk submission and the flush window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Batch decoding endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// VINs per request (1..=50).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Flush the buffer every this many submitted VINs.
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
    /// Attempts per chunk, counting the first one.
    #[serde(default = "default_request_attempts")]
    pub request_attempts: u32,
    #[serde(default)]
    pub request_backoff: Backoff,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_endpoint() -> String { DEFAULT_ENDPOINT.into() }
fn default_chunk_size() -> usize { MAX_BATCH_SIZE }
fn default_flush_every() -> usize { 1_000 }
fn default_request_attempts() -> u32 { 10 }
fn default_request_timeout_secs() -> u64 { 60 }
fn default_user_agent() -> String { format!("vinbatch/{}", env!("CARGO_PKG_VERSION")) }

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            chunk_size: default_chunk_size(),
            flush_every: default_flush_every(),
            request_attempts: default_request_attempts(),
            request_backoff: Backoff::default(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl DecoderConfig {
    pub fn request_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.request_attempts, self.request_backoff.clone())
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_BATCH_SIZE {
            return Err(PipelineError::Config(format!(
                "chunk_size must be in 1..={MAX_BATCH_SIZE}, got {}",
                self.chunk_size
            )));
        }
        if self.flush_every == 0 {
            return Err(PipelineError::Config("flush_every must be > 0".into()));
        }
        if self.request_attempts == 0 {
            return Err(PipelineError::Config("request_attempts must be > 0".into()));
        }
        if self.endpoint.is_empty() {
            return Err(PipelineError::Config("endpoint is empty".into()));
        }
        Ok(())
    }
}

/// Settings for the relational store and the flush unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `sqlite:...`, `postgres://...` or `memory:`.
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub on_conflict: OnConflict,
    /// Upsert attempts per flush before the buffered records are dropped.
    #[serde(default = "default_flush_attempts")]
    pub flush_attempts: u32,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Create the results table at start-up if it does not exist.
    #[serde(default = "bool_true")]
    pub create_table: bool,
    /// Query whose first column yields the VINs to decode.
    #[serde(default = "default_source_query")]
    pub source_query: String,
}

fn default_table() -> String { "vin_model_match".into() }
fn default_flush_attempts() -> u32 { 2 }
fn default_connect_attempts() -> u32 { 10 }
fn default_connect_backoff_ms() -> u64 { 2_000 }
fn default_max_connections() -> u32 { 5 }
fn bool_true() -> bool { true }
fn default_source_query() -> String { "SELECT vin FROM carvana_cars".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            table: default_table(),
            on_conflict: OnConflict::default(),
            flush_attempts: default_flush_attempts(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
            max_connections: default_max_connections(),
            create_table: true,
            source_query: default_source_query(),
        }
    }
}

impl StoreConfig {
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_attempts,
            Backoff::Fixed {
                delay_ms: self.connect_backoff_ms,
            },
        )
    }

    /// DDL for the results table.
    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                vin   TEXT NOT NULL PRIMARY KEY,
                brand TEXT NOT NULL,
                model TEXT NOT NULL
            )",
            self.table
        )
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.database_url.trim().is_empty() {
            return Err(PipelineError::Config("database_url is not set".into()));
        }
        validate_identifier(&self.table).map_err(|e| PipelineError::Config(e.to_string()))?;
        if self.flush_attempts == 0 || self.connect_attempts == 0 {
            return Err(PipelineError::Config(
                "flush_attempts and connect_attempts must be > 0".into(),
            ));
        }
        if self.source_query.trim().is_empty() {
            return Err(PipelineError::Config("source_query is empty".into()));
        }
        Ok(())
    }
}
