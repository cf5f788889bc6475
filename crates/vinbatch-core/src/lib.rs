//! vinbatch-core: the decode-and-persist pipeline, independent of HTTP and SQL.
//!
//! # Overview
//!
//! ```text
//! RecordStore::select ─▶ BatchDecoder ─▶ DecodeTransport (per chunk, retried)
//!                              │
//!                              └─▶ FlushController ─▶ RecordStore::upsert
//! ```
//!
//! - [`DecodeTransport`]: one request to the batch decoding endpoint
//! - [`RecordStore`]: select / upsert / execute against a relational store
//! - [`RetryPolicy`]: attempt ceiling plus backoff, owned by each call site
//! - [`BatchDecoder`]: chunking, submission, mapping
//! - [`FlushController`]: buffering and flush triggers

pub mod config;
pub mod decoder;
pub mod error;
pub mod flush;
pub mod retry;
pub mod source;
pub mod store;
pub mod transport;
pub mod types;

pub use config::{DecoderConfig, StoreConfig};
pub use decoder::BatchDecoder;
pub use error::{PipelineError, StoreError, TransportError};
pub use flush::{FlushController, FlushOutcome, FlushTarget};
pub use retry::{Backoff, RetryPolicy};
pub use store::{PreparedUpsert, RecordBatch, RecordStore};
pub use transport::DecodeTransport;
pub use types::{DecodeResult, DecodedRecord, OnConflict, Record, Rows, RunSummary, SqlValue, Vin};
