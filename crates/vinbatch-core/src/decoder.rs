//! The batch decoder: drives a VIN list through the endpoint into the flush controller.
//!
//! ```text
//! VIN list ─▶ chunks(≤50) ─▶ DecodeTransport (retried) ─▶ records ─▶ FlushController
//!                                                                     ├─ every 1000 VINs
//!                                                                     ├─ end of run
//!                                                                     └─ on abort
//! ```
//!
//! Execution is strictly sequential. Cancellation is checked between chunks.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DecoderConfig;
use crate::error::{PipelineError, TransportError};
use crate::flush::{FlushController, FlushOutcome};
use crate::retry::RetryPolicy;
use crate::transport::{DecodeTransport, MAX_BATCH_SIZE};
use crate::types::{DecodeResult, DecodedRecord, RunSummary, Vin};

/// Number of chunks a list of `len` VINs splits into.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1))
}

/// Keep the results that carry a model, copied verbatim.
pub fn records_from_results(results: &[DecodeResult]) -> Vec<DecodedRecord> {
    results
        .iter()
        .filter_map(|r| {
            let rec = r.to_record();
            if rec.is_none() {
                debug!(vin = %r.vin, error_code = %r.error_code, error_text = %r.error_text, "no model decoded");
            }
            rec
        })
        .collect()
}

/// Splits VINs into chunks, decodes them, and feeds the flush controller.
pub struct BatchDecoder {
    transport: Arc<dyn DecodeTransport>,
    policy: RetryPolicy,
    chunk_size: usize,
    flusher: FlushController,
    cancel: CancellationToken,
}

impl BatchDecoder {
    pub fn new(transport: Arc<dyn DecodeTransport>, flusher: FlushController, config: &DecoderConfig) -> Self {
        Self {
            transport,
            policy: config.request_policy(),
            chunk_size: config.chunk_size.clamp(1, MAX_BATCH_SIZE),
            flusher,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop submitting chunks once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn flusher(&self) -> &FlushController {
        &self.flusher
    }

    /// Decode every VIN and persist the results.
    ///
    /// Returns `Ok` when the list was processed (or cancelled) even if some
    /// chunks were skipped. If the loop aborts, the buffer is drained once
    /// before the error is returned.
    pub async fn run(&mut self, vins: &[Vin]) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let mut summary = RunSummary::default();
        info!(
            vins = vins.len(),
            chunks = chunk_count(vins.len(), self.chunk_size),
            endpoint = self.transport.url(),
            "start processing vin codes"
        );

        if let Err(e) = self.decode_all(vins, &mut summary).await {
            error!(error = %e, buffered = self.flusher.buffered().len(), "decode loop aborted, draining buffer");
            match self.flusher.flush("failure-drain").await {
                Ok(FlushOutcome::Dropped { records, .. }) => {
                    error!(records, "failure drain could not persist records")
                }
                Ok(_) => {}
                Err(drain) => error!(error = %drain, "failure drain failed"),
            }
            return Err(e);
        }

        if let Err(e) = self.flusher.flush("end-of-run").await {
            let stats = self.flusher.stats();
            error!(
                error = %e,
                chunks_submitted = summary.chunks_submitted,
                chunks_skipped = summary.chunks_skipped,
                vins_submitted = summary.vins_submitted,
                records_decoded = summary.records_decoded,
                records_persisted = stats.persisted,
                buffered = self.flusher.buffered().len(),
                "end-of-run flush failed"
            );
            return Err(e.into());
        }

        let stats = self.flusher.stats();
        summary.flushes = stats.flushes;
        summary.records_persisted = stats.persisted;
        summary.records_dropped = stats.dropped;

        info!(
            decoded = summary.records_decoded,
            submitted = summary.vins_submitted,
            skipped_chunks = summary.chunks_skipped,
            flushes = summary.flushes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = "success",
            "successfully processed {} vin codes",
            summary.records_decoded
        );
        Ok(summary)
    }

    async fn decode_all(&mut self, vins: &[Vin], summary: &mut RunSummary) -> Result<(), PipelineError> {
        let total = chunk_count(vins.len(), self.chunk_size);

        for (idx, chunk) in vins.chunks(self.chunk_size).enumerate() {
            if self.cancel.is_cancelled() {
                warn!(chunk = idx + 1, total, "cancelled, no further chunks will be submitted");
                summary.cancelled = true;
                break;
            }

            summary.chunks_submitted += 1;
            summary.vins_submitted += chunk.len();

            match self.submit(idx + 1, chunk).await {
                Some(results) => {
                    let records = records_from_results(&results);
                    summary.records_decoded += records.len();
                    self.flusher.push(records);
                }
                None => summary.chunks_skipped += 1,
            }

            self.flusher.advance(chunk.len()).await?;

            info!(
                chunk = idx + 1,
                total,
                decoded = summary.records_decoded,
                buffered = self.flusher.buffered().len(),
                "chunk processed"
            );
        }
        Ok(())
    }

    /// Submit one chunk under the retry policy. `None` means the chunk is abandoned.
    async fn submit(&self, chunk_no: usize, chunk: &[Vin]) -> Option<Vec<DecodeResult>> {
        let transport = &*self.transport;
        let result = self
            .policy
            .run(
                move |_| transport.decode_batch(chunk),
                TransportError::is_retryable,
            )
            .await;

        match result {
            Ok(results) => Some(results),
            Err((e, attempts)) => {
                error!(
                    severity = "critical",
                    chunk = chunk_no,
                    vins = chunk.len(),
                    first_vin = %chunk[0],
                    attempts,
                    error = %e,
                    "can't get response, skipping chunk"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tracing::field::{Field, Visit};
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    use crate::error::StoreError;
    use crate::flush::FlushTarget;
    use crate::retry::Backoff;
    use crate::store::{RecordBatch, RecordStore};
    use crate::types::{OnConflict, Rows};

    /// Decodes every VIN whose numeric suffix is not divisible by `undecodable_every`.
    struct FakeEndpoint {
        calls: AtomicUsize,
        undecodable_every: usize,
        /// Chunks containing one of these VINs always answer HTTP 500.
        failing: HashSet<String>,
        malformed: HashSet<String>,
        cancel_after_first: Option<CancellationToken>,
    }

    impl FakeEndpoint {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                undecodable_every: 0,
                failing: HashSet::new(),
                malformed: HashSet::new(),
                cancel_after_first: None,
            }
        }
    }

    #[async_trait]
    impl DecodeTransport for FakeEndpoint {
        async fn decode_batch(&self, vins: &[Vin]) -> Result<Vec<DecodeResult>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = &self.cancel_after_first {
                token.cancel();
            }
            if vins.iter().any(|v| self.failing.contains(v.as_str())) {
                return Err(TransportError::Status {
                    status: 500,
                    body: "Internal Server Error".into(),
                });
            }
            if vins.iter().any(|v| self.malformed.contains(v.as_str())) {
                return Err(TransportError::Decode("expected value at line 1".into()));
            }
            Ok(vins
                .iter()
                .map(|v| {
                    let n: usize = v.as_str()[3..].parse().unwrap();
                    let decodable = self.undecodable_every == 0 || n % self.undecodable_every != 0;
                    DecodeResult {
                        vin: v.to_string(),
                        make: "TOYOTA".into(),
                        model: if decodable { "Camry".into() } else { String::new() },
                        ..Default::default()
                    }
                })
                .collect())
        }

        fn url(&self) -> &str {
            "http://fake"
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        upserts: Mutex<Vec<usize>>,
        /// Number of leading upserts that fail with a connection error.
        unreachable_first: usize,
    }

    #[async_trait]
    impl RecordStore for RecordingStore {
        async fn select(&self, _query: &str) -> Result<Rows, StoreError> {
            Ok(Rows::default())
        }

        async fn upsert(
            &self,
            batch: &RecordBatch,
            _table: &str,
            _primary_keys: &[&str],
            _on_conflict: OnConflict,
        ) -> Result<u64, StoreError> {
            let mut calls = self.upserts.lock().unwrap();
            calls.push(batch.len());
            if calls.len() <= self.unreachable_first {
                return Err(StoreError::Connection {
                    attempts: 10,
                    reason: "connection refused".into(),
                });
            }
            Ok(batch.len() as u64)
        }

        async fn execute(&self, _statement: &str) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    fn vins(n: usize) -> Vec<Vin> {
        (1..=n).map(|i| Vin::new(format!("VIN{i:014}"))).collect()
    }

    fn config() -> DecoderConfig {
        DecoderConfig {
            request_backoff: Backoff::None,
            ..Default::default()
        }
    }

    fn decoder(endpoint: Arc<FakeEndpoint>, store: Arc<RecordingStore>) -> BatchDecoder {
        let flusher = FlushController::new(store, FlushTarget::default(), 1_000);
        BatchDecoder::new(endpoint, flusher, &config())
    }

    type Fields = HashMap<String, String>;

    /// Layer that keeps the fields of every event emitted while installed.
    #[derive(Clone, Default)]
    struct CapturedEvents(Arc<Mutex<Vec<Fields>>>);

    struct FieldVisitor<'a>(&'a mut Fields);

    impl Visit for FieldVisitor<'_> {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{value:?}"));
        }
    }

    impl<S: Subscriber> Layer<S> for CapturedEvents {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut fields = Fields::new();
            event.record(&mut FieldVisitor(&mut fields));
            self.0.lock().unwrap().push(fields);
        }
    }

    impl CapturedEvents {
        fn install(&self) -> tracing::subscriber::DefaultGuard {
            tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
        }

        fn with_field(&self, name: &str, value: &str) -> Vec<Fields> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.get(name).map(String::as_str) == Some(value))
                .cloned()
                .collect()
        }
    }

    #[test]
    fn chunks_cover_input_in_order() {
        for len in 0..=205 {
            let list = vins(len);
            let chunks: Vec<&[Vin]> = list.chunks(MAX_BATCH_SIZE).collect();
            assert_eq!(chunks.len(), chunk_count(len, MAX_BATCH_SIZE));
            assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= MAX_BATCH_SIZE));
            let rebuilt: Vec<Vin> = chunks.concat();
            assert_eq!(rebuilt, list);
        }
    }

    #[test]
    fn only_results_with_model_become_records() {
        let results = vec![
            DecodeResult {
                vin: "VIN_A".into(),
                make: "Toyota".into(),
                model: "Camry".into(),
                ..Default::default()
            },
            DecodeResult {
                vin: "VIN_B".into(),
                make: "Honda".into(),
                model: String::new(),
                ..Default::default()
            },
        ];
        assert_eq!(
            records_from_results(&results),
            vec![DecodedRecord {
                vin: "VIN_A".into(),
                brand: "Toyota".into(),
                model: "Camry".into(),
            }]
        );
    }

    #[tokio::test]
    async fn thousand_vins_flush_once_at_window() {
        let endpoint = Arc::new(FakeEndpoint {
            undecodable_every: 5,
            ..FakeEndpoint::new()
        });
        let store = Arc::new(RecordingStore::default());
        let mut dec = decoder(endpoint.clone(), store.clone());

        let summary = dec.run(&vins(1_000)).await.unwrap();

        assert_eq!(*store.upserts.lock().unwrap(), vec![800]);
        assert!(dec.flusher().buffered().is_empty());
        assert_eq!(summary.records_decoded, 800);
        assert_eq!(summary.chunks_submitted, 20);
        assert_eq!(summary.flushes, 1);
        assert_eq!(summary.records_persisted, 800);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn remainder_flushed_at_end_of_run() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let store = Arc::new(RecordingStore::default());
        let mut dec = decoder(endpoint, store.clone());

        let summary = dec.run(&vins(2_030)).await.unwrap();

        assert_eq!(*store.upserts.lock().unwrap(), vec![1_000, 1_000, 30]);
        assert_eq!(summary.chunks_submitted, 41);
        assert_eq!(summary.flushes, 3);
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn failing_chunk_is_skipped_after_ten_attempts() {
        let list = vins(120);
        let endpoint = Arc::new(FakeEndpoint {
            failing: [list[60].to_string()].into_iter().collect(),
            ..FakeEndpoint::new()
        });
        let store = Arc::new(RecordingStore::default());
        let mut dec = decoder(endpoint.clone(), store.clone());

        let summary = dec.run(&list).await.unwrap();

        // chunk 1 once, chunk 2 ten times, chunk 3 once
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 12);
        assert_eq!(summary.chunks_skipped, 1);
        assert_eq!(summary.vins_submitted, 120);
        assert_eq!(summary.records_decoded, 70);
        assert_eq!(*store.upserts.lock().unwrap(), vec![70]);
    }

    #[tokio::test]
    async fn skipped_chunks_still_advance_the_window() {
        let list = vins(1_000);
        let endpoint = Arc::new(FakeEndpoint {
            failing: [list[0].to_string()].into_iter().collect(),
            ..FakeEndpoint::new()
        });
        let store = Arc::new(RecordingStore::default());
        let mut dec = decoder(endpoint, store.clone());

        dec.run(&list).await.unwrap();
        assert_eq!(*store.upserts.lock().unwrap(), vec![950]);
        assert_eq!(dec.flusher().window(), 0);
    }

    #[tokio::test]
    async fn malformed_body_is_not_retried() {
        let list = vins(10);
        let endpoint = Arc::new(FakeEndpoint {
            malformed: [list[0].to_string()].into_iter().collect(),
            ..FakeEndpoint::new()
        });
        let store = Arc::new(RecordingStore::default());
        let mut dec = decoder(endpoint.clone(), store.clone());

        let summary = dec.run(&list).await.unwrap();
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.chunks_skipped, 1);
        assert!(store.upserts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn abort_triggers_single_failure_drain() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let store = Arc::new(RecordingStore {
            unreachable_first: 1,
            ..Default::default()
        });
        let mut dec = decoder(endpoint.clone(), store.clone());

        let err = dec.run(&vins(1_500)).await.unwrap_err();

        assert!(matches!(err, PipelineError::Store(ref e) if e.is_connection()));
        // window flush failed, failure drain wrote the same 1000 records, loop stopped
        assert_eq!(*store.upserts.lock().unwrap(), vec![1_000, 1_000]);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 20);
        assert!(dec.flusher().buffered().is_empty());
    }

    #[tokio::test]
    async fn abandoned_chunk_emits_one_critical_event() {
        let events = CapturedEvents::default();
        let _guard = events.install();

        let list = vins(120);
        let endpoint = Arc::new(FakeEndpoint {
            failing: [list[60].to_string()].into_iter().collect(),
            ..FakeEndpoint::new()
        });
        let store = Arc::new(RecordingStore::default());
        decoder(endpoint, store).run(&list).await.unwrap();

        let critical = events.with_field("severity", "critical");
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0]["chunk"], "2");
        assert_eq!(critical[0]["first_vin"], list[50].as_str());
        assert_eq!(critical[0]["attempts"], "10");
    }

    #[tokio::test]
    async fn failed_end_of_run_flush_logs_counters() {
        let events = CapturedEvents::default();
        let _guard = events.install();

        let endpoint = Arc::new(FakeEndpoint::new());
        let store = Arc::new(RecordingStore {
            unreachable_first: 1,
            ..Default::default()
        });
        let mut dec = decoder(endpoint, store.clone());

        let err = dec.run(&vins(120)).await.unwrap_err();

        assert!(matches!(err, PipelineError::Store(ref e) if e.is_connection()));
        // no failure drain on the normal path
        assert_eq!(*store.upserts.lock().unwrap(), vec![120]);
        let failed = events.with_field("message", "end-of-run flush failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["chunks_submitted"], "3");
        assert_eq!(failed[0]["vins_submitted"], "120");
        assert_eq!(failed[0]["records_decoded"], "120");
        assert_eq!(failed[0]["buffered"], "120");
    }

    #[tokio::test]
    async fn normal_path_flushes_exactly_once_at_end() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let store = Arc::new(RecordingStore::default());
        let mut dec = decoder(endpoint, store.clone());

        dec.run(&vins(2)).await.unwrap();
        assert_eq!(*store.upserts.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn cancellation_stops_between_chunks_and_drains() {
        let token = CancellationToken::new();
        let endpoint = Arc::new(FakeEndpoint {
            cancel_after_first: Some(token.clone()),
            ..FakeEndpoint::new()
        });
        let store = Arc::new(RecordingStore::default());
        let mut dec = decoder(endpoint.clone(), store.clone()).with_cancellation(token);

        let summary = dec.run(&vins(200)).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.chunks_submitted, 1);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*store.upserts.lock().unwrap(), vec![50]);
    }

    #[tokio::test]
    async fn empty_input_does_nothing() {
        let endpoint = Arc::new(FakeEndpoint::new());
        let store = Arc::new(RecordingStore::default());
        let mut dec = decoder(endpoint.clone(), store.clone());

        let summary = dec.run(&[]).await.unwrap();
        assert_eq!(summary, RunSummary::default());
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
        assert!(store.upserts.lock().unwrap().is_empty());
    }
}
