//! The `DecodeTransport` trait: one round trip to the batch decoding endpoint.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::types::{DecodeResult, Vin};

/// Maximum number of VINs the endpoint accepts in one request.
pub const MAX_BATCH_SIZE: usize = 50;

/// A single-shot client for the batch decoding endpoint.
///
/// Implementations do not retry; the caller wraps calls in a
/// [`RetryPolicy`](crate::retry::RetryPolicy).
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn DecodeTransport>`.
#[async_trait]
pub trait DecodeTransport: Send + Sync + 'static {
    /// Submit up to [`MAX_BATCH_SIZE`] VINs and return the endpoint's result list.
    async fn decode_batch(&self, vins: &[Vin]) -> Result<Vec<DecodeResult>, TransportError>;

    /// The endpoint URL, for logging.
    fn url(&self) -> &str;
}

/// Build the `data` form field: VINs joined with `;` in submission order.
pub fn batch_payload(vins: &[Vin]) -> String {
    vins.iter().map(Vin::as_str).collect::<Vec<_>>().join(";")
}
