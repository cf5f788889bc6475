//! vinbatch-http: `DecodeTransport` over HTTP for the vPIC batch endpoint.
//!
//! # Usage
//! ```rust,no_run
//! use vinbatch_core::DecoderConfig;
//! use vinbatch_http::VpicClient;
//!
//! # fn example() -> Result<(), vinbatch_core::TransportError> {
//! let client = VpicClient::from_config(&DecoderConfig::default())?;
//! # Ok(())
//! # }
//! ```

pub mod client;

pub use client::{HttpClientConfig, VpicClient};
