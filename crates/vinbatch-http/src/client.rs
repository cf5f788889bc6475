//! HTTP client for `DecodeVINValuesBatch`, backed by `reqwest`.
//!
//! One call is one form POST. Retrying is the caller's job, so every failure
//! is classified with [`TransportError::is_retryable`] and returned as is.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use vinbatch_core::config::DecoderConfig;
use vinbatch_core::error::TransportError;
use vinbatch_core::transport::{batch_payload, DecodeTransport};
use vinbatch_core::types::{DecodeResult, Vin};

/// Longest slice of an error body kept in [`TransportError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Configuration for `VpicClient`.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            user_agent: format!("vinbatch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Envelope returned by the endpoint.
#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(rename = "Count", default)]
    count: u64,
    #[serde(rename = "Message", default)]
    message: Option<String>,
    #[serde(rename = "Results")]
    results: Vec<DecodeResult>,
}

/// Client for the vPIC batch decoding endpoint.
pub struct VpicClient {
    url: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl VpicClient {
    /// Create a client for the given endpoint URL.
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build reqwest client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            request_timeout: config.request_timeout,
        })
    }

    /// Create from the decoder section of the configuration.
    pub fn from_config(config: &DecoderConfig) -> Result<Self, TransportError> {
        Self::new(
            config.endpoint.clone(),
            HttpClientConfig {
                request_timeout: Duration::from_secs(config.request_timeout_secs),
                user_agent: config.user_agent.clone(),
            },
        )
    }

    fn map_send_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                ms: self.request_timeout.as_millis() as u64,
            }
        } else {
            TransportError::Http(e.to_string())
        }
    }
}

#[async_trait]
impl DecodeTransport for VpicClient {
    async fn decode_batch(&self, vins: &[Vin]) -> Result<Vec<DecodeResult>, TransportError> {
        if vins.is_empty() {
            return Ok(vec![]);
        }
        let data = batch_payload(vins);

        let resp = self
            .http
            .post(&self.url)
            .form(&[("format", "json"), ("data", data.as_str())])
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().await.unwrap_or_default();
            body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = resp.text().await.map_err(|e| self.map_send_error(e))?;
        let parsed: BatchResponse =
            serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))?;

        tracing::debug!(
            vins = vins.len(),
            count = parsed.count,
            message = parsed.message.as_deref().unwrap_or(""),
            "batch decoded"
        );
        Ok(parsed.results)
    }

    fn url(&self) -> &str {
        &self.url
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ENDPOINT: &str = "/api/vehicles/DecodeVINValuesBatch/";

    async fn client_for(server: &MockServer) -> VpicClient {
        VpicClient::new(format!("{}{ENDPOINT}", server.uri()), HttpClientConfig::default()).unwrap()
    }

    fn vins(list: &[&str]) -> Vec<Vin> {
        list.iter().copied().map(Vin::from).collect()
    }

    #[tokio::test]
    async fn posts_form_and_parses_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ENDPOINT))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("format=json"))
            .and(body_string_contains("data=1HGCM82633A004352%3B5YJ3E1EA7KF317000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Count": 2,
                "Message": "Results returned successfully",
                "SearchCriteria": null,
                "Results": [
                    { "VIN": "1HGCM82633A004352", "Make": "HONDA", "Model": "Accord", "ErrorCode": "0" },
                    { "VIN": "5YJ3E1EA7KF317000", "Make": "TESLA", "Model": "", "ErrorCode": "1",
                      "ErrorText": "1 - Check Digit (9th position) does not calculate properly" }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let results = client
            .decode_batch(&vins(&["1HGCM82633A004352", "5YJ3E1EA7KF317000"]))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].make, "HONDA");
        assert_eq!(results[0].model, "Accord");
        assert!(results[1].model.is_empty());
        assert!(results[1].error_text.starts_with("1 - Check Digit"));
    }

    #[tokio::test]
    async fn server_error_is_retryable_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .decode_batch(&vins(&["1HGCM82633A004352"]))
            .await
            .unwrap_err();

        match &err {
            TransportError::Status { status, body } => {
                assert_eq!(*status, 500);
                assert_eq!(body, "Internal Server Error");
            }
            other => panic!("expected Status, got {other:?}"),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .decode_batch(&vins(&["1HGCM82633A004352"]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "Results": [] }))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = VpicClient::new(
            format!("{}{ENDPOINT}", server.uri()),
            HttpClientConfig {
                request_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .unwrap();
        let err = client.decode_batch(&vins(&["A"])).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { ms: 50 }));
    }

    #[tokio::test]
    async fn empty_chunk_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let results = client_for(&server).await.decode_batch(&[]).await.unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn error_body_truncation_respects_utf8() {
        let s = "é".repeat(400);
        let cut = floor_char_boundary(&s, MAX_ERROR_BODY);
        assert!(cut <= MAX_ERROR_BODY);
        assert!(s.is_char_boundary(cut));
        assert_eq!(floor_char_boundary("short", MAX_ERROR_BODY), 5);
    }
}
