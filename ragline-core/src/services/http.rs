//! Shared HTTP plumbing for the network-backed providers.

use crate::error::{RagError, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the client used by one pooled connection.
pub(crate) fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Map an HTTP status code to the appropriate [`RagError`].
///
/// Server errors and rate limiting are transient; every other non-success
/// status means the request itself was rejected.
pub(crate) fn map_http_error(service: &str, status: reqwest::StatusCode, body: &str) -> RagError {
    match status.as_u16() {
        429 => RagError::upstream(service, format!("Rate limited: {body}")),
        408 => RagError::upstream(service, "Request timed out"),
        status if status >= 500 => {
            RagError::upstream(service, format!("Server error ({status}): {body}"))
        }
        401 | 403 => {
            debug!(service, body = %body, "Authentication failed");
            RagError::invalid_response(service, format!("Authentication failed ({status})"))
        }
        _ => RagError::invalid_response(service, format!("HTTP {status}: {body}")),
    }
}

/// Map a transport failure. Connection failures and timeouts are transient.
pub(crate) fn map_transport_error(service: &str, err: reqwest::Error) -> RagError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RagError::upstream(service, format!("Request failed: {err}"))
    } else {
        RagError::invalid_response(service, format!("Request failed: {err}"))
    }
}

/// POST a JSON body and return the parsed JSON response.
pub(crate) async fn post_json(
    client: &reqwest::Client,
    service: &str,
    url: &str,
    bearer: Option<&str>,
    body: &Value,
) -> Result<Value> {
    let mut request = client.post(url).json(body);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| map_transport_error(service, e))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| map_transport_error(service, e))?;

    if !status.is_success() {
        return Err(map_http_error(service, status, &text));
    }

    serde_json::from_str(&text)
        .map_err(|e| RagError::invalid_response(service, format!("Invalid JSON: {e}")))
}

/// GET `url` and report whether it answered with a success status.
pub(crate) async fn probe(client: &reqwest::Client, url: &str, bearer: Option<&str>) -> bool {
    let mut request = client.get(url).timeout(PROBE_TIMEOUT);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }
    match request.send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!(url, error = %e, "Health probe failed");
            false
        }
    }
}

/// Parse a JSON array of numbers into an embedding vector.
pub(crate) fn parse_vector(service: &str, value: &Value) -> Result<Vec<f32>> {
    let items = value
        .as_array()
        .ok_or_else(|| RagError::invalid_response(service, "Missing embedding array"))?;
    items
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| RagError::invalid_response(service, "Non-numeric embedding value"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_http_error_mapping_429_is_retryable() {
        let err = map_http_error("llm", reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_http_error_mapping_500() {
        let err = map_http_error(
            "embedder",
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "boom",
        );
        match err {
            RagError::UpstreamUnavailable { message, .. } => assert!(message.contains("500")),
            other => panic!("Expected UpstreamUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_http_error_mapping_400_is_permanent() {
        let err = map_http_error("llm", reqwest::StatusCode::BAD_REQUEST, "bad");
        assert!(matches!(err, RagError::InvalidResponse { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_parse_vector() {
        assert_eq!(
            parse_vector("embedder", &json!([0.5, 1, -2.0])).unwrap(),
            vec![0.5, 1.0, -2.0]
        );
        assert!(parse_vector("embedder", &json!("nope")).is_err());
        assert!(parse_vector("embedder", &json!([1.0, "x"])).is_err());
    }
}
