// ============================================================================
// UPSTREAM TRANSPORT
// ============================================================================
// The only code that performs I/O against the telemetry API. Everything above
// it talks to `TelemetryTransport`, so tests can script responses.
// ============================================================================

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::config::UpstreamConfig;
use crate::error::{ConfigError, IngestResult};
use crate::{API_KEY_HEADER, INGEST_NAME, INGEST_VERSION};

/// GraphQL request body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestEnvelope {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<JsonValue>,
}

/// Raw upstream response; interpretation belongs to the executor
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure before any status line was received
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    /// POST one request envelope to the upstream
    async fn post(
        &self,
        envelope: &RequestEnvelope,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;
}

// ----------------------------------------------------------------------------
// HTTP Transport
// ----------------------------------------------------------------------------

/// `reqwest` transport against the GraphQL endpoint
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(config: &UpstreamConfig) -> IngestResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::missing_field("upstream.api_key"))?;

        let client = Client::builder()
            .user_agent(format!("{}/{}", INGEST_NAME, INGEST_VERSION))
            .timeout(config.request_timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| ConfigError::invalid_value("upstream", format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl TelemetryTransport for HttpTransport {
    async fn post(
        &self,
        envelope: &RequestEnvelope,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(envelope)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| parse_retry_after(value, Utc::now()));
        let body = response.text().await.map_err(classify_reqwest_error)?;

        Ok(TransportResponse {
            status,
            retry_after,
            body,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

/// `Retry-After` is either delta-seconds or an HTTP date
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = value.parse::<f64>() {
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        // Absurdly large hints saturate; callers cap them anyway.
        return Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

// ----------------------------------------------------------------------------
// Scripted Transport (tests)
// ----------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_retry_after_seconds() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 7 ", now), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("1.5", now), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("soon", now), None);
        assert_eq!(parse_retry_after("-3", now), None);
        assert_eq!(parse_retry_after("NaN", now), None);
        assert_eq!(parse_retry_after("1e30", now), Some(Duration::MAX));
        assert_eq!(parse_retry_after("99999999999999999999", now), Some(Duration::MAX));
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:20:00 GMT", now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = RequestEnvelope {
            query: "{ actor { user { name } } }".into(),
            variables: None,
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({ "query": "{ actor { user { name } } }" })
        );

        let envelope = RequestEnvelope {
            query: "query($c: String) { x }".into(),
            variables: Some(json!({ "c": "abc" })),
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({ "query": "query($c: String) { x }", "variables": { "c": "abc" } })
        );
    }

    #[test]
    fn test_http_transport_requires_key() {
        let config = UpstreamConfig::default();
        assert!(HttpTransport::new(&config).is_err());

        let config = UpstreamConfig {
            api_key: Some("NRAK-test".into()),
            ..UpstreamConfig::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert!(!format!("{:?}", transport).contains("NRAK-test"));
    }
}
