// ============================================================================
// QUERY EXECUTOR
// ============================================================================
// Issues one query at a time through the transport:
// - Wraps NRQL in the GraphQL envelope
// - Asks admission before every attempt, reports every outcome back
// - Classifies responses and retries the transient ones
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::admission::AdmissionController;
use crate::config::RetryConfig;
use crate::error::{FailureKind, QueryFailure};
use crate::transport::{RequestEnvelope, TelemetryTransport, TransportResponse};
use crate::types::{data_point_from_json, DataPoint};

/// Markers of upstream throttling carried inside a 2xx GraphQL error
const THROTTLE_MARKERS: [&str; 2] = ["TOO_MANY_REQUESTS", "NRDB:1106924"];

const NRQL_DOCUMENT: &str = "query($accountId: Int!, $nrql: Nrql!) { actor { account(id: $accountId) { nrql(query: $nrql) { results } } } }";

/// Result of one query after the retry policy is done with it
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Success(Vec<DataPoint>),
    Failure(QueryFailure),
}

impl QueryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, QueryOutcome::Success(_))
    }

    pub fn into_result(self) -> Result<Vec<DataPoint>, QueryFailure> {
        match self {
            QueryOutcome::Success(rows) => Ok(rows),
            QueryOutcome::Failure(failure) => Err(failure),
        }
    }
}

pub struct QueryExecutor {
    transport: Arc<dyn TelemetryTransport>,
    admission: Arc<AdmissionController>,
    retry: RetryConfig,
    account_id: u64,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("retry", &self.retry)
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

impl QueryExecutor {
    pub fn new(
        transport: Arc<dyn TelemetryTransport>,
        admission: Arc<AdmissionController>,
        retry: RetryConfig,
        account_id: u64,
    ) -> Self {
        Self {
            transport,
            admission,
            retry,
            account_id,
        }
    }

    pub fn account_id(&self) -> u64 {
        self.account_id
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Run one NRQL query and return its result rows
    pub async fn execute(&self, nrql: &str, timeout: Duration) -> QueryOutcome {
        let envelope = RequestEnvelope {
            query: NRQL_DOCUMENT.to_string(),
            variables: Some(json!({ "accountId": self.account_id, "nrql": nrql })),
        };
        match self.run(&envelope, timeout, nrql_rows).await {
            Ok(rows) => QueryOutcome::Success(rows),
            Err(failure) => QueryOutcome::Failure(failure),
        }
    }

    /// Run a raw GraphQL document under the same policy; returns `data`
    pub async fn execute_graphql(
        &self,
        document: &str,
        variables: Option<JsonValue>,
        timeout: Duration,
    ) -> Result<JsonValue, QueryFailure> {
        let envelope = RequestEnvelope {
            query: document.to_string(),
            variables,
        };
        self.run(&envelope, timeout, Ok).await
    }

    async fn run<T, F>(&self, envelope: &RequestEnvelope, timeout: Duration, extract: F) -> Result<T, QueryFailure>
    where
        F: Fn(JsonValue) -> Result<T, QueryFailure>,
    {
        let mut attempts = 0u32;
        loop {
            if let Err(open) = self.admission.await_admission().await {
                return Err(QueryFailure::from(open).with_attempts(attempts));
            }
            attempts += 1;

            let result = match tokio::time::timeout(timeout, self.transport.post(envelope, timeout)).await {
                Err(_) => Err(QueryFailure::new(FailureKind::Transport, "request timed out")),
                Ok(Err(err)) => Err(QueryFailure::new(FailureKind::Transport, err.to_string())),
                Ok(Ok(response)) => classify_response(&response).and_then(&extract),
            };

            let failure = match result {
                Ok(value) => {
                    self.admission.record_success();
                    return Ok(value);
                }
                Err(failure) => failure.with_attempts(attempts),
            };

            self.admission.record_failure(failure.kind.is_rate_limit());

            if !failure.kind.is_retryable() || attempts >= self.retry.max_attempts {
                warn!(
                    target: "cerebro::executor",
                    kind = %failure.kind,
                    status = ?failure.status,
                    attempts,
                    error = %failure.message,
                    "Query failed"
                );
                return Err(failure);
            }

            // The next admission adds its own adaptive delay; both come out of one budget.
            let backoff = backoff_delay(&self.retry, failure.kind, attempts, failure.retry_after);
            let delay = backoff.saturating_sub(self.admission.upcoming_delay_ceiling());
            debug!(
                target: "cerebro::executor",
                kind = %failure.kind,
                attempt = attempts,
                backoff_ms = backoff.as_millis() as u64,
                delay_ms = delay.as_millis() as u64,
                "Retrying query"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Delay before the next attempt, after `failed_attempts` failures so far.
pub fn backoff_delay(
    retry: &RetryConfig,
    kind: FailureKind,
    failed_attempts: u32,
    retry_after: Option<Duration>,
) -> Duration {
    let factor = 1u32 << failed_attempts.saturating_sub(1).min(16);
    match kind {
        FailureKind::RateLimited => retry_after
            .unwrap_or_else(|| retry.rate_limit_base.saturating_mul(factor))
            .min(retry.rate_limit_cap),
        FailureKind::ServerError => retry
            .server_error_base
            .saturating_mul(factor)
            .min(retry.server_error_cap),
        _ => retry
            .transport_base
            .saturating_mul(factor)
            .min(retry.server_error_cap),
    }
}

/// Classify one raw response. Returns the GraphQL `data` on success.
pub fn classify_response(response: &TransportResponse) -> Result<JsonValue, QueryFailure> {
    let status = response.status;
    if !response.is_success() {
        let failure = match status {
            429 => QueryFailure::new(FailureKind::RateLimited, "HTTP 429 Too Many Requests")
                .with_retry_after(response.retry_after),
            401 | 403 => QueryFailure::new(
                FailureKind::Authentication,
                format!("HTTP {} rejected credentials", status),
            ),
            500..=599 => QueryFailure::new(FailureKind::ServerError, format!("HTTP {}", status))
                .with_retry_after(response.retry_after),
            _ => QueryFailure::new(FailureKind::UnexpectedStatus, format!("HTTP {}", status)),
        };
        return Err(failure.with_status(status));
    }

    let mut body: JsonValue = serde_json::from_str(&response.body).map_err(|e| {
        QueryFailure::new(FailureKind::Decode, format!("response is not JSON: {}", e)).with_status(status)
    })?;

    if let Some(errors) = body.get("errors").and_then(JsonValue::as_array) {
        if !errors.is_empty() {
            let rendered = errors.iter().map(JsonValue::to_string).collect::<Vec<_>>();
            let throttled = rendered
                .iter()
                .any(|e| THROTTLE_MARKERS.iter().any(|marker| e.contains(marker)));
            let message = errors
                .iter()
                .map(|e| e.get("message").and_then(JsonValue::as_str).unwrap_or("unknown error"))
                .collect::<Vec<_>>()
                .join("; ");
            let kind = if throttled {
                FailureKind::RateLimited
            } else {
                FailureKind::QueryRejected
            };
            return Err(QueryFailure::new(kind, message)
                .with_status(status)
                .with_retry_after(response.retry_after));
        }
    }

    match body.get_mut("data").map(JsonValue::take) {
        Some(data) if !data.is_null() => Ok(data),
        _ => Err(QueryFailure::new(FailureKind::Decode, "response carries no data").with_status(status)),
    }
}

/// Pull `actor.account.nrql.results` out of a GraphQL `data` payload
fn nrql_rows(mut data: JsonValue) -> Result<Vec<DataPoint>, QueryFailure> {
    match data.pointer_mut("/actor/account/nrql/results").map(JsonValue::take) {
        Some(JsonValue::Array(rows)) => Ok(rows.into_iter().map(data_point_from_json).collect()),
        _ => Err(QueryFailure::new(FailureKind::Decode, "response has no NRQL results")),
    }
}
