use std::time::Duration;
use thiserror::Error;

/// Typed provider failure taxonomy.
///
/// Every outbound call is classified into one of these buckets; the rate
/// limiter retries only `Transient`, the orchestrator and refresh pipeline
/// decide continue-vs-stop from the step's `optional`/`critical` flags.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Rate limits, 5xx, timeouts, connection failures. Retryable.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// 404/405/501 — the provider does not support this capability.
    #[error("not implemented by provider: {0}")]
    NotImplemented(String),

    /// Any other non-2xx or malformed response. Never retried.
    #[error("provider error: {0}")]
    Fatal(String),

    /// Cooperative cancellation. Never retried, always propagated.
    #[error("operation cancelled")]
    Cancelled,

    /// A per-step deadline elapsed. Distinguishable from `Cancelled`.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    /// Only `Transient` failures are eligible for retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Stable tag used in SSE `error` payloads and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Transient(_) => "transient",
            ProviderError::NotImplemented(_) => "not_implemented",
            ProviderError::Fatal(_) => "fatal",
            ProviderError::Cancelled => "cancelled",
            ProviderError::Timeout(_) => "timeout",
        }
    }

    /// Classify an HTTP status code into the taxonomy.
    pub fn from_status(status: u16, context: &str) -> Option<Self> {
        match status {
            200..=299 => None,
            429 => Some(ProviderError::Transient(format!(
                "{context}: rate limited (429)"
            ))),
            404 | 405 | 501 => Some(ProviderError::NotImplemented(format!(
                "{context}: status {status}"
            ))),
            s if s >= 500 => Some(ProviderError::Transient(format!(
                "{context}: server error ({s})"
            ))),
            s => Some(ProviderError::Fatal(format!("{context}: status {s}"))),
        }
    }
}
