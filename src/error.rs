//! Typed errors shared across the pipeline.
//!
//! Errors are classified where they originate so callers can tell
//! "retry later" from "fix the input" from "nothing to do" without
//! inspecting message text:
//!
//! | Type | Raised by | Meaning |
//! |------|-----------|---------|
//! | [`ProviderError`] | HTTP adapters | rate limited, timed out, or any other upstream failure |
//! | [`EmbeddingError`] | [`EmbeddingClient`](crate::embedding::EmbeddingClient) | retries exhausted or a malformed vector |
//! | [`PipelineError`] | search, mining, drafts | the user-facing taxonomy |

use thiserror::Error;

/// Failure of a single call to an embedding or completion provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider rate limited: {0}")]
    RateLimited(String),
    #[error("provider request timed out: {0}")]
    Timeout(String),
    #[error("provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Rate limits and timeouts are worth another attempt; nothing else is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Timeout(_))
    }

    /// Classify a `reqwest` transport error.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Timeout(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let msg = format!("{}: {}", status, body);
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Self::RateLimited(msg)
        } else if status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::GATEWAY_TIMEOUT
            || status == reqwest::StatusCode::BAD_GATEWAY
            || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        {
            Self::Timeout(msg)
        } else {
            Self::Other(msg)
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("embedding has {actual} dimensions, expected {expected}")]
    InvalidShape { expected: usize, actual: usize },
    #[error("embedding contains a non-finite value at index {index}")]
    NonFinite { index: usize },
    #[error("cannot embed empty text")]
    EmptyInput,
}

/// User-facing error taxonomy for search, mining, and draft operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("could not parse model output: {0}")]
    ContractViolation(String),
    #[error("nothing to mine: no unprocessed questions in the window")]
    NothingToMine,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    /// Short machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::InvalidData(_) => "bad_request",
            Self::ContractViolation(_) => "contract_violation",
            Self::NothingToMine => "nothing_to_mine",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "internal",
        }
    }
}

impl From<EmbeddingError> for PipelineError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::Provider(e) => Self::ServiceUnavailable(e.to_string()),
            other => Self::InvalidData(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ProviderError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(
            ProviderError::from_status(reqwest::StatusCode::GATEWAY_TIMEOUT, ""),
            ProviderError::Timeout(_)
        ));
        assert!(matches!(
            ProviderError::from_status(reqwest::StatusCode::BAD_REQUEST, "bad input"),
            ProviderError::Other(_)
        ));
    }

    #[test]
    fn test_only_rate_limit_and_timeout_retry() {
        assert!(ProviderError::RateLimited("x".into()).is_retryable());
        assert!(ProviderError::Timeout("x".into()).is_retryable());
        assert!(!ProviderError::Other("x".into()).is_retryable());
    }

    #[test]
    fn test_embedding_error_maps_to_taxonomy() {
        let upstream: PipelineError =
            EmbeddingError::Provider(ProviderError::Timeout("slow".into())).into();
        assert_eq!(upstream.code(), "service_unavailable");

        let shape: PipelineError = EmbeddingError::InvalidShape {
            expected: 3,
            actual: 2,
        }
        .into();
        assert_eq!(shape.code(), "bad_request");
    }
}
