//! Shared error taxonomy.
//!
//! Every failure an adapter, the supervisor, or the scheduler can produce is
//! collapsed into one of the normalized kinds below before it reaches the
//! router, which consults a route's `fallback_on` set against the kind.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized failure classification carried on job traces and route
/// fallback triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizedError {
    /// Connection refused, DNS failure, socket error, or a start failure.
    Unreachable,
    /// The request exceeded `request_timeout_seconds`, in queue or in flight.
    Timeout,
    /// The backend reported an out-of-memory condition.
    Oom,
    /// The prompt exceeds the model's context window.
    ContextLength,
    /// Unknown model, route, or provider.
    NotFound,
    /// The request was rejected before submission.
    BadRequest,
    /// Everything else, including unclassified 4xx/5xx.
    Other,
}

impl NormalizedError {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizedError::Unreachable => "unreachable",
            NormalizedError::Timeout => "timeout",
            NormalizedError::Oom => "oom",
            NormalizedError::ContextLength => "context_length",
            NormalizedError::NotFound => "not_found",
            NormalizedError::BadRequest => "bad_request",
            NormalizedError::Other => "other",
        }
    }
}

impl fmt::Display for NormalizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while resolving, scheduling, or forwarding a request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("route not found: {0}")]
    RouteNotFound(String),

    #[error("provider {provider} unreachable: {detail}")]
    Unreachable { provider: String, detail: String },

    #[error("provider {provider} timed out")]
    ProviderTimeout { provider: String },

    #[error("request timed out")]
    RequestTimeout,

    #[error("provider {provider} out of memory: {detail}")]
    Oom { provider: String, detail: String },

    #[error("prompt exceeds context window on {provider}: {detail}")]
    ContextLength { provider: String, detail: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Upstream(String),
}

impl GatewayError {
    /// Collapse into the normalized taxonomy. Total: every variant maps to
    /// exactly one kind.
    pub fn normalized(&self) -> NormalizedError {
        match self {
            GatewayError::ModelNotFound(_) | GatewayError::RouteNotFound(_) => {
                NormalizedError::NotFound
            }
            GatewayError::Unreachable { .. } => NormalizedError::Unreachable,
            GatewayError::ProviderTimeout { .. } | GatewayError::RequestTimeout => {
                NormalizedError::Timeout
            }
            GatewayError::Oom { .. } => NormalizedError::Oom,
            GatewayError::ContextLength { .. } => NormalizedError::ContextLength,
            GatewayError::BadRequest(_) => NormalizedError::BadRequest,
            GatewayError::Upstream(_) => NormalizedError::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_serde_is_snake_case() {
        let json = serde_json::to_string(&NormalizedError::ContextLength).unwrap();
        assert_eq!(json, r#""context_length""#);

        let parsed: NormalizedError = serde_json::from_str(r#""unreachable""#).unwrap();
        assert_eq!(parsed, NormalizedError::Unreachable);
    }

    #[test]
    fn every_error_normalizes() {
        let cases = [
            (
                GatewayError::ModelNotFound("m".into()),
                NormalizedError::NotFound,
            ),
            (
                GatewayError::RouteNotFound("r".into()),
                NormalizedError::NotFound,
            ),
            (
                GatewayError::Unreachable {
                    provider: "p".into(),
                    detail: "refused".into(),
                },
                NormalizedError::Unreachable,
            ),
            (
                GatewayError::ProviderTimeout { provider: "p".into() },
                NormalizedError::Timeout,
            ),
            (GatewayError::RequestTimeout, NormalizedError::Timeout),
            (
                GatewayError::Oom {
                    provider: "p".into(),
                    detail: "".into(),
                },
                NormalizedError::Oom,
            ),
            (
                GatewayError::ContextLength {
                    provider: "p".into(),
                    detail: "".into(),
                },
                NormalizedError::ContextLength,
            ),
            (
                GatewayError::BadRequest("x".into()),
                NormalizedError::BadRequest,
            ),
            (GatewayError::Upstream("x".into()), NormalizedError::Other),
        ];
        for (err, expected) in cases {
            assert_eq!(err.normalized(), expected, "{err}");
        }
    }
}
