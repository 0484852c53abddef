//! Provider adapters.
//!
//! An adapter is the only component that touches a backend's HTTP surface.
//! Both variants sit behind [`ProviderAdapter`] and emit [`GatewayError`]s
//! classified by the pure functions at the bottom of this module.

mod ollama;
mod openai_compat;

pub use ollama::OllamaAdapter;
pub use openai_compat::OpenAiCompatAdapter;

use crate::api::{ChatCompletionRequest, ChatCompletionResponse};
use crate::config::{ProviderConfig, ProviderType};
use crate::error::GatewayError;
use async_trait::async_trait;
use std::time::Duration;

/// Forward one chat completion to a backend, translating both the request
/// and the response where the backend is not OpenAI-shaped.
///
/// Adapters are stateless beyond their HTTP client; the scheduler owns all
/// execution ordering.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn forward(
        &self,
        provider: &ProviderConfig,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GatewayError>;
}

/// The two adapter instances, dispatched by provider type.
pub struct AdapterSet {
    ollama: OllamaAdapter,
    openai_compat: OpenAiCompatAdapter,
}

impl AdapterSet {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            ollama: OllamaAdapter::new(request_timeout),
            openai_compat: OpenAiCompatAdapter::new(request_timeout),
        }
    }

    pub fn for_type(&self, provider_type: ProviderType) -> &dyn ProviderAdapter {
        match provider_type {
            ProviderType::Ollama => &self.ollama,
            ProviderType::OpenaiCompat => &self.openai_compat,
        }
    }
}

/// How much response body to keep in error messages.
const BODY_EXCERPT_LEN: usize = 200;

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= BODY_EXCERPT_LEN {
        trimmed.to_string()
    } else {
        let mut end = BODY_EXCERPT_LEN;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    }
}

/// Classify a non-2xx response. Pure and total: every (status, body) pair
/// maps to exactly one error.
pub(crate) fn classify_status(provider: &str, status: u16, body: &str) -> GatewayError {
    let lower = body.to_ascii_lowercase();

    let oom = lower.contains("out of memory")
        || lower.contains("cuda out of memory")
        || lower.contains("insufficient memory")
        || lower.contains("oom");
    if (500..600).contains(&status) && oom {
        return GatewayError::Oom {
            provider: provider.to_string(),
            detail: excerpt(body),
        };
    }

    let context = lower.contains("context length")
        || lower.contains("context window")
        || lower.contains("maximum context")
        || lower.contains("input length")
        || lower.contains("too many tokens")
        || lower.contains("context_length_exceeded");
    if (400..500).contains(&status) && context {
        return GatewayError::ContextLength {
            provider: provider.to_string(),
            detail: excerpt(body),
        };
    }

    GatewayError::Upstream(format!(
        "provider {provider} returned {status}: {}",
        excerpt(body)
    ))
}

/// Classify a transport-level failure. Pure and total.
pub(crate) fn classify_transport(provider: &str, err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        return GatewayError::ProviderTimeout {
            provider: provider.to_string(),
        };
    }
    if err.is_connect() {
        return GatewayError::Unreachable {
            provider: provider.to_string(),
            detail: err.to_string(),
        };
    }
    GatewayError::Upstream(format!("provider {provider} request failed: {err}"))
}
