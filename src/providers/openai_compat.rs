//! Pass-through adapter for OpenAI-compatible backends (LM Studio,
//! llama.cpp server, Faster-Whisper wrappers, cloud APIs).

use super::{classify_status, classify_transport, ProviderAdapter};
use crate::api::{ChatCompletionRequest, ChatCompletionResponse};
use crate::config::{ProviderConfig, ResourceGroup};
use crate::error::GatewayError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub struct OpenAiCompatAdapter {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl OpenAiCompatAdapter {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            request_timeout,
        }
    }
}

/// Resolve the bearer token for a provider, if one is configured.
///
/// A cloud provider with a configured key env var that is unset fails
/// immediately; local providers simply go unauthenticated.
fn resolve_api_key(provider: &ProviderConfig) -> Result<Option<String>, GatewayError> {
    let Some(ref env_name) = provider.api.api_key_env else {
        return Ok(None);
    };
    match std::env::var(env_name) {
        Ok(key) if !key.is_empty() => Ok(Some(key)),
        _ if provider.resource_group == ResourceGroup::Cloud => Err(GatewayError::BadRequest(
            format!(
                "provider {} requires credentials: environment variable {} is not set",
                provider.provider_id, env_name
            ),
        )),
        _ => Ok(None),
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    async fn forward(
        &self,
        provider: &ProviderConfig,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        let api_key = resolve_api_key(provider)?;

        let url = format!(
            "{}/v1/chat/completions",
            provider.api.base_url.trim_end_matches('/')
        );

        debug!(provider = %provider.provider_id, model = %request.model, "Forwarding to openai_compat");

        let mut builder = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(request);
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport(&provider.provider_id, &e))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(&provider.provider_id, &e))?;

        if !(200..300).contains(&status) {
            return Err(classify_status(&provider.provider_id, status, &text));
        }

        serde_json::from_str(&text).map_err(|e| {
            GatewayError::Upstream(format!(
                "provider {} returned invalid JSON: {e}",
                provider.provider_id
            ))
        })
    }
}
