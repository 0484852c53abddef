//! Ollama adapter: translates between the OpenAI chat shape and Ollama's
//! native `/api/chat`.

use super::{classify_status, classify_transport, ProviderAdapter};
use crate::api::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, Usage};
use crate::config::ProviderConfig;
use crate::error::GatewayError;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub struct OllamaAdapter {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl OllamaAdapter {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            request_timeout,
        }
    }
}

/// Build the Ollama request body. Sampling parameters go under `options`;
/// absent fields are omitted entirely. Streaming is always forced off.
fn to_ollama_request(request: &ChatCompletionRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = request
        .messages
        .iter()
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect();

    let mut options = serde_json::Map::new();
    if let Some(t) = request.temperature {
        options.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = request.top_p {
        options.insert("top_p".to_string(), json!(p));
    }
    if let Some(n) = request.max_tokens {
        options.insert("num_predict".to_string(), json!(n));
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "stream": false,
    });
    if !options.is_empty() {
        body["options"] = serde_json::Value::Object(options);
    }
    body
}

/// Translate an Ollama chat response into the OpenAI shape.
fn from_ollama_response(model: &str, body: &serde_json::Value) -> ChatCompletionResponse {
    let message = body.get("message");
    let content = message
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let finish_reason = body
        .get("done_reason")
        .and_then(|r| r.as_str())
        .unwrap_or("stop")
        .to_string();

    let prompt_tokens = body.get("prompt_eval_count").and_then(|v| v.as_u64());
    let completion_tokens = body.get("eval_count").and_then(|v| v.as_u64());
    let usage = match (prompt_tokens, completion_tokens) {
        (Some(p), Some(c)) => Some(Usage {
            prompt_tokens: p,
            completion_tokens: c,
            total_tokens: p + c,
        }),
        _ => None,
    };

    ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content,
                name: None,
            },
            finish_reason: Some(finish_reason),
        }],
        usage,
        extra: serde_json::Map::new(),
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    async fn forward(
        &self,
        provider: &ProviderConfig,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        let url = format!(
            "{}/api/chat",
            provider.api.base_url.trim_end_matches('/')
        );
        let body = to_ollama_request(request);

        debug!(provider = %provider.provider_id, model = %request.model, "Forwarding to ollama");

        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&body)
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

        let parsed: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            GatewayError::Upstream(format!(
                "provider {} returned invalid JSON: {e}",
                provider.provider_id
            ))
        })?;

        Ok(from_ollama_response(&request.model, &parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn request_translation_maps_options_and_forces_nonstreaming() {
        let req = request(serde_json::json!({
            "model": "llama3:8b",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ],
            "temperature": 0.2,
            "top_p": 0.9,
            "max_tokens": 128
        }));

        let body = to_ollama_request(&req);
        assert_eq!(body["model"], "llama3:8b");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["options"]["temperature"], 0.2);
        assert_eq!(body["options"]["top_p"], 0.9);
        assert_eq!(body["options"]["num_predict"], 128);
    }

    #[test]
    fn request_translation_omits_absent_options() {
        let req = request(serde_json::json!({
            "model": "llama3:8b",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let body = to_ollama_request(&req);
        assert!(body.get("options").is_none());
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn response_translation_builds_assistant_choice() {
        let ollama = serde_json::json!({
            "model": "llama3:8b",
            "message": {"role": "assistant", "content": "hello there"},
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 12,
            "eval_count": 7
        });
        let resp = from_ollama_response("llama3:8b", &ollama);
        assert_eq!(resp.object, "chat.completion");
        assert_eq!(resp.choices[0].message.role, "assistant");
        assert_eq!(resp.choices[0].message.content, "hello there");
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        let usage = resp.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 7);
        assert_eq!(usage.total_tokens, 19);
    }

    #[test]
    fn response_translation_defaults_finish_reason_and_omits_usage() {
        let ollama = serde_json::json!({
            "message": {"role": "assistant", "content": "partial"},
            "done": true
        });
        let resp = from_ollama_response("m", &ollama);
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(resp.usage.is_none());
    }

    #[test]
    fn response_translation_maps_done_reason() {
        let ollama = serde_json::json!({
            "message": {"role": "assistant", "content": "truncated"},
            "done": true,
            "done_reason": "length"
        });
        let resp = from_ollama_response("m", &ollama);
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("length"));
    }
}
