//! OpenAI wire types and the internal job unit.

use crate::error::NormalizedError;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// An incoming chat-completion request.
///
/// Unknown fields are retained in `extra` so the pass-through adapter can
/// forward the body without loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One scheduled unit of work: a single attempt at a chat completion under a
/// resolved model id. Fallback re-submission creates a fresh job.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: Uuid,
    pub request_id: Uuid,
    /// The resolved model id this attempt targets. The request body's
    /// `model` field is patched to match before forwarding.
    pub model_id: String,
    pub route_name: Option<String>,
    pub attempt_index: u32,
    pub request: ChatCompletionRequest,
    pub created_at: Instant,
}

impl Job {
    pub fn new(
        request_id: Uuid,
        model_id: String,
        route_name: Option<String>,
        attempt_index: u32,
        mut request: ChatCompletionRequest,
    ) -> Self {
        request.model = model_id.clone();
        Self {
            job_id: Uuid::new_v4(),
            request_id,
            model_id,
            route_name,
            attempt_index,
            request,
            created_at: Instant::now(),
        }
    }
}

/// Trace entry for one attempt, recorded by the router and carried on the
/// request log and terminal error responses.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub job_id: Uuid,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NormalizedError>,
    pub queue_wait_ms: u64,
    pub runtime_ms: u64,
}
