//! Mock inference backend for testing modelgate.
//!
//! Serves both wire shapes behind one listener:
//! - OpenAI-compatible: `/v1/models`, `/v1/chat/completions`
//! - Ollama: `/api/tags`, `/api/chat`
//!
//! Control endpoints let tests inject failures without restarting the
//! process. Prints `READY <port>` to stdout once listening.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mock-backend")]
#[command(about = "Mock inference backend for testing")]
struct Args {
    /// Port to listen on (0 for dynamic allocation)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Models this backend serves (repeatable)
    #[arg(short, long = "model", required = true)]
    models: Vec<String>,

    /// Artificial latency per chat completion (ms)
    #[arg(long, default_value = "10")]
    latency_ms: u64,
}

/// Failure injected into chat completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FailMode {
    #[default]
    None,
    /// 500 with an OOM body
    Oom,
    /// 400 with a context-length body
    ContextLength,
    /// Plain 500
    Error,
}

struct MockState {
    models: Vec<String>,
    latency: RwLock<Duration>,
    fail_mode: RwLock<FailMode>,
    request_count: RwLock<u64>,
    /// Order in which chat requests arrived, by model.
    served: RwLock<Vec<String>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_backend=debug")
        .init();

    let args = Args::parse();
    let state = Arc::new(MockState {
        models: args.models.clone(),
        latency: RwLock::new(Duration::from_millis(args.latency_ms)),
        fail_mode: RwLock::new(FailMode::None),
        request_count: RwLock::new(0),
        served: RwLock::new(Vec::new()),
    });

    let app = Router::new()
        .route("/", get(|| async { "mock backend is running" }))
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/api/tags", get(ollama_tags))
        .route("/api/chat", post(ollama_chat))
        .route("/shutdown", post(shutdown))
        .route("/stats", get(stats))
        .route("/control/fail", post(control_fail))
        .route("/control/latency", post(control_latency))
        .with_state(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    let actual_port = listener.local_addr()?.port();

    info!(models = ?args.models, port = actual_port, "Mock backend listening");

    // Signal readiness to the test harness.
    println!("READY {actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

async fn shutdown() -> impl IntoResponse {
    // Give the response a chance to flush before exiting.
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::process::exit(0);
    });
    StatusCode::OK
}

async fn list_models(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    let data: Vec<serde_json::Value> = state
        .models
        .iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "owned_by": "mock-backend"
            })
        })
        .collect();
    Json(serde_json::json!({"object": "list", "data": data}))
}

async fn ollama_tags(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    let models: Vec<serde_json::Value> = state
        .models
        .iter()
        .map(|name| serde_json::json!({"name": name}))
        .collect();
    Json(serde_json::json!({"models": models}))
}

#[derive(Deserialize)]
struct ChatRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    #[serde(default)]
    options: Option<serde_json::Value>,
}

async fn record_request(state: &MockState, model: &str) -> Result<u64, (StatusCode, String)> {
    match *state.fail_mode.read().await {
        FailMode::None => {}
        FailMode::Oom => {
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "CUDA out of memory: tried to allocate".to_string(),
            ));
        }
        FailMode::ContextLength => {
            return Err((
                StatusCode::BAD_REQUEST,
                "prompt exceeds maximum context length".to_string(),
            ));
        }
        FailMode::Error => {
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ));
        }
    }

    tokio::time::sleep(*state.latency.read().await).await;

    state.served.write().await.push(model.to_string());
    let mut count = state.request_count.write().await;
    *count += 1;
    Ok(*count)
}

async fn chat_completions(
    State(state): State<Arc<MockState>>,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if !state.models.contains(&request.model) {
        return Err((
            StatusCode::NOT_FOUND,
            format!("model {} not served here", request.model),
        ));
    }
    let count = record_request(&state, &request.model).await?;

    let last = request
        .messages
        .last()
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("");

    Ok(Json(serde_json::json!({
        "id": format!("chatcmpl-mock-{count}"),
        "object": "chat.completion",
        "created": 0,
        "model": request.model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": format!("mock #{count}: you said \"{last}\"")
            },
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
    })))
}

async fn ollama_chat(
    State(state): State<Arc<MockState>>,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if !state.models.contains(&request.model) {
        return Err((
            StatusCode::NOT_FOUND,
            format!("model '{}' not found", request.model),
        ));
    }
    let count = record_request(&state, &request.model).await?;

    // Echo options back so translation tests can assert on them.
    let options = request.options.unwrap_or(serde_json::Value::Null);

    Ok(Json(serde_json::json!({
        "model": request.model,
        "message": {
            "role": "assistant",
            "content": format!("ollama mock #{count} (options: {options})")
        },
        "done": true,
        "done_reason": "stop",
        "prompt_eval_count": 5,
        "eval_count": 9
    })))
}

async fn stats(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "models": state.models,
        "request_count": *state.request_count.read().await,
        "served": *state.served.read().await,
    }))
}

#[derive(Deserialize)]
struct ControlFail {
    mode: FailMode,
}

async fn control_fail(
    State(state): State<Arc<MockState>>,
    Json(body): Json<ControlFail>,
) -> impl IntoResponse {
    info!(mode = ?body.mode, "Setting fail mode");
    *state.fail_mode.write().await = body.mode;
    StatusCode::OK
}

#[derive(Deserialize)]
struct ControlLatency {
    latency_ms: u64,
}

async fn control_latency(
    State(state): State<Arc<MockState>>,
    Json(body): Json<ControlLatency>,
) -> impl IntoResponse {
    *state.latency.write().await = Duration::from_millis(body.latency_ms);
    StatusCode::OK
}
