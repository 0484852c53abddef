//! HTTP front end: the OpenAI-compatible surface plus admin diagnostics.

use crate::api::ChatCompletionRequest;
use crate::error::NormalizedError;
use crate::registry::Registry;
use crate::request_log::{RequestLog, RequestRecord};
use crate::router::{RoutedOutcome, Router, ROUTE_PREFIX};
use crate::scheduler::Scheduler;
use crate::supervisor::ProcessSupervisor;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub router: Arc<Router>,
    pub request_log: Arc<RequestLog>,
}

pub fn build_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/refresh", post(refresh))
        .route("/admin/providers", get(admin_providers))
        .route("/admin/registry", get(admin_registry))
        .route("/admin/logs", get(admin_logs))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (active_model, active_provider) = state.scheduler.active().await;
    let queues = state.scheduler.queue_depths().await;
    let providers = state.supervisor.statuses().await;
    let snapshot = state.registry.snapshot().await;

    Json(serde_json::json!({
        "status": "ok",
        "active_model": active_model,
        "active_provider": active_provider,
        "queues": queues,
        "providers": providers,
        "registry_built_at": snapshot.built_at,
        "registry_models": snapshot.models.len(),
    }))
}

async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot().await;
    let mut data: Vec<serde_json::Value> = snapshot
        .models
        .keys()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "created": 0,
                "owned_by": "modelgate"
            })
        })
        .collect();

    // Routes are selectable targets too, so clients can discover them.
    for name in state.router.route_names() {
        data.push(serde_json::json!({
            "id": format!("{ROUTE_PREFIX}{name}"),
            "object": "model",
            "created": 0,
            "owned_by": "modelgate-route"
        }));
    }

    Json(serde_json::json!({"object": "list", "data": data}))
}

async fn chat_completions(
    State(state): State<AppState>,
    body: Result<Json<serde_json::Value>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Ok(Json(raw)) = body else {
        return error_response(
            StatusCode::BAD_REQUEST,
            NormalizedError::BadRequest,
            "request body is not valid JSON",
            None,
        );
    };

    let request: ChatCompletionRequest = match serde_json::from_value(raw) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                NormalizedError::BadRequest,
                &format!("invalid chat completion request: {e}"),
                None,
            );
        }
    };

    if request.messages.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            NormalizedError::BadRequest,
            "messages must not be empty",
            None,
        );
    }

    // Streaming is refused before any job exists.
    if request.stream == Some(true) {
        return error_response(
            StatusCode::NOT_IMPLEMENTED,
            NormalizedError::BadRequest,
            "streaming is not supported",
            None,
        );
    }

    let requested_model = request.model.clone();
    let outcome = state.router.dispatch(request).await;
    log_outcome(&state, &requested_model, &outcome).await;

    match outcome.result {
        Ok(response) => Json(response).into_response(),
        Err(error) => {
            let normalized = error.normalized();
            let trace = outcome
                .route_name
                .is_some()
                .then(|| serde_json::to_value(&outcome.attempts).unwrap_or_default());
            error_response(
                status_for(normalized),
                normalized,
                &error.to_string(),
                trace,
            )
        }
    }
}

async fn log_outcome(state: &AppState, requested_model: &str, outcome: &RoutedOutcome) {
    let (status, normalized): (&'static str, _) = match outcome.result {
        Ok(_) => ("done", None),
        Err(ref e) => ("failed", Some(e.normalized())),
    };
    let record = RequestRecord::now(
        outcome.request_id,
        requested_model.to_string(),
        outcome.final_provider.clone(),
        outcome.route_name.clone(),
        status,
        normalized,
        outcome.attempts.clone(),
    );
    state.request_log.append(record).await;
}

async fn refresh(State(state): State<AppState>) -> impl IntoResponse {
    let summary = state.registry.refresh().await;
    info!(
        rebuilt = summary.rebuilt,
        models = summary.model_count,
        "Registry refresh requested"
    );
    Json(summary)
}

async fn admin_providers(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "providers": state.supervisor.statuses().await,
    }))
}

async fn admin_registry(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot().await;
    Json(serde_json::json!({
        "models": snapshot.models,
        "built_at": snapshot.built_at,
        "duplicates": state.registry.duplicates().await,
    }))
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default = "default_logs_limit")]
    limit: usize,
}

fn default_logs_limit() -> usize {
    100
}

async fn admin_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "logs": state.request_log.recent(query.limit).await,
    }))
}

/// HTTP status for a normalized error.
fn status_for(error: NormalizedError) -> StatusCode {
    match error {
        NormalizedError::NotFound => StatusCode::NOT_FOUND,
        NormalizedError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        NormalizedError::Unreachable | NormalizedError::Oom => StatusCode::SERVICE_UNAVAILABLE,
        NormalizedError::ContextLength => StatusCode::PAYLOAD_TOO_LARGE,
        NormalizedError::BadRequest => StatusCode::BAD_REQUEST,
        NormalizedError::Other => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// OpenAI-style error object, with the per-attempt trace when the request
/// used a route alias.
fn error_response(
    status: StatusCode,
    code: NormalizedError,
    message: &str,
    attempts: Option<serde_json::Value>,
) -> Response {
    let mut error = serde_json::json!({
        "message": message,
        "type": "gateway_error",
        "code": code,
    });
    if let Some(attempts) = attempts {
        error["attempts"] = attempts;
    }
    let body = serde_json::json!({ "error": error });

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response")
}
