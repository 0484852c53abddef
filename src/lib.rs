//! # modelgate
//!
//! Single-host HTTP gateway presenting one OpenAI-compatible front door for
//! multiple local inference backends (Ollama, LM Studio, llama.cpp server,
//! and any other OpenAI-compatible service declared by configuration).
//!
//! A request names a model id or a `route:<name>` alias. The gateway
//! resolves the target, brings the right backend process up, serializes
//! execution so at most one local model is resident at a time, forwards the
//! request, translates the response to the OpenAI wire shape, and can fall
//! back to alternate models on classified failure.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       modelgate                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ HTTP front end (axum)                              │  │
//! │  │ - validates requests, refuses streaming            │  │
//! │  │ - /health /v1/models /refresh /admin/*             │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                          │                               │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Router                                             │  │
//! │  │ - route:<name> → primary + ordered fallbacks       │  │
//! │  │ - cascade on classified errors                     │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                          │                               │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Scheduler                                          │  │
//! │  │ - per-model FIFO queues, scoring + aging           │  │
//! │  │ - global execution lock (one forward at a time)    │  │
//! │  │ - provider switch: stop-before-start               │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │              │                         │                 │
//! │  ┌────────────────────┐   ┌─────────────────────────┐    │
//! │  │ Process Supervisor │   │ Adapters                │    │
//! │  │ detect/probe/      │   │ ollama ↔ OpenAI shape   │    │
//! │  │ ensure_up/down     │   │ openai_compat verbatim  │    │
//! │  └────────────────────┘   └─────────────────────────┘    │
//! │              ▼                         ▼                 │
//! │   [ollama serve]  [llama-server]  [cloud API]            │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod api;
mod config;
mod error;
mod http;
mod providers;
mod registry;
mod request_log;
mod router;
mod scheduler;
mod supervisor;
pub mod telemetry;

pub use api::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Job};
pub use config::{AppConfig, GatewayConfig, ModelScore, ProviderConfig, RouteConfig};
pub use error::{GatewayError, NormalizedError};
pub use registry::{Registry, RefreshSummary};
pub use router::Router;
pub use scheduler::{ExecuteJob, JobOutcome, Scheduler};
pub use supervisor::{ProcessSupervisor, ProviderStatus, SupervisorError};

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// The assembled gateway: the axum router plus handles the binary needs.
pub struct Gateway {
    pub app: axum::Router,
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<Registry>,
    pub supervisor: Arc<ProcessSupervisor>,
}

/// Build the complete gateway stack and run the initial registry build.
pub async fn build_app(config: GatewayConfig) -> Result<Gateway> {
    info!(
        providers = config.providers.len(),
        routes = config.routes.len(),
        "Building modelgate"
    );

    let supervisor = Arc::new(ProcessSupervisor::new(&config.providers));
    let registry = Arc::new(Registry::new(&config, Arc::clone(&supervisor)));

    let summary = registry.refresh().await;
    info!(
        models = summary.model_count,
        duplicates = summary.duplicates.len(),
        "Initial registry build"
    );

    let scheduler = Arc::new(Scheduler::new(
        &config,
        Arc::clone(&supervisor),
        Arc::clone(&registry),
    ));
    scheduler.spawn_loop();

    let router = Arc::new(Router::new(
        Arc::clone(&registry),
        Arc::clone(&scheduler) as Arc<dyn ExecuteJob>,
        config.routes.clone(),
        config.app.routing.clone(),
        config.app.runtime.auto_refresh_on_miss,
    ));

    let request_log = Arc::new(request_log::RequestLog::new(&config.app.logging));

    let app = http::build_router(http::AppState {
        registry: Arc::clone(&registry),
        scheduler: Arc::clone(&scheduler),
        supervisor: Arc::clone(&supervisor),
        router,
        request_log,
    });

    Ok(Gateway {
        app,
        scheduler,
        registry,
        supervisor,
    })
}
