//! Router: route-alias resolution and the fallback cascade.
//!
//! The router holds a handle to the scheduler (via [`ExecuteJob`]) and
//! re-submits fresh jobs under alternate model ids when a route permits.
//! Explicit model ids never cascade.

use crate::api::{AttemptRecord, ChatCompletionRequest, ChatCompletionResponse, Job};
use crate::config::{RouteConfig, RoutingConfig};
use crate::error::{GatewayError, NormalizedError};
use crate::registry::Registry;
use crate::scheduler::ExecuteJob;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const ROUTE_PREFIX: &str = "route:";

/// What a request's `model` string resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub primary_model: String,
    pub route_name: Option<String>,
    pub fallback_models: Vec<String>,
    pub fallback_on: Vec<NormalizedError>,
}

/// Terminal result of one gateway request, trace included.
#[derive(Debug)]
pub struct RoutedOutcome {
    pub result: Result<ChatCompletionResponse, GatewayError>,
    pub request_id: Uuid,
    pub route_name: Option<String>,
    pub final_model: String,
    pub final_provider: Option<String>,
    pub attempts: Vec<AttemptRecord>,
}

pub struct Router {
    registry: Arc<Registry>,
    executor: Arc<dyn ExecuteJob>,
    routes: HashMap<String, RouteConfig>,
    routing: RoutingConfig,
    auto_refresh_on_miss: bool,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        executor: Arc<dyn ExecuteJob>,
        routes: HashMap<String, RouteConfig>,
        routing: RoutingConfig,
        auto_refresh_on_miss: bool,
    ) -> Self {
        Self {
            registry,
            executor,
            routes,
            routing,
            auto_refresh_on_miss,
        }
    }

    pub fn route_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a request's `model` string. Route aliases expand to their
    /// primary plus fallbacks; anything else is an explicit model id with
    /// no cascade.
    pub fn resolve(&self, model_input: &str) -> Result<Resolution, GatewayError> {
        if let Some(route_name) = model_input.strip_prefix(ROUTE_PREFIX) {
            let route = self
                .routes
                .get(route_name)
                .ok_or_else(|| GatewayError::RouteNotFound(route_name.to_string()))?;
            return Ok(Resolution {
                primary_model: route.primary_model.clone(),
                route_name: Some(route_name.to_string()),
                fallback_models: route.fallback_models.clone(),
                fallback_on: route.fallback_on.clone(),
            });
        }
        Ok(Resolution {
            primary_model: model_input.to_string(),
            route_name: None,
            fallback_models: Vec::new(),
            fallback_on: Vec::new(),
        })
    }

    /// Run the cascade: primary first, then alternates while the route's
    /// `fallback_on` matches and the attempt budget allows.
    pub async fn dispatch(&self, request: ChatCompletionRequest) -> RoutedOutcome {
        let request_id = Uuid::new_v4();

        let resolution = match self.resolve(&request.model) {
            Ok(r) => r,
            Err(e) => {
                return RoutedOutcome {
                    final_model: request.model.clone(),
                    final_provider: None,
                    request_id,
                    route_name: None,
                    attempts: Vec::new(),
                    result: Err(e),
                };
            }
        };

        // Effective cascade: the primary plus at most max_fallback_attempts
        // alternates. Explicit model ids carry no alternates by resolution.
        let mut candidates = vec![resolution.primary_model.clone()];
        if self.routing.enable_fallback {
            let cap = self.routing.max_fallback_attempts as usize;
            candidates.extend(resolution.fallback_models.iter().take(cap).cloned());
        }

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last_error = GatewayError::ModelNotFound(resolution.primary_model.clone());
        let mut final_model = resolution.primary_model.clone();
        let mut final_provider: Option<String> = None;

        let total = candidates.len();
        for (index, model_id) in candidates.into_iter().enumerate() {
            let attempt_index = index as u32;
            final_model = model_id.clone();

            // Each attempt is a fresh job with its own id, created before
            // the registry check so skipped candidates are traceable too.
            let job = Job::new(
                request_id,
                model_id.clone(),
                resolution.route_name.clone(),
                attempt_index,
                request.clone(),
            );
            let job_id = job.job_id;

            if !self.model_known(&model_id).await {
                warn!(model = %model_id, "Model not in registry");
                attempts.push(AttemptRecord {
                    attempt: attempt_index,
                    job_id,
                    model: model_id.clone(),
                    provider: None,
                    status: "failed",
                    error: Some(NormalizedError::NotFound),
                    queue_wait_ms: 0,
                    runtime_ms: 0,
                });
                last_error = GatewayError::ModelNotFound(model_id);
                // A missing candidate is skipped; the cascade moves on.
                continue;
            }

            let outcome = self.executor.execute(job).await;
            final_provider = outcome.provider_id.clone();

            match outcome.result {
                Ok(response) => {
                    attempts.push(AttemptRecord {
                        attempt: attempt_index,
                        job_id,
                        model: model_id,
                        provider: outcome.provider_id,
                        status: "done",
                        error: None,
                        queue_wait_ms: outcome.queue_wait_ms,
                        runtime_ms: outcome.runtime_ms,
                    });
                    return RoutedOutcome {
                        result: Ok(response),
                        request_id,
                        route_name: resolution.route_name,
                        final_model,
                        final_provider,
                        attempts,
                    };
                }
                Err(error) => {
                    let normalized = error.normalized();
                    attempts.push(AttemptRecord {
                        attempt: attempt_index,
                        job_id,
                        model: model_id.clone(),
                        provider: outcome.provider_id,
                        status: "failed",
                        error: Some(normalized),
                        queue_wait_ms: outcome.queue_wait_ms,
                        runtime_ms: outcome.runtime_ms,
                    });
                    last_error = error;

                    let more_candidates = index + 1 < total;
                    if more_candidates && resolution.fallback_on.contains(&normalized) {
                        info!(
                            model = %model_id,
                            error = %normalized,
                            "Fallback triggered; trying next alternate"
                        );
                        continue;
                    }
                    break;
                }
            }
        }

        RoutedOutcome {
            result: Err(last_error),
            request_id,
            route_name: resolution.route_name,
            final_model,
            final_provider,
            attempts,
        }
    }

    /// Is the model in the current snapshot, allowing one
    /// cooldown-respecting refresh on a miss?
    async fn model_known(&self, model_id: &str) -> bool {
        if self
            .registry
            .snapshot()
            .await
            .provider_for(model_id)
            .is_some()
        {
            return true;
        }
        if self.auto_refresh_on_miss {
            return self.registry.refresh_on_miss(model_id).await;
        }
        false
    }
}
