//! Registry: the model→provider mapping, rebuilt on demand.
//!
//! Snapshots are immutable once published; a rebuild swaps the `Arc` behind
//! an `RwLock` so readers never block on a rebuild. Rebuilds themselves are
//! serialized and obey a cooldown.

use crate::config::{GatewayConfig, ProviderConfig, ProviderType};
use crate::supervisor::ProcessSupervisor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// A model id offered by more than one provider.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DuplicateModel {
    pub model: String,
    pub providers: Vec<String>,
}

/// Immutable mapping published by a successful build.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    /// model id → provider id. BTreeMap keeps listings deterministic.
    pub models: BTreeMap<String, String>,
    pub built_at: Option<DateTime<Utc>>,
}

impl RegistrySnapshot {
    pub fn provider_for(&self, model_id: &str) -> Option<&str> {
        self.models.get(model_id).map(String::as_str)
    }
}

/// Summary returned by `/refresh`.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub rebuilt: bool,
    pub provider_count: usize,
    pub model_count: usize,
    pub duplicates: Vec<DuplicateModel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub built_at: Option<DateTime<Utc>>,
}

pub struct Registry {
    supervisor: Arc<ProcessSupervisor>,
    providers: Vec<ProviderConfig>,
    precedence: Vec<String>,
    cooldown: Duration,
    client: reqwest::Client,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    /// Serializes rebuilds; also guards `last_refresh`.
    rebuild: Mutex<Option<Instant>>,
    /// Duplicates from the most recent build attempt, kept for diagnostics
    /// even when the build failed and the old snapshot stayed published.
    last_duplicates: Mutex<Vec<DuplicateModel>>,
}

impl Registry {
    pub fn new(config: &GatewayConfig, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            supervisor,
            providers: config.providers.clone(),
            precedence: config.app.registry.duplicate_precedence.clone(),
            cooldown: Duration::from_secs(config.app.runtime.refresh_cooldown_seconds),
            client: reqwest::Client::new(),
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
            rebuild: Mutex::new(None),
            last_duplicates: Mutex::new(Vec::new()),
        }
    }

    /// The current snapshot. Cheap; never blocks on a rebuild.
    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    pub async fn duplicates(&self) -> Vec<DuplicateModel> {
        self.last_duplicates.lock().await.clone()
    }

    /// Rebuild unless the last refresh is younger than the cooldown, in
    /// which case the current snapshot's summary is returned untouched.
    pub async fn refresh(&self) -> RefreshSummary {
        let mut last = self.rebuild.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < self.cooldown {
                let snapshot = self.snapshot().await;
                return self.summary(false, &snapshot).await;
            }
        }

        let result = self.build().await;
        *last = Some(Instant::now());

        match result {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self.snapshot.write().await = Arc::clone(&snapshot);
                *self.last_duplicates.lock().await = Vec::new();
                info!(models = snapshot.models.len(), "Registry rebuilt");
                self.summary(true, &snapshot).await
            }
            Err(duplicates) => {
                warn!(
                    conflicts = duplicates.len(),
                    "Registry build failed on duplicate models; previous snapshot kept"
                );
                *self.last_duplicates.lock().await = duplicates;
                let snapshot = self.snapshot().await;
                self.summary(false, &snapshot).await
            }
        }
    }

    /// One cooldown-respecting rebuild for a requested model that is absent.
    /// Returns true if the model is present afterwards.
    pub async fn refresh_on_miss(&self, model_id: &str) -> bool {
        self.refresh().await;
        self.snapshot().await.provider_for(model_id).is_some()
    }

    async fn summary(&self, rebuilt: bool, snapshot: &RegistrySnapshot) -> RefreshSummary {
        RefreshSummary {
            rebuilt,
            provider_count: self.providers.len(),
            model_count: snapshot.models.len(),
            duplicates: self.last_duplicates.lock().await.clone(),
            built_at: snapshot.built_at,
        }
    }

    /// Build a candidate snapshot. On unresolvable duplicates the report is
    /// returned as the error and nothing is published.
    async fn build(&self) -> Result<RegistrySnapshot, Vec<DuplicateModel>> {
        // (provider id, models) per available provider, in config order.
        let mut listings: Vec<(String, Vec<String>)> = Vec::new();

        for provider in &self.providers {
            let id = provider.provider_id.as_str();

            let detected = self.supervisor.detect(id).await.unwrap_or(false);
            if !detected && !provider.start.enabled {
                info!(provider = %id, "Provider not detected and not startable; skipping");
                continue;
            }

            let healthy = self.supervisor.probe(id).await.unwrap_or(false);

            let models = if let Some(ref declared) = provider.api.models.declared_models {
                declared.clone()
            } else if healthy {
                self.list_models(provider).await
            } else if provider.start.enabled {
                // Lazy start is the scheduler's job; with nothing declared
                // there is nothing to record for this provider yet.
                warn!(
                    provider = %id,
                    "Provider unhealthy and nothing declared; models unknown until started"
                );
                Vec::new()
            } else {
                info!(provider = %id, "Provider unavailable");
                continue;
            };

            listings.push((id.to_string(), models));
        }

        let mut by_model: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (provider_id, models) in &listings {
            for model in models {
                by_model
                    .entry(model.clone())
                    .or_default()
                    .push(provider_id.clone());
            }
        }

        let mut models = BTreeMap::new();
        let mut conflicts = Vec::new();
        for (model, mut providers) in by_model {
            if providers.len() == 1 {
                models.insert(model, providers.pop().expect("one provider"));
                continue;
            }
            match resolve_precedence(&self.precedence, &providers) {
                Some(winner) => {
                    info!(model = %model, provider = %winner, "Duplicate model resolved by precedence");
                    models.insert(model, winner);
                }
                None => conflicts.push(DuplicateModel {
                    model,
                    providers,
                }),
            }
        }

        if !conflicts.is_empty() {
            return Err(conflicts);
        }

        Ok(RegistrySnapshot {
            models,
            built_at: Some(Utc::now()),
        })
    }

    /// Query the provider-native listing endpoint and parse its shape.
    async fn list_models(&self, provider: &ProviderConfig) -> Vec<String> {
        let default_path = match provider.provider_type {
            ProviderType::Ollama => "/api/tags",
            ProviderType::OpenaiCompat => "/v1/models",
        };
        let path = provider
            .api
            .models
            .path
            .as_deref()
            .unwrap_or(default_path);
        let url = format!("{}{}", provider.api.base_url.trim_end_matches('/'), path);

        let response = match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(provider.api.health.timeout_seconds.max(2)))
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(provider = %provider.provider_id, status = %r.status(), "Model listing failed");
                return Vec::new();
            }
            Err(e) => {
                warn!(provider = %provider.provider_id, error = %e, "Model listing failed");
                return Vec::new();
            }
        };

        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(provider = %provider.provider_id, error = %e, "Model listing is not JSON");
                return Vec::new();
            }
        };

        parse_listing(provider.provider_type, &body)
    }

    /// Swap in a snapshot directly. Used by tests that fabricate mappings.
    #[cfg(test)]
    pub(crate) async fn publish(&self, snapshot: RegistrySnapshot) {
        *self.snapshot.write().await = Arc::new(snapshot);
    }
}

/// Earliest provider in the precedence list wins; None when any contender
/// is missing from the list.
fn resolve_precedence(precedence: &[String], providers: &[String]) -> Option<String> {
    let mut best: Option<(usize, &String)> = None;
    for provider in providers {
        let position = precedence.iter().position(|p| p == provider)?;
        match best {
            Some((current, _)) if current <= position => {}
            _ => best = Some((position, provider)),
        }
    }
    best.map(|(_, provider)| provider.clone())
}

/// Parse the provider-native model listing.
fn parse_listing(provider_type: ProviderType, body: &serde_json::Value) -> Vec<String> {
    match provider_type {
        ProviderType::Ollama => body
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        ProviderType::OpenaiCompat => body
            .get("data")
            .and_then(|d| d.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|i| i.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
    }
}
