//! Configuration for modelgate.
//!
//! Four YAML inputs, loaded once at startup and on explicit refresh:
//! `config.yaml` (global), `providers/*.yaml` (one provider each),
//! `routes.yaml`, and `models.yaml` (per-model scoring overrides).
//! Missing files fall back to defaults; a malformed file is an error.

use crate::error::NormalizedError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level global configuration (`config.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub routing: RoutingConfig,
    pub scheduling: SchedulingConfig,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
    pub providers: ProvidersConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// On a registry miss, allow exactly one cooldown-respecting rebuild.
    pub auto_refresh_on_miss: bool,
    pub refresh_cooldown_seconds: u64,
    /// Bounds submission-to-completion, queue wait included.
    pub request_timeout_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            auto_refresh_on_miss: true,
            refresh_cooldown_seconds: 30,
            request_timeout_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub enable_fallback: bool,
    /// Number of attempts beyond the primary.
    pub max_fallback_attempts: u32,
    /// Reserved. Explicit model ids never cascade; parsing accepts the flag
    /// but `validate` rejects `true`.
    pub explicit_model_fallback: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enable_fallback: true,
            max_fallback_attempts: 2,
            explicit_model_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub aging_bonus_per_second: f64,
    pub default_model_score: ModelScore,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            aging_bonus_per_second: 0.01,
            default_model_score: ModelScore::default(),
        }
    }
}

/// Per-model scoring attributes (`models.yaml` overrides, or the default
/// block in `config.yaml`). Penalties are static constants; the scheduler
/// reads them through this value so a measured source can replace it later.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelScore {
    pub base_priority: i64,
    pub load_penalty: i64,
    pub runtime_penalty: i64,
    pub always_run_last: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Ordered provider ids; earlier wins a duplicate model id. Empty means
    /// duplicates fail the registry build.
    pub duplicate_precedence: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub keep_last_n_requests_in_memory: usize,
    pub log_dir: PathBuf,
    pub keep_days: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            keep_last_n_requests_in_memory: 500,
            log_dir: PathBuf::from("logs"),
            keep_days: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub config_dir: PathBuf,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("providers"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus port; 0 disables the metrics listener.
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { port: 9090 }
    }
}

// ---------------------------------------------------------------------------
// Provider configuration (providers/*.yaml)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Ollama,
    OpenaiCompat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceGroup {
    LocalGpu,
    Cloud,
}

/// One addressable backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub provider_type: ProviderType,
    #[serde(default = "default_resource_group")]
    pub resource_group: ResourceGroup,
    pub api: ApiConfig,
    #[serde(default)]
    pub detect: DetectConfig,
    #[serde(default)]
    pub start: StartConfig,
    #[serde(default)]
    pub stop: StopConfig,
    #[serde(default)]
    pub policy: ProviderPolicy,
}

fn default_resource_group() -> ResourceGroup {
    ResourceGroup::LocalGpu
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default)]
    pub health: ProbeConfig,
    #[serde(default)]
    pub models: ModelListingConfig,
    /// Env var holding the bearer token for cloud providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub method: String,
    pub path: String,
    pub success_codes: Vec<u16>,
    pub timeout_seconds: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            path: "/".to_string(),
            success_codes: vec![200],
            timeout_seconds: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelListingConfig {
    /// Listing path; when unset the provider-type default applies
    /// (`/api/tags` for ollama, `/v1/models` for openai_compat).
    pub path: Option<String>,
    /// When present, used verbatim instead of querying the provider.
    pub declared_models: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectMethod {
    PathOrProbe,
    ProbeOnly,
    #[default]
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    pub method: DetectMethod,
    pub binary_name: Option<String>,
    pub probe_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartConfig {
    pub enabled: bool,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub startup_grace_seconds: u64,
}

impl Default for StartConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: None,
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            startup_grace_seconds: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMethod {
    #[default]
    TerminateProcess,
    KillProcess,
    HttpRequest,
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    pub method: StopMethod,
    pub http: Option<HttpStopConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpStopConfig {
    pub method: String,
    pub path: String,
}

impl Default for HttpStopConfig {
    fn default() -> Self {
        Self {
            method: "POST".to_string(),
            path: "/shutdown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderPolicy {
    pub keep_warm: bool,
    pub idle_shutdown_seconds: Option<u64>,
    pub max_start_attempts: u32,
    pub restart_on_failure: bool,
}

impl Default for ProviderPolicy {
    fn default() -> Self {
        Self {
            keep_warm: false,
            idle_shutdown_seconds: None,
            max_start_attempts: 2,
            restart_on_failure: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Routes and model overrides
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub primary_model: String,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default)]
    pub fallback_on: Vec<NormalizedError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RoutesFile {
    #[serde(default)]
    routes: HashMap<String, RouteConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ModelsFile {
    #[serde(default)]
    models: HashMap<String, ModelScore>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Everything loaded from disk, passed by reference after startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub app: AppConfig,
    pub providers: Vec<ProviderConfig>,
    pub routes: HashMap<String, RouteConfig>,
    pub model_scores: HashMap<String, ModelScore>,
}

impl GatewayConfig {
    /// Load `config.yaml`, `providers/*.yaml`, `routes.yaml`, and
    /// `models.yaml` relative to `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let app: AppConfig = read_yaml_or_default(&root.join("config.yaml"))?;

        let providers_dir = if app.providers.config_dir.is_absolute() {
            app.providers.config_dir.clone()
        } else {
            root.join(&app.providers.config_dir)
        };
        let providers = load_providers(&providers_dir)?;

        let routes_file: RoutesFile = read_yaml_or_default(&root.join("routes.yaml"))?;
        let models_file: ModelsFile = read_yaml_or_default(&root.join("models.yaml"))?;

        let config = Self {
            app,
            providers,
            routes: routes_file.routes,
            model_scores: models_file.models,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the rest of the system cannot honor.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.provider_id.as_str()) {
                anyhow::bail!("duplicate provider_id: {}", provider.provider_id);
            }
            if provider.start.enabled && provider.start.command.is_none() {
                anyhow::bail!(
                    "provider {} has start.enabled but no start.command",
                    provider.provider_id
                );
            }
            if provider.stop.method == StopMethod::HttpRequest && provider.stop.http.is_none() {
                tracing::warn!(
                    provider = %provider.provider_id,
                    "stop.method is http_request without stop.http; the default /shutdown will be used"
                );
            }
        }

        if self.app.routing.explicit_model_fallback {
            anyhow::bail!("routing.explicit_model_fallback is reserved and must be false");
        }

        for (name, route) in &self.routes {
            if route.primary_model.is_empty() {
                anyhow::bail!("route {name} has an empty primary_model");
            }
        }

        Ok(())
    }

    pub fn score_for(&self, model_id: &str) -> ModelScore {
        self.model_scores
            .get(model_id)
            .copied()
            .unwrap_or(self.app.scheduling.default_model_score)
    }
}

fn read_yaml_or_default<T>(path: &Path) -> Result<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

fn load_providers(dir: &Path) -> Result<Vec<ProviderConfig>> {
    let mut providers = Vec::new();
    if !dir.exists() {
        tracing::warn!(dir = %dir.display(), "providers directory not found");
        return Ok(providers);
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    entries.sort();

    for path in entries {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let provider: ProviderConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        providers.push(provider);
    }

    Ok(providers)
}
