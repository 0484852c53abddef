//! Process supervisor: reconciles each provider's desired state with its
//! observed state using the declared start/stop descriptors.
//!
//! Per provider the state machine is {down, starting, up, stopping};
//! transitions are driven only by the operations here, never by callers.
//! A per-provider mutex serializes lifecycle operations; child processes
//! are always reaped.

use crate::config::{DetectMethod, ProbeConfig, ProviderConfig, StopMethod};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Interval between health polls while waiting for a started process.
const START_POLL_INTERVAL: Duration = Duration::from_millis(300);
/// Bounded wait per stop stage before escalating to the next.
const STOP_STAGE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Down,
    Starting,
    Up,
    Stopping,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Down => "down",
            ProcessState::Starting => "starting",
            ProcessState::Up => "up",
            ProcessState::Stopping => "stopping",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("failed to start provider {provider}: {reason}")]
    StartFailed { provider: String, reason: String },
}

/// Mutable lifecycle state, guarded by the per-provider mutex.
struct ProviderRuntime {
    state: ProcessState,
    detected: bool,
    healthy: bool,
    /// True iff the gateway started the current process.
    owned: bool,
    child: Option<Child>,
    last_error: Option<String>,
    last_health_at: Option<DateTime<Utc>>,
    last_used_at: Option<Instant>,
}

impl Default for ProviderRuntime {
    fn default() -> Self {
        Self {
            state: ProcessState::Down,
            detected: false,
            healthy: false,
            owned: false,
            child: None,
            last_error: None,
            last_health_at: None,
            last_used_at: None,
        }
    }
}

struct ProviderHandle {
    config: ProviderConfig,
    runtime: Mutex<ProviderRuntime>,
}

/// Diagnostic snapshot of one provider, for `/health` and `/admin/providers`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub id: String,
    pub provider_type: crate::config::ProviderType,
    pub resource_group: crate::config::ResourceGroup,
    pub state: String,
    pub detected: bool,
    pub healthy: bool,
    pub owned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_at: Option<DateTime<Utc>>,
}

pub struct ProcessSupervisor {
    providers: DashMap<String, Arc<ProviderHandle>>,
    client: reqwest::Client,
}

impl ProcessSupervisor {
    pub fn new(configs: &[ProviderConfig]) -> Self {
        let providers = DashMap::new();
        for config in configs {
            providers.insert(
                config.provider_id.clone(),
                Arc::new(ProviderHandle {
                    config: config.clone(),
                    runtime: Mutex::new(ProviderRuntime::default()),
                }),
            );
        }
        Self {
            providers,
            client: reqwest::Client::new(),
        }
    }

    fn handle(&self, provider_id: &str) -> Result<Arc<ProviderHandle>, SupervisorError> {
        self.providers
            .get(provider_id)
            .map(|h| Arc::clone(&h))
            .ok_or_else(|| SupervisorError::UnknownProvider(provider_id.to_string()))
    }

    pub fn provider_config(&self, provider_id: &str) -> Option<ProviderConfig> {
        self.providers.get(provider_id).map(|h| h.config.clone())
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Issue the configured health request. Never starts anything.
    pub async fn probe(&self, provider_id: &str) -> Result<bool, SupervisorError> {
        let handle = self.handle(provider_id)?;
        let healthy = self
            .probe_http(&handle.config.api.base_url, &handle.config.api.health)
            .await;

        let mut runtime = handle.runtime.lock().await;
        runtime.healthy = healthy;
        runtime.last_health_at = Some(Utc::now());
        if healthy && runtime.state == ProcessState::Down {
            // An externally started process is up; reflect that.
            runtime.state = ProcessState::Up;
        }
        Ok(healthy)
    }

    async fn probe_http(&self, base_url: &str, probe: &ProbeConfig) -> bool {
        let url = format!(
            "{}{}",
            base_url.trim_end_matches('/'),
            probe.path
        );
        let builder = match probe.method.to_ascii_uppercase().as_str() {
            "HEAD" => self.client.head(&url),
            "POST" => self.client.post(&url),
            _ => self.client.get(&url),
        };
        match builder
            .timeout(Duration::from_secs(probe.timeout_seconds))
            .send()
            .await
        {
            Ok(response) => probe.success_codes.contains(&response.status().as_u16()),
            Err(_) => false,
        }
    }

    /// Check whether the provider is present on this host at all.
    pub async fn detect(&self, provider_id: &str) -> Result<bool, SupervisorError> {
        let handle = self.handle(provider_id)?;
        let detect = &handle.config.detect;

        let detected = match detect.method {
            DetectMethod::None => true,
            DetectMethod::ProbeOnly => self.detect_probe(&handle).await,
            DetectMethod::PathOrProbe => {
                let on_path = detect
                    .binary_name
                    .as_deref()
                    .map(binary_on_path)
                    .unwrap_or(false);
                on_path || self.detect_probe(&handle).await
            }
        };

        let mut runtime = handle.runtime.lock().await;
        runtime.detected = detected;
        Ok(detected)
    }

    async fn detect_probe(&self, handle: &ProviderHandle) -> bool {
        match handle.config.detect.probe_url {
            Some(ref url) => self.probe_http(url, &handle.config.api.health).await,
            None => {
                self.probe_http(&handle.config.api.base_url, &handle.config.api.health)
                    .await
            }
        }
    }

    /// Bring the provider up, launching its process when permitted.
    ///
    /// `attempt_budget` bounds launch attempts within this call; callers pass
    /// either the provider's configured `max_start_attempts` or whatever
    /// remains of a cross-job budget.
    pub async fn ensure_up(
        &self,
        provider_id: &str,
        attempt_budget: u32,
    ) -> Result<(), SupervisorError> {
        let handle = self.handle(provider_id)?;
        let config = &handle.config;
        let mut runtime = handle.runtime.lock().await;

        if self
            .probe_http(&config.api.base_url, &config.api.health)
            .await
        {
            runtime.healthy = true;
            runtime.state = ProcessState::Up;
            runtime.last_health_at = Some(Utc::now());
            return Ok(());
        }
        runtime.healthy = false;
        runtime.last_health_at = Some(Utc::now());

        if !config.start.enabled {
            let reason = "unhealthy and start is disabled".to_string();
            runtime.last_error = Some(reason.clone());
            return Err(SupervisorError::StartFailed {
                provider: provider_id.to_string(),
                reason,
            });
        }

        let Some(command) = config.start.command.as_deref() else {
            let reason = "start.enabled without start.command".to_string();
            runtime.last_error = Some(reason.clone());
            return Err(SupervisorError::StartFailed {
                provider: provider_id.to_string(),
                reason,
            });
        };
        let grace = Duration::from_secs(config.start.startup_grace_seconds);

        for attempt in 1..=attempt_budget.max(1) {
            info!(
                provider = %provider_id,
                attempt,
                command,
                "Starting provider process"
            );
            runtime.state = ProcessState::Starting;

            // Stale handle from a crashed run: reap before respawning.
            if let Some(mut old) = runtime.child.take() {
                let _ = old.start_kill();
                let _ = old.wait().await;
            }

            let child = match spawn_provider(provider_id, config) {
                Ok(child) => child,
                Err(e) => {
                    warn!(provider = %provider_id, error = %e, "Spawn failed");
                    runtime.last_error = Some(e.clone());
                    continue;
                }
            };
            runtime.child = Some(child);

            let deadline = Instant::now() + grace;
            loop {
                tokio::time::sleep(START_POLL_INTERVAL).await;

                if self
                    .probe_http(&config.api.base_url, &config.api.health)
                    .await
                {
                    info!(provider = %provider_id, attempt, "Provider is healthy");
                    runtime.healthy = true;
                    runtime.owned = true;
                    runtime.state = ProcessState::Up;
                    runtime.last_error = None;
                    runtime.last_health_at = Some(Utc::now());
                    return Ok(());
                }

                let exited = match runtime.child.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => Some(format!("process exited: {status}")),
                        Ok(None) => None,
                        Err(e) => Some(format!("failed to poll process: {e}")),
                    },
                    None => Some("process handle lost".to_string()),
                };
                if let Some(reason) = exited {
                    warn!(provider = %provider_id, attempt, %reason, "Startup attempt failed");
                    runtime.last_error = Some(reason);
                    runtime.child = None;
                    break;
                }

                if Instant::now() >= deadline {
                    warn!(
                        provider = %provider_id,
                        attempt,
                        grace_secs = config.start.startup_grace_seconds,
                        "Startup grace elapsed; terminating child"
                    );
                    if let Some(mut child) = runtime.child.take() {
                        kill_child(&mut child).await;
                    }
                    runtime.last_error = Some("startup grace elapsed".to_string());
                    break;
                }
            }
        }

        runtime.state = ProcessState::Down;
        let reason = runtime
            .last_error
            .clone()
            .unwrap_or_else(|| "start failed".to_string());
        Err(SupervisorError::StartFailed {
            provider: provider_id.to_string(),
            reason,
        })
    }

    /// Stop a gateway-owned provider. External processes are never touched.
    ///
    /// Always leaves the provider with `healthy=false, owned=false` and no
    /// process handle; escalates through the stop stages on bounded waits.
    pub async fn ensure_down(&self, provider_id: &str) -> Result<(), SupervisorError> {
        let handle = self.handle(provider_id)?;
        let config = &handle.config;
        let mut runtime = handle.runtime.lock().await;

        if !runtime.owned {
            return Ok(());
        }
        runtime.state = ProcessState::Stopping;
        info!(provider = %provider_id, method = ?config.stop.method, "Stopping provider");

        match config.stop.method {
            StopMethod::None => {
                // Disown: the process keeps running without a handle.
                if let Some(child) = runtime.child.take() {
                    drop(child);
                }
            }
            StopMethod::HttpRequest => {
                self.stop_via_http(provider_id, config).await;
                // Escalate if the backend is still answering health checks.
                if self
                    .probe_http(&config.api.base_url, &config.api.health)
                    .await
                {
                    warn!(provider = %provider_id, "HTTP stop did not take effect; escalating");
                    if let Some(mut child) = runtime.child.take() {
                        terminate_child(provider_id, &mut child).await;
                    }
                } else if let Some(mut child) = runtime.child.take() {
                    // Backend stopped serving; reap the exiting process.
                    if tokio::time::timeout(STOP_STAGE_TIMEOUT, child.wait())
                        .await
                        .is_err()
                    {
                        terminate_child(provider_id, &mut child).await;
                    }
                }
            }
            StopMethod::TerminateProcess => {
                if let Some(mut child) = runtime.child.take() {
                    terminate_child(provider_id, &mut child).await;
                }
            }
            StopMethod::KillProcess => {
                if let Some(mut child) = runtime.child.take() {
                    kill_child(&mut child).await;
                }
            }
        }

        runtime.child = None;
        runtime.owned = false;
        runtime.healthy = false;
        runtime.state = ProcessState::Down;
        info!(provider = %provider_id, "Provider stopped");
        Ok(())
    }

    async fn stop_via_http(&self, provider_id: &str, config: &ProviderConfig) {
        let stop = config.stop.http.clone().unwrap_or_default();
        let url = format!(
            "{}{}",
            config.api.base_url.trim_end_matches('/'),
            stop.path
        );
        let builder = match stop.method.to_ascii_uppercase().as_str() {
            "GET" => self.client.get(&url),
            "DELETE" => self.client.delete(&url),
            _ => self.client.post(&url),
        };
        if let Err(e) = builder.timeout(STOP_STAGE_TIMEOUT).send().await {
            debug!(provider = %provider_id, error = %e, "HTTP stop request failed");
            return;
        }

        // Wait for health to stop succeeding, bounded.
        let deadline = Instant::now() + STOP_STAGE_TIMEOUT;
        while Instant::now() < deadline {
            if !self
                .probe_http(&config.api.base_url, &config.api.health)
                .await
            {
                return;
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }
    }

    /// Is the provider's current process one the gateway started?
    pub async fn is_owned(&self, provider_id: &str) -> bool {
        match self.handle(provider_id) {
            Ok(handle) => handle.runtime.lock().await.owned,
            Err(_) => false,
        }
    }

    /// Detect an owned process that died between jobs and reset it to down
    /// so the next `ensure_up` starts fresh. Returns true if still alive
    /// (or not owned).
    pub async fn process_alive(&self, provider_id: &str) -> bool {
        let Ok(handle) = self.handle(provider_id) else {
            return false;
        };
        let mut runtime = handle.runtime.lock().await;
        if !runtime.owned {
            return true;
        }
        let exited = match runtime.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Some(format!("process exited: {status}")),
                Ok(None) => None,
                Err(e) => {
                    warn!(provider = %provider_id, error = %e, "Failed to poll process");
                    None
                }
            },
            None => Some("process handle lost".to_string()),
        };
        match exited {
            Some(reason) => {
                warn!(provider = %provider_id, %reason, "Owned process found dead; resetting");
                runtime.child = None;
                runtime.owned = false;
                runtime.healthy = false;
                runtime.state = ProcessState::Down;
                runtime.last_error = Some(reason);
                false
            }
            None => true,
        }
    }

    pub async fn mark_used(&self, provider_id: &str) {
        if let Ok(handle) = self.handle(provider_id) {
            handle.runtime.lock().await.last_used_at = Some(Instant::now());
        }
    }

    pub async fn last_used(&self, provider_id: &str) -> Option<Instant> {
        let handle = self.handle(provider_id).ok()?;
        let runtime = handle.runtime.lock().await;
        runtime.last_used_at
    }

    /// Diagnostic snapshot of every provider, sorted by id.
    pub async fn statuses(&self) -> Vec<ProviderStatus> {
        let mut out = Vec::new();
        for id in self.provider_ids() {
            let Ok(handle) = self.handle(&id) else { continue };
            let runtime = handle.runtime.lock().await;
            out.push(ProviderStatus {
                id,
                provider_type: handle.config.provider_type,
                resource_group: handle.config.resource_group,
                state: runtime.state.as_str().to_string(),
                detected: runtime.detected,
                healthy: runtime.healthy,
                owned: runtime.owned,
                last_error: runtime.last_error.clone(),
                last_health_at: runtime.last_health_at,
            });
        }
        out
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Kill remaining owned children so tests and shutdown leave no zombies.
        for entry in self.providers.iter() {
            if let Ok(mut runtime) = entry.value().runtime.try_lock() {
                if runtime.owned {
                    if let Some(ref mut child) = runtime.child {
                        let _ = child.start_kill();
                    }
                }
            }
        }
    }
}

/// Spawn the provider's configured command in its own process group, with
/// the parent environment merged with the provider's env map. Stdout and
/// stderr are forwarded as debug events under the `backend` target,
/// filterable via `RUST_LOG=info,backend=debug`.
fn spawn_provider(provider_id: &str, config: &ProviderConfig) -> Result<Child, String> {
    let start = &config.start;
    let command = start.command.as_deref().unwrap_or_default();

    let mut cmd = Command::new(command);
    cmd.args(&start.args)
        .envs(&start.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(ref cwd) = start.cwd {
        cmd.current_dir(cwd);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| e.to_string())?;

    let id = provider_id.to_string();
    if let Some(stdout) = child.stdout.take() {
        let id = id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "backend", provider = %id, stream = "stdout", "{}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "backend", provider = %id, stream = "stderr", "{}", line);
            }
        });
    }

    Ok(child)
}

/// Graceful stop: SIGTERM to the process group, bounded wait, then SIGKILL.
async fn terminate_child(provider_id: &str, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: signalling a process group we spawned.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(STOP_STAGE_TIMEOUT, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(provider = %provider_id, "Graceful termination timed out; killing");
            kill_child(child).await;
        }
    }
}

/// Forced stop: SIGKILL the process group and reap.
async fn kill_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: signalling a process group we spawned.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Resolve a binary on the platform search path. Absolute and relative
/// paths with separators are checked directly.
fn binary_on_path(name: &str) -> bool {
    let candidate = std::path::Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    for dir in std::env::split_paths(&paths) {
        let full = dir.join(name);
        if full.is_file() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = full.metadata() {
                    if meta.permissions().mode() & 0o111 != 0 {
                        return true;
                    }
                }
                continue;
            }
            #[cfg(not(unix))]
            return true;
        }
    }
    false
}
