//! Scheduler: per-model FIFO queues, the global execution lock, and
//! provider switching.
//!
//! One cooperative loop owns the active-model/active-provider pair. Within
//! a model, jobs complete in enqueue order; an active model drains fully
//! (including jobs that arrive while it is active) before the loop switches
//! away. Switching providers stops the previous gateway-owned process
//! before starting the next so a single local model is resident at a time.

use crate::api::{ChatCompletionResponse, Job};
use crate::config::{GatewayConfig, ModelScore, ProviderConfig};
use crate::error::{GatewayError, NormalizedError};
use crate::providers::AdapterSet;
use crate::registry::Registry;
use crate::supervisor::ProcessSupervisor;
use async_trait::async_trait;
use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a provider's start-failure count persists before the budget
/// resets. Keeps a flapping backend from being written off forever.
const START_FAILURE_RESET: Duration = Duration::from_secs(60);

/// Delivered on a job's completion handle.
#[derive(Debug)]
pub struct JobOutcome {
    pub result: Result<ChatCompletionResponse, GatewayError>,
    pub provider_id: Option<String>,
    pub queue_wait_ms: u64,
    pub runtime_ms: u64,
}

/// Completion handle returned by `submit`.
pub struct JobTicket {
    pub job_id: Uuid,
    pub model_id: String,
    rx: oneshot::Receiver<JobOutcome>,
}

struct QueueEntry {
    job: Job,
    tx: oneshot::Sender<JobOutcome>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct SchedulerState {
    queues: HashMap<String, VecDeque<QueueEntry>>,
    active_model: Option<String>,
    active_provider: Option<String>,
}

impl SchedulerState {
    fn has_work(&self) -> bool {
        self.queues.values().any(|q| !q.is_empty())
    }
}

/// Seam between the router and the scheduler: run one job to completion,
/// enforcing the per-request timeout.
#[async_trait]
pub trait ExecuteJob: Send + Sync {
    async fn execute(&self, job: Job) -> JobOutcome;
}

pub struct Scheduler {
    state: Mutex<SchedulerState>,
    work_available: Notify,
    /// The global execution lock: at most one adapter forward at a time.
    exec_lock: Mutex<()>,
    supervisor: Arc<ProcessSupervisor>,
    registry: Arc<Registry>,
    adapters: AdapterSet,
    scores: HashMap<String, ModelScore>,
    default_score: ModelScore,
    aging_bonus_per_second: f64,
    request_timeout: Duration,
    /// provider id → (consecutive start failures, last failure time).
    start_failures: DashMap<String, (u32, Instant)>,
}

impl Scheduler {
    pub fn new(
        config: &GatewayConfig,
        supervisor: Arc<ProcessSupervisor>,
        registry: Arc<Registry>,
    ) -> Self {
        let request_timeout = Duration::from_secs(config.app.runtime.request_timeout_seconds);
        Self {
            state: Mutex::new(SchedulerState::default()),
            work_available: Notify::new(),
            exec_lock: Mutex::new(()),
            supervisor,
            registry,
            adapters: AdapterSet::new(request_timeout),
            scores: config.model_scores.clone(),
            default_score: config.app.scheduling.default_model_score,
            aging_bonus_per_second: config.app.scheduling.aging_bonus_per_second,
            request_timeout,
            start_failures: DashMap::new(),
        }
    }

    fn score_for(&self, model_id: &str) -> ModelScore {
        self.scores
            .get(model_id)
            .copied()
            .unwrap_or(self.default_score)
    }

    /// Append a job to its model's queue and wake the loop.
    pub async fn submit(&self, job: Job) -> JobTicket {
        let (tx, rx) = oneshot::channel();
        let job_id = job.job_id;
        let model_id = job.model_id.clone();

        {
            let mut state = self.state.lock().await;
            let queue = state.queues.entry(model_id.clone()).or_default();
            queue.push_back(QueueEntry {
                job,
                tx,
                enqueued_at: Instant::now(),
            });
            gauge!("modelgate_queue_depth", "model" => model_id.clone()).set(queue.len() as f64);
            debug!(model = %model_id, depth = queue.len(), "Job enqueued");
        }
        self.work_available.notify_one();

        JobTicket {
            job_id,
            model_id,
            rx,
        }
    }

    /// Remove a still-queued job. A running job cannot be preempted; its
    /// result is simply discarded by the caller.
    pub async fn cancel(&self, model_id: &str, job_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let Some(queue) = state.queues.get_mut(model_id) else {
            return false;
        };
        let Some(position) = queue.iter().position(|e| e.job.job_id == job_id) else {
            return false;
        };
        queue.remove(position);
        debug!(model = %model_id, %job_id, "Queued job cancelled");
        true
    }

    /// Current active model and provider, for `/health`.
    pub async fn active(&self) -> (Option<String>, Option<String>) {
        let state = self.state.lock().await;
        (state.active_model.clone(), state.active_provider.clone())
    }

    pub async fn queue_depths(&self) -> HashMap<String, usize> {
        let state = self.state.lock().await;
        state
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(m, q)| (m.clone(), q.len()))
            .collect()
    }

    pub fn spawn_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await })
    }

    async fn run(&self) {
        info!("Scheduler loop started");
        loop {
            self.wait_for_work().await;

            let Some(model) = self.choose_model().await else {
                continue;
            };

            // Resolve the model's provider from the current snapshot.
            let snapshot = self.registry.snapshot().await;
            let Some(provider_id) = snapshot.provider_for(&model).map(String::from) else {
                self.fail_head(&model, GatewayError::ModelNotFound(model.clone()))
                    .await;
                continue;
            };
            let Some(provider) = self.supervisor.provider_config(&provider_id) else {
                self.fail_head(
                    &model,
                    GatewayError::Unreachable {
                        provider: provider_id.clone(),
                        detail: "provider configuration missing".to_string(),
                    },
                )
                .await;
                continue;
            };

            if !self.ensure_provider(&model, &provider).await {
                continue;
            }

            self.run_head(&model, &provider).await;
        }
    }

    /// Block until some queue is non-empty, running the idle-shutdown timer
    /// for an owned, no-longer-needed provider while waiting.
    async fn wait_for_work(&self) {
        loop {
            let idle_provider = {
                let state = self.state.lock().await;
                if state.has_work() {
                    return;
                }
                state.active_provider.clone()
            };

            let Some(provider_id) = idle_provider else {
                self.work_available.notified().await;
                continue;
            };
            let Some(config) = self.supervisor.provider_config(&provider_id) else {
                self.work_available.notified().await;
                continue;
            };

            let idle_shutdown = match config.policy.idle_shutdown_seconds {
                Some(secs) if !config.policy.keep_warm => Duration::from_secs(secs),
                _ => {
                    self.work_available.notified().await;
                    continue;
                }
            };
            if !self.supervisor.is_owned(&provider_id).await {
                self.work_available.notified().await;
                continue;
            }

            let last_used = self
                .supervisor
                .last_used(&provider_id)
                .await
                .unwrap_or_else(Instant::now);
            let deadline = last_used + idle_shutdown;
            let now = Instant::now();

            if now >= deadline {
                info!(provider = %provider_id, "Idle shutdown");
                let _ = self.supervisor.ensure_down(&provider_id).await;
                let mut state = self.state.lock().await;
                if state.active_provider.as_deref() == Some(provider_id.as_str()) {
                    state.active_provider = None;
                }
                continue;
            }

            tokio::select! {
                _ = self.work_available.notified() => {}
                _ = tokio::time::sleep(deadline - now) => {}
            }
        }
    }

    /// Keep the active model while its queue is non-empty; otherwise pick
    /// the next model by score and make it active.
    async fn choose_model(&self) -> Option<String> {
        let mut state = self.state.lock().await;

        if let Some(ref active) = state.active_model {
            if state.queues.get(active).is_some_and(|q| !q.is_empty()) {
                return Some(active.clone());
            }
        }

        let stats: Vec<QueueStat> = state
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(model, q)| QueueStat {
                model: model.clone(),
                oldest_enqueued_at: q.front().expect("non-empty").enqueued_at,
            })
            .collect();

        let next = pick_next_model(
            &stats,
            |m| self.score_for(m),
            self.aging_bonus_per_second,
            Instant::now(),
        )?;
        debug!(model = %next, "Next model selected");
        state.active_model = Some(next.clone());
        Some(next)
    }

    /// Switch providers if the model's provider differs from the resident
    /// one, or re-validate the resident process. Returns false when the
    /// head job was failed and the loop should restart.
    async fn ensure_provider(&self, model: &str, provider: &ProviderConfig) -> bool {
        let provider_id = provider.provider_id.as_str();
        let previous = {
            let state = self.state.lock().await;
            state.active_provider.clone()
        };

        if previous.as_deref() == Some(provider_id) {
            // Same provider: catch a crash between jobs.
            if self.supervisor.process_alive(provider_id).await {
                return true;
            }
            warn!(provider = %provider_id, "Active provider died between jobs");
        } else if let Some(ref old) = previous {
            // Stop before start: free the resources before the new backend
            // comes up.
            if self.supervisor.is_owned(old).await {
                info!(from = %old, to = %provider_id, "Provider switch");
                counter!("modelgate_provider_switches_total",
                    "from" => old.clone(), "to" => provider_id.to_string())
                .increment(1);
                let _ = self.supervisor.ensure_down(old).await;
            }
            let mut state = self.state.lock().await;
            state.active_provider = None;
        }

        let budget = self.remaining_start_budget(provider);
        if budget == 0 {
            self.fail_head(
                model,
                GatewayError::Unreachable {
                    provider: provider_id.to_string(),
                    detail: "start attempts exhausted".to_string(),
                },
            )
            .await;
            return false;
        }

        match self.supervisor.ensure_up(provider_id, budget).await {
            Ok(()) => {
                self.start_failures.remove(provider_id);
                let mut state = self.state.lock().await;
                state.active_provider = Some(provider_id.to_string());
                true
            }
            Err(e) => {
                warn!(provider = %provider_id, error = %e, "Provider failed to come up");
                {
                    let mut state = self.state.lock().await;
                    if state.active_provider.as_deref() == Some(provider_id) {
                        state.active_provider = None;
                    }
                }
                self.note_start_failures(provider_id, budget);
                counter!("modelgate_start_failures_total", "provider" => provider_id.to_string())
                    .increment(1);
                self.fail_head(
                    model,
                    GatewayError::Unreachable {
                        provider: provider_id.to_string(),
                        detail: e.to_string(),
                    },
                )
                .await;
                false
            }
        }
    }

    /// Pop the head job for `model` and forward it under the global
    /// execution lock.
    async fn run_head(&self, model: &str, provider: &ProviderConfig) {
        let entry = {
            let mut state = self.state.lock().await;
            let Some(queue) = state.queues.get_mut(model) else {
                return;
            };
            let entry = queue.pop_front();
            gauge!("modelgate_queue_depth", "model" => model.to_string())
                .set(queue.len() as f64);
            entry
        };
        let Some(entry) = entry else {
            // Queue drained (e.g. the last job was cancelled).
            self.clear_if_empty(model).await;
            return;
        };

        let queue_wait = entry.enqueued_at.elapsed();
        debug!(
            model = %model,
            job_id = %entry.job.job_id,
            queue_wait_ms = queue_wait.as_millis() as u64,
            "Executing job"
        );

        let started = Instant::now();
        let result = {
            let _exec = self.exec_lock.lock().await;
            self.adapters
                .for_type(provider.provider_type)
                .forward(provider, &entry.job.request)
                .await
        };
        let runtime = started.elapsed();
        self.supervisor.mark_used(&provider.provider_id).await;

        let status = if result.is_ok() { "done" } else { "failed" };
        histogram!("modelgate_queue_wait_seconds", "model" => model.to_string())
            .record(queue_wait.as_secs_f64());
        histogram!("modelgate_request_runtime_seconds", "model" => model.to_string())
            .record(runtime.as_secs_f64());
        counter!("modelgate_requests_total",
            "model" => model.to_string(), "status" => status.to_string())
        .increment(1);

        if let Err(ref e) = result {
            // A dead or hung owned backend counts against the start budget
            // so repeated re-launch attempts stay bounded.
            let normalized = e.normalized();
            if matches!(
                normalized,
                NormalizedError::Unreachable | NormalizedError::Timeout
            ) && self.supervisor.is_owned(&provider.provider_id).await
            {
                self.note_start_failures(&provider.provider_id, 1);
            }
        }

        let outcome = JobOutcome {
            result,
            provider_id: Some(provider.provider_id.clone()),
            queue_wait_ms: queue_wait.as_millis() as u64,
            runtime_ms: runtime.as_millis() as u64,
        };
        if entry.tx.send(outcome).is_err() {
            // Caller gave up (request timeout); the result is discarded.
            debug!(model = %model, job_id = %entry.job.job_id, "Completion handle dropped");
        }

        self.clear_if_empty(model).await;
    }

    /// Fail the head-of-queue job for `model`, one job per loop pass, so
    /// the router can decide fallback per job.
    async fn fail_head(&self, model: &str, error: GatewayError) {
        let entry = {
            let mut state = self.state.lock().await;
            state.queues.get_mut(model).and_then(|q| q.pop_front())
        };
        if let Some(entry) = entry {
            let queue_wait = entry.enqueued_at.elapsed();
            counter!("modelgate_requests_total",
                "model" => model.to_string(), "status" => "failed".to_string())
            .increment(1);
            let _ = entry.tx.send(JobOutcome {
                result: Err(error),
                provider_id: None,
                queue_wait_ms: queue_wait.as_millis() as u64,
                runtime_ms: 0,
            });
        }
        self.clear_if_empty(model).await;
    }

    async fn clear_if_empty(&self, model: &str) {
        let mut state = self.state.lock().await;
        let empty = state.queues.get(model).is_none_or(|q| q.is_empty());
        if empty {
            state.queues.remove(model);
            if state.active_model.as_deref() == Some(model) {
                state.active_model = None;
            }
        }
    }

    fn remaining_start_budget(&self, provider: &ProviderConfig) -> u32 {
        let max = provider.policy.max_start_attempts.max(1);
        match self.start_failures.get(&provider.provider_id) {
            Some(entry) => {
                let (failures, at) = *entry;
                if at.elapsed() > START_FAILURE_RESET {
                    max
                } else {
                    max.saturating_sub(failures)
                }
            }
            None => max,
        }
    }

    fn note_start_failures(&self, provider_id: &str, used: u32) {
        let mut entry = self
            .start_failures
            .entry(provider_id.to_string())
            .or_insert((0, Instant::now()));
        let (failures, at) = *entry;
        if at.elapsed() > START_FAILURE_RESET {
            *entry = (used, Instant::now());
        } else {
            *entry = (failures + used, Instant::now());
        }
    }
}

#[async_trait]
impl ExecuteJob for Scheduler {
    async fn execute(&self, job: Job) -> JobOutcome {
        let submitted = Instant::now();
        let ticket = self.submit(job).await;
        match tokio::time::timeout(self.request_timeout, ticket.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => JobOutcome {
                result: Err(GatewayError::Upstream(
                    "scheduler dropped the job".to_string(),
                )),
                provider_id: None,
                queue_wait_ms: submitted.elapsed().as_millis() as u64,
                runtime_ms: 0,
            },
            Err(_) => {
                // Still queued: remove it. Running: it finishes on its own
                // and the result is discarded.
                let removed = self.cancel(&ticket.model_id, ticket.job_id).await;
                warn!(
                    model = %ticket.model_id,
                    job_id = %ticket.job_id,
                    removed_from_queue = removed,
                    "Request timed out"
                );
                JobOutcome {
                    result: Err(GatewayError::RequestTimeout),
                    provider_id: None,
                    queue_wait_ms: submitted.elapsed().as_millis() as u64,
                    runtime_ms: 0,
                }
            }
        }
    }
}

/// One non-empty queue considered by `pick_next_model`.
#[derive(Debug, Clone)]
pub(crate) struct QueueStat {
    pub model: String,
    pub oldest_enqueued_at: Instant,
}

/// Pick the next model to activate.
///
/// `always_run_last` models are deferred until they are the only candidates.
/// Among the rest:
///
/// ```text
/// score = base_priority - load_penalty - runtime_penalty
///         + aging_bonus_per_second * age_of_oldest_job
/// ```
///
/// Highest score wins; ties go to the older oldest job, then to the
/// lexicographically smaller model id.
pub(crate) fn pick_next_model(
    stats: &[QueueStat],
    score_for: impl Fn(&str) -> ModelScore,
    aging_bonus_per_second: f64,
    now: Instant,
) -> Option<String> {
    if stats.is_empty() {
        return None;
    }

    let foreground: Vec<&QueueStat> = stats
        .iter()
        .filter(|s| !score_for(&s.model).always_run_last)
        .collect();
    let pool: Vec<&QueueStat> = if foreground.is_empty() {
        stats.iter().collect()
    } else {
        foreground
    };

    pool.into_iter()
        .map(|stat| {
            let score = score_for(&stat.model);
            let age = now
                .saturating_duration_since(stat.oldest_enqueued_at)
                .as_secs_f64();
            let value = (score.base_priority - score.load_penalty - score.runtime_penalty)
                as f64
                + aging_bonus_per_second * age;
            (stat, value)
        })
        .max_by(|(a, va), (b, vb)| {
            va.partial_cmp(vb)
                .unwrap_or(std::cmp::Ordering::Equal)
                // Older oldest job wins a score tie.
                .then_with(|| b.oldest_enqueued_at.cmp(&a.oldest_enqueued_at))
                // Then the lexicographically smaller id.
                .then_with(|| b.model.cmp(&a.model))
        })
        .map(|(stat, _)| stat.model.clone())
}
