//! JSON-lines request log.
//!
//! One record per completed request, appended to a dated file under the
//! configured log directory. Files rotate daily; files older than
//! `keep_days` are pruned at rotation. The most recent records are also
//! kept in an in-memory ring buffer for `/admin/logs`.

use crate::api::AttemptRecord;
use crate::config::LoggingConfig;
use crate::error::NormalizedError;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

const FILE_PREFIX: &str = "gateway-";
const FILE_SUFFIX: &str = ".jsonl";

/// One completed request, success or failure.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub timestamp: String,
    pub request_id: Uuid,
    /// Job id of the final attempt; absent only when no attempt produced
    /// a job (e.g. an unknown route).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_name: Option<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_error: Option<NormalizedError>,
    pub queue_wait_ms: u64,
    pub runtime_ms: u64,
    pub attempts: Vec<AttemptRecord>,
}

struct LogInner {
    ring: VecDeque<serde_json::Value>,
    ring_capacity: usize,
    dir: PathBuf,
    keep_days: u32,
    file: Option<File>,
    open_date: Option<NaiveDate>,
}

pub struct RequestLog {
    inner: Mutex<LogInner>,
}

impl RequestLog {
    pub fn new(config: &LoggingConfig) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                ring: VecDeque::with_capacity(config.keep_last_n_requests_in_memory),
                ring_capacity: config.keep_last_n_requests_in_memory.max(1),
                dir: config.log_dir.clone(),
                keep_days: config.keep_days,
                file: None,
                open_date: None,
            }),
        }
    }

    /// Append a completed-request record to the ring buffer and the
    /// current day's file. Logging failures are reported but never fail
    /// the request.
    pub async fn append(&self, record: RequestRecord) {
        let value = match serde_json::to_value(&record) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to serialize request record");
                return;
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.ring.len() >= inner.ring_capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(value.clone());

        if let Err(e) = inner.write_line(&value) {
            warn!(error = %e, "Failed to write request log");
        }
    }

    /// Most recent records, oldest first, at most `limit`.
    pub async fn recent(&self, limit: usize) -> Vec<serde_json::Value> {
        let inner = self.inner.lock().await;
        let skip = inner.ring.len().saturating_sub(limit);
        inner.ring.iter().skip(skip).cloned().collect()
    }
}

impl LogInner {
    fn write_line(&mut self, value: &serde_json::Value) -> std::io::Result<()> {
        let today = Utc::now().date_naive();
        if self.open_date != Some(today) {
            self.rotate(today)?;
        }
        let file = self.file.as_mut().expect("rotate opens the file");
        writeln!(file, "{value}")
    }

    fn rotate(&mut self, today: NaiveDate) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self
            .dir
            .join(format!("{FILE_PREFIX}{today}{FILE_SUFFIX}"));
        self.file = Some(OpenOptions::new().create(true).append(true).open(&path)?);
        self.open_date = Some(today);
        self.prune(today);
        Ok(())
    }

    /// Remove dated log files older than the retention window.
    fn prune(&self, today: NaiveDate) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
                .and_then(|d| d.parse::<NaiveDate>().ok())
            else {
                continue;
            };
            let age = today.signed_duration_since(date).num_days();
            if age > self.keep_days as i64 {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!(file = %name, error = %e, "Failed to prune old log file");
                }
            }
        }
    }
}

impl RequestRecord {
    pub fn now(
        request_id: Uuid,
        model: String,
        provider_id: Option<String>,
        route_name: Option<String>,
        status: &'static str,
        normalized_error: Option<NormalizedError>,
        attempts: Vec<AttemptRecord>,
    ) -> Self {
        let (queue_wait_ms, runtime_ms) = attempts
            .last()
            .map(|a| (a.queue_wait_ms, a.runtime_ms))
            .unwrap_or((0, 0));
        let job_id = attempts.last().map(|a| a.job_id);
        Self {
            timestamp: Utc::now().to_rfc3339(),
            request_id,
            job_id,
            model,
            provider_id,
            route_name,
            status,
            normalized_error,
            queue_wait_ms,
            runtime_ms,
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(model: &str) -> RequestRecord {
        RequestRecord::now(
            Uuid::new_v4(),
            model.to_string(),
            Some("p1".to_string()),
            None,
            "done",
            None,
            vec![AttemptRecord {
                attempt: 0,
                job_id: Uuid::new_v4(),
                model: model.to_string(),
                provider: Some("p1".to_string()),
                status: "done",
                error: None,
                queue_wait_ms: 3,
                runtime_ms: 42,
            }],
        )
    }

    fn test_log(dir: &std::path::Path, capacity: usize) -> RequestLog {
        RequestLog::new(&LoggingConfig {
            keep_last_n_requests_in_memory: capacity,
            log_dir: dir.to_path_buf(),
            keep_days: 14,
        })
    }

    #[tokio::test]
    async fn appends_jsonl_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(dir.path(), 10);

        log.append(record("m1")).await;
        log.append(record("m2")).await;

        let today = Utc::now().date_naive();
        let path = dir.path().join(format!("gateway-{today}.jsonl"));
        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["model"], "m1");
        assert_eq!(first["status"], "done");
        assert!(first["request_id"].is_string());
        assert!(first["job_id"].is_string());
        assert_eq!(first["runtime_ms"], 42);
        assert_eq!(first["attempts"][0]["provider"], "p1");
    }

    #[tokio::test]
    async fn ring_buffer_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(dir.path(), 2);

        log.append(record("m1")).await;
        log.append(record("m2")).await;
        log.append(record("m3")).await;

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0]["model"], "m2");
        assert_eq!(recent[1]["model"], "m3");

        let limited = log.recent(1).await;
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0]["model"], "m3");
    }

    #[tokio::test]
    async fn prunes_files_beyond_retention() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("gateway-2020-01-01.jsonl");
        std::fs::write(&stale, "{}\n").unwrap();
        let unrelated = dir.path().join("notes.txt");
        std::fs::write(&unrelated, "keep me").unwrap();

        let log = test_log(dir.path(), 10);
        log.append(record("m1")).await;

        assert!(!stale.exists(), "stale log file should be pruned");
        assert!(unrelated.exists(), "unrelated files are untouched");
    }
}
