//! End-to-end tests for modelgate.
//!
//! Spawns mock-backend processes, writes a config tree into a temp
//! directory, builds the full gateway, and drives requests through the
//! axum app. Backend readiness uses the `READY <port>` handshake; no
//! polling.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use modelgate::GatewayConfig;
use serde_json::{json, Value};
use serial_test::serial;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tower::ServiceExt;

/// Port allocator for providers the gateway starts itself (their base_url
/// must be known before the process exists). High range to avoid clashes.
static NEXT_PORT: AtomicU16 = AtomicU16::new(23500);

fn allocate_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

// ── Mock backend harness ────────────────────────────────────────────────────

struct MockBackend {
    child: Child,
    port: u16,
}

impl MockBackend {
    /// Spawn a mock backend on a dynamic port and wait for READY.
    async fn spawn(models: &[&str], latency_ms: u64) -> Self {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_mock-backend"));
        cmd.args(["--port", "0", "--latency-ms", &latency_ms.to_string()])
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        for model in models {
            cmd.args(["--model", model]);
        }

        let mut child = cmd.spawn().expect("failed to spawn mock-backend");
        let stdout = child.stdout.take().expect("stdout captured");
        let mut lines = BufReader::new(stdout).lines();

        let port = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(line) = lines.next_line().await.expect("read stdout") {
                if let Some(port) = line.strip_prefix("READY ") {
                    return port.parse::<u16>().expect("parse port");
                }
            }
            panic!("backend never signaled READY");
        })
        .await
        .expect("timeout waiting for mock-backend");

        Self { child, port }
    }

    async fn served(&self) -> Vec<String> {
        let stats: Value = reqwest::get(format!("http://127.0.0.1:{}/stats", self.port))
            .await
            .expect("stats request")
            .json()
            .await
            .expect("stats json");
        stats["served"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect()
    }

    async fn request_count(&self) -> u64 {
        let stats: Value = reqwest::get(format!("http://127.0.0.1:{}/stats", self.port))
            .await
            .expect("stats request")
            .json()
            .await
            .expect("stats json");
        stats["request_count"].as_u64().unwrap()
    }

    async fn set_fail_mode(&self, mode: &str) {
        reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/control/fail", self.port))
            .json(&json!({"mode": mode}))
            .send()
            .await
            .expect("set fail mode");
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

// ── Config tree + gateway harness ───────────────────────────────────────────

struct TestGateway {
    #[allow(dead_code)] // holds the config tree alive
    dir: tempfile::TempDir,
    app: axum::Router,
}

async fn build_gateway(
    config_yaml: &str,
    providers: &[(&str, String)],
    routes_yaml: Option<&str>,
    models_yaml: Option<&str>,
) -> TestGateway {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.yaml"), config_yaml).unwrap();

    let providers_dir = dir.path().join("providers");
    std::fs::create_dir(&providers_dir).unwrap();
    for (name, yaml) in providers {
        std::fs::write(providers_dir.join(format!("{name}.yaml")), yaml).unwrap();
    }
    if let Some(routes) = routes_yaml {
        std::fs::write(dir.path().join("routes.yaml"), routes).unwrap();
    }
    if let Some(models) = models_yaml {
        std::fs::write(dir.path().join("models.yaml"), models).unwrap();
    }

    let config = GatewayConfig::load(dir.path()).expect("load config");
    let gateway = modelgate::build_app(config).await.expect("build gateway");
    TestGateway {
        dir,
        app: gateway.app,
    }
}

fn base_config(log_dir: &str) -> String {
    format!(
        r#"
runtime:
  refresh_cooldown_seconds: 0
  request_timeout_seconds: 30
logging:
  log_dir: {log_dir}
metrics:
  port: 0
"#
    )
}

fn external_provider(id: &str, kind: &str, port: u16, health_path: &str) -> String {
    format!(
        r#"
provider_id: {id}
provider_type: {kind}
api:
  base_url: http://127.0.0.1:{port}
  health:
    path: {health_path}
    timeout_seconds: 1
"#
    )
}

/// A provider that declares a model but whose process can never come up.
fn unstartable_provider(id: &str, model: &str) -> String {
    format!(
        r#"
provider_id: {id}
provider_type: openai_compat
api:
  base_url: http://127.0.0.1:1
  health:
    timeout_seconds: 1
  models:
    declared_models: [{model}]
start:
  enabled: true
  command: "false"
  startup_grace_seconds: 2
policy:
  max_start_attempts: 1
"#
    )
}

/// A provider whose process the gateway starts and stops itself.
fn managed_provider(id: &str, port: u16, model: &str) -> String {
    format!(
        r#"
provider_id: {id}
provider_type: openai_compat
api:
  base_url: http://127.0.0.1:{port}
  health:
    path: /health
    timeout_seconds: 1
  models:
    declared_models: [{model}]
start:
  enabled: true
  command: "{exe}"
  args: ["--port", "{port}", "--model", "{model}", "--latency-ms", "20"]
  startup_grace_seconds: 10
stop:
  method: terminate_process
policy:
  max_start_attempts: 2
"#,
        exe = env!("CARGO_BIN_EXE_mock-backend"),
    )
}

async fn get_json(app: &axum::Router, path: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn post_json(app: &axum::Router, path: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn chat(app: &axum::Router, model: &str, content: &str) -> (StatusCode, Value) {
    post_json(
        app,
        "/v1/chat/completions",
        json!({
            "model": model,
            "messages": [{"role": "user", "content": content}]
        }),
    )
    .await
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
#[serial]
async fn health_and_model_listing() {
    let backend = MockBackend::spawn(&["m-alpha", "m-beta"], 10).await;
    let log_dir = tempfile::tempdir().unwrap();

    let gateway = build_gateway(
        &base_config(log_dir.path().to_str().unwrap()),
        &[(
            "alpha",
            external_provider("alpha", "openai_compat", backend.port, "/health"),
        )],
        Some(
            r#"
routes:
  fast:
    primary_model: m-alpha
    fallback_models: [m-beta]
    fallback_on: [unreachable]
"#,
        ),
        None,
    )
    .await;

    let (status, health) = get_json(&gateway.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["registry_models"], 2);
    assert!(health["active_model"].is_null());

    let (status, models) = get_json(&gateway.app, "/v1/models").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(models["object"], "list");
    let ids: Vec<&str> = models["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"m-alpha"));
    assert!(ids.contains(&"m-beta"));
    assert!(ids.contains(&"route:fast"));
    // Provider ids never leak through the OpenAI surface.
    for entry in models["data"].as_array().unwrap() {
        assert!(entry["owned_by"].as_str().unwrap().starts_with("modelgate"));
    }

    let (status, registry) = get_json(&gateway.app, "/admin/registry").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(registry["models"]["m-alpha"], "alpha");
}

#[tokio::test]
#[serial]
async fn chat_completion_via_openai_compat() {
    let backend = MockBackend::spawn(&["m-alpha"], 10).await;
    let log_dir = tempfile::tempdir().unwrap();

    let gateway = build_gateway(
        &base_config(log_dir.path().to_str().unwrap()),
        &[(
            "alpha",
            external_provider("alpha", "openai_compat", backend.port, "/health"),
        )],
        None,
        None,
    )
    .await;

    let (status, body) = chat(&gateway.app, "m-alpha", "hello").await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "m-alpha");
    let content = body["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(content.contains("you said \"hello\""));
}

#[tokio::test]
#[serial]
async fn chat_completion_via_ollama_translation() {
    let backend = MockBackend::spawn(&["llama-mock"], 10).await;
    let log_dir = tempfile::tempdir().unwrap();

    let gateway = build_gateway(
        &base_config(log_dir.path().to_str().unwrap()),
        &[(
            "ollama",
            external_provider("ollama", "ollama", backend.port, "/"),
        )],
        None,
        None,
    )
    .await;

    let (status, body) = post_json(
        &gateway.app,
        "/v1/chat/completions",
        json!({
            "model": "llama-mock",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.5,
            "top_p": 0.9,
            "max_tokens": 64
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    // The mock echoes the translated options back in the content.
    let content = body["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(content.contains("num_predict"), "content: {content}");
    // Usage mapped from prompt_eval_count/eval_count.
    assert_eq!(body["usage"]["prompt_tokens"], 5);
    assert_eq!(body["usage"]["completion_tokens"], 9);
    assert_eq!(body["usage"]["total_tokens"], 14);
}

#[tokio::test]
#[serial]
async fn fifo_within_model_and_drain_before_switch() {
    // Two providers, two models. A's jobs must complete in enqueue order,
    // and a job for the active model submitted after B's job still runs
    // before the switch.
    let backend_a = MockBackend::spawn(&["m-a"], 200).await;
    let backend_b = MockBackend::spawn(&["m-b"], 200).await;
    let log_dir = tempfile::tempdir().unwrap();

    let gateway = build_gateway(
        &base_config(log_dir.path().to_str().unwrap()),
        &[
            (
                "prov-a",
                external_provider("prov-a", "openai_compat", backend_a.port, "/health"),
            ),
            (
                "prov-b",
                external_provider("prov-b", "openai_compat", backend_b.port, "/health"),
            ),
        ],
        None,
        None,
    )
    .await;

    let app = gateway.app.clone();
    let a1 = tokio::spawn({
        let app = app.clone();
        async move {
            let (status, _) = chat(&app, "m-a", "a1").await;
            (status, Instant::now())
        }
    });
    tokio::time::sleep(Duration::from_millis(60)).await;
    let b1 = tokio::spawn({
        let app = app.clone();
        async move {
            let (status, _) = chat(&app, "m-b", "b1").await;
            (status, Instant::now())
        }
    });
    tokio::time::sleep(Duration::from_millis(60)).await;
    // Submitted after b1, but m-a is active: runs before the switch.
    let a2 = tokio::spawn({
        let app = app.clone();
        async move {
            let (status, _) = chat(&app, "m-a", "a2").await;
            (status, Instant::now())
        }
    });

    let (a1_status, a1_done) = a1.await.unwrap();
    let (b1_status, b1_done) = b1.await.unwrap();
    let (a2_status, a2_done) = a2.await.unwrap();
    assert_eq!(a1_status, StatusCode::OK);
    assert_eq!(b1_status, StatusCode::OK);
    assert_eq!(a2_status, StatusCode::OK);

    assert!(a1_done < a2_done, "a1 must complete before a2");
    assert!(a2_done < b1_done, "m-a drains fully before switching to m-b");

    assert_eq!(backend_a.served().await, vec!["m-a", "m-a"]);
    assert_eq!(backend_b.served().await, vec!["m-b"]);
}

#[tokio::test]
#[serial]
async fn route_falls_back_to_alternate_on_unreachable() {
    let cloud = MockBackend::spawn(&["cloud-y"], 10).await;
    let log_dir = tempfile::tempdir().unwrap();

    let gateway = build_gateway(
        &base_config(log_dir.path().to_str().unwrap()),
        &[
            ("local-x", unstartable_provider("local-x", "local-x")),
            (
                "cloud",
                external_provider("cloud", "openai_compat", cloud.port, "/health"),
            ),
        ],
        Some(
            r#"
routes:
  r:
    primary_model: local-x
    fallback_models: [cloud-y]
    fallback_on: [unreachable]
"#,
        ),
        None,
    )
    .await;

    let (status, body) = chat(&gateway.app, "route:r", "hello").await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["model"], "cloud-y");
    assert_eq!(cloud.request_count().await, 1);

    // The trace records the failed primary and the successful alternate.
    let (status, logs) = get_json(&gateway.app, "/admin/logs?limit=5").await;
    assert_eq!(status, StatusCode::OK);
    let record = logs["logs"].as_array().unwrap().last().unwrap().clone();
    assert_eq!(record["route_name"], "r");
    assert_eq!(record["status"], "done");
    let attempts = record["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0]["model"], "local-x");
    assert_eq!(attempts[0]["error"], "unreachable");
    assert_eq!(attempts[1]["model"], "cloud-y");
    assert_eq!(attempts[1]["status"], "done");
}

#[tokio::test]
#[serial]
async fn explicit_model_does_not_fall_back() {
    let cloud = MockBackend::spawn(&["cloud-y"], 10).await;
    let log_dir = tempfile::tempdir().unwrap();

    let gateway = build_gateway(
        &base_config(log_dir.path().to_str().unwrap()),
        &[
            ("local-x", unstartable_provider("local-x", "local-x")),
            (
                "cloud",
                external_provider("cloud", "openai_compat", cloud.port, "/health"),
            ),
        ],
        Some(
            r#"
routes:
  r:
    primary_model: local-x
    fallback_models: [cloud-y]
    fallback_on: [unreachable]
"#,
        ),
        None,
    )
    .await;

    let (status, body) = chat(&gateway.app, "local-x", "hello").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "body: {body}");
    assert_eq!(body["error"]["code"], "unreachable");
    // No alternate was attempted.
    assert_eq!(cloud.request_count().await, 0);
}

#[tokio::test]
#[serial]
async fn oom_from_backend_maps_to_503() {
    let backend = MockBackend::spawn(&["m-alpha"], 10).await;
    backend.set_fail_mode("oom").await;
    let log_dir = tempfile::tempdir().unwrap();

    let gateway = build_gateway(
        &base_config(log_dir.path().to_str().unwrap()),
        &[(
            "alpha",
            external_provider("alpha", "openai_compat", backend.port, "/health"),
        )],
        None,
        None,
    )
    .await;

    let (status, body) = chat(&gateway.app, "m-alpha", "hello").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "body: {body}");
    assert_eq!(body["error"]["code"], "oom");
}

#[tokio::test]
#[serial]
async fn stream_requests_are_refused_before_enqueue() {
    let backend = MockBackend::spawn(&["m-alpha"], 10).await;
    let log_dir = tempfile::tempdir().unwrap();

    let gateway = build_gateway(
        &base_config(log_dir.path().to_str().unwrap()),
        &[(
            "alpha",
            external_provider("alpha", "openai_compat", backend.port, "/health"),
        )],
        None,
        None,
    )
    .await;

    let (status, body) = post_json(
        &gateway.app,
        "/v1/chat/completions",
        json!({
            "model": "m-alpha",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED, "body: {body}");
    // Refused before any job reached a backend.
    assert_eq!(backend.request_count().await, 0);
}

#[tokio::test]
#[serial]
async fn unknown_model_is_404_and_bad_body_is_400() {
    let backend = MockBackend::spawn(&["m-alpha"], 10).await;
    let log_dir = tempfile::tempdir().unwrap();

    let gateway = build_gateway(
        &base_config(log_dir.path().to_str().unwrap()),
        &[(
            "alpha",
            external_provider("alpha", "openai_compat", backend.port, "/health"),
        )],
        None,
        None,
    )
    .await;

    let (status, body) = chat(&gateway.app, "no-such-model", "hello").await;
    assert_eq!(status, StatusCode::NOT_FOUND, "body: {body}");
    assert_eq!(body["error"]["code"], "not_found");

    let (status, body) = post_json(
        &gateway.app,
        "/v1/chat/completions",
        json!({"messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = post_json(
        &gateway.app,
        "/v1/chat/completions",
        json!({"model": "m-alpha", "messages": []}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
}

#[tokio::test]
#[serial]
async fn refresh_is_idempotent_within_cooldown() {
    let backend = MockBackend::spawn(&["m-alpha"], 10).await;
    let log_dir = tempfile::tempdir().unwrap();

    let config = format!(
        r#"
runtime:
  refresh_cooldown_seconds: 3600
  request_timeout_seconds: 30
logging:
  log_dir: {}
metrics:
  port: 0
"#,
        log_dir.path().to_str().unwrap()
    );

    let gateway = build_gateway(
        &config,
        &[(
            "alpha",
            external_provider("alpha", "openai_compat", backend.port, "/health"),
        )],
        None,
        None,
    )
    .await;

    let (status, first) = post_json(&gateway.app, "/refresh", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, second) = post_json(&gateway.app, "/refresh", json!({})).await;
    assert_eq!(status, StatusCode::OK);

    // The startup build is still fresh: both calls are cooldown hits and
    // report the identical snapshot.
    assert_eq!(first["rebuilt"], false);
    assert_eq!(second["rebuilt"], false);
    assert_eq!(first["model_count"], second["model_count"]);
    assert_eq!(first["built_at"], second["built_at"]);
}

#[tokio::test]
#[serial]
async fn provider_switch_stops_owned_process_before_starting_next() {
    // Two gateway-managed backends on pre-allocated ports. Switching models
    // must stop the first process (terminate_process) before the second
    // comes up, and restart the first on demand later.
    let port_a = allocate_port();
    let port_b = allocate_port();
    let log_dir = tempfile::tempdir().unwrap();

    let gateway = build_gateway(
        &base_config(log_dir.path().to_str().unwrap()),
        &[
            ("managed-a", managed_provider("managed-a", port_a, "m-a")),
            ("managed-b", managed_provider("managed-b", port_b, "m-b")),
        ],
        None,
        None,
    )
    .await;

    // First request lazily starts managed-a.
    let (status, body) = chat(&gateway.app, "m-a", "one").await;
    assert_eq!(status, StatusCode::OK, "body: {body}");

    let health_a = format!("http://127.0.0.1:{port_a}/health");
    assert!(reqwest::get(&health_a).await.is_ok(), "managed-a is up");

    // Switching to m-b stops managed-a first.
    let (status, body) = chat(&gateway.app, "m-b", "two").await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert!(
        reqwest::get(&health_a).await.is_err(),
        "managed-a was stopped by the switch"
    );

    let (_, providers) = get_json(&gateway.app, "/admin/providers").await;
    let list = providers["providers"].as_array().unwrap();
    let a = list.iter().find(|p| p["id"] == "managed-a").unwrap();
    let b = list.iter().find(|p| p["id"] == "managed-b").unwrap();
    assert_eq!(a["owned"], false);
    assert_eq!(a["healthy"], false);
    assert_eq!(b["owned"], true);
    assert_eq!(b["healthy"], true);

    // Switching back restarts managed-a.
    let (status, body) = chat(&gateway.app, "m-a", "three").await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert!(
        reqwest::get(&health_a).await.is_ok(),
        "managed-a restarted on demand"
    );
}
