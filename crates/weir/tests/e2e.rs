//! End-to-end tests: the full router in front of a tempdir WAL, with the
//! forwarder draining into an in-process mock sink.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use weir::{api, config, forwarder::Forwarder, loki, App};

#[derive(Clone)]
struct MockSink {
    addr: std::net::SocketAddr,
    pushes: Arc<Mutex<Vec<serde_json::Value>>>,
    status: Arc<Mutex<u16>>,
}

impl MockSink {
    async fn spawn() -> Self {
        use axum::extract::State;
        use axum::routing::{get, post};

        let pushes: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
        let status = Arc::new(Mutex::new(200u16));

        async fn push(
            State((pushes, status)): State<(Arc<Mutex<Vec<serde_json::Value>>>, Arc<Mutex<u16>>)>,
            axum::Json(body): axum::Json<serde_json::Value>,
        ) -> axum::http::StatusCode {
            let code = *status.lock().unwrap();
            if code == 200 {
                pushes.lock().unwrap().push(body);
                axum::http::StatusCode::NO_CONTENT
            } else {
                axum::http::StatusCode::from_u16(code).unwrap()
            }
        }

        let router = axum::Router::new()
            .route("/loki/api/v1/push", post(push))
            .route("/ready", get(|| async { "ready" }))
            .with_state((pushes.clone(), status.clone()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            addr,
            pushes,
            status,
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    fn set_status(&self, status: u16) {
        *self.status.lock().unwrap() = status;
    }

    fn pushes(&self) -> Vec<serde_json::Value> {
        self.pushes.lock().unwrap().clone()
    }

    /// All pushed lines, flattened across pushes and streams, with the push
    /// arrival order preserved.
    fn lines(&self) -> Vec<String> {
        self.pushes()
            .iter()
            .flat_map(|push| push["streams"].as_array().unwrap().clone())
            .flat_map(|stream| stream["values"].as_array().unwrap().clone())
            .map(|value| value[1].as_str().unwrap().to_string())
            .collect()
    }
}

struct Gateway {
    app: Arc<App>,
    base: String,
    cancel: tokio_util::sync::CancellationToken,
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

const ADMIN_TOKEN: &str = "admin-secret";

fn gateway_yaml(wal_root: &Path, sink_url: &str, api_keys: &str, extra: &str) -> String {
    format!(
        r#"
security:
  admin_token: {ADMIN_TOKEN}
  api_keys:
{api_keys}
{extra}
wal:
  root_path: {root}
loki:
  base_url: "{sink_url}"
  timeout_seconds: 5
  backoff_seconds: [1]
  max_retries: 1
  park_seconds: 1
"#,
        root = wal_root.display(),
    )
}

fn default_api_keys() -> &'static str {
    r#"    - token: tok-a
      name: svc-a
    - token: tok-b
      name: svc-b
"#
}

async fn spawn_gateway(yaml: &str) -> Gateway {
    let parsed: config::Config = serde_yaml::from_str(yaml).unwrap();
    let handle = config::Handle::new(config::Snapshot::build(parsed).unwrap());
    let app = Arc::new(App::new(handle.clone()));

    app.wal.recover().await.unwrap();
    app.health.note_recovered(true);

    let cancel = tokio_util::sync::CancellationToken::new();
    let sink = loki::Client::new(&handle.snapshot().config.loki).unwrap();
    if sink.ready().await {
        app.health.note_sink_ok();
    }

    let forwarder = Forwarder::new(
        app.wal.clone(),
        sink,
        handle.clone(),
        app.health.clone(),
        app.forwarder_status.clone(),
    );
    tokio::spawn(forwarder.run(cancel.clone()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = api::build_router(app.clone(), weir::metrics_server::detached_handle());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Gateway {
        app,
        base: format!("http://{addr}"),
        cancel,
    }
}

async fn post_batch(
    gateway: &Gateway,
    token: &str,
    entries: Vec<serde_json::Value>,
) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/v1/logs:ingest", gateway.base))
        .bearer_auth(token)
        .json(&serde_json::json!({ "entries": entries }))
        .send()
        .await
        .unwrap()
}

async fn admin_flush(gateway: &Gateway) {
    let response = reqwest::Client::new()
        .post(format!("{}/v1/admin/flush", gateway.base))
        .bearer_auth(ADMIN_TOKEN)
        .json(&serde_json::json!({"force": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn fresh_entry(message: &str) -> serde_json::Value {
    serde_json::json!({
        // Must sit inside the accepted timestamp window relative to "now".
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "level": "INFO",
        "message": message,
        "service": "s",
        "env": "dev",
    })
}

#[tokio::test]
async fn happy_path_delivers_one_stream() {
    let sink = MockSink::spawn().await;
    let wal_dir = tempfile::tempdir().unwrap();
    let gateway = spawn_gateway(&gateway_yaml(
        wal_dir.path(),
        &sink.base_url(),
        default_api_keys(),
        "",
    ))
    .await;

    let response = post_batch(&gateway, "tok-a", vec![fresh_entry("hi")]).await;
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["accepted"], 1);
    assert_eq!(body["segment_seq"], 0);

    admin_flush(&gateway).await;
    wait_until("sink push", || !sink.pushes().is_empty()).await;

    let pushes = sink.pushes();
    assert_eq!(pushes.len(), 1);
    let streams = pushes[0]["streams"].as_array().unwrap();
    assert_eq!(streams.len(), 1);
    assert_eq!(
        streams[0]["stream"],
        serde_json::json!({"env": "dev", "level": "INFO", "service": "s"})
    );
    let values = streams[0]["values"].as_array().unwrap();
    assert_eq!(values.len(), 1);
    let line: serde_json::Value = serde_json::from_str(values[0][1].as_str().unwrap()).unwrap();
    assert_eq!(line["message"], "hi");

    // Delivered segments are deleted from disk.
    wait_until("segment deletion", || {
        gateway.app.wal.tenants()[0].sealed().is_empty()
    })
    .await;
}

#[tokio::test]
async fn masking_applies_before_the_wal_write() {
    let sink = MockSink::spawn().await;
    let wal_dir = tempfile::tempdir().unwrap();
    let masking = r#"
masking:
  baseline_keys: [password, authorization]
  partial_rules:
    authorization: {keep_prefix: 5}
"#;
    let gateway = spawn_gateway(&gateway_yaml(
        wal_dir.path(),
        &sink.base_url(),
        default_api_keys(),
        masking,
    ))
    .await;
    // Stall the sink so the sealed segment stays on disk for inspection.
    sink.set_status(503);

    let mut entry = fresh_entry("secrets ahead");
    entry["metadata"] = serde_json::json!({
        "password": "hunter2",
        "authorization": "Bearer abcdefxyz",
    });
    assert_eq!(post_batch(&gateway, "tok-a", vec![entry]).await.status(), 202);

    // Verify the WAL bytes themselves, not just the sink copy.
    let tenant = gateway.app.wal.tenants().into_iter().next().unwrap();
    gateway.app.wal.seal("tok-a", false).await.unwrap();
    let sealed = tenant.sealed();
    let mut reader = gateway.app.wal.open_reader(&sealed[0]).await.unwrap();
    let (record, _) = reader.next().await.unwrap();
    let line: serde_json::Value = serde_json::from_str(&record.line).unwrap();
    assert_eq!(line["metadata"]["password"], "****");
    assert_eq!(line["metadata"]["authorization"], "Beare****");
}

#[tokio::test]
async fn rate_limit_second_request_within_burst_window() {
    let sink = MockSink::spawn().await;
    let wal_dir = tempfile::tempdir().unwrap();
    let api_keys = r#"    - token: tok-slow
      name: svc-slow
      rate_limit_rps: 1
      rate_limit_burst: 1
"#;
    let gateway =
        spawn_gateway(&gateway_yaml(wal_dir.path(), &sink.base_url(), api_keys, "")).await;

    let first = post_batch(&gateway, "tok-slow", vec![fresh_entry("one")]).await;
    assert_eq!(first.status(), 202);

    let second = post_batch(&gateway, "tok-slow", vec![fresh_entry("two")]).await;
    assert_eq!(second.status(), 429);
    let body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(body["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn soft_quota_backpressures_one_tenant_only() {
    let sink = MockSink::spawn().await;
    let wal_dir = tempfile::tempdir().unwrap();
    let api_keys = r#"    - token: tok-small
      name: svc-small
      wal_quota_bytes: 4096
    - token: tok-b
      name: svc-b
"#;
    let gateway =
        spawn_gateway(&gateway_yaml(wal_dir.path(), &sink.base_url(), api_keys, "")).await;

    // Fill until the soft quota rejects.
    let mut last_status = 0;
    for i in 0..200 {
        let response = post_batch(
            &gateway,
            "tok-small",
            vec![fresh_entry(&format!("fill-{i}"))],
        )
        .await;
        last_status = response.status().as_u16();
        if last_status == 429 {
            let body: serde_json::Value = response.json().await.unwrap();
            assert_eq!(body["code"], "QUOTA_SOFT");
            break;
        }
        assert_eq!(last_status, 202);
    }
    assert_eq!(last_status, 429, "quota never engaged");

    // The other tenant is unaffected.
    let other = post_batch(&gateway, "tok-b", vec![fresh_entry("fine")]).await;
    assert_eq!(other.status(), 202);
}

#[tokio::test]
async fn sink_outage_buffers_then_delivers_in_order() {
    let sink = MockSink::spawn().await;
    let wal_dir = tempfile::tempdir().unwrap();
    let gateway = spawn_gateway(&gateway_yaml(
        wal_dir.path(),
        &sink.base_url(),
        default_api_keys(),
        "",
    ))
    .await;

    sink.set_status(503);

    for i in 0..5 {
        let response =
            post_batch(&gateway, "tok-a", vec![fresh_entry(&format!("m-{i}"))]).await;
        // Client requests never fail during a sink outage.
        assert_eq!(response.status(), 202);
        gateway.app.wal.seal("tok-a", false).await.unwrap();
    }

    // Segments accumulate while the sink is down.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let tenant = gateway.app.wal.tenants().into_iter().next().unwrap();
    assert_eq!(tenant.sealed().len(), 5);
    assert!(sink.pushes().is_empty());

    sink.set_status(200);
    wait_until("all segments forwarded", || {
        gateway.app.wal.tenants()[0].sealed().is_empty()
    })
    .await;

    // In order, no loss. (Coalescing may batch several segments per push.)
    let messages: Vec<String> = sink
        .lines()
        .iter()
        .map(|line| {
            serde_json::from_str::<serde_json::Value>(line).unwrap()["message"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(messages, vec!["m-0", "m-1", "m-2", "m-3", "m-4"]);
}

#[tokio::test]
async fn poison_batches_are_dropped_not_retried() {
    let sink = MockSink::spawn().await;
    let wal_dir = tempfile::tempdir().unwrap();
    let gateway = spawn_gateway(&gateway_yaml(
        wal_dir.path(),
        &sink.base_url(),
        default_api_keys(),
        "",
    ))
    .await;

    sink.set_status(400);
    assert_eq!(
        post_batch(&gateway, "tok-a", vec![fresh_entry("doomed")]).await.status(),
        202
    );
    gateway.app.wal.seal("tok-a", false).await.unwrap();

    wait_until("poison drop", || {
        gateway.app.wal.tenants()[0].sealed().is_empty()
    })
    .await;
    assert!(sink.pushes().is_empty());

    // The tenant keeps flowing afterwards.
    sink.set_status(200);
    assert_eq!(
        post_batch(&gateway, "tok-a", vec![fresh_entry("alive")]).await.status(),
        202
    );
    gateway.app.wal.seal("tok-a", false).await.unwrap();
    wait_until("recovery push", || !sink.pushes().is_empty()).await;
}

#[tokio::test]
async fn unauthenticated_and_schema_errors() {
    let sink = MockSink::spawn().await;
    let wal_dir = tempfile::tempdir().unwrap();
    let gateway = spawn_gateway(&gateway_yaml(
        wal_dir.path(),
        &sink.base_url(),
        default_api_keys(),
        "",
    ))
    .await;

    // Unknown bearer token.
    let response = post_batch(&gateway, "tok-nope", vec![fresh_entry("x")]).await;
    assert_eq!(response.status(), 401);

    // Missing Authorization entirely.
    let response = reqwest::Client::new()
        .post(format!("{}/v1/logs:ingest", gateway.base))
        .json(&serde_json::json!({"entries": [fresh_entry("x")]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Schema violation.
    let mut bad = fresh_entry("x");
    bad["level"] = serde_json::json!("SHOUTING");
    let response = post_batch(&gateway, "tok-a", vec![bad]).await;
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "SCHEMA_INVALID");

    // Batch entry-count cap.
    let many: Vec<_> = (0..501).map(|i| fresh_entry(&format!("e{i}"))).collect();
    let response = post_batch(&gateway, "tok-a", many).await;
    assert_eq!(response.status(), 413);

    // Admin endpoints refuse non-admin bearers.
    let response = reqwest::Client::new()
        .get(format!("{}/v1/admin/status", gateway.base))
        .bearer_auth("tok-a")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn idempotency_key_replays_the_original_ack() {
    let sink = MockSink::spawn().await;
    let wal_dir = tempfile::tempdir().unwrap();
    let gateway = spawn_gateway(&gateway_yaml(
        wal_dir.path(),
        &sink.base_url(),
        default_api_keys(),
        "",
    ))
    .await;

    let client = reqwest::Client::new();
    let send = || {
        client
            .post(format!("{}/v1/logs:ingest", gateway.base))
            .bearer_auth("tok-a")
            .header("X-Idempotency-Key", "batch-001")
            .json(&serde_json::json!({"entries": [fresh_entry("once")]}))
            .send()
    };

    let first: serde_json::Value = send().await.unwrap().json().await.unwrap();
    let second: serde_json::Value = send().await.unwrap().json().await.unwrap();
    assert_eq!(first, second);

    // Only one batch reached the WAL.
    gateway.app.wal.seal("tok-a", false).await.unwrap();
    wait_until("push", || !sink.pushes().is_empty()).await;
    assert_eq!(sink.lines().len(), 1);
}

#[tokio::test]
async fn ingest_time_is_bounded_by_the_request_window() {
    let sink = MockSink::spawn().await;
    let wal_dir = tempfile::tempdir().unwrap();
    let gateway = spawn_gateway(&gateway_yaml(
        wal_dir.path(),
        &sink.base_url(),
        default_api_keys(),
        "",
    ))
    .await;
    // Stall the sink so the sealed segment stays on disk for inspection.
    sink.set_status(503);

    let before = chrono::Utc::now();
    assert_eq!(post_batch(&gateway, "tok-a", vec![fresh_entry("t")]).await.status(), 202);
    let after = chrono::Utc::now();

    gateway.app.wal.seal("tok-a", false).await.unwrap();
    let tenant = gateway.app.wal.tenants().into_iter().next().unwrap();
    let sealed = tenant.sealed();
    let mut reader = gateway.app.wal.open_reader(&sealed[0]).await.unwrap();
    let (record, _) = reader.next().await.unwrap();
    assert!(record.ingest_time >= before && record.ingest_time <= after);
}

#[tokio::test]
async fn acknowledged_batches_survive_a_restart() {
    let sink = MockSink::spawn().await;
    let wal_dir = tempfile::tempdir().unwrap();
    let yaml = gateway_yaml(wal_dir.path(), &sink.base_url(), default_api_keys(), "");

    let expected: Vec<String> = (0..3).map(|i| format!("keep-{i}")).collect();
    {
        // Stall the sink so nothing is forwarded (and deleted) before the
        // simulated crash.
        sink.set_status(503);
        let gateway = spawn_gateway(&yaml).await;
        for message in &expected {
            assert_eq!(
                post_batch(&gateway, "tok-a", vec![fresh_entry(message)]).await.status(),
                202
            );
        }
        // Dropped without sealing: the active segment is the crash victim.
    }

    let parsed: config::Config = serde_yaml::from_str(&yaml).unwrap();
    let handle = config::Handle::new(config::Snapshot::build(parsed).unwrap());
    let wal = weir::wal::WalManager::new(handle);
    wal.recover().await.unwrap();

    let tenants = wal.tenants();
    assert_eq!(tenants.len(), 1);
    let sealed = tenants[0].sealed();
    assert_eq!(sealed.len(), 1);

    let mut reader = wal.open_reader(&sealed[0]).await.unwrap();
    let mut messages = Vec::new();
    while let Some((record, _)) = reader.next().await {
        let line: serde_json::Value = serde_json::from_str(&record.line).unwrap();
        messages.push(line["message"].as_str().unwrap().to_string());
    }
    assert_eq!(messages, expected);
    assert!(!reader.saw_corruption());
}

#[tokio::test]
async fn readiness_composes_probes() {
    let sink = MockSink::spawn().await;
    let wal_dir = tempfile::tempdir().unwrap();
    let gateway = spawn_gateway(&gateway_yaml(
        wal_dir.path(),
        &sink.base_url(),
        default_api_keys(),
        "",
    ))
    .await;

    // The forwarder loop ticks within a second; the sink probe was taken at
    // spawn. Liveness is unconditional.
    let health: serde_json::Value = reqwest::get(format!("{}/healthz", gateway.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let status = reqwest::get(format!("{}/readyz", gateway.base))
            .await
            .unwrap()
            .status();
        if status == 200 {
            break;
        }
        assert!(Instant::now() < deadline, "gateway never became ready");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let report: serde_json::Value = reqwest::get(format!("{}/readyz", gateway.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["ready"], true);
    for probe in ["sink", "disk", "wal", "forwarder"] {
        assert_eq!(report["probes"][probe]["ok"], true, "probe {probe}");
    }
}

#[tokio::test]
async fn admin_status_reports_tenants_and_forwarder_state() {
    let sink = MockSink::spawn().await;
    let wal_dir = tempfile::tempdir().unwrap();
    let gateway = spawn_gateway(&gateway_yaml(
        wal_dir.path(),
        &sink.base_url(),
        default_api_keys(),
        "",
    ))
    .await;

    assert_eq!(post_batch(&gateway, "tok-a", vec![fresh_entry("x")]).await.status(), 202);

    let status: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/v1/admin/status", gateway.base))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let tenants = status["tenants"].as_array().unwrap();
    assert_eq!(tenants.len(), 1);
    assert_eq!(tenants[0]["name"], "svc-a");
    assert_eq!(tenants[0]["active_segment"], 0);
    assert!(tenants[0]["bytes_on_disk"].as_u64().unwrap() > 0);
}
