//! HTTP surface: the ingest route, health and readiness, metrics, and the
//! admin-bearer-guarded flush/status endpoints.

use crate::{auth, ingest, metrics_server, App, Error};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let body = serde_json::json!({
            "code": self.code(),
            "error": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}

pub fn build_router(app: Arc<App>, prom: PrometheusHandle) -> axum::Router {
    let metrics_router = axum::Router::new()
        .route("/metrics", get(metrics_server::render))
        .with_state(prom);

    axum::Router::new()
        .route("/v1/logs:ingest", post(ingest::ingest))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/v1/admin/flush",
            post(admin_flush).route_layer(axum::middleware::from_fn_with_state(
                app.clone(),
                admin_auth,
            )),
        )
        .route(
            "/v1/admin/status",
            get(admin_status).route_layer(axum::middleware::from_fn_with_state(
                app.clone(),
                admin_auth,
            )),
        )
        .with_state(app)
        .merge(metrics_router)
        .layer(axum::middleware::from_fn(track_duration))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn track_duration(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let started = Instant::now();
    let response = next.run(request).await;
    metrics::histogram!("http_request_duration_seconds").record(started.elapsed().as_secs_f64());
    response
}

/// Admin bearer check for the /v1/admin routes.
async fn admin_auth(
    State(app): State<Arc<App>>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let admin_token = app.config.snapshot().config.security.admin_token.clone();
    match auth::bearer(request.headers()) {
        Ok(bearer) if bearer == admin_token => next.run(request).await,
        _ => Error::Unauthenticated.into_response(),
    }
}

async fn healthz() -> impl IntoResponse {
    axum::Json(serde_json::json!({"status": "ok"}))
}

async fn readyz(State(app): State<Arc<App>>) -> axum::response::Response {
    let snapshot = app.config.snapshot();
    let report = app.health.evaluate(
        app.wal.disk_free_ratio(),
        snapshot.config.wal.disk_free_min_ratio,
        wal_root_writable(app.wal.root()),
    );
    let status = if report.ready {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(report)).into_response()
}

fn wal_root_writable(root: &std::path::Path) -> bool {
    std::fs::metadata(root)
        .map(|meta| !meta.permissions().readonly())
        .unwrap_or(false)
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct FlushRequest {
    pub token: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct FlushedSegment {
    pub tenant: String,
    pub seq: u64,
    pub bytes: u64,
}

async fn admin_flush(
    State(app): State<Arc<App>>,
    body: Option<axum::Json<FlushRequest>>,
) -> Result<axum::Json<Vec<FlushedSegment>>, Error> {
    let request = body.map(|axum::Json(request)| request).unwrap_or_default();
    let flushed = app
        .wal
        .flush(request.token.as_deref(), request.force)
        .await?;
    Ok(axum::Json(
        flushed
            .into_iter()
            .map(|handle| FlushedSegment {
                tenant: handle.tenant,
                seq: handle.seq,
                bytes: handle.bytes,
            })
            .collect(),
    ))
}

#[derive(Debug, serde::Serialize)]
struct StatusResponse {
    tenants: Vec<TenantStatusEntry>,
}

#[derive(Debug, serde::Serialize)]
struct TenantStatusEntry {
    #[serde(flatten)]
    wal: crate::wal::TenantStatus,
    forwarder_state: Option<String>,
}

async fn admin_status(State(app): State<Arc<App>>) -> axum::Json<StatusResponse> {
    let forwarder = app.forwarder_status.lock().unwrap().clone();
    let tenants = app
        .wal
        .status()
        .await
        .into_iter()
        .map(|wal| {
            let forwarder_state = forwarder.get(&wal.tenant).cloned();
            TenantStatusEntry {
                wal,
                forwarder_state,
            }
        })
        .collect();
    axum::Json(StatusResponse { tenants })
}
