use crate::{
    error::ProxyError,
    proxy::InterceptionEngine,
    rules::{Rule, RuleSpec},
    Result,
};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

/// Shared state for metrics
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub active_exchanges: AtomicU64,
    pub captured: AtomicU64,
    pub dropped: AtomicU64,
    pub redirected: AtomicU64,
    pub transform_failures: AtomicU64,
    pub upstream_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub active_exchanges: u64,
    pub captured: u64,
    pub dropped: u64,
    pub redirected: u64,
    pub transform_failures: u64,
    pub upstream_failures: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            active_exchanges: self.active_exchanges.load(Ordering::Relaxed),
            captured: self.captured.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            redirected: self.redirected.load(Ordering::Relaxed),
            transform_failures: self.transform_failures.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct StatusResponse {
    running: bool,
    port: Option<u16>,
    captures: usize,
    capacity: usize,
    rules: usize,
    subscribers: usize,
}

#[derive(Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

/// Maps core errors onto HTTP statuses with a JSON `{ "error": ... }` body.
struct ApiError(ProxyError);

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ProxyError::Configuration(_) => StatusCode::BAD_REQUEST,
            ProxyError::RuleNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;
type SharedEngine = Arc<InterceptionEngine>;

pub fn router(engine: SharedEngine) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/captures", get(list_captures).delete(clear_captures))
        .route("/captures/:id", get(get_capture))
        .route("/rules", get(list_rules).post(create_rule))
        .route("/rules/:id", get(get_rule).put(update_rule).delete(delete_rule))
        .route("/rules/:id/enabled", put(set_rule_enabled))
        .route("/ca.pem", get(ca_handler))
        .route("/events", get(events_handler))
        .with_state(engine)
}

pub async fn start_admin_server(addr: SocketAddr, engine: SharedEngine) -> Result<()> {
    info!("Starting Admin API on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        ProxyError::Network(format!("Failed to bind admin address {}: {}", addr, e))
    })?;

    axum::serve(listener, router(engine))
        .await
        .map_err(|e| ProxyError::Network(format!("Admin server failed: {}", e)))?;

    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status_handler(State(engine): State<SharedEngine>) -> Json<StatusResponse> {
    let status = engine.status().await;
    Json(StatusResponse {
        running: status.running,
        port: status.port,
        captures: engine.log().len(),
        capacity: engine.log().capacity(),
        rules: engine.rules().len(),
        subscribers: engine.events().subscriber_count(),
    })
}

async fn metrics_handler(State(engine): State<SharedEngine>) -> Json<MetricsSnapshot> {
    Json(engine.metrics().snapshot())
}

async fn list_captures(State(engine): State<SharedEngine>) -> impl IntoResponse {
    Json(engine.snapshot())
}

async fn clear_captures(State(engine): State<SharedEngine>) -> StatusCode {
    engine.log().clear();
    StatusCode::NO_CONTENT
}

async fn get_capture(State(engine): State<SharedEngine>, Path(id): Path<u64>) -> Response {
    match engine.log().get(id) {
        Some(entry) => Json(entry).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("Capture not found: {}", id) })),
        )
            .into_response(),
    }
}

async fn list_rules(State(engine): State<SharedEngine>) -> Json<Vec<Rule>> {
    Json(engine.rules().list_rules())
}

async fn create_rule(
    State(engine): State<SharedEngine>,
    Json(spec): Json<RuleSpec>,
) -> ApiResult<(StatusCode, Json<Rule>)> {
    let id = engine.rules().add_rule(spec)?;
    let rule = engine.rules().get_rule(&id)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn get_rule(State(engine): State<SharedEngine>, Path(id): Path<String>) -> ApiResult<Json<Rule>> {
    Ok(Json(engine.rules().get_rule(&id)?))
}

async fn update_rule(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    Json(spec): Json<RuleSpec>,
) -> ApiResult<Json<Rule>> {
    Ok(Json(engine.rules().update_rule(&id, spec)?))
}

async fn delete_rule(State(engine): State<SharedEngine>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    engine.rules().delete_rule(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_rule_enabled(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    Json(body): Json<EnabledRequest>,
) -> ApiResult<Json<Rule>> {
    Ok(Json(engine.rules().set_enabled(&id, body.enabled)?))
}

async fn ca_handler(State(engine): State<SharedEngine>) -> Response {
    match engine.ca_material() {
        Some(ca) => ([(header::CONTENT_TYPE, "application/x-pem-file")], ca.cert_pem).into_response(),
        None => (StatusCode::NOT_FOUND, "proxy has not been started").into_response(),
    }
}

async fn events_handler(
    State(engine): State<SharedEngine>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = engine.subscribe().into_stream().map(|event| {
        Ok(Event::default().json_data(&event).unwrap_or_else(|e| {
            warn!("Failed to encode event: {}", e);
            Event::default().comment("encoding error")
        }))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn engine() -> SharedEngine {
        Arc::new(InterceptionEngine::new(ProxyConfig::default()).unwrap())
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let req = builder
            .body(Body::from(body.unwrap_or_default().to_string()))
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let app = router(engine());
        let (status, json) = call(app.clone(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");

        let (status, json) = call(app, "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["running"], false);
        assert_eq!(json["capacity"], 200);
    }

    #[tokio::test]
    async fn test_rule_crud() {
        let engine = engine();
        let app = router(engine.clone());

        let (status, created) = call(
            app.clone(),
            "POST",
            "/rules",
            Some(r#"{"name":"block","pattern":"^https://blocked\\.test/","action":{"type":"drop","status_code":204}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["scope"], "global");
        assert_eq!(engine.rules().len(), 1);

        let (status, listed) = call(app.clone(), "GET", "/rules", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, rule) = call(
            app.clone(),
            "PUT",
            &format!("/rules/{}/enabled", id),
            Some(r#"{"enabled":false}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rule["enabled"], false);

        let (status, _) = call(app.clone(), "DELETE", &format!("/rules/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, json) = call(app, "GET", &format!("/rules/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains(&id));
    }

    #[tokio::test]
    async fn test_invalid_rule_is_bad_request() {
        let engine = engine();
        let app = router(engine.clone());
        let (status, json) = call(
            app,
            "POST",
            "/rules",
            Some(r#"{"name":"bad","pattern":"(","action":{"type":"passthrough"}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("pattern"));
        assert!(engine.rules().is_empty());
    }

    #[tokio::test]
    async fn test_captures_endpoints() {
        let app = router(engine());
        let (status, json) = call(app.clone(), "GET", "/captures", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!([]));

        let (status, _) = call(app.clone(), "GET", "/captures/7", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(app.clone(), "DELETE", "/captures", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(app, "GET", "/ca.pem", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_shape() {
        let engine = engine();
        engine.metrics().dropped.fetch_add(2, Ordering::Relaxed);
        let (status, json) = call(router(engine), "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["dropped"], 2);
        assert_eq!(json["total_requests"], 0);
    }
}
