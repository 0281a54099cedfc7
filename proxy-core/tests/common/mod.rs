#![allow(dead_code)]

use axum::{
    extract::Path,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use devproxy_core::{CaMaterial, InterceptionEngine, ProxyConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestProxy {
    pub engine: Arc<InterceptionEngine>,
    pub port: u16,
    pub ca: CaMaterial,
    _storage: TempDir,
}

impl TestProxy {
    /// Client routed through the proxy that trusts its CA.
    pub fn client(&self) -> reqwest::Client {
        self.client_builder().build().unwrap()
    }

    pub fn client_builder(&self) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://127.0.0.1:{}", self.port)).unwrap())
            .add_root_certificate(reqwest::Certificate::from_pem(self.ca.cert_pem.as_bytes()).unwrap())
            .redirect(reqwest::redirect::Policy::none())
    }
}

pub fn test_config(storage: &TempDir) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.certificate.storage_path = storage.path().to_path_buf();
    config.shutdown_grace_ms = 500;
    config.upstream.timeout_ms = 2_000;
    config
}

pub async fn start_proxy(tune: impl FnOnce(&mut ProxyConfig)) -> TestProxy {
    let storage = tempfile::tempdir().unwrap();
    let mut config = test_config(&storage);
    tune(&mut config);

    let engine = Arc::new(InterceptionEngine::new(config).unwrap());
    let port = engine.start(None, None).await.unwrap();
    let ca = engine.ca_material().unwrap();

    TestProxy {
        engine,
        port,
        ca,
        _storage: storage,
    }
}

/// Binary payload served by `/bytes`
pub fn binary_payload() -> Vec<u8> {
    (0..4096u32).map(|i| (i * 31 % 256) as u8).collect()
}

async fn echo(Path(rest): Path<String>, headers: HeaderMap) -> Json<serde_json::Value> {
    let headers: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().into()))
        .collect();
    Json(serde_json::json!({ "path": format!("/echo/{}", rest), "headers": headers }))
}

/// Answers with a non-UTF-8 `x-name` header and echoes the raw `x-sent` bytes as the body.
async fn raw_header(headers: HeaderMap) -> impl IntoResponse {
    let sent = headers
        .get("x-sent")
        .map(|v| v.as_bytes().to_vec())
        .unwrap_or_default();
    let name = HeaderValue::from_bytes(b"r\xe9s").unwrap();
    ([("x-name", name)], sent)
}

/// Local plain-HTTP destination; returns its base URL.
pub async fn start_upstream() -> String {
    let app = Router::new()
        .route(
            "/bytes",
            get(|| async { ([("content-type", "application/octet-stream")], binary_payload()) }),
        )
        .route(
            "/json",
            get(|| async { Json(serde_json::json!({ "user": "alice", "token": "t-123" })) }),
        )
        .route("/text", get(|| async { "hello" }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                "slow"
            }),
        )
        .route("/teapot", get(|| async { (StatusCode::IM_A_TEAPOT, "short and stout") }))
        .route("/echo/*rest", get(echo))
        .route("/raw-header", get(raw_header));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// A port nothing listens on.
pub fn dead_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
