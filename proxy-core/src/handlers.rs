use crate::admin::Metrics;
use crate::capture::{
    CaptureEntry, CapturedBody, Completion, ExchangeMetadata, ExchangeOutcome, HeaderList, Protocol,
};
use crate::config::CaptureConfig;
use crate::filter::ScopeMatcher;
use crate::log_buffer::LogBuffer;
use crate::rules::{Evaluation, EvaluationOutcome, Phase, RuleEngine};
use crate::transform::Payload;
use crate::upstream::{end_to_end_headers, UpstreamClient};
use hudsucker::{
    hyper::{self, header, Body, HeaderMap, Method, Request, Response, StatusCode},
    HttpContext, HttpHandler, RequestOrResponse,
};
use std::sync::{atomic::Ordering, Arc};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Header set on responses the proxy synthesizes for failed exchanges
pub const ERROR_HEADER: &str = "x-devproxy-error";

/// Everything an exchange needs, shared by all clones of the handler.
pub(crate) struct ExchangeContext {
    pub rules: Arc<RuleEngine>,
    pub log: Arc<LogBuffer>,
    pub metrics: Arc<Metrics>,
    pub upstream: UpstreamClient,
    pub scope: ScopeMatcher,
    pub capture: CaptureConfig,
    pub session_header: String,
}

/// hudsucker handler running the capture and rule pipeline.
///
/// hudsucker clones the handler per request; all state lives behind the shared context.
#[derive(Clone)]
pub struct InterceptHandler {
    ctx: Arc<ExchangeContext>,
}

impl InterceptHandler {
    pub(crate) fn new(ctx: ExchangeContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }
}

/// Decrements the active exchange gauge when the exchange task ends.
struct ActiveExchange(Arc<Metrics>);

impl ActiveExchange {
    fn enter(metrics: &Arc<Metrics>) -> Self {
        metrics.active_exchanges.fetch_add(1, Ordering::Relaxed);
        Self(metrics.clone())
    }
}

impl Drop for ActiveExchange {
    fn drop(&mut self) {
        self.0.active_exchanges.fetch_sub(1, Ordering::Relaxed);
    }
}

fn is_upgrade(req: &Request<Body>) -> bool {
    req.headers().contains_key(header::UPGRADE)
}

fn header_list(headers: &hyper::HeaderMap) -> HeaderList {
    headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Full URL as rules see it; default ports are dropped (`https://a.test:443/` becomes `https://a.test/`).
fn normalize_url(uri: &hyper::Uri) -> String {
    let raw = uri.to_string();
    url::Url::parse(&raw).map(String::from).unwrap_or(raw)
}

fn build_response(status: u16, headers: &HeaderMap, body: Vec<u8>) -> Response<Body> {
    let mut res = Response::new(Body::from(body));
    *res.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    *res.headers_mut() = end_to_end_headers(headers);
    res
}

fn synthesized(status: u16, error_kind: &'static str, message: &str) -> (u16, HeaderMap, Vec<u8>) {
    let mut headers = HeaderMap::new();
    headers.insert(ERROR_HEADER, header::HeaderValue::from_static(error_kind));
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    (status, headers, message.as_bytes().to_vec())
}

/// Merge phase results into the ordered, de-duplicated list of touching rules.
fn merge_rule_ids(target: &mut Vec<String>, eval: &Evaluation) {
    for id in &eval.matched_rule_ids {
        if !target.contains(id) {
            target.push(id.clone());
        }
    }
}

fn absorb(metadata: &mut ExchangeMetadata, metrics: &Metrics, eval: &mut Evaluation) {
    metrics
        .transform_failures
        .fetch_add(eval.transform_failures.len() as u64, Ordering::Relaxed);
    metadata.transform_failures.append(&mut eval.transform_failures);
    metadata.debug_traces.append(&mut eval.debug_traces);
}

impl ExchangeContext {
    /// Complete an entry whose client never delivered the request body.
    fn abandon(&self, entry_id: u64, started: Instant, status: u16, error: String) -> Response<Body> {
        let metadata = ExchangeMetadata {
            error: Some(error),
            ..Default::default()
        };
        self.log.update(
            entry_id,
            Completion {
                request_body: None,
                status,
                headers: Vec::new(),
                body: CapturedBody::empty(),
                duration_ms: started.elapsed().as_millis() as u64,
                upstream_latency_ms: None,
                destination: None,
                outcome: ExchangeOutcome::ClientAborted,
                applied_rule_ids: Vec::new(),
                metadata,
            },
        );
        build_response(status, &HeaderMap::new(), Vec::new())
    }

    async fn run_exchange(&self, req: Request<Body>) -> Response<Body> {
        let started = Instant::now();
        let _active = ActiveExchange::enter(&self.metrics);
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

        let (parts, body) = req.into_parts();
        let method = parts.method.to_string();
        let url = normalize_url(&parts.uri);
        let protocol = if parts.uri.scheme_str() == Some("https") {
            Protocol::Tls
        } else {
            Protocol::Plain
        };
        let session_id = parts
            .headers
            .get(self.session_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Both phases see the rules as they were when the request arrived
        let rules = self.rules.snapshot();

        // The body is filled in on completion
        let entry_id = self.log.append(CaptureEntry::new(
            method.clone(),
            url.clone(),
            protocol,
            session_id.clone(),
            header_list(&parts.headers),
            CapturedBody::empty(),
        ));
        self.metrics.captured.fetch_add(1, Ordering::Relaxed);
        info!("Exchange [{}] {} {}", entry_id, method, url);

        let body = match tokio::time::timeout(self.capture.body_read_timeout(), hyper::body::to_bytes(body)).await {
            Ok(Ok(bytes)) => bytes.to_vec(),
            Ok(Err(e)) => {
                warn!("Exchange [{}] client aborted request body: {}", entry_id, e);
                return self.abandon(entry_id, started, 400, format!("client aborted request body: {}", e));
            }
            Err(_) => {
                warn!("Exchange [{}] timed out reading request body", entry_id);
                return self.abandon(entry_id, started, 408, "timed out reading request body".to_string());
            }
        };
        let request_body = CapturedBody::capture(&body, self.capture.max_body_size);

        let mut forward_headers = parts.headers;
        forward_headers.remove(self.session_header.as_str());

        let mut metadata = ExchangeMetadata::default();
        let mut applied = Vec::new();
        let mut destination = None;
        let mut upstream_latency = None;

        let mut req_eval = rules.evaluate(
            Phase::Request,
            &url,
            session_id.as_deref(),
            Payload::new(forward_headers, body),
        );
        merge_rule_ids(&mut applied, &req_eval);
        absorb(&mut metadata, &self.metrics, &mut req_eval);

        let (outcome, (status, headers, body)) = match req_eval.outcome.clone() {
            EvaluationOutcome::Drop { status } => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Exchange [{}] dropped with {}", entry_id, status);
                (ExchangeOutcome::Dropped, (status, HeaderMap::new(), Vec::new()))
            }
            EvaluationOutcome::Failed { rule_id } => {
                metadata.error = Some(format!("request transform {} failed", rule_id));
                (
                    ExchangeOutcome::TransformFailed,
                    synthesized(502, "transform", "request transform failed"),
                )
            }
            redirect_or_continue => {
                let target = match redirect_or_continue {
                    EvaluationOutcome::Redirect { target } => {
                        self.metrics.redirected.fetch_add(1, Ordering::Relaxed);
                        destination = Some(target.clone());
                        target
                    }
                    _ => url.clone(),
                };
                let payload = req_eval.payload;

                match self
                    .upstream
                    .send(&method, &target, &payload.headers, payload.body, req_eval.timeout)
                    .await
                {
                    Err(e) => {
                        self.metrics.upstream_failures.fetch_add(1, Ordering::Relaxed);
                        warn!("Exchange [{}] upstream failure: {}", entry_id, e);
                        metadata.error = Some(e.to_string());
                        (
                            ExchangeOutcome::UpstreamFailed,
                            synthesized(e.status_code(), "upstream", &e.to_string()),
                        )
                    }
                    Ok(res) => {
                        upstream_latency = Some(res.latency.as_millis() as u64);
                        let mut res_eval = rules.evaluate(
                            Phase::Response,
                            &url,
                            session_id.as_deref(),
                            Payload::new(res.headers, res.body),
                        );
                        merge_rule_ids(&mut applied, &res_eval);
                        absorb(&mut metadata, &self.metrics, &mut res_eval);

                        match res_eval.outcome {
                            EvaluationOutcome::Failed { rule_id } => {
                                metadata.error = Some(format!("response transform {} failed", rule_id));
                                (
                                    ExchangeOutcome::TransformFailed,
                                    synthesized(502, "transform", "response transform failed"),
                                )
                            }
                            _ => {
                                let outcome = if destination.is_some() {
                                    ExchangeOutcome::Redirected
                                } else {
                                    ExchangeOutcome::Forwarded
                                };
                                (outcome, (res.status, res_eval.payload.headers, res_eval.payload.body))
                            }
                        }
                    }
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let completed = self.log.update(
            entry_id,
            Completion {
                request_body: Some(request_body),
                status,
                headers: header_list(&headers),
                body: CapturedBody::capture(&body, self.capture.max_body_size),
                duration_ms,
                upstream_latency_ms: upstream_latency,
                destination,
                outcome,
                applied_rule_ids: applied,
                metadata,
            },
        );
        if !completed {
            debug!("Exchange [{}] finished after leaving the buffer", entry_id);
        }
        info!("Exchange [{}] {} in {}ms ({:?})", entry_id, status, duration_ms, outcome);

        build_response(status, &headers, body)
    }
}

#[async_trait::async_trait]
impl HttpHandler for InterceptHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        // Tunnels and upgrades are left to hudsucker
        if req.method() == Method::CONNECT || is_upgrade(&req) {
            return RequestOrResponse::Request(req);
        }

        if let Some(host) = req.uri().host() {
            if !self.ctx.scope.is_allowed(host) {
                debug!("Out of scope, forwarding uncaptured: {}", req.uri());
                return RequestOrResponse::Request(req);
            }
        }

        // A client hanging up drops this future, not the exchange
        let ctx = self.ctx.clone();
        let exchange = tokio::spawn(async move { ctx.run_exchange(req).await });

        match exchange.await {
            Ok(res) => RequestOrResponse::Response(res),
            Err(e) => {
                error!("Exchange task failed: {}", e);
                let (status, headers, body) = synthesized(502, "internal", "exchange failed");
                RequestOrResponse::Response(build_response(status, &headers, body))
            }
        }
    }
}
