//! Forwarding to the real destination

use crate::config::UpstreamConfig;
use crate::error::{ProxyError, UpstreamError};
use crate::Result;
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use reqwest::Method;
use std::time::{Duration, Instant};
use tracing::debug;

/// Headers that describe one connection and never cross the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Copy of `headers` without the connection-level ones; values keep their raw bytes.
pub fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Time from sending the request until the full body was read
    pub latency: Duration,
}

/// HTTP client used for every captured exchange.
///
/// Redirects are returned to the client untouched and the client never goes
/// through a system proxy, so traffic cannot loop back into this one.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(Policy::none())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| ProxyError::Network(format!("Failed to build upstream client: {}", e)))?;

        Ok(Self {
            client,
            default_timeout: config.timeout(),
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn send(
        &self,
        method: &str,
        url: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
        timeout: Option<Duration>,
    ) -> std::result::Result<UpstreamResponse, UpstreamError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| UpstreamError::Request(format!("invalid method {}", method)))?;
        let target = url::Url::parse(url).map_err(|e| UpstreamError::InvalidUrl(format!("{}: {}", url, e)))?;

        let header_map = end_to_end_headers(headers);

        debug!("Forwarding {} {} (timeout {:?})", method, target, timeout);
        let started = Instant::now();

        let exchange = async {
            let response = self
                .client
                .request(method, target)
                .headers(header_map)
                .body(body)
                .send()
                .await
                .map_err(|e| classify(e, timeout))?;

            let status = response.status().as_u16();
            let headers = end_to_end_headers(response.headers());
            let body = response
                .bytes()
                .await
                .map_err(|e| UpstreamError::Body(e.to_string()))?;

            Ok::<_, UpstreamError>((status, headers, body.to_vec()))
        };

        let (status, headers, body) = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| UpstreamError::Timeout(timeout))??;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
            latency: started.elapsed(),
        })
    }
}

fn classify(error: reqwest::Error, timeout: Duration) -> UpstreamError {
    if error.is_timeout() {
        UpstreamError::Timeout(timeout)
    } else if error.is_connect() {
        UpstreamError::Connect(error.to_string())
    } else {
        UpstreamError::Request(error.to_string())
    }
}
