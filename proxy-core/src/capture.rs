//! Captured exchange records

use crate::rules::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered header list; duplicates (e.g. `set-cookie`) are kept.
pub type HeaderList = Vec<(String, String)>;

/// Wire protocol the client used for an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Plain,
    Tls,
}

/// How an exchange ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeOutcome {
    Forwarded,
    Redirected,
    Dropped,
    TransformFailed,
    UpstreamFailed,
    /// The client went away or stalled before its request body arrived
    ClientAborted,
}

/// A body as stored in the log, capped at the configured size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedBody {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Size of the body on the wire, before truncation
    pub size: usize,
    pub truncated: bool,
}

impl CapturedBody {
    pub fn capture(body: &[u8], max_size: usize) -> Self {
        let truncated = body.len() > max_size;
        let kept = if truncated { &body[..max_size] } else { body };
        Self {
            data: kept.to_vec(),
            size: body.len(),
            truncated,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// A transform that failed against a live payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformFailure {
    pub rule_id: String,
    pub phase: Phase,
    pub message: String,
    /// True when the rule failed the exchange closed
    pub failed_closed: bool,
}

/// Before/after snapshot recorded for rules with the debug flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTrace {
    pub rule_id: String,
    pub phase: Phase,
    pub before: String,
    pub after: String,
    pub elapsed_us: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeMetadata {
    pub transform_failures: Vec<TransformFailure>,
    pub debug_traces: Vec<RuleTrace>,
    /// Upstream or synthesized error detail
    pub error: Option<String>,
}

/// One logical request/response exchange.
///
/// Created with the request side filled in; [`CaptureEntry::complete`] fills the
/// response side exactly once. The id is assigned by the log buffer on append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub protocol: Protocol,
    pub session_id: Option<String>,
    pub request_headers: HeaderList,
    pub request_body: CapturedBody,
    /// Resolved destination when a redirect rule applied
    pub destination: Option<String>,
    pub response_status: Option<u16>,
    pub response_headers: Option<HeaderList>,
    pub response_body: Option<CapturedBody>,
    pub duration_ms: Option<u64>,
    /// Time spent waiting on the real destination; absent when it was never contacted
    pub upstream_latency_ms: Option<u64>,
    pub outcome: Option<ExchangeOutcome>,
    pub applied_rule_ids: Vec<String>,
    pub metadata: ExchangeMetadata,
}

impl CaptureEntry {
    pub fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        protocol: Protocol,
        session_id: Option<String>,
        request_headers: HeaderList,
        request_body: CapturedBody,
    ) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            method: method.into(),
            url: url.into(),
            protocol,
            session_id,
            request_headers,
            request_body,
            destination: None,
            response_status: None,
            response_headers: None,
            response_body: None,
            duration_ms: None,
            upstream_latency_ms: None,
            outcome: None,
            applied_rule_ids: Vec::new(),
            metadata: ExchangeMetadata::default(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }

    /// Apply the completion patch. Returns false if the entry was already completed.
    pub fn complete(&mut self, patch: Completion) -> bool {
        if self.is_complete() {
            return false;
        }
        if let Some(body) = patch.request_body {
            self.request_body = body;
        }
        self.destination = patch.destination;
        self.response_status = Some(patch.status);
        self.response_headers = Some(patch.headers);
        self.response_body = Some(patch.body);
        self.duration_ms = Some(patch.duration_ms);
        self.upstream_latency_ms = patch.upstream_latency_ms;
        self.outcome = Some(patch.outcome);
        self.applied_rule_ids = patch.applied_rule_ids;
        self.metadata = patch.metadata;
        true
    }
}

/// Response-side fields written when an exchange finishes.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Request body, when it was read after the entry was appended
    pub request_body: Option<CapturedBody>,
    pub status: u16,
    pub headers: HeaderList,
    pub body: CapturedBody,
    pub duration_ms: u64,
    pub upstream_latency_ms: Option<u64>,
    pub destination: Option<String>,
    pub outcome: ExchangeOutcome,
    pub applied_rule_ids: Vec<String>,
    pub metadata: ExchangeMetadata,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CaptureEntry {
        CaptureEntry::new(
            "GET",
            "http://example.test/",
            Protocol::Plain,
            None,
            vec![("accept".into(), "*/*".into())],
            CapturedBody::empty(),
        )
    }

    fn completion(status: u16) -> Completion {
        Completion {
            request_body: Some(CapturedBody::capture(b"payload", 16)),
            status,
            headers: Vec::new(),
            body: CapturedBody::capture(b"ok", 16),
            duration_ms: 3,
            upstream_latency_ms: Some(2),
            destination: None,
            outcome: ExchangeOutcome::Forwarded,
            applied_rule_ids: vec!["r1".into()],
            metadata: ExchangeMetadata::default(),
        }
    }

    #[test]
    fn test_body_truncation() {
        let body = CapturedBody::capture(b"0123456789", 4);
        assert!(body.truncated);
        assert_eq!(body.data, b"0123");
        assert_eq!(body.size, 10);

        let small = CapturedBody::capture(b"abc", 4);
        assert!(!small.truncated);
        assert_eq!(small.data, b"abc");
    }

    #[test]
    fn test_completes_exactly_once() {
        let mut e = entry();
        assert!(!e.is_complete());
        assert!(e.response_status.is_none());

        assert!(e.complete(completion(200)));
        assert_eq!(e.response_status, Some(200));
        assert_eq!(e.request_body.data, b"payload");
        assert_eq!(e.applied_rule_ids, vec!["r1".to_string()]);

        assert!(!e.complete(completion(500)));
        assert_eq!(e.response_status, Some(200));
    }

    #[test]
    fn test_body_serializes_as_base64() {
        let body = CapturedBody::capture(b"hi", 16);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["data"], "aGk=");

        let back: CapturedBody = serde_json::from_value(json).unwrap();
        assert_eq!(back, body);
    }
}
