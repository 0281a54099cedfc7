//! Error types for proxy operations

use std::time::Duration;
use thiserror::Error;

/// Main error type for proxy operations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid rule or configuration, rejected before anything is stored
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A transform expression failed against a live payload
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// The real destination could not be reached
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// CA or leaf certificate problems
    #[error("TLS error: {0}")]
    Tls(String),

    /// Listener and socket errors
    #[error("Network error: {0}")]
    Network(String),

    /// Rule id unknown to the rule engine
    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    /// General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while authoring rules or loading configuration.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid transform expression: {0}")]
    InvalidExpression(String),

    #[error("invalid drop status code: {0}")]
    InvalidStatusCode(u16),

    #[error("invalid redirect target: {0}")]
    InvalidRedirect(String),

    #[error("invalid session scope: {0}")]
    InvalidScope(String),

    #[error("invalid configuration file: {0}")]
    InvalidFile(String),
}

/// Failures of an accepted transform expression at evaluation time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("payload is not valid JSON: {0}")]
    NotJson(String),

    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("no value at `{0}`")]
    MissingParent(String),

    #[error("cannot index into `{pointer}`: {reason}")]
    InvalidTarget { pointer: String, reason: String },
}

/// Failures reaching or reading from the real destination.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid destination url: {0}")]
    InvalidUrl(String),

    #[error("failed to read body: {0}")]
    Body(String),
}

impl UpstreamError {
    /// Status code synthesized for the client when forwarding fails
    pub fn status_code(&self) -> u16 {
        match self {
            UpstreamError::Timeout(_) => 504,
            _ => 502,
        }
    }
}
