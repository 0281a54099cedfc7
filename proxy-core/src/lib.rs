//! devproxy core library
//!
//! An embeddable intercepting proxy for development hosts: it terminates TLS
//! with leaves minted from a local root CA, runs every exchange through an
//! ordered rule pipeline, and keeps a bounded capture log with a live feed.

pub mod admin;
pub mod ca;
pub mod capture;
pub mod events;
pub mod filter;
pub mod handlers;
pub mod log_buffer;
pub mod logging;
/// Engine lifecycle
pub mod proxy;
pub mod rules;
pub mod transform;
pub mod trust;
pub mod upstream;

/// Configuration types and utilities
pub mod config;

/// Error types for proxy operations
pub mod error;

pub use admin::{Metrics, MetricsSnapshot};
pub use ca::{
    ensure_certificate_authority, CaMaterial, CertificateAuthority, CertificateAuthorityManager,
    CertificateProvider, InterceptAuthority, LeafCertificate,
};
pub use capture::{CaptureEntry, CapturedBody, ExchangeOutcome, Protocol};
pub use config::ProxyConfig;
pub use error::{ConfigurationError, ProxyError, TransformError, UpstreamError};
pub use events::{EventBroadcaster, ProxyEvent, Subscription};
pub use filter::ScopeMatcher;
pub use handlers::{InterceptHandler, ERROR_HEADER};
pub use log_buffer::LogBuffer;
pub use logging::{init_logging, LoggingConfig};
/// Re-export commonly used types
pub use proxy::{EngineStatus, InterceptionEngine};
pub use rules::{
    Evaluation, EvaluationOutcome, Phase, Rule, RuleAction, RuleEngine, RuleScope, RuleSet,
    RuleSpec, TransformFailurePolicy,
};
pub use transform::{CompiledTransform, PatchEvaluator, Payload, TransformEvaluator};

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
