//! Rule storage and evaluation
//!
//! Rules live in a copy-on-write list. Every exchange takes a [`RuleSet`]
//! snapshot when it arrives and evaluates both phases against it, so edits
//! made while an exchange is in flight only affect later exchanges.

use crate::capture::{RuleTrace, TransformFailure};
use crate::error::{ConfigurationError, ProxyError};
use crate::events::{EventBroadcaster, ProxyEvent};
use crate::transform::{CompiledTransform, PatchEvaluator, Payload, TransformEvaluator};
use crate::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default status for drop rules without an explicit code
pub const DEFAULT_DROP_STATUS: u16 = 403;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Request,
    Response,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Request => f.write_str("request"),
            Phase::Response => f.write_str("response"),
        }
    }
}

/// Which exchanges a rule applies to. Serialized as `global` or `session:<id>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum RuleScope {
    #[default]
    Global,
    Session(String),
}

impl RuleScope {
    pub fn session(id: impl Into<String>) -> Self {
        RuleScope::Session(id.into())
    }

    pub fn matches(&self, session_id: Option<&str>) -> bool {
        match self {
            RuleScope::Global => true,
            RuleScope::Session(id) => session_id == Some(id.as_str()),
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleScope::Global => f.write_str("global"),
            RuleScope::Session(id) => write!(f, "session:{}", id),
        }
    }
}

impl FromStr for RuleScope {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "global" {
            return Ok(RuleScope::Global);
        }
        match s.strip_prefix("session:") {
            Some(id) if !id.trim().is_empty() => Ok(RuleScope::Session(id.to_string())),
            _ => Err(ConfigurationError::InvalidScope(s.to_string())),
        }
    }
}

impl Serialize for RuleScope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RuleScope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// What happens to the exchange when a transform fails on a live payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformFailurePolicy {
    /// Keep the payload as it was before the failing rule and continue
    #[default]
    PassThrough,
    /// Stop evaluation and answer with a synthesized error
    FailClosed,
}

fn default_transform_phase() -> Phase {
    Phase::Request
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    Passthrough,
    Drop {
        #[serde(default)]
        status_code: Option<u16>,
    },
    Redirect {
        target_template: String,
    },
    Transform {
        expression: String,
        #[serde(default = "default_transform_phase")]
        applies_to: Phase,
        #[serde(default)]
        on_error: TransformFailurePolicy,
    },
}

impl RuleAction {
    pub fn drop_with(status_code: u16) -> Self {
        RuleAction::Drop {
            status_code: Some(status_code),
        }
    }

    pub fn redirect(target_template: impl Into<String>) -> Self {
        RuleAction::Redirect {
            target_template: target_template.into(),
        }
    }

    pub fn transform(expression: impl Into<String>, applies_to: Phase) -> Self {
        RuleAction::Transform {
            expression: expression.into(),
            applies_to,
            on_error: TransformFailurePolicy::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Rule as authored, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    /// Regular expression tested against the full request URL
    pub pattern: String,
    #[serde(default)]
    pub scope: RuleScope,
    pub action: RuleAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub debug: bool,
    /// Upstream timeout override for exchanges this rule matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl RuleSpec {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>, action: RuleAction) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            scope: RuleScope::Global,
            action,
            enabled: true,
            debug: false,
            timeout_ms: None,
        }
    }

    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(flatten)]
    pub spec: RuleSpec,
    pub created_at: DateTime<Utc>,
}

/// A validated rule with its pattern and transform ready to run.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: Rule,
    pattern: Regex,
    transform: Option<Arc<dyn CompiledTransform>>,
}

impl CompiledRule {
    fn compile(rule: Rule, evaluator: &dyn TransformEvaluator) -> Result<Self> {
        let spec = &rule.spec;
        let pattern = Regex::new(&spec.pattern).map_err(|source| ConfigurationError::InvalidPattern {
            pattern: spec.pattern.clone(),
            source,
        })?;

        if let RuleScope::Session(id) = &spec.scope {
            if id.trim().is_empty() {
                return Err(ConfigurationError::InvalidScope(spec.scope.to_string()).into());
            }
        }

        let mut transform = None;
        match &spec.action {
            RuleAction::Passthrough => {}
            RuleAction::Drop { status_code } => {
                let status = status_code.unwrap_or(DEFAULT_DROP_STATUS);
                if !(200..=599).contains(&status) {
                    return Err(ConfigurationError::InvalidStatusCode(status).into());
                }
            }
            RuleAction::Redirect { target_template } => {
                validate_redirect(&pattern, target_template)?;
            }
            RuleAction::Transform { expression, .. } => {
                transform = Some(evaluator.compile(expression)?);
            }
        }

        Ok(Self {
            rule,
            pattern,
            transform,
        })
    }

    pub fn id(&self) -> &str {
        &self.rule.id
    }

    fn applies(&self, url: &str, session_id: Option<&str>) -> bool {
        self.rule.spec.enabled
            && self.rule.spec.scope.matches(session_id)
            && self.pattern.is_match(url)
    }
}

/// Check capture references against the pattern and that the literal parts form a URL.
fn validate_redirect(pattern: &Regex, template: &str) -> std::result::Result<(), ConfigurationError> {
    let reference = Regex::new(r"\$(?:\{([^}]*)\}|([A-Za-z0-9_]+))")
        .map_err(|e| ConfigurationError::InvalidRedirect(e.to_string()))?;

    for caps in reference.captures_iter(template) {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let known = match name.parse::<usize>() {
            Ok(index) => index < pattern.captures_len(),
            Err(_) => pattern.capture_names().flatten().any(|n| n == name),
        };
        if !known {
            return Err(ConfigurationError::InvalidRedirect(format!(
                "`{}` references unknown group `{}`",
                template, name
            )));
        }
    }

    let literal = reference.replace_all(template, "x");
    let parsed = url::Url::parse(&literal)
        .map_err(|e| ConfigurationError::InvalidRedirect(format!("`{}`: {}", template, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigurationError::InvalidRedirect(format!(
            "`{}`: scheme must be http or https",
            template
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// Forward (request phase) or deliver (response phase) the payload
    Continue,
    Drop { status: u16 },
    Redirect { target: String },
    /// A fail-closed transform failed
    Failed { rule_id: String },
}

/// Result of running one phase of the rule chain.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub outcome: EvaluationOutcome,
    pub payload: Payload,
    pub matched_rule_ids: Vec<String>,
    pub transform_failures: Vec<TransformFailure>,
    pub debug_traces: Vec<RuleTrace>,
    /// Smallest timeout override among matched rules
    pub timeout: Option<Duration>,
}

impl Evaluation {
    fn new(payload: Payload) -> Self {
        Self {
            outcome: EvaluationOutcome::Continue,
            payload,
            matched_rule_ids: Vec::new(),
            transform_failures: Vec::new(),
            debug_traces: Vec::new(),
            timeout: None,
        }
    }

    fn record_match(&mut self, rule: &Rule) {
        self.matched_rule_ids.push(rule.id.clone());
        if let Some(ms) = rule.spec.timeout_ms {
            let timeout = Duration::from_millis(ms);
            self.timeout = Some(self.timeout.map_or(timeout, |t| t.min(timeout)));
        }
    }
}

/// Immutable view of the rule list at one instant, in creation order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Arc<Vec<Arc<CompiledRule>>>,
    debug_snapshot_size: usize,
}

impl RuleSet {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(|r| &r.rule)
    }

    pub fn evaluate(
        &self,
        phase: Phase,
        url: &str,
        session_id: Option<&str>,
        payload: Payload,
    ) -> Evaluation {
        let mut eval = Evaluation::new(payload);

        for compiled in self.rules.iter() {
            if !compiled.applies(url, session_id) {
                continue;
            }
            let rule = &compiled.rule;
            let started = Instant::now();
            let before = rule
                .spec
                .debug
                .then(|| eval.payload.preview(self.debug_snapshot_size));

            let mut stop = false;
            match &rule.spec.action {
                RuleAction::Passthrough => eval.record_match(rule),
                RuleAction::Drop { status_code } if phase == Phase::Request => {
                    eval.record_match(rule);
                    eval.outcome = EvaluationOutcome::Drop {
                        status: status_code.unwrap_or(DEFAULT_DROP_STATUS),
                    };
                    stop = true;
                }
                RuleAction::Redirect { target_template } if phase == Phase::Request => {
                    eval.record_match(rule);
                    let mut target = String::new();
                    if let Some(caps) = compiled.pattern.captures(url) {
                        caps.expand(target_template, &mut target);
                    }
                    debug!("Rule {} redirects {} -> {}", rule.id, url, target);
                    eval.outcome = EvaluationOutcome::Redirect { target };
                    stop = true;
                }
                RuleAction::Transform {
                    applies_to,
                    on_error,
                    ..
                } if *applies_to == phase => {
                    eval.record_match(rule);
                    let Some(transform) = &compiled.transform else {
                        continue;
                    };
                    match transform.apply(&eval.payload) {
                        Ok(next) => eval.payload = next,
                        Err(e) => {
                            let failed_closed = *on_error == TransformFailurePolicy::FailClosed;
                            warn!(
                                "Transform rule {} failed in {} phase for {}: {}",
                                rule.id, phase, url, e
                            );
                            eval.transform_failures.push(TransformFailure {
                                rule_id: rule.id.clone(),
                                phase,
                                message: e.to_string(),
                                failed_closed,
                            });
                            if failed_closed {
                                eval.outcome = EvaluationOutcome::Failed {
                                    rule_id: rule.id.clone(),
                                };
                                stop = true;
                            }
                        }
                    }
                }
                // Action does not apply in this phase
                _ => continue,
            }

            if let Some(before) = before {
                eval.debug_traces.push(RuleTrace {
                    rule_id: rule.id.clone(),
                    phase,
                    before,
                    after: eval.payload.preview(self.debug_snapshot_size),
                    elapsed_us: started.elapsed().as_micros() as u64,
                });
            }
            if stop {
                break;
            }
        }

        eval
    }
}

/// Owner of the rule collection.
pub struct RuleEngine {
    rules: RwLock<Arc<Vec<Arc<CompiledRule>>>>,
    evaluator: Arc<dyn TransformEvaluator>,
    events: Arc<EventBroadcaster>,
    debug_snapshot_size: usize,
}

impl fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.rules.read().len())
            .field("debug_snapshot_size", &self.debug_snapshot_size)
            .finish()
    }
}

impl RuleEngine {
    pub fn new(events: Arc<EventBroadcaster>) -> Self {
        Self::with_evaluator(events, Arc::new(PatchEvaluator))
    }

    pub fn with_evaluator(events: Arc<EventBroadcaster>, evaluator: Arc<dyn TransformEvaluator>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
            evaluator,
            events,
            debug_snapshot_size: 4 * 1024,
        }
    }

    pub fn with_debug_snapshot_size(mut self, size: usize) -> Self {
        self.debug_snapshot_size = size;
        self
    }

    /// Validate and append a rule; returns its id.
    pub fn add_rule(&self, spec: RuleSpec) -> Result<String> {
        let rule = Rule {
            id: Uuid::new_v4().to_string(),
            spec,
            created_at: Utc::now(),
        };
        let compiled = Arc::new(CompiledRule::compile(rule, self.evaluator.as_ref())?);
        let id = compiled.rule.id.clone();

        let mut guard = self.rules.write();
        let mut next = guard.as_ref().clone();
        next.push(compiled.clone());
        *guard = Arc::new(next);
        self.events.publish(ProxyEvent::RuleAdded {
            rule: compiled.rule.clone(),
        });

        info!("Added rule {} ({})", id, compiled.rule.spec.name);
        Ok(id)
    }

    /// Validate every spec first, then add them all.
    pub fn load_rules(&self, specs: Vec<RuleSpec>) -> Result<Vec<String>> {
        for spec in &specs {
            let probe = Rule {
                id: String::new(),
                spec: spec.clone(),
                created_at: Utc::now(),
            };
            CompiledRule::compile(probe, self.evaluator.as_ref())?;
        }
        specs.into_iter().map(|spec| self.add_rule(spec)).collect()
    }

    /// Replace a rule's definition, keeping its id and position.
    pub fn update_rule(&self, rule_id: &str, spec: RuleSpec) -> Result<Rule> {
        let mut guard = self.rules.write();
        let position = Self::position(&guard, rule_id)?;
        let current = &guard[position].rule;
        let rule = Rule {
            id: current.id.clone(),
            spec,
            created_at: current.created_at,
        };
        let compiled = Arc::new(CompiledRule::compile(rule, self.evaluator.as_ref())?);

        let mut next = guard.as_ref().clone();
        next[position] = compiled.clone();
        *guard = Arc::new(next);
        self.events.publish(ProxyEvent::RuleUpdated {
            rule: compiled.rule.clone(),
        });

        info!("Updated rule {}", rule_id);
        Ok(compiled.rule.clone())
    }

    pub fn delete_rule(&self, rule_id: &str) -> Result<()> {
        let mut guard = self.rules.write();
        let position = Self::position(&guard, rule_id)?;

        let mut next = guard.as_ref().clone();
        next.remove(position);
        *guard = Arc::new(next);
        self.events.publish(ProxyEvent::RuleDeleted {
            rule_id: rule_id.to_string(),
        });

        info!("Deleted rule {}", rule_id);
        Ok(())
    }

    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<Rule> {
        let mut guard = self.rules.write();
        let position = Self::position(&guard, rule_id)?;

        let mut compiled = guard[position].as_ref().clone();
        compiled.rule.spec.enabled = enabled;
        let rule = compiled.rule.clone();

        let mut next = guard.as_ref().clone();
        next[position] = Arc::new(compiled);
        *guard = Arc::new(next);
        self.events.publish(ProxyEvent::RuleUpdated { rule: rule.clone() });

        debug!("Rule {} enabled={}", rule_id, enabled);
        Ok(rule)
    }

    pub fn list_rules(&self) -> Vec<Rule> {
        self.rules.read().iter().map(|r| r.rule.clone()).collect()
    }

    pub fn get_rule(&self, rule_id: &str) -> Result<Rule> {
        self.rules
            .read()
            .iter()
            .find(|r| r.id() == rule_id)
            .map(|r| r.rule.clone())
            .ok_or_else(|| ProxyError::RuleNotFound(rule_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Rule list as of now; later mutations do not affect it.
    pub fn snapshot(&self) -> RuleSet {
        RuleSet {
            rules: self.rules.read().clone(),
            debug_snapshot_size: self.debug_snapshot_size,
        }
    }

    pub fn evaluate(
        &self,
        phase: Phase,
        url: &str,
        session_id: Option<&str>,
        payload: Payload,
    ) -> Evaluation {
        self.snapshot().evaluate(phase, url, session_id, payload)
    }

    fn position(rules: &[Arc<CompiledRule>], rule_id: &str) -> Result<usize> {
        rules
            .iter()
            .position(|r| r.id() == rule_id)
            .ok_or_else(|| ProxyError::RuleNotFound(rule_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hudsucker::hyper::header::{HeaderMap, HeaderValue};
    use proptest::prelude::*;

    fn engine() -> RuleEngine {
        RuleEngine::new(Arc::new(EventBroadcaster::new(64)))
    }

    fn json_payload(body: &str) -> Payload {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        Payload::new(headers, body.as_bytes())
    }

    fn body_json(eval: &Evaluation) -> serde_json::Value {
        serde_json::from_slice(&eval.payload.body).unwrap()
    }

    #[test]
    fn test_scope_parsing() {
        assert_eq!("global".parse::<RuleScope>().unwrap(), RuleScope::Global);
        assert_eq!(
            "session:abc".parse::<RuleScope>().unwrap(),
            RuleScope::session("abc")
        );
        assert!("session:".parse::<RuleScope>().is_err());
        assert!("everyone".parse::<RuleScope>().is_err());

        let json = serde_json::to_value(RuleScope::session("s1")).unwrap();
        assert_eq!(json, "session:s1");
    }

    #[test]
    fn test_spec_json_defaults() {
        let spec: RuleSpec = serde_json::from_str(
            r#"{"name":"t","pattern":"^https://","action":{"type":"transform","expression":"remove /a"}}"#,
        )
        .unwrap();
        assert!(spec.enabled);
        assert_eq!(spec.scope, RuleScope::Global);
        assert_eq!(
            spec.action,
            RuleAction::Transform {
                expression: "remove /a".into(),
                applies_to: Phase::Request,
                on_error: TransformFailurePolicy::PassThrough,
            }
        );
    }

    #[test]
    fn test_invalid_rules_rejected_and_not_stored() {
        let engine = engine();
        let bad = [
            RuleSpec::new("p", "(unclosed", RuleAction::Passthrough),
            RuleSpec::new("d", ".*", RuleAction::drop_with(42)),
            RuleSpec::new("d", ".*", RuleAction::drop_with(100)),
            RuleSpec::new("d", ".*", RuleAction::drop_with(199)),
            RuleSpec::new("d", ".*", RuleAction::drop_with(600)),
            RuleSpec::new("t", ".*", RuleAction::transform("frobnicate", Phase::Request)),
            RuleSpec::new("r", "^https://a/(.*)", RuleAction::redirect("https://b/$2")),
            RuleSpec::new("r", ".*", RuleAction::redirect("not a url")),
            RuleSpec::new("r", ".*", RuleAction::redirect("ftp://files.test/")),
            RuleSpec::new("s", ".*", RuleAction::Passthrough).with_scope(RuleScope::session(" ")),
        ];
        for spec in bad {
            let err = engine.add_rule(spec.clone()).unwrap_err();
            assert!(
                matches!(err, ProxyError::Configuration(_)),
                "{:?} gave {:?}",
                spec,
                err
            );
        }
        assert!(engine.is_empty());
    }

    #[test]
    fn test_drop_is_terminal() {
        let engine = engine();
        let drop_id = engine
            .add_rule(RuleSpec::new("block", r"^https://blocked\.test/", RuleAction::drop_with(204)))
            .unwrap();
        engine
            .add_rule(RuleSpec::new("later", ".*", RuleAction::Passthrough))
            .unwrap();

        let eval = engine.evaluate(Phase::Request, "https://blocked.test/x", None, Payload::default());
        assert_eq!(eval.outcome, EvaluationOutcome::Drop { status: 204 });
        assert_eq!(eval.matched_rule_ids, vec![drop_id]);

        // Not applicable to responses
        let eval = engine.evaluate(Phase::Response, "https://blocked.test/x", None, Payload::default());
        assert_eq!(eval.outcome, EvaluationOutcome::Continue);
        assert_eq!(eval.matched_rule_ids.len(), 1);
    }

    #[test]
    fn test_drop_default_status() {
        let engine = engine();
        engine
            .add_rule(RuleSpec::new("block", ".*", RuleAction::Drop { status_code: None }))
            .unwrap();
        let eval = engine.evaluate(Phase::Request, "http://a.test/", None, Payload::default());
        assert_eq!(eval.outcome, EvaluationOutcome::Drop { status: 403 });
    }

    #[test]
    fn test_redirect_expands_captures() {
        let engine = engine();
        engine
            .add_rule(RuleSpec::new(
                "move",
                r"^https://old\.test/(.*)",
                RuleAction::redirect("https://new.test/$1"),
            ))
            .unwrap();
        engine
            .add_rule(RuleSpec::new(
                "named",
                r"^http://(?P<svc>[a-z]+)\.local/",
                RuleAction::redirect("http://127.0.0.1:8080/${svc}/"),
            ))
            .unwrap();

        let eval = engine.evaluate(Phase::Request, "https://old.test/api/42", None, Payload::default());
        assert_eq!(
            eval.outcome,
            EvaluationOutcome::Redirect {
                target: "https://new.test/api/42".into()
            }
        );

        let eval = engine.evaluate(Phase::Request, "http://users.local/x", None, Payload::default());
        assert_eq!(
            eval.outcome,
            EvaluationOutcome::Redirect {
                target: "http://127.0.0.1:8080/users/".into()
            }
        );
    }

    #[test]
    fn test_transforms_chain_in_creation_order() {
        let engine = engine();
        let r1 = engine
            .add_rule(RuleSpec::new(
                "r1",
                "api",
                RuleAction::transform("set /step = 1; set /seen = []", Phase::Response),
            ))
            .unwrap();
        let r2 = engine
            .add_rule(RuleSpec::new(
                "r2",
                "api",
                RuleAction::transform("set /seen/- = \"r2\"; set /step = 2", Phase::Response),
            ))
            .unwrap();

        let eval = engine.evaluate(Phase::Response, "http://a.test/api", None, json_payload("{}"));
        assert_eq!(body_json(&eval), serde_json::json!({"step": 2, "seen": ["r2"]}));
        assert_eq!(eval.matched_rule_ids, vec![r1, r2]);

        // Request phase leaves the payload untouched
        let eval = engine.evaluate(Phase::Request, "http://a.test/api", None, json_payload("{}"));
        assert_eq!(eval.payload.body, b"{}");
        assert!(eval.matched_rule_ids.is_empty());
    }

    #[test]
    fn test_transform_failure_policies() {
        let engine = engine();
        let failing = engine
            .add_rule(RuleSpec::new("needs-json", ".*", RuleAction::transform("set /a = 1", Phase::Request)))
            .unwrap();
        engine
            .add_rule(RuleSpec::new(
                "text",
                ".*",
                RuleAction::transform(r#"replace "hello" with "bye""#, Phase::Request),
            ))
            .unwrap();

        let eval = engine.evaluate(Phase::Request, "http://a.test/", None, Payload::new(HeaderMap::new(), "hello"));
        assert_eq!(eval.outcome, EvaluationOutcome::Continue);
        assert_eq!(eval.payload.body, b"bye");
        assert_eq!(eval.transform_failures.len(), 1);
        assert_eq!(eval.transform_failures[0].rule_id, failing);
        assert!(!eval.transform_failures[0].failed_closed);

        let mut spec = engine.get_rule(&failing).unwrap().spec;
        spec.action = RuleAction::Transform {
            expression: "set /a = 1".into(),
            applies_to: Phase::Request,
            on_error: TransformFailurePolicy::FailClosed,
        };
        engine.update_rule(&failing, spec).unwrap();

        let eval = engine.evaluate(Phase::Request, "http://a.test/", None, Payload::new(HeaderMap::new(), "hello"));
        assert_eq!(eval.outcome, EvaluationOutcome::Failed { rule_id: failing });
        assert_eq!(eval.payload.body, b"hello");
        assert!(eval.transform_failures[0].failed_closed);
    }

    #[test]
    fn test_smallest_timeout_wins() {
        let engine = engine();
        engine
            .add_rule(RuleSpec::new("a", ".*", RuleAction::Passthrough).with_timeout_ms(5_000))
            .unwrap();
        engine
            .add_rule(RuleSpec::new("b", ".*", RuleAction::Passthrough).with_timeout_ms(200))
            .unwrap();
        engine
            .add_rule(RuleSpec::new("c", "nomatch", RuleAction::Passthrough).with_timeout_ms(1))
            .unwrap();

        let eval = engine.evaluate(Phase::Request, "http://a.test/", None, Payload::default());
        assert_eq!(eval.timeout, Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_debug_traces() {
        let engine = engine();
        engine
            .add_rule(
                RuleSpec::new("dbg", ".*", RuleAction::transform("set /x = 2", Phase::Request)).with_debug(true),
            )
            .unwrap();
        engine
            .add_rule(RuleSpec::new("quiet", ".*", RuleAction::transform("set /y = 3", Phase::Request)))
            .unwrap();

        let eval = engine.evaluate(Phase::Request, "http://a.test/", None, json_payload(r#"{"x":1}"#));
        assert_eq!(eval.debug_traces.len(), 1);
        assert!(eval.debug_traces[0].before.contains(r#"{"x":1}"#));
        assert!(eval.debug_traces[0].after.contains(r#""x":2"#));
        assert_eq!(body_json(&eval), serde_json::json!({"x": 2, "y": 3}));
    }

    #[test]
    fn test_disabled_rules_skipped() {
        let engine = engine();
        let id = engine
            .add_rule(RuleSpec::new("block", ".*", RuleAction::drop_with(403)).disabled())
            .unwrap();
        let eval = engine.evaluate(Phase::Request, "http://a.test/", None, Payload::default());
        assert_eq!(eval.outcome, EvaluationOutcome::Continue);

        engine.set_enabled(&id, true).unwrap();
        let eval = engine.evaluate(Phase::Request, "http://a.test/", None, Payload::default());
        assert_eq!(eval.outcome, EvaluationOutcome::Drop { status: 403 });
    }

    #[test]
    fn test_update_keeps_position_and_snapshot_isolation() {
        let engine = engine();
        let first = engine
            .add_rule(RuleSpec::new("first", ".*", RuleAction::transform("set /v = 1", Phase::Request)))
            .unwrap();
        engine
            .add_rule(RuleSpec::new("second", ".*", RuleAction::transform("set /w = 1", Phase::Request)))
            .unwrap();

        let in_flight = engine.snapshot();
        engine
            .update_rule(
                &first,
                RuleSpec::new("first", ".*", RuleAction::drop_with(410)),
            )
            .unwrap();

        let ids: Vec<String> = engine.list_rules().into_iter().map(|r| r.id).collect();
        assert_eq!(ids[0], first);

        // The snapshot taken before the update still transforms
        let old = in_flight.evaluate(Phase::Request, "http://a.test/", None, json_payload("{}"));
        assert_eq!(old.outcome, EvaluationOutcome::Continue);

        let new = engine.evaluate(Phase::Request, "http://a.test/", None, json_payload("{}"));
        assert_eq!(new.outcome, EvaluationOutcome::Drop { status: 410 });

        engine.delete_rule(&first).unwrap();
        let after_delete = engine.evaluate(Phase::Request, "http://a.test/", None, json_payload("{}"));
        assert_eq!(after_delete.outcome, EvaluationOutcome::Continue);
    }

    #[test]
    fn test_unknown_ids() {
        let engine = engine();
        let spec = RuleSpec::new("x", ".*", RuleAction::Passthrough);
        assert!(matches!(engine.update_rule("nope", spec), Err(ProxyError::RuleNotFound(_))));
        assert!(matches!(engine.delete_rule("nope"), Err(ProxyError::RuleNotFound(_))));
        assert!(matches!(engine.set_enabled("nope", false), Err(ProxyError::RuleNotFound(_))));
        assert!(matches!(engine.get_rule("nope"), Err(ProxyError::RuleNotFound(_))));
    }

    #[test]
    fn test_invalid_update_keeps_old_rule() {
        let engine = engine();
        let id = engine
            .add_rule(RuleSpec::new("x", ".*", RuleAction::Passthrough))
            .unwrap();
        let err = engine.update_rule(&id, RuleSpec::new("x", "(", RuleAction::Passthrough));
        assert!(err.is_err());
        assert_eq!(engine.get_rule(&id).unwrap().spec.pattern, ".*");
    }

    #[test]
    fn test_load_rules_is_all_or_nothing() {
        let engine = engine();
        let specs = vec![
            RuleSpec::new("ok", ".*", RuleAction::Passthrough),
            RuleSpec::new("bad", "(", RuleAction::Passthrough),
        ];
        assert!(engine.load_rules(specs).is_err());
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_mutations_publish_events() {
        let events = Arc::new(EventBroadcaster::new(16));
        let mut sub = events.subscribe();
        let engine = RuleEngine::new(events.clone());

        let id = engine
            .add_rule(RuleSpec::new("x", ".*", RuleAction::Passthrough))
            .unwrap();
        engine.set_enabled(&id, false).unwrap();
        engine.delete_rule(&id).unwrap();

        assert!(matches!(sub.recv().await, Some(ProxyEvent::RuleAdded { rule }) if rule.id == id));
        assert!(matches!(sub.recv().await, Some(ProxyEvent::RuleUpdated { rule }) if !rule.spec.enabled));
        assert!(matches!(sub.recv().await, Some(ProxyEvent::RuleDeleted { rule_id }) if rule_id == id));
    }

    proptest! {
        #[test]
        fn prop_global_rules_match_every_session(session in proptest::option::of("[a-z0-9]{1,12}")) {
            let engine = engine();
            engine.add_rule(RuleSpec::new("g", ".*", RuleAction::Passthrough)).unwrap();
            let eval = engine.evaluate(Phase::Request, "http://a.test/", session.as_deref(), Payload::default());
            prop_assert_eq!(eval.matched_rule_ids.len(), 1);
        }

        #[test]
        fn prop_session_rules_never_match_other_sessions(
            owner in "[a-z0-9]{1,12}",
            other in proptest::option::of("[a-z0-9]{1,12}"),
        ) {
            prop_assume!(other.as_deref() != Some(owner.as_str()));
            let engine = engine();
            engine
                .add_rule(RuleSpec::new("s", ".*", RuleAction::drop_with(403)).with_scope(RuleScope::session(owner.clone())))
                .unwrap();

            let eval = engine.evaluate(Phase::Request, "http://a.test/", other.as_deref(), Payload::default());
            prop_assert_eq!(eval.outcome, EvaluationOutcome::Continue);

            let eval = engine.evaluate(Phase::Request, "http://a.test/", Some(owner.as_str()), Payload::default());
            prop_assert_eq!(eval.outcome, EvaluationOutcome::Drop { status: 403 });
        }
    }
}
