//! Payload transforms
//!
//! Rules never see the expression syntax directly: they hold a
//! [`CompiledTransform`] produced by a [`TransformEvaluator`] when the rule is
//! authored. The built-in [`PatchEvaluator`] understands a small patch language:
//!
//! ```text
//! set /user/name = "anonymous"
//! remove /token
//! body = {"ok": true}
//! replace "secret-\d+" with "[redacted]"
//! header set x-debug = "1"
//! header remove cookie
//! ```
//!
//! Statements are separated by newlines or `;`. Pointers follow RFC 6901.

use crate::error::{ConfigurationError, TransformError};
use hudsucker::hyper::header::{HeaderMap, HeaderName, HeaderValue};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// The structured payload a transform reads and rewrites.
///
/// Header values keep their raw bytes; only headers a transform touches change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Payload {
    pub fn new(headers: HeaderMap, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// First value of `name`, if it is visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Replace every value of `name` with `value`.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    /// Human-readable rendering, body cut at `max_body` bytes.
    pub fn preview(&self, max_body: usize) -> String {
        let mut out = String::new();
        for (k, v) in &self.headers {
            out.push_str(k.as_str());
            out.push_str(": ");
            out.push_str(&String::from_utf8_lossy(v.as_bytes()));
            out.push('\n');
        }
        out.push('\n');
        let end = self.body.len().min(max_body);
        out.push_str(&String::from_utf8_lossy(&self.body[..end]));
        out
    }
}

/// A parsed, ready-to-run transform. Must be free of side effects.
pub trait CompiledTransform: Send + Sync + fmt::Debug {
    fn apply(&self, payload: &Payload) -> Result<Payload, TransformError>;
}

/// Turns expression source into a [`CompiledTransform`], rejecting bad input up front.
pub trait TransformEvaluator: Send + Sync {
    fn compile(&self, expression: &str) -> Result<Arc<dyn CompiledTransform>, ConfigurationError>;
}

/// Evaluator for the built-in patch language.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchEvaluator;

impl TransformEvaluator for PatchEvaluator {
    fn compile(&self, expression: &str) -> Result<Arc<dyn CompiledTransform>, ConfigurationError> {
        let mut ops = Vec::new();
        for (index, statement) in split_statements(expression).into_iter().enumerate() {
            let op = parse_statement(statement).map_err(|reason| {
                ConfigurationError::InvalidExpression(format!(
                    "statement {} `{}`: {}",
                    index + 1,
                    statement,
                    reason
                ))
            })?;
            ops.push(op);
        }
        if ops.is_empty() {
            return Err(ConfigurationError::InvalidExpression(
                "expression is empty".to_string(),
            ));
        }
        Ok(Arc::new(PatchScript { ops }))
    }
}

#[derive(Debug)]
enum PatchOp {
    Set { pointer: String, value: Value },
    Remove { pointer: String },
    ReplaceBody(Value),
    Replace { pattern: Regex, with: String },
    SetHeader { name: HeaderName, value: HeaderValue },
    RemoveHeader { name: HeaderName },
}

#[derive(Debug)]
struct PatchScript {
    ops: Vec<PatchOp>,
}

impl CompiledTransform for PatchScript {
    fn apply(&self, payload: &Payload) -> Result<Payload, TransformError> {
        let mut out = payload.clone();
        for op in &self.ops {
            match op {
                PatchOp::Set { pointer, value } => {
                    let mut doc = parse_json(&out.body)?;
                    set_pointer(&mut doc, pointer, value.clone())?;
                    out.body = to_json(&doc)?;
                }
                PatchOp::Remove { pointer } => {
                    let mut doc = parse_json(&out.body)?;
                    remove_pointer(&mut doc, pointer)?;
                    out.body = to_json(&doc)?;
                }
                PatchOp::ReplaceBody(value) => {
                    out.body = to_json(value)?;
                }
                PatchOp::Replace { pattern, with } => {
                    let text = std::str::from_utf8(&out.body).map_err(|_| TransformError::NotUtf8)?;
                    out.body = pattern.replace_all(text, with.as_str()).into_owned().into_bytes();
                }
                PatchOp::SetHeader { name, value } => out.set_header(name.clone(), value.clone()),
                PatchOp::RemoveHeader { name } => {
                    out.headers.remove(name);
                }
            }
        }
        Ok(out)
    }
}

fn parse_json(body: &[u8]) -> Result<Value, TransformError> {
    serde_json::from_slice(body).map_err(|e| TransformError::NotJson(e.to_string()))
}

fn to_json(value: &Value) -> Result<Vec<u8>, TransformError> {
    serde_json::to_vec(value).map_err(|e| TransformError::NotJson(e.to_string()))
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn split_pointer(pointer: &str) -> (&str, String) {
    match pointer.rfind('/') {
        Some(idx) => (&pointer[..idx], unescape_token(&pointer[idx + 1..])),
        None => ("", unescape_token(pointer)),
    }
}

fn set_pointer(doc: &mut Value, pointer: &str, value: Value) -> Result<(), TransformError> {
    if pointer.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent_pointer, key) = split_pointer(pointer);
    let parent = doc
        .pointer_mut(parent_pointer)
        .ok_or_else(|| TransformError::MissingParent(parent_pointer.to_string()))?;

    match parent {
        Value::Object(map) => {
            map.insert(key, value);
            Ok(())
        }
        Value::Array(items) => {
            if key == "-" {
                items.push(value);
                return Ok(());
            }
            let index: usize = key.parse().map_err(|_| TransformError::InvalidTarget {
                pointer: pointer.to_string(),
                reason: "array index expected".to_string(),
            })?;
            if index < items.len() {
                items[index] = value;
            } else if index == items.len() {
                items.push(value);
            } else {
                return Err(TransformError::InvalidTarget {
                    pointer: pointer.to_string(),
                    reason: format!("index {} out of bounds", index),
                });
            }
            Ok(())
        }
        _ => Err(TransformError::InvalidTarget {
            pointer: pointer.to_string(),
            reason: "parent is not an object or array".to_string(),
        }),
    }
}

fn remove_pointer(doc: &mut Value, pointer: &str) -> Result<(), TransformError> {
    let (parent_pointer, key) = split_pointer(pointer);
    match doc.pointer_mut(parent_pointer) {
        Some(Value::Object(map)) => {
            map.remove(&key);
        }
        Some(Value::Array(items)) => {
            if let Ok(index) = key.parse::<usize>() {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        // Removing something that is not there leaves the payload as is
        _ => {}
    }
    Ok(())
}

/// Split on `;` and newlines outside of strings and JSON brackets.
fn split_statements(source: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;

    for (idx, ch) in source.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => depth -= 1,
            ';' | '\n' if depth <= 0 => {
                statements.push(&source[start..idx]);
                start = idx + ch.len_utf8();
            }
            _ => {}
        }
    }
    statements.push(&source[start..]);

    statements
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.starts_with('#'))
        .collect()
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(idx) => (&input[..idx], input[idx..].trim_start()),
        None => (input, ""),
    }
}

fn parse_pointer(token: &str) -> Result<String, String> {
    if token.is_empty() || token.starts_with('/') {
        Ok(token.to_string())
    } else {
        Err(format!("pointer `{}` must start with `/`", token))
    }
}

fn parse_assignment(rest: &str) -> Result<&str, String> {
    rest.trim_start()
        .strip_prefix('=')
        .map(str::trim)
        .ok_or_else(|| "expected `=`".to_string())
}

fn parse_json_value(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON value: {}", e))
}

/// Read one JSON string literal, returning it with the unparsed remainder.
fn parse_string_literal(input: &str) -> Result<(String, &str), String> {
    let mut stream = serde_json::Deserializer::from_str(input).into_iter::<String>();
    match stream.next() {
        Some(Ok(value)) => {
            let offset = stream.byte_offset();
            Ok((value, &input[offset..]))
        }
        Some(Err(e)) => Err(format!("invalid string literal: {}", e)),
        None => Err("expected a quoted string".to_string()),
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName, String> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| format!("invalid header name `{}`", name))
}

fn parse_statement(statement: &str) -> Result<PatchOp, String> {
    let (keyword, rest) = split_word(statement);
    match keyword {
        "set" => {
            let (pointer, rest) = split_word(rest);
            let pointer = parse_pointer(pointer)?;
            let value = parse_json_value(parse_assignment(rest)?)?;
            Ok(PatchOp::Set { pointer, value })
        }
        "remove" => {
            let (pointer, trailing) = split_word(rest);
            if !trailing.is_empty() {
                return Err(format!("unexpected `{}`", trailing));
            }
            if pointer.is_empty() {
                return Err("remove needs a pointer".to_string());
            }
            Ok(PatchOp::Remove {
                pointer: parse_pointer(pointer)?,
            })
        }
        "body" => Ok(PatchOp::ReplaceBody(parse_json_value(parse_assignment(rest)?)?)),
        "replace" => {
            let (pattern, rest) = parse_string_literal(rest)?;
            let (with_kw, rest) = split_word(rest);
            if with_kw != "with" {
                return Err("expected `with`".to_string());
            }
            let (with, trailing) = parse_string_literal(rest)?;
            if !trailing.trim().is_empty() {
                return Err(format!("unexpected `{}`", trailing.trim()));
            }
            let pattern = Regex::new(&pattern).map_err(|e| format!("invalid regex: {}", e))?;
            Ok(PatchOp::Replace { pattern, with })
        }
        "header" => {
            let (action, rest) = split_word(rest);
            let (name, rest) = split_word(rest);
            let name = parse_header_name(name)?;
            match action {
                "set" => {
                    let (value, trailing) = parse_string_literal(parse_assignment(rest)?)?;
                    if !trailing.trim().is_empty() {
                        return Err(format!("unexpected `{}`", trailing.trim()));
                    }
                    let value = HeaderValue::from_str(&value)
                        .map_err(|_| format!("invalid value for header `{}`", name))?;
                    Ok(PatchOp::SetHeader { name, value })
                }
                "remove" if rest.is_empty() => Ok(PatchOp::RemoveHeader { name }),
                "remove" => Err(format!("unexpected `{}`", rest)),
                other => Err(format!("unknown header action `{}`", other)),
            }
        }
        other => Err(format!("unknown statement `{}`", other)),
    }
}
