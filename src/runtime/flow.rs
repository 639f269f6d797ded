//! Flow control primitives: expression parsing, comparisons, routing helpers
//!
//! Everything here is pure. Expressions that are not plain dotted paths are
//! handed to the sandbox by the node executor; this module only classifies them.
//!
//! Parameter values are literals unless they are strings starting with `=`, in
//! which case `{{ ... }}` segments are expressions:
//!
//! - `"={{ $json.user.name }}"` resolves to the raw value at that path
//! - `"=Hello {{ $json.name }}!"` renders a string
//! - `"={{ $json.price * 1.2 }}"` is evaluated by the sandbox

use regex::RegexBuilder;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FlowError {
    #[error("Invalid regex '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },
}

/// Root object a dotted path starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    /// The current item (`$json` / `json`)
    Json,
    /// Resolved variables (`$vars` / `vars`)
    Vars,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Body of a single `{{ ... }}`
#[derive(Debug, Clone, PartialEq)]
pub enum ExprBody {
    Path { root: PathRoot, segments: Vec<PathSegment> },
    Script(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Expr(ExprBody),
}

/// Classification of a parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedValue {
    /// Not an expression, use as is
    Literal,
    /// Exactly one `{{ }}`, yields the raw value
    Single(ExprBody),
    /// Text mixed with expressions, yields a string
    Template(Vec<TemplatePart>),
}

/// Classifies a parameter value.
pub fn parse_value(value: &Value) -> ParsedValue {
    match value.as_str().and_then(|s| s.strip_prefix('=')) {
        Some(raw) => parse_expression(raw),
        None => ParsedValue::Literal,
    }
}

/// Parses the text after the leading `=`.
pub fn parse_expression(raw: &str) -> ParsedValue {
    let mut parts = Vec::new();
    let mut rest = raw;

    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };
        if open > 0 {
            parts.push(TemplatePart::Text(rest[..open].to_string()));
        }
        parts.push(TemplatePart::Expr(classify(&after_open[..close])));
        rest = &after_open[close + 2..];
    }
    if !rest.is_empty() {
        parts.push(TemplatePart::Text(rest.to_string()));
    }

    let mut exprs = parts.iter().filter(|p| matches!(p, TemplatePart::Expr(_)));
    let only_expr = exprs.next().cloned();
    let single = exprs.next().is_none()
        && parts
            .iter()
            .all(|p| !matches!(p, TemplatePart::Text(t) if !t.trim().is_empty()));

    match only_expr {
        Some(TemplatePart::Expr(body)) if single => ParsedValue::Single(body),
        _ => ParsedValue::Template(parts),
    }
}

fn classify(body: &str) -> ExprBody {
    let body = body.trim();
    match parse_path(body) {
        Some((root, segments)) => ExprBody::Path { root, segments },
        None => ExprBody::Script(body.to_string()),
    }
}

/// Parses `$json.a.b[0]["c d"]` style paths. Anything else returns `None`.
pub fn parse_path(expr: &str) -> Option<(PathRoot, Vec<PathSegment>)> {
    let (root, mut rest) = take_ident(expr.trim());
    let root = match root {
        "$json" | "json" => PathRoot::Json,
        "$vars" | "vars" => PathRoot::Vars,
        _ => return None,
    };

    let mut segments = Vec::new();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let (ident, tail) = take_ident(after);
            if ident.is_empty() {
                return None;
            }
            segments.push(PathSegment::Key(ident.to_string()));
            rest = tail;
        } else if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']')?;
            let inner = after[..close].trim();
            let quoted = inner
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
            match quoted {
                Some(key) => segments.push(PathSegment::Key(key.to_string())),
                None => segments.push(PathSegment::Index(inner.parse().ok()?)),
            }
            rest = &after[close + 1..];
        } else {
            return None;
        }
    }
    Some((root, segments))
}

fn take_ident(s: &str) -> (&str, &str) {
    let end = s
        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
        .unwrap_or(s.len());
    s.split_at(end)
}

/// Walks a path through objects and arrays.
pub fn lookup<'a>(value: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| match (segment, current) {
        (PathSegment::Key(key), Value::Object(map)) => map.get(key),
        (PathSegment::Key(key), Value::Array(items)) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
        (PathSegment::Index(i), Value::Object(map)) => map.get(&i.to_string()),
        _ => None,
    })
}

/// String form used for templates and string comparisons.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Comparison operators for If and Switch conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    #[serde(alias = "equals")]
    Equal,
    #[serde(alias = "notEquals")]
    NotEqual,
    #[serde(alias = "larger", alias = "gt")]
    Greater,
    #[serde(alias = "largerEqual", alias = "gte")]
    GreaterEqual,
    #[serde(alias = "smaller", alias = "lt")]
    Less,
    #[serde(alias = "smallerEqual", alias = "lte")]
    LessEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,
    IsEmpty,
    IsNotEmpty,
}

/// Evaluates `left <op> right`.
pub fn compare(op: Operation, left: &Value, right: &Value) -> Result<bool, FlowError> {
    let result = match op {
        Operation::Equal => loose_equal(left, right),
        Operation::NotEqual => !loose_equal(left, right),
        Operation::Greater => ordering(left, right).is_some_and(|o| o.is_gt()),
        Operation::GreaterEqual => ordering(left, right).is_some_and(|o| o.is_ge()),
        Operation::Less => ordering(left, right).is_some_and(|o| o.is_lt()),
        Operation::LessEqual => ordering(left, right).is_some_and(|o| o.is_le()),
        Operation::Contains => contains(left, right),
        Operation::NotContains => !contains(left, right),
        Operation::StartsWith => !left.is_null() && to_text(left).starts_with(&to_text(right)),
        Operation::EndsWith => !left.is_null() && to_text(left).ends_with(&to_text(right)),
        Operation::Regex => regex_match(left, right)?,
        Operation::IsEmpty => is_empty(left),
        Operation::IsNotEmpty => !is_empty(left),
    };
    Ok(result)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse().ok(),
        _ => None,
    }
}

/// Equality with number/string coercion (`5 == "5"`, `true == "true"`).
fn loose_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_))
        | (Value::Number(_), Value::String(_))
        | (Value::String(_), Value::Number(_)) => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        (Value::Bool(_), Value::String(_)) | (Value::String(_), Value::Bool(_)) => {
            to_text(left) == to_text(right)
        }
        _ => left == right,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (left, right) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => s.contains(&to_text(needle)),
        Value::Array(items) => items.iter().any(|item| loose_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Matches against a pattern, accepting `/pattern/flags` with i, m and s flags.
fn regex_match(subject: &Value, pattern: &Value) -> Result<bool, FlowError> {
    let raw = to_text(pattern);
    let (body, flags) = match raw.strip_prefix('/').and_then(|s| s.rfind('/').map(|i| (&s[..i], &s[i + 1..]))) {
        Some((body, flags)) if flags.chars().all(|c| "gims".contains(c)) => (body.to_string(), flags.to_string()),
        _ => (raw.clone(), String::new()),
    };

    let regex = RegexBuilder::new(&body)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
        .map_err(|e| FlowError::InvalidRegex {
            pattern: raw.clone(),
            message: e.to_string(),
        })?;
    Ok(regex.is_match(&to_text(subject)))
}

/// How condition results are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Combine {
    #[default]
    And,
    Or,
}

impl<'de> Deserialize<'de> for Combine {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "and" | "all" => Ok(Combine::And),
            "or" | "any" => Ok(Combine::Or),
            other => Err(serde::de::Error::custom(format!("unknown combine mode '{other}'"))),
        }
    }
}

impl Combine {
    /// AND of nothing is true, OR of nothing is false.
    pub fn apply(self, results: impl IntoIterator<Item = bool>) -> bool {
        let mut results = results.into_iter();
        match self {
            Combine::And => results.all(|r| r),
            Combine::Or => results.any(|r| r),
        }
    }
}

/// A single comparison with unresolved operands
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default, alias = "leftValue")]
    pub value1: Value,
    pub operation: Operation,
    #[serde(default, alias = "rightValue")]
    pub value2: Value,
}

/// Parameters of an If node
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IfParameters {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub combine: Combine,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SwitchMode {
    #[default]
    Rules,
    Expression,
}

/// One Switch rule; `value1` falls back to the node-level `value1`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRule {
    #[serde(default)]
    pub value1: Option<Value>,
    pub operation: Operation,
    #[serde(default)]
    pub value2: Value,
    /// Port for matching items, defaults to the rule's position
    #[serde(default)]
    pub output: Option<usize>,
}

/// Parameters of a Switch node
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchParameters {
    #[serde(default)]
    pub mode: SwitchMode,
    #[serde(default)]
    pub value1: Value,
    #[serde(default)]
    pub rules: Vec<SwitchRule>,
    /// Expression mode: yields the output index per item
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub number_outputs: Option<usize>,
    #[serde(default)]
    pub fallback_output: Option<usize>,
}

impl SwitchParameters {
    /// Ports addressable by rules or the index expression.
    pub fn output_count(&self) -> usize {
        let from_rules = self
            .rules
            .iter()
            .enumerate()
            .map(|(i, rule)| rule.output.unwrap_or(i).saturating_add(1))
            .max()
            .unwrap_or(0);
        self.number_outputs.unwrap_or(from_rules).max(from_rules)
    }

    /// Port for unmatched items.
    pub fn fallback_port(&self) -> usize {
        self.fallback_output.unwrap_or_else(|| self.output_count())
    }

    /// Total ports the node emits, fallback included.
    pub fn port_count(&self) -> usize {
        self.output_count().max(self.fallback_port().saturating_add(1))
    }
}

/// Interprets an index-expression result as a port, if it is a valid one.
pub fn route_by_index(value: &Value, outputs: usize) -> Option<usize> {
    let index = as_number(value)?;
    if index < 0.0 || index.fract() != 0.0 {
        return None;
    }
    let index = index as usize;
    (index < outputs).then_some(index)
}
