//! Expression and template gateway.
//!
//! Wraps `jexl_eval::Evaluator` (conditions, value expressions, reduce folds)
//! and a sandboxed `minijinja::Environment` (prompt, log and argument
//! templates) behind one call surface.
//!
//! **Security note:** bindings are always passed as context objects, NEVER
//! interpolated into expression or template strings. Neither evaluator has
//! filesystem, network or process access.

use std::collections::BTreeMap;

use minijinja::Environment;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation or template rendering.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("failed to evaluate `{expression}`: {message}")]
    EvalFailed { expression: String, message: String },

    #[error("unknown name '{name}' in `{expression}`{hint}")]
    UnknownName {
        expression: String,
        name: String,
        /// Either empty or a leading-newline "Did you mean" suggestion.
        hint: String,
    },

    #[error("failed to render template `{template}`: {message}")]
    RenderFailed { template: String, message: String },

    #[error("`{expression}` evaluated to {found}, expected {expected}")]
    UnexpectedType {
        expression: String,
        expected: &'static str,
        found: String,
    },

    #[error("invalid bindings: {0}")]
    InvalidContext(String),
}

impl ExpressionError {
    /// The expression or template text that failed.
    pub fn source_text(&self) -> Option<&str> {
        match self {
            ExpressionError::EvalFailed { expression, .. }
            | ExpressionError::UnknownName { expression, .. }
            | ExpressionError::UnexpectedType { expression, .. } => Some(expression),
            ExpressionError::RenderFailed { template, .. } => Some(template),
            ExpressionError::InvalidContext(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator plus sandboxed template environment.
///
/// Registered transforms:
/// - strings: `lower`, `upper`, `trim`, `split`, `contains`, `startsWith`, `endsWith`
/// - values: `not`, `length`, `keys`, `values`
/// - lists: `append`, `concat`, `first`, `last`
pub struct TaskEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
    templates: Environment<'static>,
}

impl TaskEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().unwrap_or(&Value::Null);
                Ok(json!(!value_to_bool(val)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<&String> = match args.first() {
                    Some(Value::Object(o)) => o.keys().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(keys))
            })
            .with_transform("values", |args: &[Value]| {
                let values: Vec<&Value> = match args.first() {
                    Some(Value::Object(o)) => o.values().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(values))
            })
            // List folding helpers used by map-reduce `reduce` expressions
            .with_transform("append", |args: &[Value]| {
                let mut list = into_list(args.first().cloned().unwrap_or(Value::Null));
                list.push(args.get(1).cloned().unwrap_or(Value::Null));
                Ok(Value::Array(list))
            })
            .with_transform("concat", |args: &[Value]| {
                let mut list = into_list(args.first().cloned().unwrap_or(Value::Null));
                list.extend(into_list(args.get(1).cloned().unwrap_or(Value::Null)));
                Ok(Value::Array(list))
            })
            .with_transform("first", |args: &[Value]| {
                Ok(match args.first() {
                    Some(Value::Array(a)) => a.first().cloned().unwrap_or(Value::Null),
                    _ => Value::Null,
                })
            })
            .with_transform("last", |args: &[Value]| {
                Ok(match args.first() {
                    Some(Value::Array(a)) => a.last().cloned().unwrap_or(Value::Null),
                    _ => Value::Null,
                })
            });

        let mut templates = Environment::new();
        templates.set_trim_blocks(true);
        templates.set_lstrip_blocks(true);

        Self {
            evaluator,
            templates,
        }
    }

    /// Evaluate an expression and return the raw JSON value.
    ///
    /// Root names the expression references must exist in `bindings`; an
    /// unknown name fails with a closest-match suggestion when one exists.
    pub fn evaluate(&self, expression: &str, bindings: &Value) -> Result<Value, ExpressionError> {
        let names = bindings.as_object().ok_or_else(|| {
            ExpressionError::InvalidContext("bindings must be a JSON object".to_string())
        })?;

        for name in root_identifiers(expression) {
            if !names.contains_key(&name) {
                let hint = closest_name(&name, names.keys())
                    .map(|candidate| format!("\nDid you mean '{candidate}' instead of '{name}'?"))
                    .unwrap_or_default();
                return Err(ExpressionError::UnknownName {
                    expression: expression.to_string(),
                    name,
                    hint,
                });
            }
        }

        self.evaluator
            .eval_in_context(expression, bindings)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }

    /// Evaluate an expression and coerce the result with JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, bindings: &Value) -> Result<bool, ExpressionError> {
        self.evaluate(expression, bindings)
            .map(|result| value_to_bool(&result))
    }

    /// Evaluate an expression that must produce a list.
    pub fn evaluate_list(
        &self,
        expression: &str,
        bindings: &Value,
    ) -> Result<Vec<Value>, ExpressionError> {
        match self.evaluate(expression, bindings)? {
            Value::Array(items) => Ok(items),
            other => Err(ExpressionError::UnexpectedType {
                expression: expression.to_string(),
                expected: "a list",
                found: type_name(&other).to_string(),
            }),
        }
    }

    /// Evaluate every expression of a key -> expression map into one object.
    pub fn evaluate_map(
        &self,
        expressions: &BTreeMap<String, String>,
        bindings: &Value,
    ) -> Result<Value, ExpressionError> {
        let mut out = serde_json::Map::with_capacity(expressions.len());
        for (key, expression) in expressions {
            out.insert(key.clone(), self.evaluate(expression, bindings)?);
        }
        Ok(Value::Object(out))
    }

    /// Render a string template.
    pub fn render_str(&self, template: &str, bindings: &Value) -> Result<String, ExpressionError> {
        self.templates
            .render_str(template, bindings)
            .map_err(|e| ExpressionError::RenderFailed {
                template: template.to_string(),
                message: e.to_string(),
            })
    }

    /// Render every string leaf of a nested structure, leaving other leaves
    /// untouched. Bindings named in `skip_vars` are hidden from templates.
    ///
    /// The result is built separately from `input`, so a failure anywhere
    /// leaves nothing half-rendered.
    pub fn render(
        &self,
        input: &Value,
        bindings: &Value,
        skip_vars: &[&str],
    ) -> Result<Value, ExpressionError> {
        let visible = match bindings {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(name, _)| !skip_vars.contains(&name.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            _ => {
                return Err(ExpressionError::InvalidContext(
                    "bindings must be a JSON object".to_string(),
                ));
            }
        };
        self.render_nested(input, &visible)
    }

    fn render_nested(&self, input: &Value, bindings: &Value) -> Result<Value, ExpressionError> {
        match input {
            Value::String(template) => self.render_str(template, bindings).map(Value::String),
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_nested(item, bindings))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key.clone(), self.render_nested(value, bindings)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

impl Default for TaskEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn into_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

const KEYWORDS: [&str; 4] = ["true", "false", "null", "in"];

/// Names an expression reads from its bindings.
///
/// Skips string literals, property accesses (`a.b`), transform names
/// (`a|lower`) and object-literal keys (`{key: 1}`).
fn root_identifiers(expression: &str) -> Vec<String> {
    let chars: Vec<char> = expression.chars().collect();
    let mut names = Vec::new();
    let mut prev_significant: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' {
            i += 1;
            while i < chars.len() && chars[i] != c {
                if chars[i] == '\\' {
                    i += 1;
                }
                i += 1;
            }
            i += 1;
            prev_significant = Some(c);
            continue;
        }
        if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
            prev_significant = Some('0');
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            let next_significant = chars[i..].iter().find(|c| !c.is_whitespace()).copied();
            let is_member = matches!(prev_significant, Some('.') | Some('|'));
            let is_key = next_significant == Some(':');
            if !is_member && !is_key && !KEYWORDS.contains(&ident.as_str()) && !names.contains(&ident) {
                names.push(ident);
            }
            prev_significant = Some('a');
            continue;
        }
        if !c.is_whitespace() {
            prev_significant = Some(c);
        }
        i += 1;
    }
    names
}

/// Closest known name within a small edit distance of `unknown`.
fn closest_name<'a>(unknown: &str, known: impl Iterator<Item = &'a String>) -> Option<&'a str> {
    let budget = (unknown.chars().count() / 3).max(1);
    known
        .map(|candidate| (edit_distance(unknown, candidate), candidate))
        .filter(|(distance, _)| *distance <= budget)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate.as_str())
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for i in 1..=a.len() {
        let mut diagonal = row[0];
        row[0] = i;
        for j in 1..=b.len() {
            let above = row[j];
            let cost = usize::from(a[i - 1] != b[j - 1]);
            row[j] = (row[j] + 1).min(row[j - 1] + 1).min(diagonal + cost);
            diagonal = above;
        }
    }
    row[b.len()]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
