//! Template and expression evaluation for step parameters and conditions.
//!
//! Templates embed `{{ ... }}` placeholders. A template that is exactly one
//! placeholder yields the typed value behind it; any surrounding literal text
//! turns the result into a concatenated string.
//!
//! Inside a placeholder, a bare path rooted at `vars`, `steps` or `env`
//! (`steps.fetch.output.items[0]`, `steps['my-step'].output`) is resolved by
//! direct traversal of the scope and never errors: a missing path is `null`.
//! Anything else is handed to a JEXL evaluator whose context holds only the
//! `vars`, `steps` and `env` objects; its failures surface as
//! [`ExpressionError`].
//!
//! Everything here is pure: a scope `Value` in, a `Value` out.

use serde_json::{json, Map, Number, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

/// Split a template into literal text and trimmed placeholder bodies.
/// An unterminated `{{` is kept as literal text.
fn split_template(template: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        if start > 0 {
            segments.push(Segment::Literal(&rest[..start]));
        }
        segments.push(Segment::Placeholder(after[..end].trim()));
        rest = &after[end + 2..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    segments
}

/// Whether a string contains at least one complete placeholder.
pub fn has_placeholders(template: &str) -> bool {
    split_template(template)
        .iter()
        .any(|s| matches!(s, Segment::Placeholder(_)))
}

/// Resolve a template against a scope object (`{vars, steps, env}`).
pub fn resolve(template: &str, scope: &Value) -> Result<Value, ExpressionError> {
    let segments = split_template(template);

    let mut placeholders = segments
        .iter()
        .filter_map(|s| match s {
            Segment::Placeholder(expr) => Some(*expr),
            Segment::Literal(_) => None,
        });
    let Some(first) = placeholders.next() else {
        return Ok(Value::String(template.to_string()));
    };

    let only_whitespace_around = segments.iter().all(|s| match s {
        Segment::Literal(text) => text.trim().is_empty(),
        Segment::Placeholder(_) => true,
    });
    if placeholders.next().is_none() && only_whitespace_around {
        return evaluate(first, scope);
    }

    let mut out = String::with_capacity(template.len());
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Placeholder(expr) => out.push_str(&value_to_string(&evaluate(expr, scope)?)),
        }
    }
    Ok(Value::String(out))
}

/// Resolve every string inside a JSON value, recursing into arrays and objects.
pub fn resolve_value(value: &Value, scope: &Value) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => resolve(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_params(map, scope).map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Resolve a step's parameter map.
pub fn resolve_params(
    params: &Map<String, Value>,
    scope: &Value,
) -> Result<Map<String, Value>, ExpressionError> {
    params
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve_value(value, scope)?)))
        .collect()
}

/// Evaluate a condition and coerce it to a boolean.
///
/// Accepts either a template (`"{{ vars.n > 3 }}"`) or a bare expression
/// (`"vars.n > 3"`).
pub fn evaluate_condition(condition: &str, scope: &Value) -> Result<bool, ExpressionError> {
    let value = if has_placeholders(condition) {
        resolve(condition, scope)?
    } else {
        evaluate(condition, scope)?
    };
    Ok(is_truthy(&value))
}

// ---------------------------------------------------------------------------
// Single expressions
// ---------------------------------------------------------------------------

/// Evaluate the body of one placeholder.
pub fn evaluate(expression: &str, scope: &Value) -> Result<Value, ExpressionError> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Ok(Value::Null);
    }

    if let Some(path) = parse_bare_path(expression) {
        return Ok(lookup(scope, &path).cloned().unwrap_or(Value::Null));
    }

    // jexl-eval binds `?:` tighter than comparisons, so the top-level
    // conditional is split off here and its parts evaluated on their own.
    if let Some((condition, then, otherwise)) = split_conditional(expression) {
        let branch = if is_truthy(&evaluate(condition, scope)?) {
            then
        } else {
            otherwise
        };
        return evaluate(branch, scope);
    }

    if !scope.is_object() {
        return Err(ExpressionError::InvalidContext(
            "scope must be a JSON object".to_string(),
        ));
    }

    let rewritten = rewrite_hyphenated_ids(expression);
    let context = to_float_numbers(scope.clone());
    let result = ExpressionEvaluator::new().evaluate_value(&rewritten, &context)?;
    Ok(from_float_numbers(result))
}

// ---------------------------------------------------------------------------
// Bare paths
// ---------------------------------------------------------------------------

const ROOTS: [&str; 3] = ["vars", "steps", "env"];

#[derive(Debug, Clone, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Step ids may contain hyphens; other keys may not, so `vars.n-1` is
/// arithmetic rather than a key named `n-1`.
fn is_step_id_char(c: char) -> bool {
    is_key_char(c) || c == '-'
}

/// Parse `root(.key | [index] | ['key'] | ["key"])*`. Returns `None` for
/// anything that is not a plain path.
fn parse_bare_path(expression: &str) -> Option<Vec<PathSegment>> {
    let root_len = expression
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(expression.len());
    let root = &expression[..root_len];
    if !ROOTS.contains(&root) {
        return None;
    }

    let mut segments = vec![PathSegment::Key(root.to_string())];
    let mut rest = &expression[root_len..];

    while !rest.is_empty() {
        if let Some(after_dot) = rest.strip_prefix('.') {
            let step_id = root == "steps" && segments.len() == 1;
            let len = after_dot
                .find(|c: char| if step_id { !is_step_id_char(c) } else { !is_key_char(c) })
                .unwrap_or(after_dot.len());
            if len == 0 {
                return None;
            }
            segments.push(PathSegment::Key(after_dot[..len].to_string()));
            rest = &after_dot[len..];
        } else if let Some(after_bracket) = rest.strip_prefix('[') {
            let quote = after_bracket.chars().next()?;
            if quote == '\'' || quote == '"' {
                let body = &after_bracket[1..];
                let close = body.find(quote)?;
                segments.push(PathSegment::Key(body[..close].to_string()));
                rest = body[close + 1..].strip_prefix(']')?;
            } else {
                let close = after_bracket.find(']')?;
                let index = after_bracket[..close].parse::<usize>().ok()?;
                segments.push(PathSegment::Index(index));
                rest = &after_bracket[close + 1..];
            }
        } else {
            return None;
        }
    }

    Some(segments)
}

fn lookup<'a>(scope: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    path.iter().try_fold(scope, |current, segment| match (segment, current) {
        (PathSegment::Key(key), Value::Object(map)) => map.get(key),
        (PathSegment::Key(key), Value::Array(items)) => {
            key.parse::<usize>().ok().and_then(|i| items.get(i))
        }
        (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
        _ => None,
    })
}

/// Split `cond ? a : b` at its top level, outside string literals and
/// brackets. Nested conditionals in either branch are left for the
/// recursive call.
fn split_conditional(expression: &str) -> Option<(&str, &str, &str)> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut question = None;
    let mut pending = 0usize;

    for (i, c) in expression.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            '?' if depth == 0 => {
                if question.is_none() {
                    question = Some(i);
                } else {
                    pending += 1;
                }
            }
            ':' if depth == 0 && question.is_some() => {
                if pending == 0 {
                    let q = question?;
                    let condition = expression[..q].trim();
                    let then = expression[q + 1..i].trim();
                    let otherwise = expression[i + 1..].trim();
                    if condition.is_empty() || then.is_empty() || otherwise.is_empty() {
                        return None;
                    }
                    return Some((condition, then, otherwise));
                }
                pending -= 1;
            }
            _ => {}
        }
    }
    None
}

/// Rewrite `steps.my-id` to `steps['my-id']` outside string literals, so
/// hyphenated step ids are not parsed as subtraction.
fn rewrite_hyphenated_ids(expression: &str) -> String {
    let chars: Vec<char> = expression.chars().collect();
    let mut out = String::with_capacity(expression.len() + 8);
    let mut i = 0;
    let mut quote: Option<char> = None;

    while i < chars.len() {
        let c = chars[i];

        if let Some(q) = quote {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        if c == '\'' || c == '"' {
            quote = Some(c);
            out.push(c);
            i += 1;
            continue;
        }

        let boundary = i == 0 || {
            let prev = chars[i - 1];
            !(prev.is_ascii_alphanumeric() || prev == '_' || prev == '.')
        };
        if boundary && chars[i..].starts_with(&['s', 't', 'e', 'p', 's', '.']) {
            let start = i + 6;
            let mut end = start;
            while end < chars.len() && is_step_id_char(chars[end]) {
                end += 1;
            }
            let id: String = chars[start..end].iter().collect();
            if id.contains('-') {
                out.push_str("steps['");
                out.push_str(&id);
                out.push_str("']");
            } else {
                out.push_str("steps.");
                out.push_str(&id);
            }
            i = end;
            continue;
        }

        out.push(c);
        i += 1;
    }

    out
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// Render a value for string concatenation. `null` renders as empty.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JavaScript-like truthiness, with the strings `"false"` and `"0"` also
/// false since interpolated booleans arrive as text.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !(s.is_empty() || s == "false" || s == "0"),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// JEXL works on f64; integers in the scope must be floats for `==` to match
/// numeric literals.
fn to_float_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) if !n.is_f64() => n
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Number(n)),
        Value::Array(items) => Value::Array(items.into_iter().map(to_float_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, to_float_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Turn integral floats back into integers so `{{ vars.n + 1 }}` yields `3`.
fn from_float_numbers(value: Value) -> Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0;
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < MAX_SAFE => json!(f as i64),
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(from_float_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, from_float_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the standard transforms registered.
///
/// Short-lived: built per evaluation so it never crosses an await point.
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
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
            .with_transform("join", |args: &[Value]| {
                let separator = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let joined = match args.first() {
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(value_to_string)
                        .collect::<Vec<_>>()
                        .join(separator),
                    Some(other) => value_to_string(other),
                    None => String::new(),
                };
                Ok(json!(joined))
            })
            .with_transform("json", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(val.to_string()))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!is_truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
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
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}
