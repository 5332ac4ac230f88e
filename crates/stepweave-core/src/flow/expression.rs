//! Expression evaluation and `${...}` interpolation.
//!
//! The engine talks to expressions only through [`ExpressionResolver`]. The
//! default [`JexlResolver`] wraps `jexl_eval::Evaluator` with the standard
//! transforms pre-registered.
//!
//! Values are always passed as context objects, never spliced into
//! expression strings.

use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed for `{expression}`: {message}")]
    EvalFailed { expression: String, message: String },

    #[error("unterminated interpolation in `{0}`")]
    Unterminated(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Resolver trait
// ---------------------------------------------------------------------------

/// Pluggable expression language.
///
/// Implementors provide `evaluate`; interpolation over JSON templates and
/// truthiness are shared.
pub trait ExpressionResolver: Send + Sync {
    /// Evaluate a bare expression (no `${}` wrapper) against `context`.
    fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError>;

    /// Evaluate a condition. Accepts `expr` or `${expr}`.
    fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        let body = expression_body(expression)?;
        self.evaluate(body, context).map(|v| is_truthy(&v))
    }

    /// Evaluate an expression field that may or may not be `${}`-wrapped.
    fn evaluate_expr(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        let body = expression_body(expression)?;
        self.evaluate(body, context)
    }

    /// Resolve a template recursively.
    ///
    /// A string that is exactly one `${expr}` yields the typed value; strings
    /// with embedded expressions yield a string; objects and arrays are
    /// resolved element by element; other values pass through.
    fn resolve(&self, template: &Value, context: &Value) -> Result<Value, ExpressionError> {
        match template {
            Value::String(s) => self.resolve_str(s, context),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (key, value) in fields {
                    out.insert(key.clone(), self.resolve(value, context)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_str(&self, template: &str, context: &Value) -> Result<Value, ExpressionError> {
        let segments = split_template(template)?;
        match segments.as_slice() {
            [] => Ok(Value::String(String::new())),
            [Segment::Expr(expr)] => self.evaluate(expr.trim(), context),
            _ if segments.iter().all(|s| matches!(s, Segment::Literal(_))) => {
                Ok(Value::String(template.to_string()))
            }
            _ => {
                let mut out = String::with_capacity(template.len());
                for segment in &segments {
                    match segment {
                        Segment::Literal(text) => out.push_str(text),
                        Segment::Expr(expr) => {
                            out.push_str(&stringify(&self.evaluate(expr.trim(), context)?))
                        }
                    }
                }
                Ok(Value::String(out))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Template scanning
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub(crate) enum Segment<'a> {
    Literal(&'a str),
    Expr(&'a str),
}

/// Split a string into literal text and `${...}` bodies.
///
/// Braces nest, and braces inside quoted strings are ignored.
pub(crate) fn split_template(template: &str) -> Result<Vec<Segment<'_>>, ExpressionError> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        if start > 0 {
            segments.push(Segment::Literal(&rest[..start]));
        }
        let body_start = start + 2;
        let mut depth = 1usize;
        let mut quote: Option<char> = None;
        let mut end = None;

        for (offset, ch) in rest[body_start..].char_indices() {
            match (quote, ch) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '\'' | '"') => quote = Some(ch),
                (None, '{') => depth += 1,
                (None, '}') => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(body_start + offset);
                        break;
                    }
                }
                _ => {}
            }
        }

        let end = end.ok_or_else(|| ExpressionError::Unterminated(template.to_string()))?;
        segments.push(Segment::Expr(&rest[body_start..end]));
        rest = &rest[end + 1..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

/// The expression inside a fully `${}`-wrapped string, or the string itself.
pub fn expression_body(expression: &str) -> Result<&str, ExpressionError> {
    let trimmed = expression.trim();
    if trimmed.starts_with("${") {
        if let [Segment::Expr(body)] = split_template(trimmed)?.as_slice() {
            return Ok(body.trim());
        }
    }
    Ok(trimmed)
}

/// JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value for embedding in a string. Integral floats print without
/// a fractional part.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => {
                format!("{}", f as i64)
            }
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// JEXL implementation
// ---------------------------------------------------------------------------

/// JEXL-backed resolver with string, boolean and length transforms.
#[derive(Debug, Clone, Copy, Default)]
pub struct JexlResolver;

impl JexlResolver {
    pub fn new() -> Self {
        Self
    }

    fn evaluator() -> jexl_eval::Evaluator<'static> {
        jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = str_arg(args, 0).split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!is_truthy(args.first().unwrap_or(&Value::Null))))
            })
            .with_transform("contains", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).contains(str_arg(args, 1))))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            // Substring match, not regex.
            .with_transform("match", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).contains(str_arg(args, 1))))
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
    }
}

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(|v| v.as_str()).unwrap_or("")
}

impl ExpressionResolver for JexlResolver {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        Self::evaluator()
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }
}
