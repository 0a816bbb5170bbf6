//! Expression Evaluation
//!
//! The engine treats expression evaluation as an opaque capability: Repeat
//! uses it to compute its element collection and leaf states use it to
//! render templated parameters. Hosts plug in their own evaluator through
//! [`ExpressionEvaluator`]; [`ContextEvaluator`] is the built-in one.
//!
//! # Built-in syntax
//!
//! - Any JSON literal: `["a", "b"]`, `"PARALLEL"`, `42`
//! - `elements.<type>`: payload of the most recent element of that type
//! - `elements.<type>.name`: its name
//! - `elements.<type>.<field>[.<field>...]`: a field path into its payload
//!
//! An expression may be wrapped in `${ ... }`.

use serde_json::Value;
use thiserror::Error;

use super::element::{ContextStack, ElementType};

/// Failure to evaluate or render an expression.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("expression '{0}' could not be resolved")]
    Unresolved(String),

    #[error("invalid expression '{expression}': {reason}")]
    Invalid { expression: String, reason: String },
}

/// Evaluates expressions against an execution's context stack.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluates a single expression to a value.
    fn evaluate(&self, expression: &str, context: &ContextStack) -> Result<Value, ExpressionError>;

    /// Replaces every `${ ... }` occurrence in `template` with its value.
    ///
    /// String values are inserted verbatim, anything else as JSON.
    fn render(&self, template: &str, context: &ContextStack) -> Result<String, ExpressionError> {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            output.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| ExpressionError::Invalid {
                expression: template.to_string(),
                reason: "unterminated '${'".to_string(),
            })?;

            match self.evaluate(after[..end].trim(), context)? {
                Value::String(s) => output.push_str(&s),
                other => output.push_str(&other.to_string()),
            }
            rest = &after[end + 1..];
        }

        output.push_str(rest);
        Ok(output)
    }
}

/// Built-in evaluator resolving JSON literals and context element lookups.
#[derive(Debug, Clone, Default)]
pub struct ContextEvaluator;

impl ContextEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for ContextEvaluator {
    fn evaluate(&self, expression: &str, context: &ContextStack) -> Result<Value, ExpressionError> {
        let expression = strip_wrapper(expression.trim());

        if expression.is_empty() {
            return Err(ExpressionError::Invalid {
                expression: expression.to_string(),
                reason: "empty expression".to_string(),
            });
        }

        if let Ok(value) = serde_json::from_str::<Value>(expression) {
            return Ok(value);
        }

        let Some(path) = expression.strip_prefix("elements.") else {
            return Err(ExpressionError::Unresolved(expression.to_string()));
        };

        let mut segments = path.split('.');
        let type_name = segments.next().unwrap_or_default();
        let element_type = ElementType::parse(type_name);
        let element = context
            .latest(&element_type)
            .ok_or_else(|| ExpressionError::Unresolved(expression.to_string()))?;

        let fields: Vec<&str> = segments.collect();
        match fields.as_slice() {
            [] => Ok(element.payload().clone()),
            ["name"] => Ok(Value::String(element.name().to_string())),
            fields => {
                let fields = match fields {
                    ["payload", tail @ ..] => tail,
                    all => all,
                };
                let mut current = element.payload();
                for field in fields {
                    current = lookup_field(current, field)
                        .ok_or_else(|| ExpressionError::Unresolved(expression.to_string()))?;
                }
                Ok(current.clone())
            }
        }
    }
}

fn strip_wrapper(expression: &str) -> &str {
    expression
        .strip_prefix("${")
        .and_then(|inner| inner.strip_suffix('}'))
        .map(str::trim)
        .unwrap_or(expression)
}

fn lookup_field<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(field),
        Value::Array(items) => field.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}
