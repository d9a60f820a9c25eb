//! Numeric point transforms.
//!
//! An expression sees the decoded number as `value` and must produce a
//! number, e.g. `value * 0.1 + 3` or `if(value > 100, 100, value)`. A leading
//! `return` is accepted and ignored.

use evalexpr::ContextWithMutableVariables;

use crate::error::DecodeError;

/// Name the decoded value is bound to inside an expression.
pub const INPUT_VARIABLE: &str = "value";

#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptEngine;

impl ScriptEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn eval(&self, expression: &str, value: f64) -> Result<f64, DecodeError> {
        let formula = normalize(expression);
        let failure = |message: String| DecodeError::Script {
            expression: expression.to_string(),
            message,
        };

        let mut context = evalexpr::HashMapContext::new();
        context
            .set_value(INPUT_VARIABLE.to_string(), evalexpr::Value::Float(value))
            .map_err(|e| failure(e.to_string()))?;

        match evalexpr::eval_with_context(formula, &context).map_err(|e| failure(e.to_string()))? {
            evalexpr::Value::Float(f) => Ok(f),
            evalexpr::Value::Int(i) => Ok(i as f64),
            evalexpr::Value::Boolean(b) => Ok(if b { 1.0 } else { 0.0 }),
            other => Err(failure(format!("expression produced {:?}", other))),
        }
    }
}

fn normalize(expression: &str) -> &str {
    let trimmed = expression.trim();
    trimmed
        .strip_prefix("return ")
        .map(str::trim)
        .unwrap_or(trimmed)
}
