//! Typed variable values.
//!
//! A value is always one of three scalar kinds. Conversions between kinds
//! only happen through [`Value::cast`] and [`Value::parse_as`]; nothing in
//! the engine coerces implicitly.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// Declared type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    String,
    #[serde(alias = "int", alias = "integer", alias = "float")]
    Number,
    #[serde(alias = "bool")]
    Boolean,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::String(_) => ValueType::String,
            Self::Number(_) => ValueType::Number,
            Self::Boolean(_) => ValueType::Boolean,
        }
    }

    /// False only for boolean `false`, the empty string and numeric zero.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Boolean(b) => *b,
            Self::Number(n) => *n != 0.0,
            Self::String(s) => !s.is_empty(),
        }
    }

    /// Numeric view used by comparisons: numbers, and strings holding a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => parse_number(s),
            Self::Boolean(_) => None,
        }
    }

    /// Parse raw text into a value of the given type.
    pub fn parse_as(text: &str, target: ValueType) -> Result<Value, FlowError> {
        match target {
            ValueType::String => Ok(Value::String(text.to_string())),
            ValueType::Number => parse_number(text)
                .map(Value::Number)
                .ok_or_else(|| cast_failure(text, target)),
            ValueType::Boolean => parse_bool(text)
                .map(Value::Boolean)
                .ok_or_else(|| cast_failure(text, target)),
        }
    }

    pub fn cast(&self, target: ValueType) -> Result<Value, FlowError> {
        match (self, target) {
            (Self::String(s), _) => Self::parse_as(s, target),
            (_, ValueType::String) => Ok(Value::String(self.to_string())),
            (Self::Number(_), ValueType::Number) | (Self::Boolean(_), ValueType::Boolean) => {
                Ok(self.clone())
            }
            (Self::Number(n), ValueType::Boolean) => Ok(Value::Boolean(*n != 0.0)),
            (Self::Boolean(b), ValueType::Number) => Ok(Value::Number(if *b { 1.0 } else { 0.0 })),
        }
    }

    /// Map a JSON field from structured agent output onto a flat value.
    /// Arrays, objects and null are kept as compact JSON text.
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => Value::Number(f),
                None => Value::String(n.to_string()),
            },
            other => Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Number(n) => f.write_str(&format_number(*n)),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// Parse finite decimal text. `NaN` and infinities are not numbers here.
pub fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Accepted boolean spellings, case-insensitive.
pub fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "on" | "1" => Some(true),
        "false" | "no" | "n" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Integral numbers print without a fractional part so that `{{count}}`
/// renders as `3`, not `3.0`.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn cast_failure(text: &str, target: ValueType) -> FlowError {
    FlowError::CastFailure {
        value: text.to_string(),
        target,
    }
}
