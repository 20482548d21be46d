//! Branch conditions.
//!
//! ```text
//! condition := '!' field | field | field op literal
//! op        := '==' | '!=' | '>' | '<' | '>=' | '<='
//! literal   := quoted-string | number | bare-identifier
//! ```
//!
//! A field is a variable name or a positional reference (`$1`).
//! Comparisons are numeric when both sides parse as numbers and textual
//! otherwise.

use std::cmp::Ordering;
use std::fmt;

use crate::error::FlowError;
use crate::models::value::parse_number;
use crate::variables::VariableStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Gt => ordering == Ordering::Greater,
            Self::Lt => ordering == Ordering::Less,
            Self::Ge => ordering != Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Truthy(String),
    Negated(String),
    Compare {
        field: String,
        op: CompareOp,
        literal: String,
    },
}

impl Condition {
    pub fn parse(text: &str) -> Result<Self, FlowError> {
        let invalid = |reason: &str| FlowError::InvalidCondition {
            condition: text.to_string(),
            reason: reason.to_string(),
        };

        let source = text.trim();
        if source.is_empty() {
            return Err(invalid("empty condition"));
        }

        if let Some(rest) = source.strip_prefix('!') {
            if rest.starts_with('=') {
                return Err(invalid("missing field before '!='"));
            }
            let rest = rest.trim_start();
            let (field, tail) = split_field(rest).ok_or_else(|| invalid("expected a field after '!'"))?;
            if !tail.trim().is_empty() {
                return Err(invalid("a negated check takes a single field"));
            }
            return Ok(Condition::Negated(field.to_string()));
        }

        let (field, tail) = split_field(source).ok_or_else(|| invalid("expected a field name"))?;
        let tail = tail.trim_start();
        if tail.is_empty() {
            return Ok(Condition::Truthy(field.to_string()));
        }

        let (op, rest) = split_op(tail).ok_or_else(|| invalid("expected a comparison operator"))?;
        let literal = parse_literal(rest.trim()).map_err(|reason| invalid(&reason))?;
        Ok(Condition::Compare {
            field: field.to_string(),
            op,
            literal,
        })
    }

    /// Evaluate against `store`. Pure; never mutates the store.
    pub fn evaluate(&self, store: &VariableStore) -> Result<bool, FlowError> {
        match self {
            Condition::Truthy(field) => Ok(store.get(field).is_some_and(|v| v.is_truthy())),
            Condition::Negated(field) => Ok(!store.get(field).is_some_and(|v| v.is_truthy())),
            Condition::Compare { field, op, literal } => {
                let value = store
                    .get(field)
                    .ok_or_else(|| FlowError::UndefinedVariable(field.clone()))?;
                let ordering = match (value.as_number(), parse_number(literal)) {
                    (Some(lhs), Some(rhs)) => lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal),
                    _ => value.to_string().as_str().cmp(literal.as_str()),
                };
                Ok(op.holds(ordering))
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Truthy(field) => f.write_str(field),
            Condition::Negated(field) => write!(f, "!{}", field),
            Condition::Compare { field, op, literal } => {
                write!(f, "{} {} {:?}", field, op.as_str(), literal)
            }
        }
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(condition: &str, store: &VariableStore) -> Result<bool, FlowError> {
    Condition::parse(condition)?.evaluate(store)
}

fn split_field(input: &str) -> Option<(&str, &str)> {
    let bytes = input.as_bytes();
    let end = match bytes.first()? {
        b'$' => {
            let digits = bytes[1..].iter().take_while(|b| b.is_ascii_digit()).count();
            if digits == 0 {
                return None;
            }
            1 + digits
        }
        b if b.is_ascii_alphabetic() || *b == b'_' => bytes
            .iter()
            .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
            .count(),
        _ => return None,
    };
    Some(input.split_at(end))
}

fn split_op(input: &str) -> Option<(CompareOp, &str)> {
    const OPS: [(&str, CompareOp); 6] = [
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
    ];
    OPS.iter()
        .find_map(|(token, op)| input.strip_prefix(token).map(|rest| (*op, rest)))
}

fn parse_literal(input: &str) -> Result<String, String> {
    let mut chars = input.chars();
    match chars.next() {
        None => Err("missing literal after operator".to_string()),
        Some(quote @ ('"' | '\'')) => {
            let body = &input[1..];
            match body.find(quote) {
                Some(end) if body[end + 1..].trim().is_empty() => Ok(body[..end].to_string()),
                Some(_) => Err("unexpected text after quoted literal".to_string()),
                None => Err("unterminated quoted literal".to_string()),
            }
        }
        Some(_) => {
            if input.chars().any(char::is_whitespace) {
                Err("unquoted literal must be a single word".to_string())
            } else {
                Ok(input.to_string())
            }
        }
    }
}
