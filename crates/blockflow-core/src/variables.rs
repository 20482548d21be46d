//! Frame-local variable store.
//!
//! Named variables keep insertion order; positional arguments live beside
//! them and are addressed as `$1..$N`.

use serde::{Deserialize, Serialize};

use crate::models::{Value, ValueType};

/// A named, typed variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub value: Value,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value_type: value.value_type(),
            value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableStore {
    named: Vec<Variable>,
    positional: Vec<String>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a named variable, or a positional argument written as `$N`.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(index) = positional_index(name) {
            return self.positional(index).map(Value::from);
        }
        self.named
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Insert or overwrite a named variable, keeping its original position.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let variable = Variable::new(name, value);
        match self.named.iter_mut().find(|v| v.name == variable.name) {
            Some(existing) => *existing = variable,
            None => self.named.push(variable),
        }
    }

    /// Replace the positional arguments, returning their names `$1..$N`.
    pub fn bind_positional(&mut self, args: Vec<String>) -> Vec<String> {
        self.positional = args;
        (1..=self.positional.len()).map(|i| format!("${}", i)).collect()
    }

    /// The 1-based positional argument `index`.
    pub fn positional(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.positional.get(i))
            .map(String::as_str)
    }

    pub fn positional_len(&self) -> usize {
        self.positional.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.named.iter().map(|v| v.name.clone()).collect()
    }

    pub fn variables(&self) -> &[Variable] {
        &self.named
    }

    /// Named variables followed by positional ones, for progress snapshots.
    pub fn snapshot(&self) -> Vec<Variable> {
        let mut all = self.named.clone();
        all.extend(
            self.positional
                .iter()
                .enumerate()
                .map(|(i, v)| Variable::new(format!("${}", i + 1), Value::from(v.as_str()))),
        );
        all
    }

    /// Copy every named variable of `other` into this store.
    pub fn merge_from(&mut self, other: &VariableStore) {
        for variable in &other.named {
            self.set(variable.name.clone(), variable.value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty()
    }
}

fn positional_index(name: &str) -> Option<usize> {
    let digits = name.strip_prefix('$')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
