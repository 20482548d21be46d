//! Template substitution for `{{name}}` and `$N` tokens.
//!
//! Substitution is a single left-to-right pass: text produced by a
//! substitution is never scanned again, so a variable holding `{{x}}`
//! is inserted literally. `$$` produces a literal `$` and `$0` is left
//! as written.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use crate::error::FlowError;
use crate::variables::VariableStore;

lazy_static! {
    static ref TOKEN: Regex = Regex::new(
        r"\$\$|\$(\d+)|\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}"
    )
    .expect("template token pattern");
}

/// Substitute every token in `template` from `store`.
pub fn resolve(template: &str, store: &VariableStore) -> Result<String, FlowError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in TOKEN.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&substitute(&caps, store)?);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

fn substitute(caps: &Captures<'_>, store: &VariableStore) -> Result<String, FlowError> {
    if let Some(index) = caps.get(1) {
        let raw = index.as_str();
        // Absurdly large indexes can never be bound.
        let n: usize = raw.parse().unwrap_or(usize::MAX);
        if n == 0 {
            return Ok(format!("${}", raw));
        }
        return store
            .positional(n)
            .map(str::to_string)
            .ok_or(FlowError::MissingArgument {
                index: n,
                provided: store.positional_len(),
            });
    }

    if let Some(name) = caps.get(2) {
        let name = name.as_str();
        return store
            .get(name)
            .map(|v| v.to_string())
            .ok_or_else(|| FlowError::UnresolvedVariable {
                name: name.to_string(),
                available: store.names(),
            });
    }

    Ok("$".to_string())
}

/// Variables and positional indexes a template refers to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateRefs {
    pub variables: Vec<String>,
    pub positional: Vec<usize>,
}

pub fn references(template: &str) -> TemplateRefs {
    let mut refs = TemplateRefs::default();
    for caps in TOKEN.captures_iter(template) {
        if let Some(n) = caps.get(1).and_then(|m| m.as_str().parse::<usize>().ok()) {
            if n > 0 && !refs.positional.contains(&n) {
                refs.positional.push(n);
            }
        } else if let Some(name) = caps.get(2) {
            let name = name.as_str().to_string();
            if !refs.variables.contains(&name) {
                refs.variables.push(name);
            }
        }
    }
    refs.positional.sort_unstable();
    refs
}
