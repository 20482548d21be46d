//! Execution frames — one activation of a command graph.

use std::sync::Arc;

use crate::error::FlowError;
use crate::models::{BlockGraph, Value};
use crate::variables::VariableStore;

/// How a finished child frame reports back to the Command block that
/// pushed it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnBinding {
    pub call_block_id: String,
    pub call_block_name: String,
    pub return_variable: Option<String>,
    pub merge_output: bool,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub graph: Arc<BlockGraph>,
    pub vars: VariableStore,
    pub current: String,
    /// Where this frame resumes once the child it called returns;
    /// `None` while no call is outstanding or when the Command block was a leaf
    pub return_target: Option<String>,
    /// Set on frames pushed by a Command block
    pub binding: Option<ReturnBinding>,
}

impl Frame {
    /// Enter `graph` at its Start block with `args` bound.
    ///
    /// Positional value N binds `$N` and the N-th declared argument's name.
    /// Declared arguments missing from `args` take their default; a required
    /// one without a default is a [`FlowError::MissingArgument`]. Extra values
    /// stay reachable as `$N`.
    pub fn enter(
        graph: Arc<BlockGraph>,
        args: Vec<String>,
        binding: Option<ReturnBinding>,
    ) -> Result<Self, FlowError> {
        let current = graph
            .start_block()
            .map(|b| b.id.clone())
            .ok_or_else(|| FlowError::InvalidGraph {
                command: graph.name.clone(),
                problems: vec!["missing Start block".to_string()],
            })?;

        let mut vars = VariableStore::new();
        let provided = args.len();
        let mut positional = args;
        for (i, argument) in graph.arguments.iter().enumerate() {
            if let Some(value) = positional.get(i) {
                vars.set(argument.name.clone(), Value::from(value.as_str()));
                continue;
            }
            match &argument.default {
                Some(default) => {
                    if positional.len() == i {
                        positional.push(default.clone());
                    }
                    vars.set(argument.name.clone(), Value::from(default.as_str()));
                }
                None if argument.required => {
                    return Err(FlowError::MissingArgument {
                        index: i + 1,
                        provided,
                    })
                }
                None => {}
            }
        }
        vars.bind_positional(positional);

        Ok(Self {
            graph,
            vars,
            current,
            return_target: None,
            binding,
        })
    }

    pub fn command(&self) -> &str {
        &self.graph.name
    }
}
