//! Command library — the set of named graphs a run can invoke.
//!
//! Graphs are shared as `Arc`s. Cloning the library is how a run takes its
//! frozen snapshot: replacing a command afterwards swaps the `Arc` in the
//! live library and leaves in-flight runs on the old definition.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::error::FlowError;
use crate::models::BlockGraph;

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("Commands directory '{0}' does not exist")]
    MissingDir(String),
    #[error("Invalid glob pattern: {0}")]
    Pattern(String),
    #[error("{0}")]
    Load(String),
    #[error("Command '{name}' defined twice ({first} and {second})")]
    Duplicate {
        name: String,
        first: String,
        second: String,
    },
}

/// Result of validating every command in the library.
#[derive(Debug, Default)]
pub struct LibraryReport {
    pub errors: Vec<FlowError>,
    pub warnings: Vec<String>,
}

impl LibraryReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandLibrary {
    commands: HashMap<String, Arc<BlockGraph>>,
}

impl CommandLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.yaml`, `*.yml` and `*.json` file in `dir`.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize, LibraryError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(LibraryError::MissingDir(dir.display().to_string()));
        }

        let mut sources: HashMap<String, String> = HashMap::new();
        let mut count = 0;
        for ext in ["yaml", "yml", "json"] {
            let pattern = dir.join(format!("*.{}", ext));
            let pattern = pattern.to_string_lossy();
            let paths = glob::glob(&pattern).map_err(|e| LibraryError::Pattern(e.to_string()))?;
            for path in paths.flatten() {
                let graph = BlockGraph::from_file(&path).map_err(LibraryError::Load)?;
                let path_str = path.display().to_string();
                if let Some(first) = sources.get(&graph.name) {
                    return Err(LibraryError::Duplicate {
                        name: graph.name.clone(),
                        first: first.clone(),
                        second: path_str,
                    });
                }
                tracing::info!("[Library] Loaded command /{} ({})", graph.name, path_str);
                sources.insert(graph.name.clone(), path_str);
                self.insert(graph);
                count += 1;
            }
        }
        Ok(count)
    }

    /// Add or replace a command, returning the definition it superseded.
    pub fn insert(&mut self, graph: BlockGraph) -> Option<Arc<BlockGraph>> {
        self.commands.insert(graph.name.clone(), Arc::new(graph))
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<BlockGraph>> {
        self.commands.remove(normalize(name))
    }

    /// Look up a command; a leading `/` is ignored.
    pub fn get(&self, name: &str) -> Option<Arc<BlockGraph>> {
        self.commands.get(normalize(name)).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(normalize(name))
    }

    /// Command names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Validate `name` and every command it can reach through Command blocks.
    ///
    /// Unknown call targets are structural errors: a run must not start if
    /// it could only fail later for want of a definition.
    pub fn validate_closure(&self, name: &str) -> Result<Vec<String>, FlowError> {
        let root = self
            .get(name)
            .ok_or_else(|| FlowError::CommandNotFound(normalize(name).to_string()))?;

        let mut warnings = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = vec![root];
        while let Some(graph) = pending.pop() {
            if !seen.insert(graph.name.clone()) {
                continue;
            }
            warnings.extend(graph.validate()?);
            let mut missing = Vec::new();
            for target in graph.called_commands() {
                match self.get(target) {
                    Some(callee) => pending.push(callee),
                    None => missing.push(format!("Command block targets unknown command /{}", target)),
                }
            }
            if !missing.is_empty() {
                return Err(FlowError::InvalidGraph {
                    command: graph.name.clone(),
                    problems: missing,
                });
            }
        }
        Ok(warnings)
    }

    /// Validate every command, collecting all errors and warnings.
    pub fn validate_all(&self) -> LibraryReport {
        let mut report = LibraryReport::default();
        for name in self.names() {
            let Some(graph) = self.get(&name) else { continue };
            match graph.validate() {
                Ok(warnings) => report
                    .warnings
                    .extend(warnings.into_iter().map(|w| format!("/{}: {}", name, w))),
                Err(e) => report.errors.push(e),
            }
            let missing: Vec<String> = graph
                .called_commands()
                .into_iter()
                .filter(|target| !self.contains(target))
                .map(|target| format!("Command block targets unknown command /{}", target))
                .collect();
            if !missing.is_empty() {
                report.errors.push(FlowError::InvalidGraph {
                    command: name.clone(),
                    problems: missing,
                });
            }
        }
        report.warnings.extend(
            self.call_cycles()
                .into_iter()
                .map(|cycle| format!("recursive call chain: {} (bounded at runtime)", cycle)),
        );
        report
    }

    /// Cycles in the static call graph, each rendered as `a -> b -> a`.
    /// Every cycle is reported once, starting from its smallest name.
    pub fn call_cycles(&self) -> Vec<String> {
        let mut cycles = Vec::new();
        for start in self.names() {
            let mut path = vec![start.clone()];
            self.find_cycles(&start, &mut path, &mut cycles);
        }
        cycles
    }

    fn find_cycles(&self, start: &str, path: &mut Vec<String>, cycles: &mut Vec<String>) {
        let Some(current) = path.last().and_then(|name| self.get(name)) else {
            return;
        };
        for target in current.called_commands() {
            if target == start {
                cycles.push(format!("{} -> {}", path.join(" -> "), start));
            } else if target > start && !path.iter().any(|p| p == target) && self.contains(target) {
                path.push(target.to_string());
                self.find_cycles(start, path, cycles);
                path.pop();
            }
        }
    }
}

fn normalize(name: &str) -> &str {
    name.trim().trim_start_matches('/')
}
