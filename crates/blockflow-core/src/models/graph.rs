//! Command definition — a named block graph plus its declared arguments.
//!
//! Commands are authored as YAML (or JSON) files:
//!
//! ```yaml
//! name: fix-tests
//! description: Loop until the test suite passes
//! arguments:
//!   - name: target
//!     description: Package to test
//! blocks:
//!   - { id: start, type: start }
//!   - { id: test, type: bash, command: "cargo test -p $1", exit_code_variable: code }
//!   - { id: passed, type: branch, condition: "code == 0" }
//!   - { id: fix, type: prompt, prompt: "Tests for $1 fail. Fix them." }
//!   - { id: done, type: end }
//! edges:
//!   - { from: start, to: test }
//!   - { from: test, to: passed }
//!   - { from: passed, to: done, tag: true }
//!   - { from: passed, to: fix, tag: false }
//!   - { from: fix, to: test }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::block::{Block, BlockKind, BlockType, Edge, EdgeTag};
use crate::condition::Condition;
use crate::error::FlowError;
use crate::template;

lazy_static! {
    static ref VARIABLE_NAME: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("variable name pattern");
}

/// Whether `name` is usable as a variable name.
pub fn is_valid_variable_name(name: &str) -> bool {
    VARIABLE_NAME.is_match(name)
}

/// An argument declared by a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandArgument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

fn default_required() -> bool {
    true
}

/// An immutable command graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockGraph {
    /// Command name, invoked as `/name`
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub arguments: Vec<CommandArgument>,

    pub blocks: Vec<Block>,

    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl BlockGraph {
    pub fn new(name: impl Into<String>, blocks: Vec<Block>, edges: Vec<Edge>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            arguments: Vec::new(),
            blocks,
            edges,
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<CommandArgument>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Parse a command definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse command YAML: {}", e))
    }

    /// Parse a command definition from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("Failed to parse command JSON: {}", e))
    }

    /// Load a command definition, picking the format from the file extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read command file '{}': {}", path.display(), e))?;
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn start_block(&self) -> Option<&Block> {
        self.blocks
            .iter()
            .find(|b| b.block_type() == BlockType::Start)
    }

    /// Target of the outgoing edge from `block_id` carrying `tag`.
    pub fn successor(&self, block_id: &str, tag: EdgeTag) -> Option<&str> {
        self.edges
            .iter()
            .find(|e| e.from == block_id && e.tag == tag)
            .map(|e| e.to.as_str())
    }

    /// Names of commands invoked by Command blocks, deduplicated in block order.
    pub fn called_commands(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.blocks
            .iter()
            .filter_map(|b| match &b.kind {
                BlockKind::Command(cfg) => Some(cfg.target()),
                _ => None,
            })
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Structural validation.
    ///
    /// Returns warnings on success; every problem found is collected into a
    /// single [`FlowError::InvalidGraph`] otherwise.
    pub fn validate(&self) -> Result<Vec<String>, FlowError> {
        let mut problems = Vec::new();
        let mut warnings = Vec::new();

        let mut ids = HashSet::new();
        for block in &self.blocks {
            if block.id.trim().is_empty() {
                problems.push("block with empty id".to_string());
            } else if !ids.insert(block.id.as_str()) {
                problems.push(format!("duplicate block id '{}'", block.id));
            }
        }

        let starts: Vec<&Block> = self
            .blocks
            .iter()
            .filter(|b| b.block_type() == BlockType::Start)
            .collect();
        match starts.len() {
            0 => problems.push("missing Start block".to_string()),
            1 => {}
            n => problems.push(format!("{} Start blocks, expected exactly one", n)),
        }

        let types: HashMap<&str, BlockType> = self
            .blocks
            .iter()
            .map(|b| (b.id.as_str(), b.block_type()))
            .collect();

        let mut outgoing: HashMap<&str, Vec<&Edge>> = HashMap::new();
        for edge in &self.edges {
            let Some(source_type) = types.get(edge.from.as_str()) else {
                problems.push(format!("edge from unknown block '{}'", edge.from));
                continue;
            };
            match types.get(edge.to.as_str()) {
                None => problems.push(format!(
                    "edge from '{}' to unknown block '{}'",
                    edge.from, edge.to
                )),
                Some(BlockType::Start) => {
                    problems.push(format!("edge from '{}' into the Start block", edge.from))
                }
                Some(_) => {}
            }
            let tag_ok = match source_type {
                BlockType::Branch => edge.tag != EdgeTag::Plain,
                _ => edge.tag == EdgeTag::Plain,
            };
            if !tag_ok {
                problems.push(format!(
                    "edge '{}' -> '{}' has tag '{}', not valid for a {} block",
                    edge.from, edge.to, edge.tag, source_type
                ));
            }
            outgoing.entry(edge.from.as_str()).or_default().push(edge);
        }

        for block in &self.blocks {
            let edges = outgoing.get(block.id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            match block.block_type() {
                BlockType::Branch => {
                    let trues = edges.iter().filter(|e| e.tag == EdgeTag::True).count();
                    let falses = edges.iter().filter(|e| e.tag == EdgeTag::False).count();
                    if trues != 1 || falses != 1 || edges.len() != 2 {
                        problems.push(format!(
                            "Branch '{}' needs exactly one true and one false edge",
                            block.id
                        ));
                    }
                }
                BlockType::End => {
                    if !edges.is_empty() {
                        problems.push(format!("End block '{}' has outgoing edges", block.id));
                    }
                }
                _ => {
                    if edges.len() > 1 {
                        problems.push(format!(
                            "block '{}' has {} outgoing edges, expected at most one",
                            block.id,
                            edges.len()
                        ));
                    }
                }
            }
            self.validate_config(block, &mut problems);
        }

        if let [start] = starts.as_slice() {
            let reachable = self.reachable_from(&start.id);
            let end_reachable = self
                .blocks
                .iter()
                .any(|b| b.block_type() == BlockType::End && reachable.contains(b.id.as_str()));
            if !end_reachable {
                problems.push("no End block is reachable from Start".to_string());
            }
            for block in &self.blocks {
                if !reachable.contains(block.id.as_str()) {
                    warnings.push(format!("block '{}' is unreachable from Start", block.id));
                }
            }
        }

        for argument in &self.arguments {
            if !is_valid_variable_name(&argument.name) {
                problems.push(format!("invalid argument name '{}'", argument.name));
            }
        }
        warnings.extend(self.reference_warnings());

        if problems.is_empty() {
            Ok(warnings)
        } else {
            Err(FlowError::InvalidGraph {
                command: self.name.clone(),
                problems,
            })
        }
    }

    fn validate_config(&self, block: &Block, problems: &mut Vec<String>) {
        fn check_name(block: &Block, name: Option<&String>, what: &str, problems: &mut Vec<String>) {
            if let Some(name) = name {
                if !is_valid_variable_name(name) {
                    problems.push(format!("block '{}' has invalid {} '{}'", block.id, what, name));
                }
            }
        }
        match &block.kind {
            BlockKind::Prompt(cfg) => {
                check_name(block, cfg.output_variable.as_ref(), "output variable", problems);
                if cfg.prompt.trim().is_empty() {
                    problems.push(format!("Prompt '{}' has empty prompt text", block.id));
                }
                if let Some(schema) = &cfg.output_schema {
                    if !schema.is_object() {
                        problems.push(format!(
                            "Prompt '{}' output schema must be an object",
                            block.id
                        ));
                    }
                }
            }
            BlockKind::Bash(cfg) => {
                check_name(block, cfg.stdout_variable.as_ref(), "stdout variable", problems);
                check_name(block, cfg.stderr_variable.as_ref(), "stderr variable", problems);
                check_name(block, cfg.exit_code_variable.as_ref(), "exit code variable", problems);
                if cfg.command.trim().is_empty() {
                    problems.push(format!("Bash '{}' has an empty command", block.id));
                }
            }
            BlockKind::Variable(cfg) => check_name(block, Some(&cfg.variable), "variable name", problems),
            BlockKind::Cast(cfg) => check_name(block, Some(&cfg.variable), "variable name", problems),
            BlockKind::Command(cfg) => {
                check_name(block, cfg.return_variable.as_ref(), "return variable", problems);
                if cfg.target().is_empty() {
                    problems.push(format!("Command '{}' has no target command", block.id));
                }
            }
            BlockKind::Branch(cfg) => {
                if cfg.condition.trim().is_empty() {
                    problems.push(format!("Branch '{}' has an empty condition", block.id));
                } else if let Err(e) = Condition::parse(&cfg.condition) {
                    problems.push(format!("Branch '{}': {}", block.id, e));
                }
            }
            BlockKind::Start | BlockKind::Refresh | BlockKind::End => {}
        }
    }

    /// Template references to names that no block of this graph defines.
    /// A `merge_output` call can define anything, so it silences the check.
    fn reference_warnings(&self) -> Vec<String> {
        let mut defined: HashSet<&str> = self.arguments.iter().map(|a| a.name.as_str()).collect();
        for block in &self.blocks {
            match &block.kind {
                BlockKind::Prompt(cfg) => {
                    defined.extend(cfg.output_variable.as_deref());
                    if let Some(props) = cfg
                        .output_schema
                        .as_ref()
                        .and_then(|schema| schema.get("properties"))
                        .and_then(|props| props.as_object())
                    {
                        defined.extend(props.keys().map(String::as_str));
                    }
                }
                BlockKind::Bash(cfg) => {
                    defined.extend(cfg.stdout_variable.as_deref());
                    defined.extend(cfg.stderr_variable.as_deref());
                    defined.extend(cfg.exit_code_variable.as_deref());
                }
                BlockKind::Variable(cfg) => {
                    defined.insert(cfg.variable.as_str());
                }
                BlockKind::Command(cfg) if cfg.merge_output => return Vec::new(),
                BlockKind::Command(cfg) => defined.extend(cfg.return_variable.as_deref()),
                _ => {}
            }
        }

        let mut warnings = Vec::new();
        for block in &self.blocks {
            let templates: Vec<&str> = match &block.kind {
                BlockKind::Prompt(cfg) => vec![cfg.prompt.as_str()],
                BlockKind::Bash(cfg) => {
                    let mut t = vec![cfg.command.as_str()];
                    t.extend(cfg.working_directory.as_deref());
                    t
                }
                BlockKind::Variable(cfg) => vec![cfg.value.as_str()],
                BlockKind::Command(cfg) => cfg.arguments.iter().map(String::as_str).collect(),
                _ => continue,
            };
            for template in templates {
                for name in template::references(template).variables {
                    if !defined.contains(name.as_str()) {
                        warnings.push(format!(
                            "block '{}' references '{{{{{}}}}}', which no block defines",
                            block.id, name
                        ));
                    }
                }
            }
        }
        warnings
    }

    fn reachable_from<'a>(&'a self, start: &'a str) -> HashSet<&'a str> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            for edge in self.edges.iter().filter(|e| e.from == id) {
                if seen.insert(edge.to.as_str()) {
                    queue.push_back(edge.to.as_str());
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::block::{BranchConfig, VariableConfig};
    use crate::models::ValueType;

    fn variable(id: &str, name: &str, value: &str) -> Block {
        Block::new(
            id,
            BlockKind::Variable(VariableConfig {
                variable: name.to_string(),
                value: value.to_string(),
                value_type: ValueType::String,
            }),
        )
    }

    fn branch(id: &str, condition: &str) -> Block {
        Block::new(
            id,
            BlockKind::Branch(BranchConfig {
                condition: condition.to_string(),
            }),
        )
    }

    fn linear() -> BlockGraph {
        BlockGraph::new(
            "linear",
            vec![
                Block::new("s", BlockKind::Start),
                variable("v", "x", "1"),
                Block::new("e", BlockKind::End),
            ],
            vec![
                Edge::new("s", "v", EdgeTag::Plain),
                Edge::new("v", "e", EdgeTag::Plain),
            ],
        )
    }

    fn problems(graph: &BlockGraph) -> Vec<String> {
        match graph.validate() {
            Err(FlowError::InvalidGraph { problems, .. }) => problems,
            other => panic!("expected InvalidGraph, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_linear_graph() {
        let warnings = linear().validate().unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_missing_start() {
        let mut graph = linear();
        graph.blocks.remove(0);
        graph.edges.remove(0);
        let problems = problems(&graph);
        assert!(problems.iter().any(|p| p.contains("missing Start")));
    }

    #[test]
    fn test_duplicate_block_id() {
        let mut graph = linear();
        graph.blocks.push(variable("v", "y", "2"));
        let problems = problems(&graph);
        assert!(problems.iter().any(|p| p.contains("duplicate block id 'v'")));
    }

    #[test]
    fn test_unreachable_end() {
        let mut graph = linear();
        graph.edges.pop();
        let problems = problems(&graph);
        assert!(problems.iter().any(|p| p.contains("no End block is reachable")));
    }

    #[test]
    fn test_mismatched_edge_tag() {
        let mut graph = linear();
        graph.edges[1].tag = EdgeTag::True;
        let problems = problems(&graph);
        assert!(problems.iter().any(|p| p.contains("has tag 'true'")));
    }

    #[test]
    fn test_branch_requires_true_and_false_edges() {
        let graph = BlockGraph::new(
            "branchy",
            vec![
                Block::new("s", BlockKind::Start),
                branch("b", "ready"),
                Block::new("e", BlockKind::End),
            ],
            vec![
                Edge::new("s", "b", EdgeTag::Plain),
                Edge::new("b", "e", EdgeTag::True),
            ],
        );
        let problems = problems(&graph);
        assert!(problems
            .iter()
            .any(|p| p.contains("needs exactly one true and one false edge")));
    }

    #[test]
    fn test_back_edge_loop_is_valid() {
        let graph = BlockGraph::new(
            "loop",
            vec![
                Block::new("s", BlockKind::Start),
                branch("b", "count < 3"),
                variable("inc", "count", "1"),
                Block::new("e", BlockKind::End),
            ],
            vec![
                Edge::new("s", "b", EdgeTag::Plain),
                Edge::new("b", "inc", EdgeTag::True),
                Edge::new("b", "e", EdgeTag::False),
                Edge::new("inc", "b", EdgeTag::Plain),
            ],
        );
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_invalid_condition_and_names_are_reported() {
        let graph = BlockGraph::new(
            "bad",
            vec![
                Block::new("s", BlockKind::Start),
                variable("v", "1abc", "x"),
                branch("b", "count >"),
                Block::new("e", BlockKind::End),
            ],
            vec![
                Edge::new("s", "v", EdgeTag::Plain),
                Edge::new("v", "b", EdgeTag::Plain),
                Edge::new("b", "e", EdgeTag::True),
                Edge::new("b", "e", EdgeTag::False),
            ],
        );
        let problems = problems(&graph);
        assert!(problems.iter().any(|p| p.contains("invalid variable name '1abc'")));
        assert!(problems.iter().any(|p| p.starts_with("Branch 'b'")));
    }

    #[test]
    fn test_unreachable_block_is_a_warning() {
        let mut graph = linear();
        graph.blocks.push(variable("orphan", "y", "2"));
        let warnings = graph.validate().unwrap();
        assert_eq!(warnings, vec!["block 'orphan' is unreachable from Start".to_string()]);
    }

    #[test]
    fn test_undefined_template_reference_is_a_warning() {
        let mut graph = linear();
        graph.blocks[1] = variable("v", "x", "{{x}} and {{ghost}}");
        let warnings = graph.validate().unwrap();
        assert_eq!(
            warnings,
            vec!["block 'v' references '{{ghost}}', which no block defines".to_string()]
        );
    }

    #[test]
    fn test_successor_lookup() {
        let graph = linear();
        assert_eq!(graph.successor("s", EdgeTag::Plain), Some("v"));
        assert_eq!(graph.successor("e", EdgeTag::Plain), None);
        assert_eq!(graph.start_block().map(|b| b.id.as_str()), Some("s"));
    }

    #[test]
    fn test_parse_documented_example() {
        let yaml = r#"
name: fix-tests
arguments:
  - name: target
blocks:
  - { id: start, type: start }
  - { id: test, type: bash, command: "cargo test -p $1", exit_code_variable: code }
  - { id: passed, type: branch, condition: "code == 0" }
  - { id: fix, type: prompt, prompt: "Tests for $1 fail. Fix them." }
  - { id: done, type: end }
edges:
  - { from: start, to: test }
  - { from: test, to: passed }
  - { from: passed, to: done, tag: true }
  - { from: passed, to: fix, tag: false }
  - { from: fix, to: test }
"#;
        let graph = BlockGraph::from_yaml(yaml).unwrap();
        assert_eq!(graph.name, "fix-tests");
        assert!(graph.arguments[0].required);
        assert!(graph.validate().unwrap().is_empty());
    }

    #[test]
    fn test_from_file_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("greet.json");
        std::fs::write(
            &json,
            r#"{"name":"greet","blocks":[{"id":"s","type":"start"},{"id":"e","type":"end"}],"edges":[{"from":"s","to":"e"}]}"#,
        )
        .unwrap();
        let yml = dir.path().join("greet.v2.yml");
        std::fs::write(&yml, "name: greet-yml\nblocks:\n  - { id: s, type: start }\n").unwrap();

        assert_eq!(BlockGraph::from_file(&json).unwrap().name, "greet");
        assert_eq!(BlockGraph::from_file(yml.as_path()).unwrap().name, "greet-yml");

        // Read errors name the file
        let err = BlockGraph::from_file(dir.path().join("absent.json")).unwrap_err();
        assert!(err.contains("absent.json"), "unexpected error: {}", err);
    }
}
