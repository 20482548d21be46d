//! Blocks and edges — the nodes and connections of a command graph.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use super::value::ValueType;

/// A typed unit of work in a command graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Unique id within the graph
    pub id: String,

    /// Display name used in progress output and commit messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Type tag plus type-specific configuration
    #[serde(flatten)]
    pub kind: BlockKind,
}

impl Block {
    pub fn new(id: impl Into<String>, kind: BlockKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn block_type(&self) -> BlockType {
        self.kind.block_type()
    }

    /// The display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Start,
    Prompt(PromptConfig),
    Bash(BashConfig),
    Variable(VariableConfig),
    Branch(BranchConfig),
    Command(CommandConfig),
    Refresh,
    Cast(CastConfig),
    End,
}

impl BlockKind {
    pub fn block_type(&self) -> BlockType {
        match self {
            Self::Start => BlockType::Start,
            Self::Prompt(_) => BlockType::Prompt,
            Self::Bash(_) => BlockType::Bash,
            Self::Variable(_) => BlockType::Variable,
            Self::Branch(_) => BlockType::Branch,
            Self::Command(_) => BlockType::Command,
            Self::Refresh => BlockType::Refresh,
            Self::Cast(_) => BlockType::Cast,
            Self::End => BlockType::End,
        }
    }
}

/// Block type without configuration, used in events and commit labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Start,
    Prompt,
    Bash,
    Variable,
    Branch,
    Command,
    Refresh,
    Cast,
    End,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Prompt => "prompt",
            Self::Bash => "bash",
            Self::Variable => "variable",
            Self::Branch => "branch",
            Self::Command => "command",
            Self::Refresh => "refresh",
            Self::Cast => "cast",
            Self::End => "end",
        }
    }

    /// Capitalised label, e.g. `Prompt`.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::Prompt => "Prompt",
            Self::Bash => "Bash",
            Self::Variable => "Variable",
            Self::Branch => "Branch",
            Self::Command => "Command",
            Self::Refresh => "Refresh",
            Self::Cast => "Cast",
            Self::End => "End",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Prompt template (`{{name}}` and `$N` are substituted)
    pub prompt: String,

    /// JSON schema of the structured answer; each property becomes a variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,

    /// Store the raw response text under this name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BashConfig {
    /// Shell command template
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_variable: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_variable: Option<String>,

    /// Receives the exit code as a number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code_variable: Option<String>,

    /// Parse trimmed stdout as this type before storing it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<ValueType>,

    /// Run somewhere other than the session's working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableConfig {
    pub variable: String,

    /// Value template; YAML scalars of any kind are accepted as text
    #[serde(default, deserialize_with = "scalar_text")]
    pub value: String,

    #[serde(default)]
    pub value_type: ValueType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Target command name; a leading `/` is ignored
    pub command: String,

    /// Argument templates, bound to `$1..$N` in the child frame
    #[serde(default, deserialize_with = "scalar_text_list")]
    pub arguments: Vec<String>,

    /// Child variable copied back into the caller on return
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_variable: Option<String>,

    /// Copy every named child variable back into the caller on return
    #[serde(default)]
    pub merge_output: bool,
}

impl CommandConfig {
    pub fn target(&self) -> &str {
        self.command.trim().trim_start_matches('/')
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastConfig {
    pub variable: String,
    pub to: ValueType,
}

/// A directed connection between two blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub tag: EdgeTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_port: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, tag: EdgeTag) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            tag,
            from_port: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeTag {
    #[default]
    Plain,
    True,
    False,
}

impl EdgeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::True => "true",
            Self::False => "false",
        }
    }
}

impl fmt::Display for EdgeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// YAML authors write `tag: true` unquoted, so booleans are accepted too.
impl<'de> Deserialize<'de> for EdgeTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::Bool(true) => Ok(EdgeTag::True),
            serde_json::Value::Bool(false) => Ok(EdgeTag::False),
            serde_json::Value::String(s) => match s.as_str() {
                "plain" | "" => Ok(EdgeTag::Plain),
                "true" => Ok(EdgeTag::True),
                "false" => Ok(EdgeTag::False),
                other => Err(serde::de::Error::custom(format!(
                    "unknown edge tag '{}', expected plain, true or false",
                    other
                ))),
            },
            serde_json::Value::Null => Ok(EdgeTag::Plain),
            other => Err(serde::de::Error::custom(format!(
                "invalid edge tag {}",
                other
            ))),
        }
    }
}

fn json_scalar_text(value: serde_json::Value) -> Result<String, String> {
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(format!("expected a scalar, found {}", other)),
    }
}

fn scalar_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    json_scalar_text(serde_json::Value::deserialize(deserializer)?).map_err(serde::de::Error::custom)
}

fn scalar_text_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Vec::<serde_json::Value>::deserialize(deserializer)?
        .into_iter()
        .map(json_scalar_text)
        .collect::<Result<_, _>>()
        .map_err(serde::de::Error::custom)
}
