//! Engine configuration, loaded from `blockflow.yaml`.
//!
//! ```yaml
//! max_steps: 500
//! prompt_timeout_secs: 900
//! agent:
//!   command: claude
//!   model: sonnet
//! git:
//!   auto_commit: true
//!   auto_push: false
//! ```
//!
//! Lookup order: an explicit path, `./blockflow.yaml`, then
//! `~/.blockflow/config.yaml`. Missing files fall back to defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "blockflow.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Total blocks executed per run, across all frames
    pub max_steps: usize,
    /// Maximum frame stack depth for nested command calls
    pub max_call_depth: usize,
    pub prompt_timeout_secs: u64,
    pub shell_timeout_secs: u64,
    pub restart_timeout_secs: u64,
    /// Command library directory, relative to the working directory
    pub commands_dir: PathBuf,
    pub agent: AgentConfig,
    pub git: GitConfig,
    /// Write progress events to `.blockflow/runs/`
    pub history: bool,
    /// Reject dangerous shell commands in Bash blocks
    pub shell_guard: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 1000,
            max_call_depth: 10,
            prompt_timeout_secs: 600,
            shell_timeout_secs: 300,
            restart_timeout_secs: 60,
            commands_dir: PathBuf::from(".blockflow").join("commands"),
            agent: AgentConfig::default(),
            git: GitConfig::default(),
            history: true,
            shell_guard: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI executable (usually "claude")
    pub command: String,
    /// Permission mode: "acceptEdits" | "bypassPermissions" | ...
    pub permission_mode: Option<String>,
    pub model: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            permission_mode: Some("bypassPermissions".to_string()),
            model: None,
        }
    }
}

/// Policy handed to the git collaborator; the engine itself never reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub auto_commit: bool,
    pub auto_push: bool,
    pub remote: String,
    /// Push target; the current branch when unset
    pub branch: Option<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            auto_commit: false,
            auto_push: false,
            remote: "origin".to_string(),
            branch: None,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Load from `explicit`, or discover a config file relative to `cwd`.
    ///
    /// An explicit path must exist; discovered paths are optional.
    pub fn load(explicit: Option<&Path>, cwd: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        for candidate in Self::candidate_paths(cwd) {
            if candidate.is_file() {
                tracing::info!("[Config] Loading {}", candidate.display());
                return Self::from_file(&candidate);
            }
        }
        Ok(Self::default())
    }

    fn candidate_paths(cwd: &Path) -> Vec<PathBuf> {
        let mut paths = vec![cwd.join(CONFIG_FILE_NAME)];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".blockflow").join("config.yaml"));
        }
        paths
    }

    /// The command library directory resolved against `cwd`.
    pub fn commands_dir_in(&self, cwd: &Path) -> PathBuf {
        if self.commands_dir.is_absolute() {
            self.commands_dir.clone()
        } else {
            cwd.join(&self.commands_dir)
        }
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
}
