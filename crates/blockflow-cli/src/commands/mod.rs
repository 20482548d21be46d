//! CLI command implementations.
//!
//! Each submodule corresponds to a group of CLI subcommands and reuses the
//! blockflow-core engine through a [`CliContext`].

pub mod library;
pub mod run;

use std::path::PathBuf;
use std::sync::Arc;

use blockflow_core::git::GitAutoCommit;
use blockflow_core::history::RunHistoryWriter;
use blockflow_core::session::{ClaudeSession, ClaudeSessionConfig};
use blockflow_core::{AgentSession, CommandLibrary, EngineConfig, ExecutionController};

/// Global options as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub config: Option<PathBuf>,
    pub commands_dir: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub max_steps: Option<usize>,
    pub verbose: bool,
    pub git_auto_commit: bool,
}

/// Resolved configuration for one CLI invocation.
#[derive(Debug, Clone)]
pub struct CliContext {
    pub cwd: PathBuf,
    pub config: EngineConfig,
    pub commands_dir: PathBuf,
    pub verbose: bool,
}

impl CliContext {
    /// Load the engine config and apply command-line overrides.
    pub fn load(options: &CliOptions) -> Result<Self, String> {
        let cwd = match &options.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()
                .map_err(|e| format!("Cannot determine working directory: {}", e))?,
        };
        if !cwd.is_dir() {
            return Err(format!("Working directory '{}' does not exist", cwd.display()));
        }

        let mut config =
            EngineConfig::load(options.config.as_deref(), &cwd).map_err(|e| e.to_string())?;
        if let Some(max_steps) = options.max_steps {
            config.max_steps = max_steps;
        }
        if options.git_auto_commit {
            config.git.auto_commit = true;
        }

        let commands_dir = match &options.commands_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => cwd.join(dir),
            None => config.commands_dir_in(&cwd),
        };

        Ok(Self {
            cwd,
            config,
            commands_dir,
            verbose: options.verbose,
        })
    }

    pub fn load_library(&self) -> Result<CommandLibrary, String> {
        let mut library = CommandLibrary::new();
        let count = library
            .load_dir(&self.commands_dir)
            .map_err(|e| e.to_string())?;
        tracing::info!(
            "[CLI] Loaded {} command(s) from {}",
            count,
            self.commands_dir.display()
        );
        Ok(library)
    }

    /// Spawn the agent process configured under `agent:`.
    pub async fn spawn_session(&self) -> Result<Box<dyn AgentSession>, String> {
        let config =
            ClaudeSessionConfig::from_agent_config(&self.config.agent, self.cwd.clone(), "blockflow");
        let session = ClaudeSession::spawn(config)
            .await
            .map_err(|e| format!("Failed to start agent '{}': {}", self.config.agent.command, e))?;
        Ok(Box::new(session))
    }

    /// Build a controller over `session` with git and history wired in per config.
    pub fn controller(
        &self,
        library: CommandLibrary,
        session: Box<dyn AgentSession>,
    ) -> ExecutionController {
        let mut controller = ExecutionController::new(self.config.clone(), library, session);
        if self.config.git.auto_commit {
            controller = controller.with_git(Arc::new(GitAutoCommit::new(self.config.git.clone())));
        }
        if self.config.history {
            controller = controller.with_history(RunHistoryWriter::new(&self.cwd));
        }
        controller
    }
}
