//! Blockflow Core — the flowchart execution engine for agent slash commands.
//!
//! A slash command is a block graph: Start, Prompt, Bash, Variable, Branch,
//! Command, Refresh, Cast and End blocks joined by plain or `true`/`false`
//! edges. This crate validates those graphs and runs them against one
//! coding-agent session:
//!
//! - `models` / `library` — graph definitions and the named command set
//! - `variables` / `template` / `condition` — typed values, `{{name}}` and
//!   `$N` substitution, Branch conditions
//! - `interpreter` — the frame-stack state machine
//! - `controller` — start / cancel / status over a single-run lock
//! - `session` — the agent process and shell execution
//! - `git`, `events`, `history` — side channels notified during a run

pub mod condition;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod git;
pub mod history;
pub mod interpreter;
pub mod library;
pub mod models;
pub mod session;
pub mod slash;
pub mod template;
pub mod variables;

// Convenience re-exports
pub use config::EngineConfig;
pub use controller::{ExecutionController, RunLock};
pub use error::{BlockFailure, FlowError};
pub use events::{ProgressBus, ProgressEvent, ProgressState};
pub use interpreter::{Interpreter, RunLimits, RunOutcome, RunState, RunStatus};
pub use library::CommandLibrary;
pub use models::{Block, BlockGraph, BlockKind, BlockType, Value, ValueType};
pub use session::{AgentSession, SessionState};
pub use variables::{Variable, VariableStore};
