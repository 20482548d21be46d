//! Agent sessions — one coding-agent process bound to a working directory.
//!
//! ```text
//!            send / run_shell
//!   Ready ─────────────────────▶ Busy
//!     ▲  ◀─────────────────────   │
//!     │     reply / cancel_turn    │ process exit
//!     │                            ▼
//!  Restarting ◀──── restart ──── Crashed
//! ```
//!
//! Every transition is awaited by the caller; a session never restarts
//! itself in the background.

pub mod claude;
pub mod scripted;
pub mod shell;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FlowError;

pub use claude::{ClaudeSession, ClaudeSessionConfig};
pub use scripted::{ScriptedReply, ScriptedSession};
pub use shell::{run_shell, ShellGuard, ShellOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Ready,
    Busy,
    Restarting,
    Crashed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Restarting => "restarting",
            Self::Crashed => "crashed",
        }
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Ready, Busy)
                | (Busy, Ready)
                | (Ready, Restarting)
                | (Busy, Restarting)
                | (Crashed, Restarting)
                | (Restarting, Ready)
                | (Restarting, Crashed)
                | (_, Crashed)
        )
    }

    /// Error for a request the session cannot take in this state.
    pub fn unavailable(self, name: &str) -> FlowError {
        match self {
            SessionState::Busy => {
                FlowError::SessionBusy(format!("session '{}' is handling another request", name))
            }
            other => FlowError::SessionUnavailable(format!(
                "session '{}' is {}",
                name,
                other.as_str()
            )),
        }
    }
}

/// The agent's complete answer to one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub text: String,
    pub stop_reason: String,
}

#[async_trait]
pub trait AgentSession: Send {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn working_directory(&self) -> &Path;

    fn state(&self) -> SessionState;

    /// Send one prompt and wait for the full reply.
    async fn send(&mut self, prompt: &str) -> Result<AgentReply, FlowError>;

    /// Abandon the in-flight turn without killing the process. Its late
    /// reply, if any, is discarded.
    async fn cancel_turn(&mut self);

    /// Terminate and respawn the agent process in the same working directory.
    async fn restart(&mut self) -> Result<(), FlowError>;

    async fn run_shell(
        &mut self,
        command: &str,
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<ShellOutput, FlowError>;
}
