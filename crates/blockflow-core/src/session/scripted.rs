//! A session that replays fixed agent replies.
//!
//! Used for deterministic runs in tests and dry runs. Shell commands still
//! execute for real in the session's working directory.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::shell::{run_shell, ShellOutput};
use super::{AgentReply, AgentSession, SessionState};
use crate::error::FlowError;

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    Text(String),
    /// Never answers; the caller must cancel or time out
    Hang,
    /// The agent process dies mid-turn
    Crash,
}

impl From<&str> for ScriptedReply {
    fn from(text: &str) -> Self {
        ScriptedReply::Text(text.to_string())
    }
}

/// What a scripted session has been asked to do so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptLog {
    pub prompts: Vec<String>,
    pub shell_commands: Vec<String>,
    pub restarts: usize,
    pub cancelled_turns: usize,
}

pub struct ScriptedSession {
    id: String,
    name: String,
    cwd: PathBuf,
    state: SessionState,
    replies: VecDeque<ScriptedReply>,
    log: Arc<Mutex<ScriptLog>>,
}

impl ScriptedSession {
    pub fn new(cwd: impl Into<PathBuf>, replies: Vec<ScriptedReply>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: "scripted".to_string(),
            cwd: cwd.into(),
            state: SessionState::Ready,
            replies: replies.into(),
            log: Arc::new(Mutex::new(ScriptLog::default())),
        }
    }

    /// Shared handle on the interaction log; stays valid after the session
    /// is moved into a controller.
    pub fn log_handle(&self) -> Arc<Mutex<ScriptLog>> {
        self.log.clone()
    }

    fn record(&self, update: impl FnOnce(&mut ScriptLog)) {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        update(&mut log);
    }
}

#[async_trait]
impl AgentSession for ScriptedSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn working_directory(&self) -> &Path {
        &self.cwd
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn send(&mut self, prompt: &str) -> Result<AgentReply, FlowError> {
        if self.state != SessionState::Ready {
            return Err(self.state.unavailable(&self.name));
        }
        self.record(|log| log.prompts.push(prompt.to_string()));

        match self.replies.pop_front() {
            Some(ScriptedReply::Text(text)) => Ok(AgentReply {
                text,
                stop_reason: "end_turn".to_string(),
            }),
            Some(ScriptedReply::Hang) => {
                self.state = SessionState::Busy;
                std::future::pending().await
            }
            Some(ScriptedReply::Crash) => {
                self.state = SessionState::Crashed;
                Err(FlowError::SessionUnavailable(
                    "agent process exited before replying".to_string(),
                ))
            }
            None => Err(FlowError::SessionUnavailable(
                "scripted replies exhausted".to_string(),
            )),
        }
    }

    async fn cancel_turn(&mut self) {
        self.record(|log| log.cancelled_turns += 1);
        if self.state == SessionState::Busy {
            self.state = SessionState::Ready;
        }
    }

    async fn restart(&mut self) -> Result<(), FlowError> {
        self.state = SessionState::Restarting;
        self.record(|log| log.restarts += 1);
        self.state = SessionState::Ready;
        Ok(())
    }

    async fn run_shell(
        &mut self,
        command: &str,
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<ShellOutput, FlowError> {
        self.record(|log| log.shell_commands.push(command.to_string()));
        let cwd = cwd.unwrap_or(&self.cwd).to_path_buf();
        run_shell(command, &cwd, timeout).await
    }
}
