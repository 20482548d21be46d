//! Claude Code agent session over the stream-json protocol.
//!
//! The agent CLI runs as a long-lived child process:
//!   - stdin: NDJSON user messages, one per prompt
//!   - stdout: NDJSON events (`system`, `assistant`, `user`, `result`, ...)
//!
//! A turn ends with the `result` event. Assistant text seen during the turn
//! is accumulated and returned as the reply.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, watch, Mutex};

use super::shell::{run_shell, ShellOutput};
use super::{AgentReply, AgentSession, SessionState};
use crate::config::AgentConfig;
use crate::error::FlowError;

// ─── Protocol Types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct ClaudeContent {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClaudeMessage {
    #[serde(default)]
    content: Vec<ClaudeContent>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClaudeOutputMessage {
    #[serde(rename = "type")]
    msg_type: String,
    subtype: Option<String>,
    session_id: Option<String>,
    message: Option<ClaudeMessage>,
    result: Option<String>,
    is_error: Option<bool>,
}

// ─── Config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClaudeSessionConfig {
    /// Command to run (usually "claude")
    pub command: String,
    pub cwd: PathBuf,
    /// Display name for logging
    pub name: String,
    /// Permission mode: "acceptEdits" | "bypassPermissions"
    pub permission_mode: Option<String>,
    pub model: Option<String>,
    /// How long a fresh process gets before it must still be alive
    pub startup_grace: Duration,
}

impl ClaudeSessionConfig {
    pub fn from_agent_config(agent: &AgentConfig, cwd: impl Into<PathBuf>, name: &str) -> Self {
        Self {
            command: agent.command.clone(),
            cwd: cwd.into(),
            name: name.to_string(),
            permission_mode: agent.permission_mode.clone(),
            model: agent.model.clone(),
            startup_grace: Duration::from_millis(500),
        }
    }
}

impl Default for ClaudeSessionConfig {
    fn default() -> Self {
        Self::from_agent_config(&AgentConfig::default(), ".", "Claude Code")
    }
}

// ─── Turn State ─────────────────────────────────────────────────────────

struct TurnResult {
    text: String,
    stop_reason: String,
    is_error: bool,
}

#[derive(Default)]
struct TurnState {
    pending: Option<oneshot::Sender<TurnResult>>,
    buffer: String,
    /// Abandoned turns whose `result` is still to come
    discard: usize,
}

/// A Claude Code process driven as an [`AgentSession`].
pub struct ClaudeSession {
    id: String,
    config: ClaudeSessionConfig,
    state: Arc<watch::Sender<SessionState>>,
    agent_session_id: Arc<Mutex<Option<String>>>,
    turn: Arc<Mutex<TurnState>>,
    /// Bumped on every spawn so readers of a replaced process stay quiet
    generation: Arc<AtomicU64>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl ClaudeSession {
    /// Spawn the agent process and wait until it is ready.
    pub async fn spawn(config: ClaudeSessionConfig) -> Result<Self, FlowError> {
        let (state, _) = watch::channel(SessionState::Restarting);
        let mut session = Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            state: Arc::new(state),
            agent_session_id: Arc::new(Mutex::new(None)),
            turn: Arc::new(Mutex::new(TurnState::default())),
            generation: Arc::new(AtomicU64::new(0)),
            child: None,
            stdin: None,
        };
        session.start().await?;
        Ok(session)
    }

    /// Session id reported by the agent in its `system/init` event.
    pub async fn agent_session_id(&self) -> Option<String> {
        self.agent_session_id.lock().await.clone()
    }

    /// Watch state transitions, e.g. to surface crashes in a UI.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SessionState) {
        let current = *self.state.borrow();
        if current != next && !current.can_transition_to(next) {
            tracing::debug!(
                "[ClaudeSession:{}] Unexpected transition {:?} -> {:?}",
                self.config.name,
                current,
                next
            );
        }
        self.state.send_replace(next);
    }

    async fn start(&mut self) -> Result<(), FlowError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.arg("-p");
        cmd.args(["--output-format", "stream-json"]);
        cmd.args(["--input-format", "stream-json"]);
        cmd.arg("--verbose");

        let permission_mode = self
            .config
            .permission_mode
            .as_deref()
            .unwrap_or("bypassPermissions");
        if permission_mode == "bypassPermissions" {
            cmd.arg("--dangerously-skip-permissions");
        } else {
            cmd.args(["--permission-mode", permission_mode]);
        }

        // No one is there to answer interactive questions
        cmd.args(["--disallowed-tools", "AskUserQuestion"]);

        if let Some(model) = &self.config.model {
            cmd.args(["--model", model]);
        }

        cmd.current_dir(&self.config.cwd);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::info!(
            "[ClaudeSession:{}] Spawning: {} -p --output-format stream-json ... (cwd: {})",
            self.config.name,
            self.config.command,
            self.config.cwd.display()
        );

        let mut child = cmd.spawn().map_err(|e| {
            self.state.send_replace(SessionState::Crashed);
            FlowError::SessionUnavailable(format!(
                "failed to spawn '{}' - is it installed? {}",
                self.config.command, e
            ))
        })?;

        let missing = |what: &str| FlowError::SessionUnavailable(format!("agent {} not captured", what));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        self.child = Some(child);
        self.stdin = Some(stdin);
        self.set_state(SessionState::Ready);

        // Spawn stdout reader
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current_generation = self.generation.clone();
        let state = self.state.clone();
        let turn = self.turn.clone();
        let agent_session_id = self.agent_session_id.clone();
        let name = self.config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = clear_ansi(line.trim());
                if !line.starts_with('{') {
                    continue;
                }
                match serde_json::from_str::<ClaudeOutputMessage>(&line) {
                    Ok(msg) => handle_message(msg, &turn, &agent_session_id).await,
                    Err(e) => {
                        tracing::debug!(
                            "[ClaudeSession:{}] Failed to parse: {} - {}",
                            name,
                            e,
                            &line[..line.len().min(100)]
                        );
                    }
                }
            }

            if current_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            // Fail the waiting turn, if any, by dropping its sender
            turn.lock().await.pending.take();
            if *state.borrow() != SessionState::Restarting {
                state.send_replace(SessionState::Crashed);
                tracing::warn!("[ClaudeSession:{}] Agent process exited", name);
            }
        });

        // Spawn stderr reader
        let name = self.config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    tracing::warn!("[ClaudeSession:{} stderr] {}", name, line);
                }
            }
        });

        // Wait for process to stabilize
        tokio::time::sleep(self.config.startup_grace).await;

        if self.state() == SessionState::Crashed {
            return Err(FlowError::SessionUnavailable(
                "agent process died during startup".to_string(),
            ));
        }

        tracing::info!("[ClaudeSession:{}] Process started", self.config.name);
        Ok(())
    }

    async fn stop(&mut self) {
        // Closing stdin lets the agent exit on its own; kill covers the rest
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!("[ClaudeSession:{}] Kill failed: {}", self.config.name, e);
            }
        }
        *self.agent_session_id.lock().await = None;
        *self.turn.lock().await = TurnState::default();
    }
}

#[async_trait]
impl AgentSession for ClaudeSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn working_directory(&self) -> &Path {
        &self.config.cwd
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    async fn send(&mut self, prompt: &str) -> Result<AgentReply, FlowError> {
        let current = self.state();
        if current != SessionState::Ready {
            return Err(current.unavailable(&self.config.name));
        }

        let session_id = self.agent_session_id.lock().await.clone();
        let user_input = serde_json::json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{ "type": "text", "text": prompt }]
            },
            "session_id": session_id
        });

        let (tx, rx) = oneshot::channel();
        {
            let mut turn = self.turn.lock().await;
            turn.buffer.clear();
            turn.pending = Some(tx);
        }
        self.set_state(SessionState::Busy);

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| FlowError::SessionUnavailable("stdin not available".to_string()))?;
        let line = format!("{}\n", user_input);
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.set_state(SessionState::Crashed);
            return Err(FlowError::SessionUnavailable(format!(
                "failed to write prompt: {}",
                e
            )));
        }

        let result = rx.await;
        match result {
            Ok(turn) => {
                self.set_state(SessionState::Ready);
                if turn.is_error {
                    Err(FlowError::PromptFailure(format!(
                        "agent reported an error ({}): {}",
                        turn.stop_reason, turn.text
                    )))
                } else {
                    Ok(AgentReply {
                        text: turn.text,
                        stop_reason: turn.stop_reason,
                    })
                }
            }
            Err(_) => Err(FlowError::SessionUnavailable(
                "agent process exited before replying".to_string(),
            )),
        }
    }

    async fn cancel_turn(&mut self) {
        if abandon_turn(&mut *self.turn.lock().await) {
            tracing::info!("[ClaudeSession:{}] Abandoned in-flight turn", self.config.name);
        }
        if self.state() == SessionState::Busy {
            self.set_state(SessionState::Ready);
        }
    }

    async fn restart(&mut self) -> Result<(), FlowError> {
        tracing::info!("[ClaudeSession:{}] Restarting", self.config.name);
        self.set_state(SessionState::Restarting);
        self.stop().await;
        self.start().await.inspect_err(|_| {
            self.state.send_replace(SessionState::Crashed);
        })
    }

    async fn run_shell(
        &mut self,
        command: &str,
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<ShellOutput, FlowError> {
        let cwd = cwd.unwrap_or(&self.config.cwd).to_path_buf();
        run_shell(command, &cwd, timeout).await
    }
}

// ─── Message Handling ───────────────────────────────────────────────────

async fn handle_message(
    msg: ClaudeOutputMessage,
    turn: &Arc<Mutex<TurnState>>,
    agent_session_id: &Arc<Mutex<Option<String>>>,
) {
    match msg.msg_type.as_str() {
        "system" => {
            if msg.subtype.as_deref() == Some("init") {
                if let Some(id) = msg.session_id {
                    *agent_session_id.lock().await = Some(id);
                }
            }
        }

        "assistant" => {
            if let Some(message) = msg.message {
                let mut turn = turn.lock().await;
                for item in message.content {
                    if item.content_type == "text" {
                        if let Some(text) = item.text {
                            if !turn.buffer.is_empty() {
                                turn.buffer.push('\n');
                            }
                            turn.buffer.push_str(&text);
                        }
                    }
                }
            }
        }

        "result" => {
            let mut turn = turn.lock().await;
            let buffered = std::mem::take(&mut turn.buffer);
            if turn.discard > 0 {
                turn.discard -= 1;
                return;
            }
            let text = match msg.result {
                Some(result) if !result.is_empty() => result,
                _ => buffered,
            };
            if let Some(tx) = turn.pending.take() {
                let _ = tx.send(TurnResult {
                    text,
                    stop_reason: msg.subtype.unwrap_or_else(|| "end_turn".to_string()),
                    is_error: msg.is_error.unwrap_or(false),
                });
            }
        }

        _ => {}
    }
}

/// Drop the waiting turn. Only a turn whose `result` has not arrived yet
/// leaves a reply behind that must be discarded.
fn abandon_turn(turn: &mut TurnState) -> bool {
    turn.buffer.clear();
    if turn.pending.take().is_some() {
        turn.discard += 1;
        true
    } else {
        false
    }
}

lazy_static! {
    static ref ANSI: Regex = Regex::new(r"\x1b\[[0-9;]*m").expect("ansi pattern");
}

fn clear_ansi(text: &str) -> String {
    ANSI.replace_all(text, "").to_string()
}
