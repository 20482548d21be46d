//! Execution interpreter — walks block graphs against one agent session.
//!
//! A run is a stack of [`Frame`]s. The root frame runs the invoked command;
//! each Command block pushes a child frame that runs to completion before
//! its caller resumes. Recursion is bounded by `max_call_depth` and loops
//! by `max_steps`, both counted across all frames.
//!
//! The interpreter yields only while awaiting the agent (Prompt), a shell
//! command (Bash) or a session restart (Refresh). Cancellation is observed
//! at every block boundary and at the first two suspension points.

mod blocks;
pub mod frame;
pub mod structured;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{BlockFailure, FlowError};
use crate::events::{ProgressBus, ProgressEvent, ProgressState};
use crate::git::{GitCollaborator, NoopGit};
use crate::history::RunHistoryWriter;
use crate::library::CommandLibrary;
use crate::models::{Block, BlockGraph, BlockType};
use crate::session::{AgentSession, ShellGuard};
use crate::variables::Variable;

pub use frame::{Frame, ReturnBinding};

// ─── Run state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    AwaitingAgent,
    AwaitingShell,
    AwaitingRestart,
}

impl SuspendReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingAgent => "awaiting agent",
            Self::AwaitingShell => "awaiting shell",
            Self::AwaitingRestart => "awaiting restart",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Running,
    Suspended(SuspendReason),
    Completed,
    Failed(BlockFailure),
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }

    pub fn label(&self) -> String {
        match self {
            Self::Running => "running".to_string(),
            Self::Suspended(reason) => format!("suspended ({})", reason.as_str()),
            Self::Completed => "completed".to_string(),
            Self::Failed(_) => "failed".to_string(),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Live view of a run, published on every block boundary and suspension.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatus {
    pub run_id: String,
    pub command: String,
    pub state: RunState,
    pub current_block: Option<String>,
    /// Frame stack depth, 1 for the root command
    pub depth: usize,
    pub steps: usize,
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,
    pub command: String,
    pub state: RunState,
    /// Block ids in execution order, across all frames
    pub visited: Vec<String>,
    /// Root frame variables on completion; the innermost frame's otherwise
    pub variables: Vec<Variable>,
    pub steps: usize,
}

impl RunOutcome {
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn failure(&self) -> Option<&BlockFailure> {
        match &self.state {
            RunState::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunLimits {
    pub max_steps: usize,
    pub max_call_depth: usize,
    pub prompt_timeout: Duration,
    pub shell_timeout: Duration,
    pub restart_timeout: Duration,
    pub shell_guard: bool,
}

impl RunLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            max_call_depth: config.max_call_depth,
            prompt_timeout: config.prompt_timeout(),
            shell_timeout: config.shell_timeout(),
            restart_timeout: config.restart_timeout(),
            shell_guard: config.shell_guard,
        }
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// What a block asks the run loop to do next.
enum Flow {
    /// Move to this block in the current frame; `None` is a leaf
    Next(Option<String>),
    /// Push `child`; the caller resumes at `resume`
    Call { child: Frame, resume: Option<String> },
    /// End block: pop the current frame
    Return,
}

/// Why the run loop stopped early.
enum Halt {
    Failed(BlockFailure),
    Cancelled,
}

// ─── Interpreter ───────────────────────────────────────────────────────────

pub struct Interpreter {
    run_id: String,
    library: CommandLibrary,
    limits: RunLimits,
    guard: ShellGuard,
    git: Arc<dyn GitCollaborator>,
    bus: ProgressBus,
    history: Option<RunHistoryWriter>,
    cancel: CancellationToken,
    status: watch::Sender<RunStatus>,
    stack: Vec<Frame>,
    steps: usize,
    visited: Vec<String>,
    final_variables: Vec<Variable>,
}

impl Interpreter {
    /// `library` is the run's snapshot; later library edits do not reach it.
    pub fn new(run_id: impl Into<String>, library: CommandLibrary, limits: RunLimits) -> Self {
        let run_id = run_id.into();
        let (status, _) = watch::channel(RunStatus {
            run_id: run_id.clone(),
            command: String::new(),
            state: RunState::Running,
            current_block: None,
            depth: 0,
            steps: 0,
        });
        Self {
            run_id,
            library,
            guard: ShellGuard::new(limits.shell_guard),
            limits,
            git: Arc::new(NoopGit),
            bus: ProgressBus::default(),
            history: None,
            cancel: CancellationToken::new(),
            status,
            stack: Vec::new(),
            steps: 0,
            visited: Vec::new(),
            final_variables: Vec::new(),
        }
    }

    pub fn with_git(mut self, git: Arc<dyn GitCollaborator>) -> Self {
        self.git = git;
        self
    }

    pub fn with_bus(mut self, bus: ProgressBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_history(mut self, history: Option<RunHistoryWriter>) -> Self {
        self.history = history;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn status(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute `command` with `args` to a terminal state.
    pub async fn run(
        mut self,
        session: &mut dyn AgentSession,
        command: &str,
        args: Vec<String>,
    ) -> RunOutcome {
        let command = command.trim().trim_start_matches('/').to_string();
        self.status.send_modify(|s| s.command = command.clone());
        tracing::info!(
            "[Interpreter] Run {} started: /{} {:?}",
            self.run_id,
            command,
            args
        );

        let state = match self.execute(session, &command, args).await {
            Ok(()) => RunState::Completed,
            Err(Halt::Cancelled) => {
                tracing::info!("[Interpreter] Run {} cancelled", self.run_id);
                RunState::Cancelled
            }
            Err(Halt::Failed(failure)) => {
                tracing::error!("[Interpreter] Run {} failed: {}", self.run_id, failure);
                RunState::Failed(failure)
            }
        };

        if !matches!(state, RunState::Completed) {
            if let Some(frame) = self.stack.last() {
                self.final_variables = frame.vars.snapshot();
            }
            self.stack.clear();
        }
        let final_state = state.clone();
        self.status.send_modify(|s| {
            s.state = final_state;
            s.depth = 0;
        });
        tracing::info!(
            "[Interpreter] Run {} finished after {} steps: {}",
            self.run_id,
            self.steps,
            state.label()
        );

        RunOutcome {
            run_id: self.run_id,
            command,
            state,
            visited: self.visited,
            variables: self.final_variables,
            steps: self.steps,
        }
    }

    async fn execute(
        &mut self,
        session: &mut dyn AgentSession,
        command: &str,
        args: Vec<String>,
    ) -> Result<(), Halt> {
        let graph = self.library.get(command).ok_or_else(|| {
            Halt::Failed(BlockFailure::new(
                "",
                "",
                command,
                FlowError::CommandNotFound(command.to_string()),
            ))
        })?;
        let root = Frame::enter(Arc::clone(&graph), args, None).map_err(|e| {
            let start = graph.start_block();
            Halt::Failed(BlockFailure::new(
                start.map(|b| b.id.as_str()).unwrap_or_default(),
                start.map(|b| b.display_name()).unwrap_or_default(),
                command,
                e,
            ))
        })?;
        self.stack.push(root);

        loop {
            let Some(frame) = self.stack.last() else {
                return Ok(());
            };
            let graph = Arc::clone(&frame.graph);
            let Some(block) = graph.block(&frame.current) else {
                let missing = frame.current.clone();
                return Err(Halt::Failed(BlockFailure::new(
                    missing.clone(),
                    missing.clone(),
                    graph.name.clone(),
                    FlowError::Internal(format!("block '{}' not found", missing)),
                )));
            };

            if self.cancel.is_cancelled() {
                self.emit(self.event(&graph, block, ProgressState::Cancelled)).await;
                return Err(Halt::Cancelled);
            }

            self.steps += 1;
            if self.steps > self.limits.max_steps {
                let error = FlowError::StepLimitExceeded(format!(
                    "run exceeded {} steps",
                    self.limits.max_steps
                ));
                return Err(self.fail(&graph, block, error).await);
            }

            self.visited.push(block.id.clone());
            let (steps, depth) = (self.steps, self.stack.len());
            self.status.send_modify(|s| {
                s.state = RunState::Running;
                s.current_block = Some(block.id.clone());
                s.depth = depth;
                s.steps = steps;
            });
            tracing::debug!(
                "[Interpreter] /{} step {} depth {}: {} '{}'",
                graph.name,
                steps,
                depth,
                block.block_type().label(),
                block.id
            );
            self.emit(self.event(&graph, block, ProgressState::Started)).await;

            let started = Instant::now();
            let flow = match self.dispatch(session, &graph, block).await {
                Ok(flow) => flow,
                Err(FlowError::Cancelled) => {
                    self.emit(self.event(&graph, block, ProgressState::Cancelled)).await;
                    return Err(Halt::Cancelled);
                }
                Err(error) => return Err(self.fail(&graph, block, error).await),
            };

            let mut completed = self.event(&graph, block, ProgressState::Completed);
            completed.variables = self.stack.last().map(|f| f.vars.snapshot());
            completed.duration_ms = Some(started.elapsed().as_millis() as u64);
            self.emit(completed).await;

            match flow {
                Flow::Next(Some(next)) => {
                    if let Some(frame) = self.stack.last_mut() {
                        frame.current = next;
                    }
                }
                Flow::Call { child, resume } => {
                    if let Some(frame) = self.stack.last_mut() {
                        frame.return_target = resume;
                    }
                    self.stack.push(child);
                }
                Flow::Next(None) | Flow::Return => {
                    if let Err(failure) = self.finish_frame() {
                        let mut event = self.event(&graph, block, ProgressState::Failed);
                        event.command = failure.command.clone();
                        event.block_id = failure.block_id.clone();
                        event.block_name = failure.block_name.clone();
                        event.block_type = BlockType::Command;
                        event.variables = self.stack.last().map(|f| f.vars.snapshot());
                        event.detail = Some(failure.error.to_string());
                        self.emit(event).await;
                        return Err(Halt::Failed(failure));
                    }
                }
            }

            if self.stack.is_empty() {
                let mut done = self.event(&graph, block, ProgressState::RunCompleted);
                done.variables = Some(self.final_variables.clone());
                self.emit(done).await;
                return Ok(());
            }
        }
    }

    /// Pop the finished frame and hand its results to the caller.
    ///
    /// A caller whose Command block was a leaf has nowhere to resume, so it
    /// finishes as well.
    fn finish_frame(&mut self) -> Result<(), BlockFailure> {
        loop {
            let Some(child) = self.stack.pop() else {
                return Ok(());
            };
            if self.stack.is_empty() {
                self.final_variables = child.vars.snapshot();
                return Ok(());
            }
            let depth = self.stack.len() - 1;
            let parent = &mut self.stack[depth];

            if let Some(binding) = &child.binding {
                if binding.merge_output {
                    parent.vars.merge_from(&child.vars);
                }
                if let Some(name) = &binding.return_variable {
                    match child.vars.get(name) {
                        Some(value) => parent.vars.set(name.clone(), value),
                        None => {
                            return Err(BlockFailure::new(
                                binding.call_block_id.clone(),
                                binding.call_block_name.clone(),
                                parent.graph.name.clone(),
                                FlowError::UnresolvedVariable {
                                    name: name.clone(),
                                    available: child.vars.names(),
                                },
                            ));
                        }
                    }
                }
            }

            match parent.return_target.take() {
                Some(next) => {
                    parent.current = next;
                    return Ok(());
                }
                None => continue,
            }
        }
    }

    async fn fail(&self, graph: &BlockGraph, block: &Block, error: FlowError) -> Halt {
        let mut event = self.event(graph, block, ProgressState::Failed);
        event.variables = self.stack.last().map(|f| f.vars.snapshot());
        event.detail = Some(error.to_string());
        self.emit(event).await;
        Halt::Failed(BlockFailure::new(
            block.id.clone(),
            block.display_name(),
            graph.name.clone(),
            error,
        ))
    }

    // ─── Helpers shared with block handlers ─────────────────────────────────

    fn frame(&self) -> Result<&Frame, FlowError> {
        self.stack
            .last()
            .ok_or_else(|| FlowError::Internal("no active frame".to_string()))
    }

    fn frame_mut(&mut self) -> Result<&mut Frame, FlowError> {
        self.stack
            .last_mut()
            .ok_or_else(|| FlowError::Internal("no active frame".to_string()))
    }

    /// Await `fut` as a suspension point. `None` means the run was cancelled
    /// first and `fut` was dropped.
    async fn suspend<F: Future>(&self, reason: SuspendReason, fut: F) -> Option<F::Output> {
        self.status.send_modify(|s| s.state = RunState::Suspended(reason));
        let output = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            output = fut => Some(output),
        };
        self.status.send_modify(|s| s.state = RunState::Running);
        output
    }

    fn event(&self, graph: &BlockGraph, block: &Block, state: ProgressState) -> ProgressEvent {
        ProgressEvent {
            run_id: self.run_id.clone(),
            command: graph.name.clone(),
            block_id: block.id.clone(),
            block_name: block.display_name().to_string(),
            block_type: block.block_type(),
            state,
            depth: self.stack.len(),
            step: self.steps,
            variables: None,
            detail: None,
            duration_ms: None,
            timestamp: Utc::now(),
        }
    }

    async fn emit(&self, event: ProgressEvent) {
        if let Some(history) = &self.history {
            history.append_safe(&event).await;
        }
        self.bus.publish(event);
    }
}
