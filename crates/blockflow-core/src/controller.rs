//! Execution controller — starts, observes and cancels runs.
//!
//! The controller owns the agent session for as long as a run executes.
//! At most one run holds the session at a time: the rule is an explicit
//! [`RunLock`], and a `start` that finds it taken fails immediately with
//! [`FlowError::SessionBusy`] instead of queueing.
//!
//!   - `start`  → validate the command closure, take the lock, spawn the run
//!   - `cancel` → trip the run's cancellation token
//!   - `status` → current block, frame depth and state
//!   - `wait`   → the run's final [`RunOutcome`]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::FlowError;
use crate::events::{ProgressBus, ProgressEvent};
use crate::git::{GitCollaborator, NoopGit};
use crate::history::RunHistoryWriter;
use crate::interpreter::{Interpreter, RunLimits, RunOutcome, RunStatus};
use crate::library::CommandLibrary;
use crate::models::BlockGraph;
use crate::session::{AgentSession, SessionState};
use crate::slash;

// ─── Run lock ──────────────────────────────────────────────────────────────

/// The one-run-at-a-time rule. Clones share the lock, so handing the same
/// lock to several controllers makes the rule process-wide.
#[derive(Clone, Default)]
pub struct RunLock(Arc<Mutex<()>>);

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock without waiting.
    pub fn try_acquire(&self) -> Result<OwnedMutexGuard<()>, FlowError> {
        Arc::clone(&self.0).try_lock_owned().map_err(|_| {
            FlowError::SessionBusy("another command is already running".to_string())
        })
    }

    pub fn is_held(&self) -> bool {
        self.0.try_lock().is_err()
    }
}

// ─── Controller ────────────────────────────────────────────────────────────

/// Finished runs kept for `status` and `wait`; older ones are forgotten.
const RETAINED_FINISHED_RUNS: usize = 32;

struct RunHandle {
    /// Start order, used to forget the oldest finished runs first
    seq: u64,
    cancel: CancellationToken,
    status: watch::Receiver<RunStatus>,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

#[derive(Clone)]
pub struct ExecutionController {
    config: EngineConfig,
    /// Live library; each run takes a snapshot at start
    library: Arc<RwLock<CommandLibrary>>,
    session: Arc<Mutex<Box<dyn AgentSession>>>,
    git: Arc<dyn GitCollaborator>,
    bus: ProgressBus,
    history: Option<RunHistoryWriter>,
    lock: RunLock,
    /// run id → handle, kept after completion for `status` and `wait`
    runs: Arc<RwLock<HashMap<String, RunHandle>>>,
    next_seq: Arc<AtomicU64>,
}

impl ExecutionController {
    pub fn new(
        config: EngineConfig,
        library: CommandLibrary,
        session: Box<dyn AgentSession>,
    ) -> Self {
        Self {
            config,
            library: Arc::new(RwLock::new(library)),
            session: Arc::new(Mutex::new(session)),
            git: Arc::new(NoopGit),
            bus: ProgressBus::default(),
            history: None,
            lock: RunLock::new(),
            runs: Arc::new(RwLock::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_git(mut self, git: Arc<dyn GitCollaborator>) -> Self {
        self.git = git;
        self
    }

    pub fn with_history(mut self, history: RunHistoryWriter) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_run_lock(mut self, lock: RunLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn run_lock(&self) -> RunLock {
        self.lock.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start `command` with positional `args` and return the run id.
    ///
    /// The command and everything it can call are validated against a
    /// snapshot of the library before the lock is taken, so an invalid graph
    /// fails without touching the session.
    pub async fn start(&self, command: &str, args: Vec<String>) -> Result<String, FlowError> {
        let name = command.trim().trim_start_matches('/').to_string();
        if name.is_empty() {
            return Err(FlowError::InvalidInvocation("empty command name".to_string()));
        }

        let snapshot = self.library.read().await.clone();
        for warning in snapshot.validate_closure(&name)? {
            tracing::warn!("[Controller] /{}: {}", name, warning);
        }

        let guard = self.lock.try_acquire()?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let interpreter = Interpreter::new(&run_id, snapshot, RunLimits::from_config(&self.config))
            .with_git(Arc::clone(&self.git))
            .with_bus(self.bus.clone())
            .with_history(self.history.clone())
            .with_cancellation(cancel.clone());
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let mut runs = self.runs.write().await;
        prune_finished(&mut runs);
        runs.insert(
            run_id.clone(),
            RunHandle {
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                cancel,
                status: interpreter.status(),
                outcome: outcome_rx,
            },
        );
        drop(runs);
        tracing::info!("[Controller] Starting run {} for /{} {:?}", run_id, name, args);

        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            let mut session = session.lock_owned().await;
            let outcome = interpreter.run(&mut **session, &name, args).await;
            drop(session);
            drop(guard);
            let _ = outcome_tx.send(Some(outcome));
        });

        Ok(run_id)
    }

    /// Parse a `/name args...` line and start it.
    pub async fn invoke(&self, line: &str) -> Result<String, FlowError> {
        let (name, args) = slash::parse_invocation(line)?;
        self.start(&name, args).await
    }

    /// Request cancellation. Returns `false` for unknown or finished runs.
    pub async fn cancel(&self, run_id: &str) -> bool {
        let runs = self.runs.read().await;
        let Some(handle) = runs.get(run_id) else {
            return false;
        };
        if handle.outcome.borrow().is_some() {
            return false;
        }
        tracing::info!("[Controller] Cancelling run {}", run_id);
        handle.cancel.cancel();
        true
    }

    pub async fn status(&self, run_id: &str) -> Option<RunStatus> {
        let runs = self.runs.read().await;
        runs.get(run_id).map(|handle| handle.status.borrow().clone())
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(&self, run_id: &str) -> Result<RunOutcome, FlowError> {
        let mut outcome = {
            let runs = self.runs.read().await;
            runs.get(run_id)
                .map(|handle| handle.outcome.clone())
                .ok_or_else(|| FlowError::InvalidInvocation(format!("unknown run '{}'", run_id)))?
        };
        let lost = || FlowError::Internal(format!("run {} ended without an outcome", run_id));
        let finished = outcome.wait_for(|o| o.is_some()).await.map_err(|_| lost())?;
        let result = finished.clone();
        result.ok_or_else(lost)
    }

    /// Progress events of every run started by this controller.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.bus.subscribe()
    }

    /// Session state, or `None` while a run holds the session.
    pub fn session_state(&self) -> Option<SessionState> {
        self.session.try_lock().ok().map(|session| session.state())
    }

    // ─── Library ───────────────────────────────────────────────────────────

    /// Snapshot of the live library.
    pub async fn library(&self) -> CommandLibrary {
        self.library.read().await.clone()
    }

    /// Validate and add or replace a command. Runs already in flight keep
    /// the definition they started with.
    pub async fn save_command(&self, graph: BlockGraph) -> Result<Vec<String>, FlowError> {
        let warnings = graph.validate()?;
        let name = graph.name.clone();
        let replaced = self.library.write().await.insert(graph).is_some();
        tracing::info!(
            "[Controller] {} command /{}",
            if replaced { "Replaced" } else { "Added" },
            name
        );
        Ok(warnings)
    }

    pub async fn remove_command(&self, name: &str) -> bool {
        self.library.write().await.remove(name).is_some()
    }
}

/// Forget the oldest finished runs beyond [`RETAINED_FINISHED_RUNS`].
/// Runs still in flight are never dropped.
fn prune_finished(runs: &mut HashMap<String, RunHandle>) {
    let mut finished: Vec<(u64, String)> = runs
        .iter()
        .filter(|(_, handle)| handle.outcome.borrow().is_some())
        .map(|(id, handle)| (handle.seq, id.clone()))
        .collect();
    if finished.len() <= RETAINED_FINISHED_RUNS {
        return;
    }
    finished.sort_unstable();
    let excess = finished.len() - RETAINED_FINISHED_RUNS;
    for (_, id) in finished.into_iter().take(excess) {
        runs.remove(&id);
    }
}
