//! Per-block-type handlers.

use std::path::PathBuf;

use super::frame::{Frame, ReturnBinding};
use super::structured;
use super::{Flow, Interpreter, SuspendReason};
use crate::condition::Condition;
use crate::error::FlowError;
use crate::git::BlockCommit;
use crate::models::{
    BashConfig, Block, BlockGraph, BlockKind, CastConfig, CommandConfig, EdgeTag, PromptConfig,
    Value, VariableConfig,
};
use crate::session::{AgentReply, AgentSession};
use crate::template;

impl Interpreter {
    pub(super) async fn dispatch(
        &mut self,
        session: &mut dyn AgentSession,
        graph: &BlockGraph,
        block: &Block,
    ) -> Result<Flow, FlowError> {
        match &block.kind {
            BlockKind::Start => Ok(next(graph, block)),
            BlockKind::Prompt(config) => self.run_prompt(session, graph, block, config).await,
            BlockKind::Bash(config) => self.run_bash(session, graph, block, config).await,
            BlockKind::Variable(config) => self.run_variable(graph, block, config),
            BlockKind::Branch(config) => {
                let taken = Condition::parse(&config.condition)?.evaluate(&self.frame()?.vars)?;
                let tag = if taken { EdgeTag::True } else { EdgeTag::False };
                let target = graph.successor(&block.id, tag).ok_or_else(|| {
                    FlowError::Internal(format!("branch has no '{}' edge", tag.as_str()))
                })?;
                tracing::debug!(
                    "[Interpreter] Branch '{}' ({}) -> {}",
                    block.id,
                    config.condition,
                    tag.as_str()
                );
                Ok(Flow::Next(Some(target.to_string())))
            }
            BlockKind::Command(config) => self.run_command(graph, block, config),
            BlockKind::Refresh => self.run_refresh(session, graph, block).await,
            BlockKind::Cast(config) => self.run_cast(graph, block, config),
            BlockKind::End => Ok(Flow::Return),
        }
    }

    async fn run_prompt(
        &mut self,
        session: &mut dyn AgentSession,
        graph: &BlockGraph,
        block: &Block,
        config: &PromptConfig,
    ) -> Result<Flow, FlowError> {
        let text = template::resolve(&config.prompt, &self.frame()?.vars)?;
        let prompt = match &config.output_schema {
            Some(schema) => structured::with_schema_instructions(&text, schema),
            None => text,
        };

        let mut reply = self.ask_agent(session, &prompt).await?;
        let mut captured = Vec::new();
        if let Some(schema) = &config.output_schema {
            let fields = match structured::parse_response(&reply.text, schema) {
                Ok(fields) => fields,
                Err(first) => {
                    tracing::warn!(
                        "[Interpreter] Prompt '{}' returned unparseable output, retrying once: {}",
                        block.id,
                        first
                    );
                    reply = self
                        .ask_agent(session, &structured::corrective_prompt(schema))
                        .await?;
                    structured::parse_response(&reply.text, schema).map_err(|e| {
                        FlowError::PromptFailure(format!(
                            "structured output still invalid after retry: {}",
                            e
                        ))
                    })?
                }
            };
            captured.extend(fields);
        }
        if let Some(name) = &config.output_variable {
            captured.push((name.clone(), Value::String(reply.text.trim().to_string())));
        }

        // Nothing is written until the whole block has succeeded
        let frame = self.frame_mut()?;
        for (name, value) in captured {
            frame.vars.set(name, value);
        }
        self.notify_git(block, session.working_directory().to_path_buf()).await;
        Ok(next(graph, block))
    }

    /// Send one prompt as a suspension point, honouring timeout and cancel.
    async fn ask_agent(
        &self,
        session: &mut dyn AgentSession,
        prompt: &str,
    ) -> Result<AgentReply, FlowError> {
        let timeout = self.limits.prompt_timeout;
        let outcome = self
            .suspend(
                SuspendReason::AwaitingAgent,
                tokio::time::timeout(timeout, session.send(prompt)),
            )
            .await;
        match outcome {
            Some(Ok(reply)) => reply,
            Some(Err(_)) => {
                session.cancel_turn().await;
                Err(FlowError::PromptFailure(format!(
                    "no response within {}s",
                    timeout.as_secs()
                )))
            }
            None => {
                session.cancel_turn().await;
                Err(FlowError::Cancelled)
            }
        }
    }

    async fn run_bash(
        &mut self,
        session: &mut dyn AgentSession,
        graph: &BlockGraph,
        block: &Block,
        config: &BashConfig,
    ) -> Result<Flow, FlowError> {
        let vars = &self.frame()?.vars;
        let command = template::resolve(&config.command, vars)?;
        let cwd = match &config.working_directory {
            Some(dir) => {
                let dir = PathBuf::from(template::resolve(dir, vars)?);
                let dir = if dir.is_absolute() {
                    dir
                } else {
                    session.working_directory().join(dir)
                };
                if !dir.is_dir() {
                    return Err(FlowError::ShellRejected(format!(
                        "working directory '{}' does not exist",
                        dir.display()
                    )));
                }
                Some(dir)
            }
            None => None,
        };

        for warning in self.guard.check(&command)? {
            tracing::warn!("[Interpreter] Bash '{}': {}: {}", block.id, warning, command);
        }

        let output = self
            .suspend(
                SuspendReason::AwaitingShell,
                session.run_shell(&command, cwd.as_deref(), self.limits.shell_timeout),
            )
            .await
            .ok_or(FlowError::Cancelled)??;
        if output.timed_out {
            tracing::warn!(
                "[Interpreter] Bash '{}' timed out after {}s",
                block.id,
                self.limits.shell_timeout.as_secs()
            );
        }

        let mut captured = Vec::new();
        if let Some(name) = &config.stdout_variable {
            let stdout = output.stdout.trim();
            let value = match config.output_type {
                Some(ty) => Value::parse_as(stdout, ty)?,
                None => Value::from(stdout),
            };
            captured.push((name.clone(), value));
        }
        if let Some(name) = &config.stderr_variable {
            captured.push((name.clone(), Value::from(output.stderr.trim())));
        }
        if let Some(name) = &config.exit_code_variable {
            captured.push((name.clone(), Value::Number(f64::from(output.exit_code))));
        }

        let frame = self.frame_mut()?;
        for (name, value) in captured {
            frame.vars.set(name, value);
        }
        self.notify_git(block, session.working_directory().to_path_buf()).await;
        Ok(next(graph, block))
    }

    fn run_variable(
        &mut self,
        graph: &BlockGraph,
        block: &Block,
        config: &VariableConfig,
    ) -> Result<Flow, FlowError> {
        let frame = self.frame_mut()?;
        let text = template::resolve(&config.value, &frame.vars)?;
        let value = Value::parse_as(&text, config.value_type)?;
        frame.vars.set(config.variable.clone(), value);
        Ok(next(graph, block))
    }

    fn run_command(
        &mut self,
        graph: &BlockGraph,
        block: &Block,
        config: &CommandConfig,
    ) -> Result<Flow, FlowError> {
        let vars = &self.frame()?.vars;
        let args = config
            .arguments
            .iter()
            .map(|arg| template::resolve(arg, vars))
            .collect::<Result<Vec<_>, _>>()?;

        let target = config.target();
        let callee = self
            .library
            .get(target)
            .ok_or_else(|| FlowError::CommandNotFound(target.to_string()))?;
        if self.stack.len() >= self.limits.max_call_depth {
            return Err(FlowError::StepLimitExceeded(format!(
                "call depth limit of {} reached invoking /{}",
                self.limits.max_call_depth, target
            )));
        }

        let binding = ReturnBinding {
            call_block_id: block.id.clone(),
            call_block_name: block.display_name().to_string(),
            return_variable: config.return_variable.clone(),
            merge_output: config.merge_output,
        };
        let child = Frame::enter(callee, args, Some(binding))?;
        tracing::debug!(
            "[Interpreter] /{} calls /{} at depth {}",
            graph.name,
            target,
            self.stack.len() + 1
        );
        Ok(Flow::Call {
            child,
            resume: graph
                .successor(&block.id, EdgeTag::Plain)
                .map(str::to_string),
        })
    }

    /// Restart is never abandoned halfway; a pending cancel is observed at
    /// the next block boundary.
    async fn run_refresh(
        &mut self,
        session: &mut dyn AgentSession,
        graph: &BlockGraph,
        block: &Block,
    ) -> Result<Flow, FlowError> {
        let timeout = self.limits.restart_timeout;
        self.status
            .send_modify(|s| s.state = super::RunState::Suspended(SuspendReason::AwaitingRestart));
        let restarted = tokio::time::timeout(timeout, session.restart()).await;
        self.status.send_modify(|s| s.state = super::RunState::Running);
        match restarted {
            Ok(result) => result?,
            Err(_) => {
                return Err(FlowError::SessionUnavailable(format!(
                    "session did not restart within {}s",
                    timeout.as_secs()
                )))
            }
        }
        tracing::info!("[Interpreter] Session '{}' restarted", session.name());
        Ok(next(graph, block))
    }

    fn run_cast(
        &mut self,
        graph: &BlockGraph,
        block: &Block,
        config: &CastConfig,
    ) -> Result<Flow, FlowError> {
        let frame = self.frame_mut()?;
        let current = frame
            .vars
            .get(&config.variable)
            .ok_or_else(|| FlowError::UnresolvedVariable {
                name: config.variable.clone(),
                available: frame.vars.names(),
            })?;
        let cast = current.cast(config.to)?;
        frame.vars.set(config.variable.clone(), cast);
        Ok(next(graph, block))
    }

    async fn notify_git(&self, block: &Block, working_directory: PathBuf) {
        let commit = BlockCommit {
            block_type: block.block_type(),
            block_name: block.display_name().to_string(),
            working_directory,
        };
        self.git.block_completed(&commit).await;
    }
}

fn next(graph: &BlockGraph, block: &Block) -> Flow {
    Flow::Next(
        graph
            .successor(&block.id, EdgeTag::Plain)
            .map(str::to_string),
    )
}
