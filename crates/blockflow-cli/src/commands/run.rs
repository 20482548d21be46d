//! `blockflow run` / `blockflow invoke` — execute a command and stream progress.

use blockflow_core::events::{ProgressEvent, ProgressState};
use blockflow_core::slash;
use blockflow_core::{ExecutionController, RunOutcome, RunState};
use console::style;
use tokio::sync::broadcast::error::RecvError;

use super::CliContext;

/// Run `command` from the library with positional `args`.
pub async fn run(ctx: &CliContext, command: &str, args: Vec<String>) -> Result<(), String> {
    let library = ctx.load_library()?;
    let session = ctx.spawn_session().await?;
    let controller = ctx.controller(library, session);
    let outcome = execute(&controller, command, args, ctx.verbose).await?;
    report(&outcome, ctx.verbose)
}

/// Run a `/name args...` line.
pub async fn invoke(ctx: &CliContext, line: &str) -> Result<(), String> {
    // Reject a malformed line before an agent process is spawned
    let (command, args) = slash::parse_invocation(line).map_err(|e| e.to_string())?;
    run(ctx, &command, args).await
}

/// Start the run, print its progress until it finishes and return the
/// outcome. Ctrl-C requests cancellation.
pub async fn execute(
    controller: &ExecutionController,
    command: &str,
    args: Vec<String>,
    verbose: bool,
) -> Result<RunOutcome, String> {
    let mut events = controller.subscribe();
    let run_id = controller
        .start(command, args)
        .await
        .map_err(|e| e.to_string())?;
    println!(
        "{} /{} {}",
        style("▶").cyan().bold(),
        command.trim_start_matches('/'),
        style(format!("(run {})", short_id(&run_id))).dim()
    );

    let mut cancel_requested = false;
    let outcome = loop {
        tokio::select! {
            outcome = controller.wait(&run_id) => break outcome.map_err(|e| e.to_string())?,
            event = events.recv() => match event {
                Ok(event) if event.run_id == run_id => print_event(&event, verbose),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("[CLI] Skipped {} progress events", skipped);
                }
                Err(RecvError::Closed) => {
                    break controller.wait(&run_id).await.map_err(|e| e.to_string())?;
                }
            },
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                println!("{} cancelling run...", style("⏹").yellow());
                controller.cancel(&run_id).await;
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        if event.run_id == run_id {
            print_event(&event, verbose);
        }
    }
    Ok(outcome)
}

/// Print the final line and turn a failed or cancelled run into an error.
pub fn report(outcome: &RunOutcome, verbose: bool) -> Result<(), String> {
    match &outcome.state {
        RunState::Completed => {
            println!(
                "{} /{} completed in {} step(s)",
                style("✔").green().bold(),
                outcome.command,
                outcome.steps
            );
            if verbose {
                for variable in &outcome.variables {
                    println!("    {} = {}", variable.name, truncate(&variable.value.to_string(), 80));
                }
            }
            Ok(())
        }
        RunState::Failed(failure) => Err(format!(
            "/{} failed after {} step(s): {}",
            outcome.command, outcome.steps, failure
        )),
        RunState::Cancelled => Err(format!("/{} was cancelled", outcome.command)),
        other => Err(format!("/{} ended in state {}", outcome.command, other.label())),
    }
}

pub fn format_event(event: &ProgressEvent) -> Option<String> {
    let indent = "  ".repeat(event.depth.max(1));
    let label = format!("{:<8} {}", event.block_type.label(), event.block_name);
    let line = match event.state {
        ProgressState::Started => return None,
        ProgressState::Completed => format!(
            "{}{} {}{}",
            indent,
            style("✓").green(),
            label,
            event
                .duration_ms
                .filter(|ms| *ms >= 1000)
                .map(|ms| format!(" ({:.1}s)", ms as f64 / 1000.0))
                .unwrap_or_default()
        ),
        ProgressState::Failed => format!(
            "{}{} {}: {}",
            indent,
            style("✗").red(),
            label,
            event.detail.as_deref().unwrap_or("failed")
        ),
        ProgressState::Cancelled => format!("{}{} {}", indent, style("⊘").yellow(), label),
        ProgressState::RunCompleted => return None,
    };
    Some(line)
}

fn print_event(event: &ProgressEvent, verbose: bool) {
    if verbose && event.state == ProgressState::Started {
        println!(
            "{}{} {}",
            "  ".repeat(event.depth.max(1)),
            style("…").dim(),
            event.block_name
        );
    }
    if let Some(line) = format_event(event) {
        println!("{}", line);
    }
    if verbose && event.state == ProgressState::Completed {
        if let Some(variables) = &event.variables {
            for variable in variables {
                println!(
                    "{}    {} = {}",
                    "  ".repeat(event.depth.max(1)),
                    style(&variable.name).dim(),
                    truncate(&variable.value.to_string(), 80)
                );
            }
        }
    }
}

fn short_id(run_id: &str) -> &str {
    &run_id[..8.min(run_id.len())]
}

pub fn truncate(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max {
        flat
    } else {
        let kept: String = flat.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("line one\nline two", 8), "line on…");
        assert_eq!(truncate("ééééé", 3), "éé…");
    }
}
