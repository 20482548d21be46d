//! `blockflow list` / `validate` / `check` — inspect command definitions.

use std::path::Path;

use blockflow_core::BlockGraph;
use console::style;

use super::run::truncate;
use super::CliContext;

pub fn list(ctx: &CliContext) -> Result<(), String> {
    let library = ctx.load_library()?;
    if library.is_empty() {
        println!("No commands found in {}", ctx.commands_dir.display());
        return Ok(());
    }

    println!("📋 Commands in {}:", ctx.commands_dir.display());
    println!();
    println!("┌──────────────────┬──────────────────────────┬────────┬──────────────────────────────┐");
    println!("│ Command          │ Arguments                │ Blocks │ Description                  │");
    println!("├──────────────────┼──────────────────────────┼────────┼──────────────────────────────┤");
    for name in library.names() {
        let Some(graph) = library.get(&name) else { continue };
        println!(
            "│ {:<16} │ {:<24} │ {:>6} │ {:<28} │",
            truncate(&format!("/{}", graph.name), 16),
            truncate(&signature(&graph), 24),
            graph.blocks.len(),
            truncate(&graph.description, 28)
        );
    }
    println!("└──────────────────┴──────────────────────────┴────────┴──────────────────────────────┘");
    println!();
    println!("Total: {} command(s)", library.len());
    Ok(())
}

/// Usage line for the declared arguments: `<required> [optional] [name=default]`.
pub fn signature(graph: &BlockGraph) -> String {
    graph
        .arguments
        .iter()
        .map(|arg| match (&arg.default, arg.required) {
            (Some(default), _) => format!("[{}={}]", arg.name, default),
            (None, true) => format!("<{}>", arg.name),
            (None, false) => format!("[{}]", arg.name),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Validate a single command file.
pub fn validate(file: &Path) -> Result<(), String> {
    let graph = BlockGraph::from_file(file)?;
    let warnings = graph.validate().map_err(|e| e.to_string())?;

    println!(
        "{} /{} is valid ({} blocks, {} edges)",
        style("✅").green(),
        graph.name,
        graph.blocks.len(),
        graph.edges.len()
    );
    for warning in warnings {
        println!("   {} {}", style("⚠").yellow(), warning);
    }
    Ok(())
}

/// Validate the whole library, including cross-command references.
pub fn check(ctx: &CliContext) -> Result<(), String> {
    let library = ctx.load_library()?;
    let report = library.validate_all();

    for error in &report.errors {
        println!("{} {}", style("✗").red(), error);
    }
    for warning in &report.warnings {
        println!("{} {}", style("⚠").yellow(), warning);
    }

    if report.is_ok() {
        println!(
            "{} {} command(s) checked, no errors",
            style("✅").green(),
            library.len()
        );
        Ok(())
    } else {
        Err(format!(
            "{} of {} command(s) have errors",
            report.errors.len(),
            library.len()
        ))
    }
}
