//! Blockflow CLI — run flowchart slash commands against a coding agent.
//!
//! Commands are loaded from the library directory (`.blockflow/commands`
//! by default) and executed by blockflow-core's interpreter.

use std::path::PathBuf;

use blockflow_cli::commands::{self, CliContext, CliOptions};
use clap::{Parser, Subcommand};

/// Blockflow CLI — flowchart slash commands for coding agents
#[derive(Parser)]
#[command(name = "blockflow", version, about = "Blockflow CLI — flowchart slash commands for coding agents")]
pub struct Cli {
    /// Path to the engine config file (default: ./blockflow.yaml, then ~/.blockflow/config.yaml)
    #[arg(long, env = "BLOCKFLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Command library directory
    #[arg(long, env = "BLOCKFLOW_COMMANDS_DIR", global = true)]
    commands_dir: Option<PathBuf>,

    /// Working directory for the agent session and shell blocks
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Maximum blocks executed per run
    #[arg(long, global = true)]
    max_steps: Option<usize>,

    /// Print variable snapshots after each block
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Commit the working tree after every Prompt and Bash block
    #[arg(long, global = true)]
    git_auto_commit: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command from the library
    Run {
        /// Command name, with or without the leading '/'
        command: String,
        /// Positional arguments, bound to $1..$N
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run a slash-command line, e.g. "/fix-tests crates/core 'fast mode'"
    Invoke {
        /// The full invocation line
        line: String,
    },

    /// Validate a single command file without running it
    Validate {
        /// Path to a .yaml, .yml or .json command file
        file: PathBuf,
    },

    /// List the commands in the library
    List,

    /// Validate the whole library, including cross-command references
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blockflow_core=warn,blockflow_cli=info".into()),
        )
        .init();

    let options = CliOptions {
        config: cli.config,
        commands_dir: cli.commands_dir,
        cwd: cli.cwd,
        max_steps: cli.max_steps,
        verbose: cli.verbose,
        git_auto_commit: cli.git_auto_commit,
    };

    if let Err(e) = dispatch(cli.command, &options).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(command: Commands, options: &CliOptions) -> Result<(), String> {
    match command {
        Commands::Run { command, args } => {
            let ctx = CliContext::load(options)?;
            commands::run::run(&ctx, &command, args).await
        }
        Commands::Invoke { line } => {
            let ctx = CliContext::load(options)?;
            commands::run::invoke(&ctx, &line).await
        }
        Commands::Validate { file } => commands::library::validate(&file),
        Commands::List => commands::library::list(&CliContext::load(options)?),
        Commands::Check => commands::library::check(&CliContext::load(options)?),
    }
}
