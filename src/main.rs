use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use evolver::commands::classify::ClassifyArgs;
use evolver::commands::evolve::EvolveCommand;
use evolver::commands::run::RunCommand;
use evolver::commands::task::TaskCommand;
use evolver::commands::{self, Project};
use evolver::{error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "evolver",
    version,
    about = "Personal task agent with a gated, snapshot-protected self-evolution loop"
)]
struct Cli {
    /// Project root directory (defaults to the current directory)
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Submit, run and inspect self-evolution tasks
    Evolve {
        #[command(subcommand)]
        command: EvolveCommand,
    },
    /// Process inbound tasks (analysis, execution, memory)
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Run the coding agent directly
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },
    /// Show the safety level of file paths
    Classify(ClassifyArgs),
    /// Probe the supervised service once
    Health,
    /// Print the JSON Schema for .evolver.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Evolve { .. } => "evolve",
            Self::Task { .. } => "task",
            Self::Run { .. } => "run",
            Self::Classify(_) => "classify",
            Self::Health => "health",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Schema => commands::schema::run_schema(),
        command => Project::load(cli.project_root.as_deref()).and_then(|project| match command {
            Commands::Evolve { command } => command.execute(&project),
            Commands::Task { command } => command.execute(&project),
            Commands::Run { command } => command.execute(&project),
            Commands::Classify(args) => args.execute(&project),
            Commands::Health => commands::health::run_health(&project),
            Commands::Schema => commands::schema::run_schema(),
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
