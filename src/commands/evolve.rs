use std::path::PathBuf;

use clap::Subcommand;

use super::{OutputFormat, Project};
use crate::error::ExitError;
use crate::evolution::{
    Collaborators, EvolutionController, EvolutionOutcome, EvolutionSettings, submit,
};
use crate::lease::{self, RunLease};
use crate::notify;
use crate::ralph::ThreadSleeper;
use crate::ralph::runner::AgentCli;
use crate::safety::{SafetyLevel, SafetyPolicy};
use crate::service::{HttpHealthProbe, Supervisor};
use crate::snapshot::GitVcs;
use crate::store::{EvolutionTask, NewEvolutionTask, RecordStore, TaskType};

#[derive(Debug, Subcommand)]
pub enum EvolveCommand {
    /// Run one evolution task through snapshot, execution and verification
    Run {
        /// Evolution task id
        id: String,
    },
    /// Run the oldest pending evolution task
    Pending,
    /// Create an evolution task from a Markdown file or from flags
    Submit {
        /// Markdown task file
        file: Option<PathBuf>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long = "type", value_enum, default_value_t = TaskType::Code)]
        task_type: TaskType,
        /// Declared safety level (0-3)
        #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(0..=3))]
        level: u8,
        #[arg(long)]
        description: Option<String>,
        /// Files to modify, newline-separated
        #[arg(long)]
        files: Option<String>,
        #[arg(long)]
        verification: Option<String>,
    },
    /// List evolution tasks, most recent first
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
}

impl EvolveCommand {
    pub fn execute(&self, project: &Project) -> anyhow::Result<()> {
        match self {
            Self::Run { id } => run(project, Some(id)),
            Self::Pending => run(project, None),
            Self::Submit {
                file,
                title,
                task_type,
                level,
                description,
                files,
                verification,
            } => {
                let task = match (file, title, description) {
                    (Some(path), _, _) => submit::load_file(path)?,
                    (None, Some(title), Some(description)) => NewEvolutionTask {
                        title: title.clone(),
                        task_type: *task_type,
                        level: SafetyLevel::from_u8(*level).unwrap_or(SafetyLevel::Free),
                        description: description.clone(),
                        files_modified: files.clone().unwrap_or_default(),
                        verification_steps: verification.clone().unwrap_or_default(),
                    },
                    _ => {
                        return Err(ExitError::Other(
                            "provide a task file or both --title and --description".to_string(),
                        )
                        .into());
                    }
                };
                let store = project.open_store()?;
                let id = store.create_evolution(&task)?;
                tracing::info!(id = %id, title = %task.title, level = %task.level, "evolution task created");
                println!("{id}");
                Ok(())
            }
            Self::History { limit, format } => {
                let store = project.open_store()?;
                let tasks = store.evolution_history(*limit)?;
                print_history(&tasks, OutputFormat::resolve(*format))
            }
        }
    }
}

/// Run a specific task, or the oldest pending one, under the evolution and
/// worktree leases.
fn run(project: &Project, id: Option<&str>) -> anyhow::Result<()> {
    let config = &project.config;
    let store = project.open_store()?;

    lease::release_on_interrupt();
    let _leases = RunLease::acquire_all(&project.locks_dir(), &[lease::EVOLUTION, lease::WORKTREE])?;

    let sleeper = ThreadSleeper;
    let vcs = GitVcs::new(&project.root);
    let health = HttpHealthProbe::from_config(&config.service);
    let service = Supervisor::from_config(&config.service, &sleeper);
    let runner = AgentCli::new(&config.agent, project.secrets.agent_env.clone());
    let notifier = notify::from_config(&config.notify, &project.secrets)?;
    let policy = SafetyPolicy::new(&config.safety)?.with_project_root(&project.root);

    let controller = EvolutionController::new(
        Collaborators {
            store: &store,
            vcs: &vcs,
            health: &health,
            service: &service,
            runner: &runner,
            notifier: notifier.as_ref(),
            sleeper: &sleeper,
        },
        &policy,
        EvolutionSettings::from_config(config, project.root.clone()),
    );

    let (id, outcome) = match id {
        Some(id) => (id.to_string(), controller.run(id)?),
        None => match controller.run_pending()? {
            Some(ran) => ran,
            None => {
                println!("No pending evolution tasks");
                return Ok(());
            }
        },
    };
    report(&id, outcome)
}

fn report(id: &str, outcome: EvolutionOutcome) -> anyhow::Result<()> {
    match outcome {
        EvolutionOutcome::Completed { post_tag, duration } => {
            println!(
                "{id}: completed in {duration}s (tag {})",
                post_tag.as_deref().unwrap_or("none")
            );
            Ok(())
        }
        EvolutionOutcome::Skipped { reason } => Err(ExitError::Precondition(reason).into()),
        EvolutionOutcome::Failed { error } => {
            println!("{id}: failed");
            Err(ExitError::Other(format!("evolution failed: {error}")).into())
        }
        EvolutionOutcome::RolledBack { reason, duration } => {
            println!("{id}: rolled back after {duration}s");
            Err(ExitError::Other(format!("evolution rolled back: {reason}")).into())
        }
    }
}

fn print_history(tasks: &[EvolutionTask], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(tasks)?),
        OutputFormat::Text => {
            for task in tasks {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    task.id,
                    task.status,
                    task.level.as_u8(),
                    task.duration.map_or_else(String::new, |d| d.to_string()),
                    task.title
                );
            }
        }
        OutputFormat::Pretty => {
            if tasks.is_empty() {
                println!("No evolution tasks.");
                return Ok(());
            }
            println!("=== Evolution History ===\n");
            for task in tasks {
                let duration = task
                    .duration
                    .map_or_else(|| "-".to_string(), |d| format!("{d}s"));
                println!(
                    "  {} [{}] {} ({}, {duration})",
                    task.short_id(),
                    task.status,
                    task.title,
                    task.level
                );
                if let Some(tag) = &task.git_tag_post {
                    println!("      tag: {tag}");
                }
                if let Some(error) = &task.error_message {
                    println!("      error: {}", error.lines().next().unwrap_or_default());
                }
            }
        }
    }
    Ok(())
}
