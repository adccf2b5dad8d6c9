use std::path::PathBuf;
use std::time::Duration;

use clap::Subcommand;

use super::{OutputFormat, Project};
use crate::error::ExitError;
use crate::ralph::runner::AgentCli;
use crate::ralph::signal::ResultSummary;
use crate::ralph::{ExecutionResult, RalphLoop, ThreadSleeper};

/// ANSI codes for pretty output.
struct Style {
    bold: &'static str,
    dim: &'static str,
    green: &'static str,
    red: &'static str,
    reset: &'static str,
}

const PRETTY_STYLE: Style = Style {
    bold: "\x1b[1m",
    dim: "\x1b[2m",
    green: "\x1b[32m",
    red: "\x1b[31m",
    reset: "\x1b[0m",
};

const TEXT_STYLE: Style = Style {
    bold: "",
    dim: "",
    green: "",
    red: "",
    reset: "",
};

#[derive(Debug, Subcommand)]
pub enum RunCommand {
    /// Run the coding agent in a bounded retry loop until it signals completion
    Agent {
        /// Task instructions
        #[arg(short, long)]
        prompt: String,
        /// Title used for artifact directory names
        #[arg(short, long, default_value = "task")]
        title: String,
        /// Defaults to ralph.max_attempts
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Per-attempt timeout in seconds; defaults to ralph.attempt_timeout_secs
        #[arg(long)]
        timeout: Option<u64>,
        /// Run the agent here instead of in each attempt's artifact directory
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Send the prompt without the automated-execution preamble
        #[arg(long)]
        no_preamble: bool,
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
}

impl RunCommand {
    pub fn execute(&self, project: &Project) -> anyhow::Result<()> {
        match self {
            Self::Agent {
                prompt,
                title,
                max_attempts,
                timeout,
                workdir,
                no_preamble,
                format,
            } => {
                let config = &project.config;
                let runner = AgentCli::new(&config.agent, project.secrets.agent_env.clone());
                let sleeper = ThreadSleeper;
                let tasks_dir = config.tasks_dir(&project.root);

                let mut ralph = RalphLoop::new(
                    &runner,
                    &sleeper,
                    &tasks_dir,
                    Duration::from_secs(config.agent.backoff_secs),
                );
                if let Some(dir) = workdir {
                    ralph = ralph.with_workdir(dir);
                }
                if *no_preamble {
                    ralph = ralph.without_preamble();
                }

                let result = ralph.run_with_retry(
                    prompt,
                    title,
                    max_attempts.unwrap_or(config.ralph.max_attempts),
                    Duration::from_secs(timeout.unwrap_or(config.ralph.attempt_timeout_secs)),
                );
                print_result(&result, OutputFormat::resolve(*format))?;

                if result.success {
                    Ok(())
                } else {
                    Err(ExitError::Other(format!(
                        "agent did not complete after {} attempt(s): {}",
                        result.attempts,
                        result.error_text()
                    ))
                    .into())
                }
            }
        }
    }
}

fn print_result(result: &ExecutionResult, format: OutputFormat) -> anyhow::Result<()> {
    let style = match format {
        OutputFormat::Json => {
            let summary = ResultSummary::extract(&result.output);
            let json = serde_json::json!({ "result": result, "summary": summary });
            println!("{}", serde_json::to_string_pretty(&json)?);
            return Ok(());
        }
        OutputFormat::Pretty => &PRETTY_STYLE,
        OutputFormat::Text => &TEXT_STYLE,
    };

    let (color, verdict) = if result.success {
        (style.green, "completed")
    } else {
        (style.red, "failed")
    };
    println!(
        "{}{color}{verdict}{} after {} attempt(s) {}({:?}, exit {}){}",
        style.bold, style.reset, result.attempts, style.dim, result.signal, result.exit_code, style.reset
    );
    if let Some(dir) = &result.artifact_dir {
        println!("artifacts: {}", dir.display());
    }
    if let Some(url) = ResultSummary::extract(&result.output).deploy_url {
        println!("deploy: {url}");
    }
    if !result.output.trim().is_empty() {
        println!("\n{}", result.output.trim_end());
    }
    Ok(())
}
