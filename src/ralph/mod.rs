//! The Ralph loop: run the coding agent until it signals completion or the
//! attempt budget runs out.
//!
//! Each attempt gets a fresh artifact directory, a hard timeout, and (from the
//! second attempt on) the previous attempt's error prepended to its prompt.
//! Completion is read from the captured output by [`signal::CompletionSignal`].

pub mod runner;
pub mod signal;
pub mod workspace;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use serde::Serialize;

use crate::error::ExitError;
use crate::subprocess::RunOutput;
use crate::template;

use runner::AgentRunner;
use signal::CompletionSignal;
use workspace::ArtifactDirs;

/// Waits between attempts. Swapped for a recorder in tests.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested sleeps without waiting.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: std::sync::Mutex<Vec<Duration>>,
}

#[cfg(test)]
impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

/// Outcome of one attempt, or of the whole loop (the last attempt's).
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub stderr: String,
    pub artifact_dir: Option<PathBuf>,
    pub error: Option<String>,
    pub exit_code: i32,
    pub signal: CompletionSignal,
    pub attempts: u32,
}

impl ExecutionResult {
    fn failed(attempt: u32, artifact_dir: Option<PathBuf>, error: String) -> Self {
        Self {
            success: false,
            output: String::new(),
            stderr: String::new(),
            artifact_dir,
            error: Some(error),
            exit_code: -1,
            signal: CompletionSignal::NoSignal,
            attempts: attempt,
        }
    }

    fn from_run(attempt: u32, artifact_dir: PathBuf, run: RunOutput) -> Self {
        let signal = CompletionSignal::detect(&run.stdout, run.exit_code);
        let error = if signal.is_complete() {
            None
        } else if run.stderr.trim().is_empty() {
            Some(format!("Agent exited with code {}", run.exit_code))
        } else {
            Some(run.stderr.trim().to_string())
        };
        Self {
            success: signal.is_complete(),
            output: run.stdout,
            stderr: run.stderr,
            artifact_dir: Some(artifact_dir),
            error,
            exit_code: run.exit_code,
            signal,
            attempts: attempt,
        }
    }

    /// The error text, or a placeholder when none was captured.
    pub fn error_text(&self) -> &str {
        self.error.as_deref().unwrap_or("Unknown error")
    }
}

/// Where the loop is between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting { attempt: u32 },
    Waiting { after_attempt: u32 },
    Succeeded,
    Exhausted,
}

impl RetryState {
    /// Transition out of `Attempting { attempt }` given the attempt's verdict.
    pub const fn after_attempt(attempt: u32, complete: bool, max_attempts: u32) -> Self {
        if complete {
            Self::Succeeded
        } else if attempt < max_attempts {
            Self::Waiting {
                after_attempt: attempt,
            }
        } else {
            Self::Exhausted
        }
    }
}

/// The bounded retry executor.
pub struct RalphLoop<'a> {
    runner: &'a dyn AgentRunner,
    sleeper: &'a dyn Sleeper,
    artifacts: ArtifactDirs,
    backoff: Duration,
    workdir: Option<PathBuf>,
    preamble: bool,
}

impl<'a> RalphLoop<'a> {
    pub fn new(
        runner: &'a dyn AgentRunner,
        sleeper: &'a dyn Sleeper,
        tasks_dir: &Path,
        backoff: Duration,
    ) -> Self {
        Self {
            runner,
            sleeper,
            artifacts: ArtifactDirs::new(tasks_dir),
            backoff,
            workdir: None,
            preamble: true,
        }
    }

    /// Run the agent in `dir` instead of the attempt's artifact directory.
    pub fn with_workdir(mut self, dir: &Path) -> Self {
        self.workdir = Some(dir.to_path_buf());
        self
    }

    /// Send the prompt as-is, without the automated-execution preamble.
    pub fn without_preamble(mut self) -> Self {
        self.preamble = false;
        self
    }

    /// Run attempts until one signals completion or `max_attempts` are spent.
    ///
    /// Never fails: timeouts and launch errors become the attempt's `error`.
    pub fn run_with_retry(
        &self,
        prompt: &str,
        title: &str,
        max_attempts: u32,
        attempt_timeout: Duration,
    ) -> ExecutionResult {
        let max_attempts = max_attempts.max(1);
        let mut last: Option<ExecutionResult> = None;
        let mut state = RetryState::Attempting { attempt: 1 };

        loop {
            state = match state {
                RetryState::Attempting { attempt } => {
                    let _span = tracing::info_span!("attempt", attempt, max_attempts).entered();
                    tracing::info!(title, "Ralph loop attempt {attempt}/{max_attempts}");
                    let previous_error = last.as_ref().map(ExecutionResult::error_text);
                    let result = self.attempt(attempt, prompt, previous_error, title, attempt_timeout);
                    let next = RetryState::after_attempt(attempt, result.success, max_attempts);
                    match next {
                        RetryState::Succeeded => {
                            tracing::info!(signal = ?result.signal, "task completed on attempt {attempt}");
                        }
                        _ => tracing::warn!(error = %result.error_text(), "attempt {attempt} incomplete"),
                    }
                    last = Some(result);
                    next
                }
                RetryState::Waiting { after_attempt } => {
                    tracing::info!("retrying in {}s", self.backoff.as_secs());
                    self.sleeper.sleep(self.backoff);
                    RetryState::Attempting {
                        attempt: after_attempt + 1,
                    }
                }
                RetryState::Succeeded | RetryState::Exhausted => break,
            };
        }

        if state == RetryState::Exhausted {
            tracing::error!(title, "all {max_attempts} attempts failed");
        }
        last.unwrap_or_else(|| {
            ExecutionResult::failed(max_attempts, None, format!("All {max_attempts} attempts failed"))
        })
    }

    fn attempt(
        &self,
        attempt: u32,
        prompt: &str,
        previous_error: Option<&str>,
        title: &str,
        timeout: Duration,
    ) -> ExecutionResult {
        let task_prompt = match previous_error {
            Some(error) if attempt > 1 => match template::render_retry_context(attempt, error) {
                Ok(context) => format!("{context}{prompt}"),
                Err(e) => return ExecutionResult::failed(attempt, None, format!("{e:#}")),
            },
            _ => prompt.to_string(),
        };
        let sent = if self.preamble {
            match template::render_preamble() {
                Ok(preamble) => format!("{preamble}{task_prompt}"),
                Err(e) => return ExecutionResult::failed(attempt, None, format!("{e:#}")),
            }
        } else {
            task_prompt.clone()
        };

        let dir = match self
            .artifacts
            .create(&format!("{title}_attempt{attempt}"), Local::now().date_naive())
        {
            Ok(dir) => dir,
            Err(e) => return ExecutionResult::failed(attempt, None, format!("{e:#}")),
        };
        if let Err(e) = workspace::write_prompt(&dir, &task_prompt, &sent) {
            return ExecutionResult::failed(attempt, Some(dir), format!("{e:#}"));
        }
        tracing::debug!(dir = %dir.display(), "artifact directory created");

        let cwd = self.workdir.clone().unwrap_or_else(|| dir.clone());
        match self.runner.run(&sent, &cwd, timeout) {
            Ok(run) => {
                if let Err(e) = workspace::write_result(&dir, &run.stdout, &run.stderr) {
                    tracing::warn!("could not persist agent output: {e:#}");
                }
                ExecutionResult::from_run(attempt, dir, run)
            }
            Err(e) => {
                let message = match e.downcast_ref::<ExitError>() {
                    Some(exit) if exit.is_timeout() => format!(
                        "Attempt {attempt} timed out after {} seconds",
                        timeout.as_secs()
                    ),
                    Some(ExitError::ToolNotFound { tool }) => {
                        format!("{tool} not found - is it installed?")
                    }
                    _ => format!("{e:#}"),
                };
                tracing::error!("attempt {attempt} failed: {message}");
                ExecutionResult::failed(attempt, Some(dir), message)
            }
        }
    }
}
