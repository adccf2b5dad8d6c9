//! The evolution controller: classify, snapshot, execute, verify, then commit
//! or roll back.
//!
//! Only reading the task can fail the call. Every later failure is written to
//! the task record as data, and the working tree is returned to the
//! pre-evolution snapshot whenever execution or verification fails.

pub mod submit;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Local;

use crate::config::Config;
use crate::notify::{Notifier, notify_best_effort};
use crate::ralph::runner::AgentRunner;
use crate::ralph::{RalphLoop, Sleeper};
use crate::safety::{SafetyLevel, SafetyPolicy};
use crate::service::{HealthCheck, ServiceControl};
use crate::snapshot::{SnapshotPhase, Vcs, snapshot_tag};
use crate::store::{EvolutionStatus, EvolutionTask, EvolutionUpdate, RecordStore};
use crate::subprocess::truncate_chars;
use crate::template::{self, EvolutionPromptContext, EvolutionReportContext};

const SUMMARY_CHARS: usize = 150;
const NOTIFY_ERROR_CHARS: usize = 200;
const EXEC_DETAIL_CHARS: usize = 2000;
const REASON_OUTPUT_CHARS: usize = 500;

/// Everything the controller touches outside its own state.
pub struct Collaborators<'a> {
    pub store: &'a dyn RecordStore,
    pub vcs: &'a dyn Vcs,
    pub health: &'a dyn HealthCheck,
    pub service: &'a dyn ServiceControl,
    pub runner: &'a dyn AgentRunner,
    pub notifier: &'a dyn Notifier,
    pub sleeper: &'a dyn Sleeper,
}

#[derive(Debug, Clone)]
pub struct EvolutionSettings {
    /// Agent working directory.
    pub project_root: PathBuf,
    pub tasks_dir: PathBuf,
    pub timeout: Duration,
    pub output_limit: usize,
    pub restart_settle: Duration,
    pub rollback_settle: Duration,
}

impl EvolutionSettings {
    pub fn from_config(config: &Config, project_root: PathBuf) -> Self {
        Self {
            tasks_dir: config.tasks_dir(&project_root),
            project_root,
            timeout: Duration::from_secs(config.evolution.timeout_secs),
            output_limit: config.evolution.output_limit,
            restart_settle: Duration::from_secs(config.service.restart_settle_secs),
            rollback_settle: Duration::from_secs(config.service.rollback_settle_secs),
        }
    }
}

/// How a run ended. Mirrors what was written to the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvolutionOutcome {
    /// Not found or not pending; nothing was changed.
    Skipped { reason: String },
    Failed { error: String },
    Completed { post_tag: Option<String>, duration: u64 },
    RolledBack { reason: String, duration: u64 },
}

impl EvolutionOutcome {
    pub const fn status(&self) -> Option<EvolutionStatus> {
        match self {
            Self::Skipped { .. } => None,
            Self::Failed { .. } => Some(EvolutionStatus::Failed),
            Self::Completed { .. } => Some(EvolutionStatus::Completed),
            Self::RolledBack { .. } => Some(EvolutionStatus::RolledBack),
        }
    }
}

struct Execution {
    ok: bool,
    /// Stored as `agent_output`: the output on success, failure detail otherwise.
    output: String,
}

struct Verification {
    healthy: bool,
    report: String,
}

pub struct EvolutionController<'a> {
    deps: Collaborators<'a>,
    policy: &'a SafetyPolicy,
    settings: EvolutionSettings,
}

impl<'a> EvolutionController<'a> {
    pub const fn new(
        deps: Collaborators<'a>,
        policy: &'a SafetyPolicy,
        settings: EvolutionSettings,
    ) -> Self {
        Self {
            deps,
            policy,
            settings,
        }
    }

    /// Run the oldest pending task, if any.
    pub fn run_pending(&self) -> anyhow::Result<Option<(String, EvolutionOutcome)>> {
        let pending = self.deps.store.pending_evolutions()?;
        tracing::info!("found {} pending evolution task(s)", pending.len());
        let Some(task) = pending.into_iter().next() else {
            return Ok(None);
        };
        let outcome = self.run(&task.id)?;
        Ok(Some((task.id, outcome)))
    }

    /// Drive one task through every phase.
    pub fn run(&self, task_id: &str) -> anyhow::Result<EvolutionOutcome> {
        let _span = tracing::info_span!("evolution", task_id).entered();
        let start = Instant::now();

        let Some(task) = self.deps.store.evolution(task_id)? else {
            tracing::error!("evolution task not found");
            return Ok(EvolutionOutcome::Skipped {
                reason: format!("Task not found: {task_id}"),
            });
        };
        if task.status != EvolutionStatus::Pending {
            tracing::error!(status = %task.status, "task is not pending");
            return Ok(EvolutionOutcome::Skipped {
                reason: format!("Task is not pending (status: {})", task.status),
            });
        }
        tracing::info!(title = %task.title, level = %task.level, "processing evolution task");

        let pre_tag = match self.prepare(&task) {
            Ok(tag) => tag,
            Err(error) => {
                tracing::error!("pre-evolution check failed: {error}");
                self.record(&task.id, EvolutionStatus::Failed, EvolutionUpdate::error(&error));
                self.report_failure(&task, elapsed(start), &error, false);
                return Ok(EvolutionOutcome::Failed { error });
            }
        };

        let execution = self.execute(&task);
        self.record(
            &task.id,
            EvolutionStatus::Verifying,
            EvolutionUpdate {
                agent_output: Some(execution.output.clone()),
                ..EvolutionUpdate::default()
            },
        );

        let verification = self.verify(&task);
        let duration = elapsed(start);

        if execution.ok && verification.healthy {
            Ok(self.commit(&task, &execution, verification, duration))
        } else {
            Ok(self.roll_back(&task, &pre_tag, &execution, verification, duration))
        }
    }

    /// Classify, probe, and take the pre-evolution snapshot.
    ///
    /// Returns the snapshot tag, or the error to record as `failed`.
    fn prepare(&self, task: &EvolutionTask) -> Result<String, String> {
        let files = task.files();
        let level = self.policy.classify_task(&files);
        tracing::info!(detected = %level, declared = %task.level, "safety level");

        if level == SafetyLevel::Forbidden {
            let forbidden = self.policy.forbidden(&files);
            return Err(format!(
                "Level 0 files detected - manual intervention required: {forbidden:?}"
            ));
        }
        if level < task.level {
            tracing::warn!(
                "task declared as {} but contains {level} files",
                task.level
            );
        }

        self.record(&task.id, EvolutionStatus::Executing, EvolutionUpdate::default());

        let health = self.deps.health.probe();
        if !health.healthy {
            tracing::warn!(detail = %health.detail, "service unhealthy before evolution, continuing");
        }

        let tag = snapshot_tag(SnapshotPhase::PreEvolution, &task.id, Local::now());
        self.deps
            .vcs
            .snapshot(&tag)
            .map_err(|e| format!("Failed to create snapshot: {e:#}"))?;
        tracing::info!(tag, "pre-evolution snapshot created");

        self.record(
            &task.id,
            EvolutionStatus::Executing,
            EvolutionUpdate {
                git_tag_pre: Some(tag.clone()),
                ..EvolutionUpdate::default()
            },
        );
        Ok(tag)
    }

    /// One agent attempt in the project root.
    fn execute(&self, task: &EvolutionTask) -> Execution {
        let prompt = match template::render_evolution_prompt(&EvolutionPromptContext {
            title: &task.title,
            description: &task.description,
            files: &task.files_modified,
            verification: &task.verification_steps,
        }) {
            Ok(prompt) => prompt,
            Err(e) => {
                return Execution {
                    ok: false,
                    output: format!("Execution error: {e:#}"),
                };
            }
        };

        let ralph = RalphLoop::new(
            self.deps.runner,
            self.deps.sleeper,
            &self.settings.tasks_dir,
            Duration::ZERO,
        )
        .with_workdir(&self.settings.project_root)
        .without_preamble();
        let result = ralph.run_with_retry(
            &prompt,
            &format!("evolution_{}", task.short_id()),
            1,
            self.settings.timeout,
        );

        if result.success {
            tracing::info!(signal = ?result.signal, "evolution execution finished");
            return Execution {
                ok: true,
                output: truncate_chars(&result.output, self.settings.output_limit).to_string(),
            };
        }

        let output = if result.exit_code < 0 {
            result.error_text().to_string()
        } else {
            let detail = [result.output.trim(), result.stderr.trim()]
                .into_iter()
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            let detail = if detail.is_empty() {
                result.error_text().to_string()
            } else {
                detail
            };
            format!(
                "Agent failed (exit {}): {}",
                result.exit_code,
                truncate_chars(&detail, EXEC_DETAIL_CHARS)
            )
        };
        tracing::error!("evolution execution failed");
        Execution { ok: false, output }
    }

    /// Probe; on failure restart once and probe again.
    fn verify(&self, task: &EvolutionTask) -> Verification {
        let mut lines = Vec::new();
        let mut health = self.deps.health.probe();
        lines.push(format!("Health check: {} - {}", health.verdict(), health.detail));

        if !health.healthy {
            tracing::warn!("service unhealthy after evolution, attempting restart");
            match self.deps.service.restart() {
                Ok(msg) => {
                    lines.push(format!("Service restart: PASS - {msg}"));
                    self.deps.sleeper.sleep(self.settings.restart_settle);
                    health = self.deps.health.probe();
                    lines.push(format!(
                        "Health check after restart: {} - {}",
                        health.verdict(),
                        health.detail
                    ));
                }
                Err(e) => lines.push(format!("Service restart: FAIL - {e:#}")),
            }
        }

        if !task.verification_steps.is_empty() {
            lines.push(format!(
                "Verification steps defined: {} chars",
                task.verification_steps.chars().count()
            ));
        }

        Verification {
            healthy: health.healthy,
            report: lines.join("\n"),
        }
    }

    fn commit(
        &self,
        task: &EvolutionTask,
        execution: &Execution,
        verification: Verification,
        duration: u64,
    ) -> EvolutionOutcome {
        let tag = snapshot_tag(SnapshotPhase::PostEvolution, &task.id, Local::now());
        let (post_tag, error_message) = match self.deps.vcs.snapshot(&tag) {
            Ok(tag) => (Some(tag), None),
            Err(e) => {
                tracing::warn!("post-evolution snapshot failed: {e:#}");
                (None, Some(format!("Post-evolution snapshot failed: {e:#}")))
            }
        };
        let commit = self
            .deps
            .vcs
            .current_commit()
            .unwrap_or_else(|_| "unknown".to_string());

        self.record(
            &task.id,
            EvolutionStatus::Completed,
            EvolutionUpdate {
                git_tag_post: post_tag.clone(),
                git_commit_hash: Some(commit),
                verification_result: Some(verification.report),
                error_message,
                duration: Some(duration),
                ..EvolutionUpdate::default()
            },
        );
        tracing::info!("evolution completed in {duration}s");

        let summary = summarize(&execution.output, SUMMARY_CHARS);
        let level = task.level.to_string();
        let message = template::render_evolution_success(&EvolutionReportContext {
            title: &task.title,
            duration,
            level: &level,
            tag: post_tag.as_deref().unwrap_or("none"),
            summary: &summary,
            error: "",
            rolled_back: false,
        });
        self.send(message);

        EvolutionOutcome::Completed { post_tag, duration }
    }

    fn roll_back(
        &self,
        task: &EvolutionTask,
        pre_tag: &str,
        execution: &Execution,
        verification: Verification,
        duration: u64,
    ) -> EvolutionOutcome {
        let mut reason = format!(
            "Execution: {}, Verification: {}",
            ok_or_failed(execution.ok),
            ok_or_failed(verification.healthy)
        );
        if !execution.ok {
            reason.push_str(&format!(
                "\nExec output: {}",
                truncate_chars(&execution.output, REASON_OUTPUT_CHARS)
            ));
        }
        if !verification.healthy {
            reason.push_str(&format!("\nVerify result: {}", verification.report));
        }

        tracing::warn!(tag = pre_tag, "rolling back");
        let report = match self.deps.vcs.rollback(pre_tag) {
            Ok(msg) => {
                let restart = match self.deps.service.restart() {
                    Ok(msg) => msg,
                    Err(e) => format!("{e:#}"),
                };
                self.deps.sleeper.sleep(self.settings.rollback_settle);
                let health = self.deps.health.probe();
                if !health.healthy {
                    tracing::error!(detail = %health.detail, "service still unhealthy after rollback");
                }
                format!(
                    "Rollback to {pre_tag}: {msg}\nService restart: {restart}\nHealth after rollback: {}\nReason: {reason}",
                    health.detail
                )
            }
            Err(e) => {
                tracing::error!("git rollback failed: {e:#}");
                format!("Git rollback failed: {e:#}")
            }
        };

        let error = if execution.ok {
            verification.report.clone()
        } else {
            execution.output.clone()
        };
        self.record(
            &task.id,
            EvolutionStatus::RolledBack,
            EvolutionUpdate {
                error_message: Some(error.clone()),
                rollback_reason: Some(report.clone()),
                verification_result: Some(verification.report),
                duration: Some(duration),
                ..EvolutionUpdate::default()
            },
        );
        tracing::warn!("evolution rolled back after {duration}s");

        self.report_failure(task, duration, &error, true);
        EvolutionOutcome::RolledBack {
            reason: report,
            duration,
        }
    }

    fn report_failure(&self, task: &EvolutionTask, duration: u64, error: &str, rolled_back: bool) {
        let level = task.level.to_string();
        let message = template::render_evolution_failure(&EvolutionReportContext {
            title: &task.title,
            duration,
            level: &level,
            tag: "",
            summary: "",
            error: truncate_chars(error, NOTIFY_ERROR_CHARS),
            rolled_back,
        });
        self.send(message);
    }

    fn send(&self, message: anyhow::Result<String>) {
        match message {
            Ok(text) => notify_best_effort(self.deps.notifier, &text),
            Err(e) => tracing::error!("failed to render evolution report: {e:#}"),
        }
    }

    /// Persist a transition; store errors are logged, not raised.
    fn record(&self, id: &str, status: EvolutionStatus, update: EvolutionUpdate) {
        if let Err(e) = self.deps.store.update_evolution(id, status, update) {
            tracing::error!(status = %status, "failed to update evolution task: {e:#}");
        }
    }
}

fn elapsed(start: Instant) -> u64 {
    start.elapsed().as_secs()
}

const fn ok_or_failed(ok: bool) -> &'static str {
    if ok { "OK" } else { "FAILED" }
}

fn summarize(text: &str, max_chars: usize) -> String {
    let cut = truncate_chars(text, max_chars);
    if cut.len() < text.len() {
        format!("{cut}...")
    } else {
        cut.to_string()
    }
}
