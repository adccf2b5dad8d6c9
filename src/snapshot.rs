//! Version-control checkpoints of the working tree.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local};

use crate::error::ExitError;
use crate::subprocess::Tool;

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Which side of an evolution run a snapshot marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPhase {
    PreEvolution,
    PostEvolution,
}

impl SnapshotPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreEvolution => "pre-evolution",
            Self::PostEvolution => "post-evolution",
        }
    }
}

/// `<phase>-<short-task-id>-<timestamp>`, e.g. `pre-evolution-1a2b3c4d-20260101-120000`.
pub fn snapshot_tag(phase: SnapshotPhase, task_id: &str, at: DateTime<Local>) -> String {
    let short: String = task_id.chars().take(8).collect();
    let short = if short.is_empty() { "unknown".to_string() } else { short };
    format!("{}-{}-{}", phase.as_str(), short, at.format("%Y%m%d-%H%M%S"))
}

/// Checkpoint and restore operations the evolution controller relies on.
pub trait Vcs {
    /// Commit everything pending (empty commits allowed) and force-tag it.
    fn snapshot(&self, tag: &str) -> anyhow::Result<String>;

    /// Hard-reset to `tag` and remove untracked files.
    fn rollback(&self, tag: &str) -> anyhow::Result<String>;

    fn current_commit(&self) -> anyhow::Result<String>;
}

/// `git` in a project directory.
#[derive(Debug, Clone)]
pub struct GitVcs {
    dir: PathBuf,
}

impl GitVcs {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn git(&self, args: &[&str]) -> anyhow::Result<String> {
        let output = Tool::new("git")
            .args(args)
            .current_dir(&self.dir)
            .timeout(GIT_TIMEOUT)
            .run()?;
        if output.success() {
            Ok(output.stdout_trimmed().to_string())
        } else {
            Err(ExitError::ToolFailed {
                tool: format!("git {}", args.first().copied().unwrap_or_default()),
                code: output.exit_code,
                message: output.stderr.trim().to_string(),
            }
            .into())
        }
    }
}

impl Vcs for GitVcs {
    fn snapshot(&self, tag: &str) -> anyhow::Result<String> {
        self.git(&["add", "-A"])?;
        let message = format!("Evolution snapshot: {tag}");
        self.git(&["commit", "--allow-empty", "--no-verify", "-m", &message])?;
        self.git(&["tag", "-f", tag])?;
        tracing::info!(tag, dir = %self.dir.display(), "snapshot created");
        Ok(tag.to_string())
    }

    fn rollback(&self, tag: &str) -> anyhow::Result<String> {
        self.git(&["reset", "--hard", tag])
            .with_context(|| format!("Failed to reset to {tag}"))?;
        if let Err(e) = self.git(&["clean", "-fd"]) {
            tracing::warn!("git clean after rollback failed: {e:#}");
        }
        tracing::info!(tag, "working tree rolled back");
        Ok(format!("Rolled back to {tag}"))
    }

    fn current_commit(&self) -> anyhow::Result<String> {
        self.git(&["rev-parse", "HEAD"])
    }
}
