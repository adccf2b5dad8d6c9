//! Record store: the Inbox, Review, Memory and Evolution tables.
//!
//! The controller and the task processor only talk to [`RecordStore`]. The
//! bundled backend is [`json::JsonStore`], one JSON document per table.

pub mod json;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::safety::SafetyLevel;

pub use json::JsonStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    Received,
    Processing,
    Failed,
}

/// An inbound task waiting for (or undergoing) analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxTask {
    pub id: String,
    pub title: String,
    pub raw_input: String,
    pub source: String,
    pub status: InboxStatus,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Simple,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    PendingReview,
    Executing,
    Completed,
    Failed,
}

/// An analyzed task kept for human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewTask {
    pub id: String,
    pub title: String,
    pub difficulty: Difficulty,
    pub status: ReviewStatus,
    pub summary: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub preparation: String,
    #[serde(default)]
    pub agent_prompt: String,
    #[serde(default)]
    pub estimated_time: String,
    #[serde(default)]
    pub reason: String,
    pub source_task_id: String,
    pub processed_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub folder: Option<PathBuf>,
}

/// Fields for a new review record; the shape follows the analysis difficulty.
#[derive(Debug, Clone)]
pub enum NewReview {
    Simple {
        title: String,
        summary: String,
        result: String,
        source_task_id: String,
    },
    Complex {
        title: String,
        summary: String,
        analysis: String,
        preparation: String,
        agent_prompt: String,
        estimated_time: String,
        reason: String,
        source_task_id: String,
    },
}

/// A long-lived fact fed back into every analysis request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub title: String,
    pub category: String,
    pub content: String,
    pub importance: String,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    fn importance_rank(&self) -> u8 {
        match self.importance.as_str() {
            "high" => 0,
            "medium" => 1,
            "low" => 2,
            _ => 3,
        }
    }
}

/// Render memories for an analysis request, most important and newest first.
pub fn format_memories(memories: &[MemoryRecord]) -> String {
    if memories.is_empty() {
        return "No stored memories.".to_string();
    }
    let mut sorted: Vec<&MemoryRecord> = memories.iter().collect();
    sorted.sort_by(|a, b| {
        a.importance_rank()
            .cmp(&b.importance_rank())
            .then_with(|| b.updated_at.cmp(&a.updated_at))
    });
    sorted
        .iter()
        .map(|m| format!("- [{}] {}: {}", m.category, m.title, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionStatus {
    Pending,
    Executing,
    Verifying,
    Completed,
    RolledBack,
    Failed,
}

impl EvolutionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Failed)
    }
}

impl fmt::Display for EvolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an evolution task changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Prompt,
    Code,
    Frontend,
    Config,
}

impl TaskType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Code => "code",
            Self::Frontend => "frontend",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prompt" => Ok(Self::Prompt),
            "code" => Ok(Self::Code),
            "frontend" => Ok(Self::Frontend),
            "config" => Ok(Self::Config),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

/// A proposed self-modification and its audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionTask {
    pub id: String,
    pub title: String,
    pub status: EvolutionStatus,
    pub task_type: TaskType,
    /// Author-asserted; the controller computes its own.
    pub level: SafetyLevel,
    pub description: String,
    /// Newline-separated paths.
    pub files_modified: String,
    pub verification_steps: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub git_tag_pre: Option<String>,
    #[serde(default)]
    pub git_tag_post: Option<String>,
    #[serde(default)]
    pub git_commit_hash: Option<String>,
    #[serde(default)]
    pub verification_result: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub rollback_reason: Option<String>,
    #[serde(default)]
    pub agent_output: Option<String>,
}

impl EvolutionTask {
    /// Declared files, one per non-blank line.
    pub fn files(&self) -> Vec<&str> {
        self.files_modified
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// First eight characters of the id, as used in snapshot tags.
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }
}

/// Fields of a new evolution task; it always starts `pending`.
#[derive(Debug, Clone)]
pub struct NewEvolutionTask {
    pub title: String,
    pub task_type: TaskType,
    pub level: SafetyLevel,
    pub description: String,
    pub files_modified: String,
    pub verification_steps: String,
}

/// Optional fields written alongside a status change. `None` leaves the
/// stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct EvolutionUpdate {
    pub git_tag_pre: Option<String>,
    pub git_tag_post: Option<String>,
    pub git_commit_hash: Option<String>,
    pub verification_result: Option<String>,
    pub error_message: Option<String>,
    pub rollback_reason: Option<String>,
    pub agent_output: Option<String>,
    pub duration: Option<u64>,
}

impl EvolutionUpdate {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// The four tables the core reads and writes.
pub trait RecordStore {
    fn create_inbox(&self, title: &str, raw_input: &str, source: &str) -> anyhow::Result<String>;
    fn update_inbox_status(&self, id: &str, status: InboxStatus) -> anyhow::Result<()>;
    /// Hide the record from every pending query. Records are never removed.
    fn archive_inbox(&self, id: &str) -> anyhow::Result<()>;
    /// `received` records that are not archived, oldest first.
    fn pending_inbox(&self) -> anyhow::Result<Vec<InboxTask>>;

    fn create_review(&self, review: NewReview) -> anyhow::Result<String>;
    fn update_review_status(&self, id: &str, status: ReviewStatus) -> anyhow::Result<()>;
    /// Record the outcome and stamp `completed_at`.
    fn update_review_result(
        &self,
        id: &str,
        status: ReviewStatus,
        result: &str,
        folder: Option<PathBuf>,
    ) -> anyhow::Result<()>;
    fn review(&self, id: &str) -> anyhow::Result<Option<ReviewTask>>;

    fn memories(&self) -> anyhow::Result<Vec<MemoryRecord>>;
    fn find_memory(&self, title: &str) -> anyhow::Result<Option<MemoryRecord>>;
    fn create_memory(
        &self,
        title: &str,
        category: &str,
        content: &str,
        importance: &str,
    ) -> anyhow::Result<String>;
    fn update_memory(
        &self,
        id: &str,
        content: Option<&str>,
        importance: Option<&str>,
    ) -> anyhow::Result<()>;

    fn create_evolution(&self, task: &NewEvolutionTask) -> anyhow::Result<String>;
    fn evolution(&self, id: &str) -> anyhow::Result<Option<EvolutionTask>>;
    /// `pending` tasks, oldest first.
    fn pending_evolutions(&self) -> anyhow::Result<Vec<EvolutionTask>>;
    /// Set the status, stamping `started_at` on `executing` and
    /// `completed_at` on terminal states, and apply the given fields.
    fn update_evolution(
        &self,
        id: &str,
        status: EvolutionStatus,
        update: EvolutionUpdate,
    ) -> anyhow::Result<()>;
    /// Most recent first.
    fn evolution_history(&self, limit: usize) -> anyhow::Result<Vec<EvolutionTask>>;
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn memory(title: &str, importance: &str, minute: u32) -> MemoryRecord {
        MemoryRecord {
            id: title.to_string(),
            title: title.to_string(),
            category: "preference".to_string(),
            content: format!("{title} content"),
            importance: importance.to_string(),
            updated_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, minute, 0).unwrap(),
        }
    }

    #[test]
    fn memories_sorted_by_importance_then_recency() {
        let text = format_memories(&[
            memory("low-one", "low", 5),
            memory("old-high", "high", 1),
            memory("new-high", "high", 9),
            memory("mid", "medium", 3),
        ]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "- [preference] new-high: new-high content",
                "- [preference] old-high: old-high content",
                "- [preference] mid: mid content",
                "- [preference] low-one: low-one content",
            ]
        );
    }

    #[test]
    fn empty_memories_have_placeholder() {
        assert_eq!(format_memories(&[]), "No stored memories.");
    }

    #[test]
    fn task_type_parses_case_insensitively() {
        assert_eq!("Frontend".parse::<TaskType>().unwrap(), TaskType::Frontend);
        assert!("infra".parse::<TaskType>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(EvolutionStatus::RolledBack.is_terminal());
        assert!(!EvolutionStatus::Verifying.is_terminal());
        assert_eq!(EvolutionStatus::RolledBack.to_string(), "rolled_back");
    }
}
