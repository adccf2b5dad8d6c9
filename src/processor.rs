//! The inbound-task pipeline: record, analyze, execute complex work through
//! the Ralph loop, learn memories, and archive.
//!
//! Unlike the evolution controller this pipeline re-raises: after best-effort
//! cleanup the error reaches the caller.

use std::path::PathBuf;
use std::time::Duration;

use crate::analysis::{Analysis, AnalysisRequest, Analyzer, MemoryAction, MemoryUpdate};
use crate::config::Config;
use crate::lease::{self, RunLease};
use crate::notify::{Notifier, notify_best_effort};
use crate::ralph::runner::AgentRunner;
use crate::ralph::signal::ResultSummary;
use crate::ralph::{RalphLoop, Sleeper};
use crate::store::{
    Difficulty, InboxStatus, InboxTask, NewReview, RecordStore, ReviewStatus, format_memories,
};
use crate::subprocess::truncate_chars;

const TITLE_CHARS: usize = 50;
const REVIEW_OUTPUT_CHARS: usize = 2000;
const FAILURE_NOTICE_CHARS: usize = 300;
const ERROR_INPUT_CHARS: usize = 100;
const ERROR_NOTICE_CHARS: usize = 200;
const REVIEW_ERROR_CHARS: usize = 500;

const DEFAULT_CATEGORY: &str = "context";
const DEFAULT_IMPORTANCE: &str = "medium";

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub tasks_dir: PathBuf,
    pub backoff: Duration,
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    /// Where the `worktree` lease lives; `None` runs without one.
    pub locks_dir: Option<PathBuf>,
}

impl ProcessorSettings {
    pub fn from_config(config: &Config, root: &std::path::Path) -> Self {
        Self {
            tasks_dir: config.tasks_dir(root),
            backoff: Duration::from_secs(config.agent.backoff_secs),
            max_attempts: config.ralph.max_attempts,
            attempt_timeout: Duration::from_secs(config.ralph.attempt_timeout_secs),
            locks_dir: Some(config.store_dir(root).join("locks")),
        }
    }
}

/// How a processed task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub inbox_id: String,
    pub review_id: String,
    pub difficulty: Difficulty,
    /// Whether a complex execution succeeded; `None` for simple tasks.
    pub executed: Option<bool>,
}

/// Totals from one `poll` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub processed: usize,
    pub failed: usize,
}

pub struct TaskProcessor<'a> {
    pub store: &'a dyn RecordStore,
    pub analyzer: &'a dyn Analyzer,
    pub runner: &'a dyn AgentRunner,
    pub notifier: &'a dyn Notifier,
    pub sleeper: &'a dyn Sleeper,
    pub settings: ProcessorSettings,
}

impl TaskProcessor<'_> {
    /// Record a new inbound task and run it through the pipeline.
    pub fn process(
        &self,
        input: &str,
        source: &str,
        attachment: Option<&str>,
    ) -> anyhow::Result<Processed> {
        let inbox_id = self
            .store
            .create_inbox(&inbox_title(input), input, source)?;
        tracing::info!(inbox_id = %inbox_id, "inbox task created");
        self.run_pipeline(&inbox_id, input, attachment)
    }

    /// Process every pending inbox record. A failing record is counted and
    /// the pass moves on.
    pub fn poll(&self) -> anyhow::Result<PollSummary> {
        let pending = self.store.pending_inbox()?;
        tracing::info!("found {} pending inbox task(s)", pending.len());
        let mut summary = PollSummary::default();
        for task in pending {
            match self.process_existing(&task) {
                Ok(_) => summary.processed += 1,
                Err(e) => {
                    tracing::error!(inbox_id = %task.id, "task processing failed: {e:#}");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    pub fn process_existing(&self, task: &InboxTask) -> anyhow::Result<Processed> {
        self.run_pipeline(&task.id, &task.raw_input, None)
    }

    fn run_pipeline(
        &self,
        inbox_id: &str,
        input: &str,
        attachment: Option<&str>,
    ) -> anyhow::Result<Processed> {
        let _span = tracing::info_span!("task", inbox_id).entered();
        let mut review_id: Option<String> = None;

        match self.stages(inbox_id, input, attachment, &mut review_id) {
            Ok(processed) => Ok(processed),
            Err(e) => {
                tracing::error!("error processing task: {e:#}");
                let text = format!("{e:#}");
                notify_best_effort(
                    self.notifier,
                    &format!(
                        "❌ Error while processing task\n\nOriginal message: {}...\n\nError: {}",
                        truncate_chars(input, ERROR_INPUT_CHARS),
                        truncate_chars(&text, ERROR_NOTICE_CHARS)
                    ),
                );
                if let Some(id) = &review_id {
                    let result = format!("Error: {}", truncate_chars(&text, REVIEW_ERROR_CHARS));
                    if let Err(e) =
                        self.store
                            .update_review_result(id, ReviewStatus::Failed, &result, None)
                    {
                        tracing::warn!("failed to mark review failed: {e:#}");
                    }
                }
                if let Err(e) = self
                    .store
                    .update_inbox_status(inbox_id, InboxStatus::Failed)
                    .and_then(|()| self.store.archive_inbox(inbox_id))
                {
                    tracing::warn!("failed to archive inbox task: {e:#}");
                }
                Err(e)
            }
        }
    }

    fn stages(
        &self,
        inbox_id: &str,
        input: &str,
        attachment: Option<&str>,
        review_id: &mut Option<String>,
    ) -> anyhow::Result<Processed> {
        self.store
            .update_inbox_status(inbox_id, InboxStatus::Processing)?;

        let memories = format_memories(&self.store.memories()?);
        let analysis = self.analyzer.analyze(&AnalysisRequest {
            input,
            memories: &memories,
            attachment,
        })?;
        tracing::info!(difficulty = ?analysis.difficulty, "analysis complete");

        let id = self.store.create_review(new_review(&analysis, inbox_id))?;
        tracing::info!(review_id = %id, "review task created");
        let id: &str = review_id.insert(id);

        let executed = match analysis.agent_prompt() {
            Some(prompt) => Some(self.execute(&analysis, id, prompt)?),
            None => {
                notify_best_effort(self.notifier, &analysis.message);
                None
            }
        };

        if !analysis.memory_updates.is_empty() {
            tracing::info!("applying {} memory update(s)", analysis.memory_updates.len());
            for update in &analysis.memory_updates {
                if let Err(e) = apply_memory_update(self.store, update) {
                    tracing::error!(title = %update.title, "memory update failed: {e:#}");
                }
            }
        }

        self.store.archive_inbox(inbox_id)?;
        tracing::info!("task processing completed");
        Ok(Processed {
            inbox_id: inbox_id.to_string(),
            review_id: id.to_string(),
            difficulty: analysis.difficulty,
            executed,
        })
    }

    /// Run a complex task to completion or exhaustion. Returns whether it
    /// succeeded; only store and lease errors propagate.
    fn execute(&self, analysis: &Analysis, review_id: &str, prompt: &str) -> anyhow::Result<bool> {
        notify_best_effort(
            self.notifier,
            &format!(
                "📝 Task created: {}\n\nDifficulty: complex\nStatus: executing...\n\nYou'll be notified when it finishes.",
                analysis.title
            ),
        );
        self.store
            .update_review_status(review_id, ReviewStatus::Executing)?;

        let _lease = match &self.settings.locks_dir {
            Some(dir) => Some(RunLease::acquire(dir, lease::WORKTREE)?),
            None => None,
        };

        let ralph = RalphLoop::new(
            self.runner,
            self.sleeper,
            &self.settings.tasks_dir,
            self.settings.backoff,
        );
        let result = ralph.run_with_retry(
            prompt,
            &analysis.title,
            self.settings.max_attempts,
            self.settings.attempt_timeout,
        );

        if result.success {
            self.store.update_review_result(
                review_id,
                ReviewStatus::Completed,
                truncate_chars(&result.output, REVIEW_OUTPUT_CHARS),
                result.artifact_dir.clone(),
            )?;
            let summary = ResultSummary::extract(&result.output);
            let mut message = format!("✅ {}", analysis.title);
            if let Some(url) = &summary.deploy_url {
                message.push_str(&format!("\n🌐 {url}"));
            }
            message.push_str(&format!("\n📋 Review {review_id}"));
            notify_best_effort(self.notifier, &message);
        } else {
            let error = result.error_text();
            self.store.update_review_result(
                review_id,
                ReviewStatus::Failed,
                &format!("Execution failed: {error}"),
                result.artifact_dir.clone(),
            )?;
            notify_best_effort(
                self.notifier,
                &format!(
                    "❌ Task failed: {}\n\nError: {}",
                    analysis.title,
                    truncate_chars(error, FAILURE_NOTICE_CHARS)
                ),
            );
        }
        Ok(result.success)
    }
}

/// First 50 characters, with an ellipsis when cut.
pub fn inbox_title(input: &str) -> String {
    let cut = truncate_chars(input, TITLE_CHARS);
    if cut.len() < input.len() {
        format!("{cut}...")
    } else {
        cut.to_string()
    }
}

fn new_review(analysis: &Analysis, source_task_id: &str) -> NewReview {
    let source_task_id = source_task_id.to_string();
    match (analysis.difficulty, &analysis.simple_result, &analysis.complex_result) {
        (Difficulty::Complex, _, Some(c)) => NewReview::Complex {
            title: analysis.title.clone(),
            summary: c.summary.clone(),
            analysis: c.analysis.clone(),
            preparation: c.preparation.clone(),
            agent_prompt: c.agent_prompt.clone(),
            estimated_time: c.estimated_time.clone(),
            reason: c.reason.clone(),
            source_task_id,
        },
        (Difficulty::Simple, Some(s), _) => NewReview::Simple {
            title: analysis.title.clone(),
            summary: s.summary.clone(),
            result: s.result.clone(),
            source_task_id,
        },
        _ => NewReview::Simple {
            title: analysis.title.clone(),
            summary: "Could not parse the full response".to_string(),
            result: analysis.message.clone(),
            source_task_id,
        },
    }
}

/// Create the memory when no record has this title, otherwise update it.
/// Both actions converge on the same upsert.
pub fn apply_memory_update(store: &dyn RecordStore, update: &MemoryUpdate) -> anyhow::Result<()> {
    match store.find_memory(&update.title)? {
        Some(existing) => {
            if update.action == MemoryAction::Create {
                tracing::debug!(title = %update.title, "memory exists, updating instead");
            }
            store.update_memory(
                &existing.id,
                Some(&update.content),
                update.importance.as_deref(),
            )?;
            tracing::info!(title = %update.title, "updated memory");
        }
        None => {
            if update.action == MemoryAction::Update {
                tracing::debug!(title = %update.title, "memory not found, creating");
            }
            store.create_memory(
                &update.title,
                update.category.as_deref().unwrap_or(DEFAULT_CATEGORY),
                &update.content,
                update.importance.as_deref().unwrap_or(DEFAULT_IMPORTANCE),
            )?;
            tracing::info!(title = %update.title, "created memory");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::Path;

    use super::*;
    use crate::analysis::{ComplexResult, SimpleResult};
    use crate::notify::RecordingNotifier;
    use crate::ralph::RecordingSleeper;
    use crate::store::JsonStore;
    use crate::subprocess::RunOutput;

    struct CannedAnalyzer(anyhow::Result<Analysis>);

    impl Analyzer for CannedAnalyzer {
        fn analyze(&self, _request: &AnalysisRequest<'_>) -> anyhow::Result<Analysis> {
            match &self.0 {
                Ok(a) => Ok(a.clone()),
                Err(e) => Err(anyhow::anyhow!("{e}")),
            }
        }
    }

    struct ScriptedAgent {
        outputs: RefCell<Vec<RunOutput>>,
        calls: RefCell<u32>,
    }

    impl ScriptedAgent {
        fn new(outputs: Vec<(i32, &str)>) -> Self {
            Self {
                outputs: RefCell::new(
                    outputs
                        .into_iter()
                        .rev()
                        .map(|(exit_code, stdout)| RunOutput {
                            stdout: stdout.to_string(),
                            stderr: String::new(),
                            exit_code,
                        })
                        .collect(),
                ),
                calls: RefCell::new(0),
            }
        }
    }

    impl AgentRunner for ScriptedAgent {
        fn run(&self, _prompt: &str, _cwd: &Path, _timeout: Duration) -> anyhow::Result<RunOutput> {
            *self.calls.borrow_mut() += 1;
            self.outputs
                .borrow_mut()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("no scripted output"))
        }
    }

    fn simple() -> Analysis {
        Analysis {
            difficulty: Difficulty::Simple,
            title: "Weather".to_string(),
            simple_result: Some(SimpleResult {
                summary: "Sunny".to_string(),
                result: "Sunny all week".to_string(),
            }),
            complex_result: None,
            memory_updates: vec![MemoryUpdate {
                action: MemoryAction::Update,
                title: "City".to_string(),
                category: None,
                content: "Lives in Taipei".to_string(),
                importance: None,
            }],
            message: "It will be sunny".to_string(),
        }
    }

    fn complex() -> Analysis {
        Analysis {
            difficulty: Difficulty::Complex,
            title: "Landing page".to_string(),
            simple_result: None,
            complex_result: Some(ComplexResult {
                summary: "Build a site".to_string(),
                analysis: "Static".to_string(),
                preparation: "None".to_string(),
                agent_prompt: "Build and deploy".to_string(),
                estimated_time: "1h".to_string(),
                reason: "Deploys".to_string(),
            }),
            memory_updates: Vec::new(),
            message: "On it".to_string(),
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        store: JsonStore,
        notifier: RecordingNotifier,
        sleeper: RecordingSleeper,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = JsonStore::open(&dir.path().join("store")).unwrap();
            Self {
                dir,
                store,
                notifier: RecordingNotifier::default(),
                sleeper: RecordingSleeper::default(),
            }
        }

        fn processor<'a>(
            &'a self,
            analyzer: &'a dyn Analyzer,
            agent: &'a dyn AgentRunner,
        ) -> TaskProcessor<'a> {
            TaskProcessor {
                store: &self.store,
                analyzer,
                runner: agent,
                notifier: &self.notifier,
                sleeper: &self.sleeper,
                settings: ProcessorSettings {
                    tasks_dir: self.dir.path().join("tasks"),
                    backoff: Duration::from_secs(10),
                    max_attempts: 3,
                    attempt_timeout: Duration::from_secs(60),
                    locks_dir: Some(self.dir.path().join("locks")),
                },
            }
        }
    }

    #[test]
    fn simple_task_notifies_learns_and_archives() {
        let fx = Fixture::new();
        let analyzer = CannedAnalyzer(Ok(simple()));
        let agent = ScriptedAgent::new(vec![]);
        let processed = fx
            .processor(&analyzer, &agent)
            .process("what's the weather", "line", None)
            .unwrap();

        assert_eq!(processed.difficulty, Difficulty::Simple);
        assert_eq!(processed.executed, None);
        assert_eq!(*agent.calls.borrow(), 0);
        assert_eq!(fx.notifier.messages(), vec!["It will be sunny"]);
        assert!(fx.store.pending_inbox().unwrap().is_empty());

        let review = fx.store.review(&processed.review_id).unwrap().unwrap();
        assert_eq!(review.status, ReviewStatus::PendingReview);
        assert_eq!(review.result, "Sunny all week");
        assert_eq!(review.source_task_id, processed.inbox_id);

        // update with no existing record falls back to create
        let memory = fx.store.find_memory("City").unwrap().unwrap();
        assert_eq!(memory.category, "context");
        assert_eq!(memory.importance, "medium");
    }

    #[test]
    fn create_for_existing_memory_updates_it() {
        let fx = Fixture::new();
        fx.store
            .create_memory("Stack", "preference", "Likes Vue", "low")
            .unwrap();
        apply_memory_update(
            &fx.store,
            &MemoryUpdate {
                action: MemoryAction::Create,
                title: "Stack".to_string(),
                category: Some("preference".to_string()),
                content: "Likes Astro".to_string(),
                importance: Some("high".to_string()),
            },
        )
        .unwrap();
        let memories = fx.store.memories().unwrap();
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].content, "Likes Astro");
        assert_eq!(memories[0].importance, "high");
    }

    #[test]
    fn complex_task_runs_loop_and_reports_deploy_url() {
        let fx = Fixture::new();
        let analyzer = CannedAnalyzer(Ok(complex()));
        let agent = ScriptedAgent::new(vec![
            (1, "still building"),
            (
                0,
                "---RESULT---\nSTATUS: SUCCESS\nDEPLOY_URL: https://landing.onrender.com\n---END---",
            ),
        ]);
        let processed = fx
            .processor(&analyzer, &agent)
            .process("build me a landing page", "line", None)
            .unwrap();

        assert_eq!(processed.executed, Some(true));
        assert_eq!(*agent.calls.borrow(), 2);
        assert_eq!(fx.sleeper.slept(), vec![Duration::from_secs(10)]);

        let review = fx.store.review(&processed.review_id).unwrap().unwrap();
        assert_eq!(review.status, ReviewStatus::Completed);
        assert!(review.result.contains("DEPLOY_URL"));
        let folder = review.folder.unwrap();
        assert!(folder.ends_with(format!(
            "{}_Landing_page_attempt2",
            chrono::Local::now().format("%Y-%m-%d")
        )));

        let messages = fx.notifier.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with("📝 Task created: Landing page"));
        assert!(messages[1].contains("🌐 https://landing.onrender.com"));
        assert!(messages[1].contains(&processed.review_id));
        // lease released
        assert!(!fx.dir.path().join("locks").join("worktree.lock").exists());
    }

    #[test]
    fn exhausted_complex_task_is_recorded_failed() {
        let fx = Fixture::new();
        let analyzer = CannedAnalyzer(Ok(complex()));
        let agent = ScriptedAgent::new(vec![(2, ""), (2, ""), (2, "")]);
        let processed = fx
            .processor(&analyzer, &agent)
            .process("build", "line", None)
            .unwrap();

        assert_eq!(processed.executed, Some(false));
        assert_eq!(*agent.calls.borrow(), 3);
        let review = fx.store.review(&processed.review_id).unwrap().unwrap();
        assert_eq!(review.status, ReviewStatus::Failed);
        assert_eq!(review.result, "Execution failed: Agent exited with code 2");
        let messages = fx.notifier.messages();
        assert!(messages[1].starts_with("❌ Task failed: Landing page"));
    }

    #[test]
    fn held_worktree_lease_fails_the_task() {
        let fx = Fixture::new();
        let _held = RunLease::acquire(&fx.dir.path().join("locks"), lease::WORKTREE).unwrap();
        let analyzer = CannedAnalyzer(Ok(complex()));
        let agent = ScriptedAgent::new(vec![(0, "done")]);
        let err = fx
            .processor(&analyzer, &agent)
            .process("build", "line", None)
            .unwrap_err();
        assert!(err.to_string().contains("another run is active"));
        assert_eq!(*agent.calls.borrow(), 0);
    }

    #[test]
    fn analysis_error_cleans_up_and_reraises() {
        let fx = Fixture::new();
        let analyzer = CannedAnalyzer(Err(anyhow::anyhow!("model overloaded")));
        let agent = ScriptedAgent::new(vec![]);
        let err = fx
            .processor(&analyzer, &agent)
            .process("hello there", "line", None)
            .unwrap_err();
        assert!(err.to_string().contains("model overloaded"));

        assert!(fx.store.pending_inbox().unwrap().is_empty());
        let messages = fx.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("Original message: hello there..."));
        assert!(messages[0].contains("Error: model overloaded"));
    }

    #[test]
    fn poll_processes_pending_records_and_counts_failures() {
        let fx = Fixture::new();
        fx.store.create_inbox("a", "first", "line").unwrap();
        fx.store.create_inbox("b", "second", "line").unwrap();

        let analyzer = CannedAnalyzer(Ok(simple()));
        let agent = ScriptedAgent::new(vec![]);
        let summary = fx.processor(&analyzer, &agent).poll().unwrap();
        assert_eq!(summary, PollSummary { processed: 2, failed: 0 });
        assert!(fx.store.pending_inbox().unwrap().is_empty());

        fx.store.create_inbox("c", "third", "line").unwrap();
        let failing = CannedAnalyzer(Err(anyhow::anyhow!("down")));
        let summary = fx.processor(&failing, &agent).poll().unwrap();
        assert_eq!(summary, PollSummary { processed: 0, failed: 1 });
    }

    #[test]
    fn long_input_title_is_truncated() {
        assert_eq!(inbox_title("short"), "short");
        let title = inbox_title(&"a".repeat(80));
        assert_eq!(title.len(), 53);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn unparsable_complex_analysis_gets_fallback_review() {
        let mut analysis = complex();
        analysis.complex_result = None;
        match new_review(&analysis, "inbox-1") {
            NewReview::Simple { summary, result, .. } => {
                assert_eq!(summary, "Could not parse the full response");
                assert_eq!(result, "On it");
            }
            NewReview::Complex { .. } => panic!("expected simple fallback"),
        }
    }
}
