//! File-backed [`RecordStore`]: one pretty-printed JSON array per table.
//!
//! Writes go to a unique temp file and are renamed into place so a crash
//! never leaves a half-written table behind. Read-modify-write cycles hold an
//! exclusive lock on `.store.lock`, so separate processes sharing a store
//! directory do not lose each other's rows.
//!
//! The directory carries its own `.gitignore`, which keeps the tables and run
//! leases out of snapshots and untouched by rollbacks when the store lives
//! inside the project tree.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, anyhow};
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use super::{
    Difficulty, EvolutionStatus, EvolutionTask, EvolutionUpdate, InboxStatus, InboxTask, MemoryRecord,
    NewEvolutionTask, NewReview, RecordStore, ReviewStatus, ReviewTask,
};

const INBOX: &str = "inbox";
const REVIEW: &str = "review";
const MEMORY: &str = "memory";
const EVOLUTION: &str = "evolution";

const LOCK_FILE: &str = ".store.lock";
const VCS_IGNORE: &str = "\
/inbox.json
/review.json
/memory.json
/evolution.json
/locks/
/.tmp*
/.store.lock
/.gitignore
";

#[derive(Debug)]
pub struct JsonStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles; also feeds id generation.
    seq: Mutex<u64>,
}

impl JsonStore {
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating store {}", dir.display()))?;
        let ignore = dir.join(".gitignore");
        if !ignore.exists() {
            fs::write(&ignore, VCS_IGNORE)
                .with_context(|| format!("writing {}", ignore.display()))?;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            seq: Mutex::new(0),
        })
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.json"))
    }

    fn read<T: DeserializeOwned>(&self, table: &str) -> anyhow::Result<Vec<T>> {
        let path = self.table_path(table);
        match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => Ok(Vec::new()),
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("reading {}", path.display()))),
        }
    }

    fn write<T: Serialize>(&self, table: &str, rows: &[T]) -> anyhow::Result<()> {
        let path = self.table_path(table);
        let json = serde_json::to_string_pretty(rows)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("creating temp file in {}", self.dir.display()))?;
        tmp.write_all(json.as_bytes())
            .with_context(|| format!("writing {}", tmp.path().display()))?;
        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    /// Run `f` over the table under the store locks and persist the result.
    fn modify<T, R>(
        &self,
        table: &str,
        f: impl FnOnce(&mut Vec<T>) -> anyhow::Result<R>,
    ) -> anyhow::Result<R>
    where
        T: Serialize + DeserializeOwned,
    {
        let _guard = self.lock()?;
        let _tables = self.lock_tables()?;
        let mut rows = self.read(table)?;
        let out = f(&mut rows)?;
        self.write(table, &rows)?;
        Ok(out)
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, u64>> {
        self.seq.lock().map_err(|_| anyhow!("record store lock poisoned"))
    }

    /// Exclusive across processes; released when the handle drops.
    fn lock_tables(&self) -> anyhow::Result<File> {
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.lock()
            .with_context(|| format!("locking {}", path.display()))?;
        Ok(file)
    }

    fn new_id(&self, table: &str, seed: &str) -> anyhow::Result<String> {
        let n = {
            let mut seq = self.lock()?;
            *seq += 1;
            *seq
        };
        let mut hasher = Sha256::new();
        hasher.update(table.as_bytes());
        hasher.update(seed.as_bytes());
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(n.to_le_bytes());
        hasher.update(
            Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_le_bytes(),
        );
        let digest = format!("{:x}", hasher.finalize());
        Ok(digest[..32].to_string())
    }
}

trait Keyed {
    const TABLE: &'static str;
    fn key(&self) -> &str;
}

impl Keyed for InboxTask {
    const TABLE: &'static str = INBOX;
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for ReviewTask {
    const TABLE: &'static str = REVIEW;
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for MemoryRecord {
    const TABLE: &'static str = MEMORY;
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for EvolutionTask {
    const TABLE: &'static str = EVOLUTION;
    fn key(&self) -> &str {
        &self.id
    }
}

fn find_mut<'a, T: Keyed>(rows: &'a mut [T], id: &str) -> anyhow::Result<&'a mut T> {
    rows.iter_mut()
        .find(|r| r.key() == id)
        .ok_or_else(|| anyhow!("no {} record with id {id}", T::TABLE))
}

impl RecordStore for JsonStore {
    fn create_inbox(&self, title: &str, raw_input: &str, source: &str) -> anyhow::Result<String> {
        let id = self.new_id(INBOX, title)?;
        let task = InboxTask {
            id: id.clone(),
            title: title.to_string(),
            raw_input: raw_input.to_string(),
            source: source.to_string(),
            status: InboxStatus::Received,
            received_at: Utc::now(),
            archived: false,
        };
        self.modify(INBOX, |rows: &mut Vec<InboxTask>| {
            rows.push(task);
            Ok(())
        })?;
        tracing::debug!(id, "inbox task created");
        Ok(id)
    }

    fn update_inbox_status(&self, id: &str, status: InboxStatus) -> anyhow::Result<()> {
        self.modify(INBOX, |rows: &mut Vec<InboxTask>| {
            find_mut(rows, id)?.status = status;
            Ok(())
        })
    }

    fn archive_inbox(&self, id: &str) -> anyhow::Result<()> {
        self.modify(INBOX, |rows: &mut Vec<InboxTask>| {
            find_mut(rows, id)?.archived = true;
            Ok(())
        })
    }

    fn pending_inbox(&self) -> anyhow::Result<Vec<InboxTask>> {
        let mut rows: Vec<InboxTask> = self.read(INBOX)?;
        rows.retain(|t| !t.archived && t.status == InboxStatus::Received);
        rows.sort_by_key(|t| t.received_at);
        Ok(rows)
    }

    fn create_review(&self, review: NewReview) -> anyhow::Result<String> {
        let now = Utc::now();
        let task = match review {
            NewReview::Simple {
                title,
                summary,
                result,
                source_task_id,
            } => ReviewTask {
                id: self.new_id(REVIEW, &title)?,
                title,
                difficulty: Difficulty::Simple,
                status: ReviewStatus::PendingReview,
                summary,
                result,
                analysis: String::new(),
                preparation: String::new(),
                agent_prompt: String::new(),
                estimated_time: String::new(),
                reason: String::new(),
                source_task_id,
                processed_at: now,
                completed_at: None,
                folder: None,
            },
            NewReview::Complex {
                title,
                summary,
                analysis,
                preparation,
                agent_prompt,
                estimated_time,
                reason,
                source_task_id,
            } => ReviewTask {
                id: self.new_id(REVIEW, &title)?,
                title,
                difficulty: Difficulty::Complex,
                status: ReviewStatus::PendingReview,
                summary,
                result: String::new(),
                analysis,
                preparation,
                agent_prompt,
                estimated_time,
                reason,
                source_task_id,
                processed_at: now,
                completed_at: None,
                folder: None,
            },
        };
        let id = task.id.clone();
        self.modify(REVIEW, |rows: &mut Vec<ReviewTask>| {
            rows.push(task);
            Ok(())
        })?;
        Ok(id)
    }

    fn update_review_status(&self, id: &str, status: ReviewStatus) -> anyhow::Result<()> {
        self.modify(REVIEW, |rows: &mut Vec<ReviewTask>| {
            find_mut(rows, id)?.status = status;
            Ok(())
        })
    }

    fn update_review_result(
        &self,
        id: &str,
        status: ReviewStatus,
        result: &str,
        folder: Option<PathBuf>,
    ) -> anyhow::Result<()> {
        self.modify(REVIEW, |rows: &mut Vec<ReviewTask>| {
            let task = find_mut(rows, id)?;
            task.status = status;
            task.result = result.to_string();
            task.completed_at = Some(Utc::now());
            if folder.is_some() {
                task.folder = folder;
            }
            Ok(())
        })
    }

    fn review(&self, id: &str) -> anyhow::Result<Option<ReviewTask>> {
        let rows: Vec<ReviewTask> = self.read(REVIEW)?;
        Ok(rows.into_iter().find(|t| t.id == id))
    }

    fn memories(&self) -> anyhow::Result<Vec<MemoryRecord>> {
        self.read(MEMORY)
    }

    fn find_memory(&self, title: &str) -> anyhow::Result<Option<MemoryRecord>> {
        let rows: Vec<MemoryRecord> = self.read(MEMORY)?;
        Ok(rows.into_iter().find(|m| m.title == title))
    }

    fn create_memory(
        &self,
        title: &str,
        category: &str,
        content: &str,
        importance: &str,
    ) -> anyhow::Result<String> {
        let id = self.new_id(MEMORY, title)?;
        let record = MemoryRecord {
            id: id.clone(),
            title: title.to_string(),
            category: category.to_string(),
            content: content.to_string(),
            importance: importance.to_string(),
            updated_at: Utc::now(),
        };
        self.modify(MEMORY, |rows: &mut Vec<MemoryRecord>| {
            rows.push(record);
            Ok(())
        })?;
        Ok(id)
    }

    fn update_memory(
        &self,
        id: &str,
        content: Option<&str>,
        importance: Option<&str>,
    ) -> anyhow::Result<()> {
        self.modify(MEMORY, |rows: &mut Vec<MemoryRecord>| {
            let record = find_mut(rows, id)?;
            if let Some(content) = content {
                record.content = content.to_string();
            }
            if let Some(importance) = importance {
                record.importance = importance.to_string();
            }
            record.updated_at = Utc::now();
            Ok(())
        })
    }

    fn create_evolution(&self, task: &NewEvolutionTask) -> anyhow::Result<String> {
        let id = self.new_id(EVOLUTION, &task.title)?;
        let record = EvolutionTask {
            id: id.clone(),
            title: task.title.clone(),
            status: EvolutionStatus::Pending,
            task_type: task.task_type,
            level: task.level,
            description: task.description.clone(),
            files_modified: task.files_modified.clone(),
            verification_steps: task.verification_steps.clone(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration: None,
            git_tag_pre: None,
            git_tag_post: None,
            git_commit_hash: None,
            verification_result: None,
            error_message: None,
            rollback_reason: None,
            agent_output: None,
        };
        self.modify(EVOLUTION, |rows: &mut Vec<EvolutionTask>| {
            rows.push(record);
            Ok(())
        })?;
        tracing::info!(id, title = %task.title, level = %task.level, "evolution task created");
        Ok(id)
    }

    fn evolution(&self, id: &str) -> anyhow::Result<Option<EvolutionTask>> {
        let rows: Vec<EvolutionTask> = self.read(EVOLUTION)?;
        Ok(rows.into_iter().find(|t| t.id == id))
    }

    fn pending_evolutions(&self) -> anyhow::Result<Vec<EvolutionTask>> {
        let mut rows: Vec<EvolutionTask> = self.read(EVOLUTION)?;
        rows.retain(|t| t.status == EvolutionStatus::Pending);
        rows.sort_by_key(|t| t.created_at);
        Ok(rows)
    }

    fn update_evolution(
        &self,
        id: &str,
        status: EvolutionStatus,
        update: EvolutionUpdate,
    ) -> anyhow::Result<()> {
        self.modify(EVOLUTION, |rows: &mut Vec<EvolutionTask>| {
            let task = find_mut(rows, id)?;
            task.status = status;
            if status == EvolutionStatus::Executing {
                task.started_at = Some(Utc::now());
            } else if status.is_terminal() {
                task.completed_at = Some(Utc::now());
            }

            let EvolutionUpdate {
                git_tag_pre,
                git_tag_post,
                git_commit_hash,
                verification_result,
                error_message,
                rollback_reason,
                agent_output,
                duration,
            } = update;
            let fields = [
                (&mut task.git_tag_pre, git_tag_pre),
                (&mut task.git_tag_post, git_tag_post),
                (&mut task.git_commit_hash, git_commit_hash),
                (&mut task.verification_result, verification_result),
                (&mut task.error_message, error_message),
                (&mut task.rollback_reason, rollback_reason),
                (&mut task.agent_output, agent_output),
            ];
            for (slot, value) in fields {
                if value.is_some() {
                    *slot = value;
                }
            }
            if duration.is_some() {
                task.duration = duration;
            }
            Ok(())
        })?;
        tracing::debug!(id, status = %status, "evolution task updated");
        Ok(())
    }

    fn evolution_history(&self, limit: usize) -> anyhow::Result<Vec<EvolutionTask>> {
        let mut rows: Vec<EvolutionTask> = self.read(EVOLUTION)?;
        rows.reverse();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::SafetyLevel;
    use crate::store::TaskType;

    fn store() -> (tempfile::TempDir, JsonStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(&dir.path().join("store")).unwrap();
        (dir, store)
    }

    fn new_task(title: &str) -> NewEvolutionTask {
        NewEvolutionTask {
            title: title.to_string(),
            task_type: TaskType::Code,
            level: SafetyLevel::Free,
            description: "d".to_string(),
            files_modified: "docs/a.md\n\n docs/b.md \n".to_string(),
            verification_steps: String::new(),
        }
    }

    #[test]
    fn archived_inbox_task_is_not_pending() {
        let (_dir, store) = store();
        let keep = store.create_inbox("keep", "keep me", "line").unwrap();
        let gone = store.create_inbox("gone", "archive me", "line").unwrap();
        assert_eq!(store.pending_inbox().unwrap().len(), 2);

        store.archive_inbox(&gone).unwrap();
        let pending = store.pending_inbox().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, keep);
    }

    #[test]
    fn processing_inbox_task_is_not_pending() {
        let (_dir, store) = store();
        let id = store.create_inbox("t", "raw", "cli").unwrap();
        store.update_inbox_status(&id, InboxStatus::Processing).unwrap();
        assert!(store.pending_inbox().unwrap().is_empty());
    }

    #[test]
    fn unknown_ids_are_errors() {
        let (_dir, store) = store();
        assert!(store.archive_inbox("nope").is_err());
        assert!(store.update_memory("nope", Some("x"), None).is_err());
        assert!(
            store
                .update_evolution("nope", EvolutionStatus::Failed, EvolutionUpdate::default())
                .is_err()
        );
        assert!(store.evolution("nope").unwrap().is_none());
    }

    #[test]
    fn evolution_status_stamps_times_and_keeps_fields() {
        let (_dir, store) = store();
        let id = store.create_evolution(&new_task("tidy")).unwrap();
        let task = store.evolution(&id).unwrap().unwrap();
        assert_eq!(task.status, EvolutionStatus::Pending);
        assert_eq!(task.files(), vec!["docs/a.md", "docs/b.md"]);
        assert_eq!(task.short_id().len(), 8);

        store
            .update_evolution(
                &id,
                EvolutionStatus::Executing,
                EvolutionUpdate {
                    git_tag_pre: Some("pre-tag".into()),
                    ..EvolutionUpdate::default()
                },
            )
            .unwrap();
        let task = store.evolution(&id).unwrap().unwrap();
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_none());

        store
            .update_evolution(
                &id,
                EvolutionStatus::Completed,
                EvolutionUpdate {
                    git_tag_post: Some("post-tag".into()),
                    duration: Some(12),
                    ..EvolutionUpdate::default()
                },
            )
            .unwrap();
        let task = store.evolution(&id).unwrap().unwrap();
        assert_eq!(task.status, EvolutionStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.git_tag_pre.as_deref(), Some("pre-tag"));
        assert_eq!(task.git_tag_post.as_deref(), Some("post-tag"));
        assert_eq!(task.duration, Some(12));
    }

    #[test]
    fn pending_oldest_first_history_newest_first() {
        let (_dir, store) = store();
        let a = store.create_evolution(&new_task("a")).unwrap();
        let b = store.create_evolution(&new_task("b")).unwrap();
        let c = store.create_evolution(&new_task("c")).unwrap();
        store
            .update_evolution(&b, EvolutionStatus::Failed, EvolutionUpdate::error("x"))
            .unwrap();

        let pending: Vec<String> = store
            .pending_evolutions()
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(pending, vec![a.clone(), c.clone()]);

        let history: Vec<String> = store
            .evolution_history(2)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(history, vec![c, b]);
    }

    #[test]
    fn memory_lookup_and_update() {
        let (_dir, store) = store();
        let id = store
            .create_memory("Timezone", "preference", "UTC+8", "high")
            .unwrap();
        let found = store.find_memory("Timezone").unwrap().unwrap();
        assert_eq!(found.id, id);

        store.update_memory(&id, Some("UTC+9"), None).unwrap();
        let found = store.find_memory("Timezone").unwrap().unwrap();
        assert_eq!(found.content, "UTC+9");
        assert_eq!(found.importance, "high");
        assert!(store.find_memory("Missing").unwrap().is_none());
    }

    #[test]
    fn review_result_records_folder() {
        let (_dir, store) = store();
        let id = store
            .create_review(NewReview::Simple {
                title: "t".into(),
                summary: "s".into(),
                result: "r".into(),
                source_task_id: "inbox-1".into(),
            })
            .unwrap();
        store
            .update_review_result(
                &id,
                ReviewStatus::Completed,
                "done",
                Some(PathBuf::from("/tmp/x")),
            )
            .unwrap();
        let review = store.review(&id).unwrap().unwrap();
        assert_eq!(review.status, ReviewStatus::Completed);
        assert_eq!(review.result, "done");
        assert_eq!(review.folder, Some(PathBuf::from("/tmp/x")));
        assert!(review.completed_at.is_some());
    }

    #[test]
    fn tables_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = JsonStore::open(dir.path())
            .unwrap()
            .create_evolution(&new_task("persist"))
            .unwrap();
        let reopened = JsonStore::open(dir.path()).unwrap();
        assert_eq!(reopened.evolution(&id).unwrap().unwrap().title, "persist");
        assert!(dir.path().join("evolution.json").exists());
    }

    #[test]
    fn concurrent_handles_keep_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let first = JsonStore::open(dir.path()).unwrap();
        let second = JsonStore::open(dir.path()).unwrap();

        std::thread::scope(|s| {
            for (name, store) in [("a", &first), ("b", &second)] {
                s.spawn(move || {
                    for i in 0..100 {
                        store
                            .create_memory(&format!("{name}-{i}"), "note", "body", "low")
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(first.memories().unwrap().len(), 200);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn store_dir_ignores_its_own_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "custom\n").unwrap();
        JsonStore::open(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join(".gitignore")).unwrap(), "custom\n");

        let fresh = dir.path().join("fresh");
        JsonStore::open(&fresh).unwrap();
        let ignore = fs::read_to_string(fresh.join(".gitignore")).unwrap();
        assert!(ignore.contains("/evolution.json"));
        assert!(ignore.contains("/locks/"));
    }
}
