//! Single-slot run leases.
//!
//! A lease is a lock file under `<store>/locks/` created with `create_new`, so
//! only one process can hold a given name. Evolution runs hold `evolution`
//! and `worktree`; complex-task executions hold `worktree`. A second run fails
//! fast instead of snapshotting or resetting the tree underneath the first.
//!
//! A lease is held for as long as its recorded process is alive, however long
//! the run takes. Leases left behind by a dead process are broken on the next
//! acquire.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExitError;
use crate::subprocess::Tool;

pub const EVOLUTION: &str = "evolution";
pub const WORKTREE: &str = "worktree";

/// Unreadable leases (no holder pid) older than this are assumed abandoned.
const UNKNOWN_HOLDER_STALE_MINUTES: i64 = 10;

static HELD: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());
static INTERRUPT_HANDLER: Once = Once::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if self.pid == 0 {
            now - self.acquired_at > Duration::minutes(UNKNOWN_HOLDER_STALE_MINUTES)
        } else {
            !process_alive(self.pid)
        }
    }
}

/// Held until dropped.
#[derive(Debug)]
pub struct RunLease {
    name: String,
    path: PathBuf,
}

impl RunLease {
    pub fn acquire(locks_dir: &Path, name: &str) -> anyhow::Result<Self> {
        fs::create_dir_all(locks_dir)
            .with_context(|| format!("creating {}", locks_dir.display()))?;
        let path = locks_dir.join(format!("{name}.lock"));

        match Self::create(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = read_record(&path).or_else(|| record_from_mtime(&path));
                match holder {
                    Some(record) if !record.is_stale(Utc::now()) => {
                        return Err(ExitError::Precondition(format!(
                            "{name} lease is held by pid {} since {}; another run is active",
                            record.pid,
                            record.acquired_at.to_rfc3339()
                        ))
                        .into());
                    }
                    Some(record) => tracing::warn!(
                        pid = record.pid,
                        "breaking stale {name} lease from {}",
                        record.acquired_at.to_rfc3339()
                    ),
                    None => tracing::warn!("breaking unreadable {name} lease"),
                }
                fs::remove_file(&path)
                    .with_context(|| format!("removing stale lease {}", path.display()))?;
                Self::create(&path)
                    .with_context(|| format!("acquiring {}", path.display()))?;
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("acquiring {}", path.display())));
            }
        }

        if let Ok(mut held) = HELD.lock() {
            held.push(path.clone());
        }
        tracing::debug!(lease = name, "lease acquired");
        Ok(Self {
            name: name.to_string(),
            path,
        })
    }

    /// Acquire several leases in order; earlier ones are released if a later
    /// one is held.
    pub fn acquire_all(locks_dir: &Path, names: &[&str]) -> anyhow::Result<Vec<Self>> {
        names
            .iter()
            .map(|name| Self::acquire(locks_dir, name))
            .collect()
    }

    fn create(path: &Path) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let record = LeaseRecord {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).map_err(std::io::Error::other)?;
        file.write_all(json.as_bytes())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("failed to release {} lease: {e}", self.name);
        }
        if let Ok(mut held) = HELD.lock() {
            held.retain(|p| p != &self.path);
        }
        tracing::debug!(lease = %self.name, "lease released");
    }
}

fn read_record(path: &Path) -> Option<LeaseRecord> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn process_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        return Path::new("/proc").join(pid.to_string()).exists();
    }
    Tool::new("kill")
        .args(&["-0", &pid.to_string()])
        .run()
        .is_ok_and(|o| o.success())
}

/// A lock file whose record is not written yet (or was truncated) is dated
/// by its modification time.
fn record_from_mtime(path: &Path) -> Option<LeaseRecord> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(LeaseRecord {
        pid: 0,
        acquired_at: DateTime::<Utc>::from(modified),
    })
}

/// Remove every held lease file and exit on Ctrl-C. Installed once per process.
pub fn release_on_interrupt() {
    INTERRUPT_HANDLER.call_once(|| {
        let result = ctrlc::set_handler(|| {
            eprintln!("Received interrupt signal, releasing leases...");
            if let Ok(held) = HELD.lock() {
                for path in held.iter() {
                    let _ = fs::remove_file(path);
                }
            }
            std::process::exit(130);
        });
        if let Err(e) = result {
            tracing::warn!("could not install Ctrl-C handler: {e}");
        }
    });
}
