//! Per-attempt artifact directories.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};

const SLUG_MAX: usize = 50;

/// Filesystem-safe slug: alphanumerics, `-` and `_` kept, the rest become `_`.
pub fn slugify(title: &str) -> String {
    title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(SLUG_MAX)
        .collect()
}

/// Creates `<root>/<date>_<slug>[_<n>]` directories.
#[derive(Debug, Clone)]
pub struct ArtifactDirs {
    root: PathBuf,
}

impl ArtifactDirs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Create a fresh directory, adding a numeric suffix on collision.
    pub fn create(&self, title: &str, date: NaiveDate) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))?;

        let base = format!("{}_{}", date.format("%Y-%m-%d"), slugify(title));
        let mut candidate = self.root.join(&base);
        let mut counter = 1;
        loop {
            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    candidate = self.root.join(format!("{base}_{counter}"));
                    counter += 1;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("creating {}", candidate.display())));
                }
            }
        }
    }
}

/// Write `task.md` and the digest of the prompt actually sent.
pub fn write_prompt(dir: &Path, task_prompt: &str, sent_prompt: &str) -> anyhow::Result<()> {
    fs::write(dir.join("task.md"), format!("# Task\n\n{task_prompt}"))
        .with_context(|| format!("writing task.md in {}", dir.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(sent_prompt.as_bytes());
    fs::write(dir.join("prompt.sha256"), format!("{:x}\n", hasher.finalize()))
        .with_context(|| format!("writing prompt.sha256 in {}", dir.display()))?;
    Ok(())
}

/// Write `result.md` with the captured streams.
pub fn write_result(dir: &Path, stdout: &str, stderr: &str) -> anyhow::Result<()> {
    let mut content = format!("# Result\n\n## Output\n\n{stdout}");
    if !stderr.trim().is_empty() {
        content.push_str(&format!("\n\n## Errors\n\n{stderr}"));
    }
    fs::write(dir.join("result.md"), content)
        .with_context(|| format!("writing result.md in {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    #[test]
    fn slug_replaces_unsafe_chars_and_caps_length() {
        assert_eq!(slugify("Build a site: v2/beta"), "Build_a_site__v2_beta");
        assert_eq!(slugify(&"x".repeat(80)).len(), 50);
        assert_eq!(slugify("日本語"), "日本語");
    }

    #[test]
    fn collisions_get_numeric_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = ArtifactDirs::new(&tmp.path().join("tasks"));
        let a = dirs.create("Landing page", date()).unwrap();
        let b = dirs.create("Landing page", date()).unwrap();
        let c = dirs.create("Landing page", date()).unwrap();
        assert!(a.ends_with("2026-10-19_Landing_page"));
        assert!(b.ends_with("2026-10-19_Landing_page_1"));
        assert!(c.ends_with("2026-10-19_Landing_page_2"));
        assert!(a.is_dir() && b.is_dir() && c.is_dir());
    }

    #[test]
    fn artifacts_written() {
        let tmp = tempfile::tempdir().unwrap();
        write_prompt(tmp.path(), "do it", "preamble\ndo it").unwrap();
        write_result(tmp.path(), "out", "").unwrap();
        let task = fs::read_to_string(tmp.path().join("task.md")).unwrap();
        assert_eq!(task, "# Task\n\ndo it");
        let digest = fs::read_to_string(tmp.path().join("prompt.sha256")).unwrap();
        assert_eq!(digest.trim().len(), 64);
        let result = fs::read_to_string(tmp.path().join("result.md")).unwrap();
        assert!(result.contains("## Output\n\nout"));
        assert!(!result.contains("## Errors"));

        write_result(tmp.path(), "out", "boom").unwrap();
        let result = fs::read_to_string(tmp.path().join("result.md")).unwrap();
        assert!(result.ends_with("## Errors\n\nboom"));
    }
}
