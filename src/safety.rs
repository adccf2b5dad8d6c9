//! Safety-level classification of file paths.
//!
//! A path gets a level from 0 (never touched by an autonomous run) to 3
//! (free to modify). A task's level is the most restrictive level across the
//! paths it declares.

use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::SafetyConfig;

/// How freely a path may be modified. Ordered from most to least restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SafetyLevel {
    /// Requires manual intervention; blocks execution.
    Forbidden = 0,
    /// Core logic; snapshot plus full verification.
    Core = 1,
    /// Safe with a snapshot.
    Guarded = 2,
    /// Free modification.
    Free = 3,
}

impl SafetyLevel {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::Forbidden),
            1 => Some(Self::Core),
            2 => Some(Self::Guarded),
            3 => Some(Self::Free),
            _ => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Forbidden => "Forbidden - Requires manual intervention",
            Self::Core => "Core Logic - Requires snapshot + full verification",
            Self::Guarded => "Safe - Requires snapshot",
            Self::Free => "Free modification",
        }
    }
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Level {}", self.as_u8())
    }
}

impl From<SafetyLevel> for u8 {
    fn from(level: SafetyLevel) -> Self {
        level.as_u8()
    }
}

impl TryFrom<u8> for SafetyLevel {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Self::from_u8(n).ok_or_else(|| format!("safety level must be 0-3, got {n}"))
    }
}

/// Immutable classifier built from the `[safety]` config section.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    project_root: Option<PathBuf>,
    forbidden_files: Vec<String>,
    forbidden_patterns: Vec<Regex>,
    core_files: Vec<String>,
    guarded_files: Vec<String>,
    free_dirs: Vec<String>,
}

impl SafetyPolicy {
    pub fn new(config: &SafetyConfig) -> anyhow::Result<Self> {
        let forbidden_patterns = config
            .forbidden_patterns
            .iter()
            .map(|p| {
                Regex::new(&glob_to_regex(p))
                    .map_err(|e| anyhow::anyhow!("invalid safety pattern {p:?}: {e}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            project_root: None,
            forbidden_files: config.forbidden_files.clone(),
            forbidden_patterns,
            core_files: config.core_files.clone(),
            guarded_files: config.guarded_files.clone(),
            free_dirs: config.free_dirs.clone(),
        })
    }

    /// Absolute paths under this root are classified by their relative part.
    pub fn with_project_root(mut self, root: &Path) -> Self {
        self.project_root = Some(root.to_path_buf());
        self
    }

    /// Classify a single path.
    pub fn classify(&self, path: &str) -> SafetyLevel {
        let rel = self.relative(path);

        if matches_file_list(rel, &self.forbidden_files) {
            return SafetyLevel::Forbidden;
        }
        let base = rel.rsplit('/').next().unwrap_or(rel);
        if self
            .forbidden_patterns
            .iter()
            .any(|re| re.is_match(rel) || re.is_match(base))
        {
            return SafetyLevel::Forbidden;
        }
        if matches_file_list(rel, &self.core_files) {
            return SafetyLevel::Core;
        }
        if matches_file_list(rel, &self.guarded_files) {
            return SafetyLevel::Guarded;
        }
        if self.free_dirs.iter().any(|d| rel.starts_with(d.as_str())) {
            return SafetyLevel::Free;
        }
        SafetyLevel::Guarded
    }

    /// Most restrictive level over `paths`; an empty set is unrestricted.
    pub fn classify_task<S: AsRef<str>>(&self, paths: &[S]) -> SafetyLevel {
        paths
            .iter()
            .map(|p| self.classify(p.as_ref()))
            .min()
            .unwrap_or(SafetyLevel::Free)
    }

    /// The paths in `paths` that classify as forbidden.
    pub fn forbidden<'a, S: AsRef<str>>(&self, paths: &'a [S]) -> Vec<&'a str> {
        paths
            .iter()
            .map(AsRef::as_ref)
            .filter(|p| self.classify(p) == SafetyLevel::Forbidden)
            .collect()
    }

    fn relative<'a>(&self, path: &'a str) -> &'a str {
        if let Some(root) = self.project_root.as_ref().and_then(|r| r.to_str())
            && let Some(rest) = path.strip_prefix(root)
        {
            return rest.trim_start_matches('/');
        }
        path.trim_start_matches('/')
    }
}

fn matches_file_list(rel: &str, files: &[String]) -> bool {
    files.iter().any(|f| rel == f || rel.ends_with(f.as_str()))
}

/// Translate a shell-style glob into an anchored regex.
///
/// `*` matches any run of characters (including `/`), `?` one character, and
/// `[...]` a character class (`[!...]` negated).
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                if chars.peek() == Some(&'!') {
                    chars.next();
                    class.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' || inner == '^' {
                        class.push('\\');
                    }
                    class.push(inner);
                }
                if closed {
                    out.push('[');
                    out.push_str(&class);
                    out.push(']');
                } else {
                    out.push_str(&regex::escape("["));
                    out.push_str(&regex::escape(class.trim_start_matches('^')));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SafetyPolicy {
        SafetyPolicy::new(&SafetyConfig::default()).unwrap()
    }

    #[test]
    fn forbidden_files_are_level_zero() {
        let p = policy();
        assert_eq!(p.classify("src/config.py"), SafetyLevel::Forbidden);
        assert_eq!(p.classify("/src/main.py"), SafetyLevel::Forbidden);
        assert_eq!(p.classify("nested/src/config.py"), SafetyLevel::Forbidden);
    }

    #[test]
    fn forbidden_patterns_beat_every_other_list() {
        let config = SafetyConfig {
            free_dirs: vec!["deploy/".into()],
            core_files: vec!["deploy/agent.plist".into()],
            ..SafetyConfig::default()
        };
        let p = SafetyPolicy::new(&config).unwrap();
        assert_eq!(p.classify("deploy/agent.plist"), SafetyLevel::Forbidden);
        assert_eq!(p.classify("docs/.env.local"), SafetyLevel::Forbidden);
    }

    #[test]
    fn core_guarded_free_and_default() {
        let p = policy();
        assert_eq!(p.classify("src/services/task_processor.py"), SafetyLevel::Core);
        assert_eq!(p.classify("src/services/line_service.py"), SafetyLevel::Guarded);
        assert_eq!(p.classify("docs/README.md"), SafetyLevel::Free);
        assert_eq!(p.classify("web-frontend/index.html"), SafetyLevel::Free);
        assert_eq!(p.classify("src/unknown.py"), SafetyLevel::Guarded);
    }

    #[test]
    fn absolute_paths_under_root_are_relativized() {
        let p = policy().with_project_root(Path::new("/srv/agent"));
        assert_eq!(p.classify("/srv/agent/docs/x.md"), SafetyLevel::Free);
        assert_eq!(p.classify("/srv/agent/src/config.py"), SafetyLevel::Forbidden);
    }

    #[test]
    fn task_level_is_minimum() {
        let p = policy();
        let paths = ["docs/a.md", "src/services/notion_service.py", "tasks/x"];
        assert_eq!(p.classify_task(&paths), SafetyLevel::Core);
        for path in paths {
            assert!(p.classify_task(&paths) <= p.classify(path));
        }
        assert_eq!(p.classify_task(&["docs/a.md", ".env"]), SafetyLevel::Forbidden);
    }

    #[test]
    fn empty_task_is_unrestricted() {
        let empty: [&str; 0] = [];
        assert_eq!(policy().classify_task(&empty), SafetyLevel::Free);
    }

    #[test]
    fn forbidden_lists_offending_paths() {
        let paths = vec!["docs/a.md".to_string(), "src/config.py".to_string()];
        assert_eq!(policy().forbidden(&paths), vec!["src/config.py"]);
    }

    #[test]
    fn glob_translation() {
        let re = Regex::new(&glob_to_regex("*.plist")).unwrap();
        assert!(re.is_match("com.agent.plist"));
        assert!(!re.is_match("plist.txt"));
        let re = Regex::new(&glob_to_regex("file?.[ch]")).unwrap();
        assert!(re.is_match("file1.c"));
        assert!(!re.is_match("file1.rs"));
        let re = Regex::new(&glob_to_regex("[!a]x")).unwrap();
        assert!(re.is_match("bx"));
        assert!(!re.is_match("ax"));
    }

    #[test]
    fn level_labels() {
        assert_eq!(SafetyLevel::try_from(2), Ok(SafetyLevel::Guarded));
        assert!(SafetyLevel::try_from(9).is_err());
        assert_eq!(SafetyLevel::Core.to_string(), "Level 1");
    }
}
