//! Building evolution tasks from Markdown task files.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use regex::Regex;

use crate::safety::SafetyLevel;
use crate::store::{NewEvolutionTask, TaskType};

const TITLE_PREFIX: &str = "Evolution Task";

#[derive(Clone, Copy)]
enum Section {
    Description,
    Files,
    Verification,
}

impl Section {
    fn from_heading(heading: &str) -> Option<Self> {
        let lower = heading.to_lowercase();
        if lower.starts_with("description") {
            Some(Self::Description)
        } else if lower.starts_with("files") {
            Some(Self::Files)
        } else if lower.starts_with("verification") {
            Some(Self::Verification)
        } else {
            None
        }
    }
}

fn re_level() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)Level[：:\s]*(\d)").unwrap())
}

/// Parse a task file. The title is empty when the file has no `#` heading.
///
/// ```text
/// # Evolution Task: Tidy the docs
/// Level 3
/// ## Description
/// ...
/// ## Files
/// docs/intro.md
/// ## Verification
/// ...
/// ```
pub fn parse_markdown(content: &str) -> NewEvolutionTask {
    let title = content
        .lines()
        .find_map(|line| {
            let rest = line.strip_prefix('#')?;
            (!rest.starts_with('#')).then(|| strip_title_prefix(rest.trim()))
        })
        .unwrap_or_default();

    let level = re_level()
        .captures(content)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .and_then(SafetyLevel::from_u8)
        .unwrap_or(SafetyLevel::Free);

    let mut description = String::new();
    let mut files = String::new();
    let mut verification = String::new();
    let mut current: Option<Section> = None;
    let mut body: Vec<&str> = Vec::new();

    let mut flush = |section: Option<Section>, body: &mut Vec<&str>| {
        let text = body.join("\n").trim().to_string();
        body.clear();
        let slot = match section {
            Some(Section::Description) => &mut description,
            Some(Section::Files) => &mut files,
            Some(Section::Verification) => &mut verification,
            None => return,
        };
        // a repeated heading keeps its last non-empty body
        if !text.is_empty() || slot.is_empty() {
            *slot = text;
        }
    };

    for line in content.lines() {
        if let Some(heading) = line.strip_prefix("##") {
            flush(current, &mut body);
            current = Section::from_heading(heading.trim_start_matches('#').trim());
        } else if current.is_some() {
            body.push(line);
        }
    }
    flush(current, &mut body);

    NewEvolutionTask {
        title,
        task_type: infer_type(content),
        level,
        description,
        files_modified: files,
        verification_steps: verification,
    }
}

fn strip_title_prefix(heading: &str) -> String {
    heading
        .strip_prefix(TITLE_PREFIX)
        .map(|rest| rest.trim_start_matches([':', '：']).trim())
        .filter(|rest| !rest.is_empty())
        .unwrap_or(heading)
        .to_string()
}

/// Guess the task type from keywords anywhere in the file.
pub fn infer_type(content: &str) -> TaskType {
    let lower = content.to_lowercase();
    if lower.contains("prompt") {
        TaskType::Prompt
    } else if lower.contains("frontend") {
        TaskType::Frontend
    } else if lower.contains("config") || lower.contains(".env") {
        TaskType::Config
    } else {
        TaskType::Code
    }
}

/// Read and parse a task file, titling it after the file stem when it has no
/// heading.
pub fn load_file(path: &Path) -> anyhow::Result<NewEvolutionTask> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading task file {}", path.display()))?;
    let mut task = parse_markdown(&content);
    if task.title.is_empty() {
        task.title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    Ok(task)
}
