//! Reading completion signals and result blocks out of agent output.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

pub const RESULT_START: &str = "---RESULT---";
pub const RESULT_END: &str = "---END---";

/// What an attempt's output says about completion, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSignal {
    /// A `---RESULT---` block: the task produced a deliverable.
    ResultBlock,
    /// `EXIT_SIGNAL: true`.
    ExitSignal,
    /// `STATUS: COMPLETE`.
    CompleteStatus,
    /// Clean exit with no explicit signal.
    ImplicitSuccess,
    NoSignal,
}

impl CompletionSignal {
    /// Detect the signal, checking variants in precedence order.
    ///
    /// A result block counts even when the process exited non-zero and even
    /// when its own `STATUS` line is not `SUCCESS`.
    pub fn detect(output: &str, exit_code: i32) -> Self {
        if output.contains(RESULT_START) {
            Self::ResultBlock
        } else if re_exit_signal().is_match(output) {
            Self::ExitSignal
        } else if re_complete_status().is_match(output) {
            Self::CompleteStatus
        } else if exit_code == 0 {
            Self::ImplicitSuccess
        } else {
            Self::NoSignal
        }
    }

    pub const fn is_complete(self) -> bool {
        !matches!(self, Self::NoSignal)
    }
}

fn re_exit_signal() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"EXIT_SIGNAL:\s*true\b").unwrap())
}

fn re_complete_status() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bSTATUS:\s*COMPLETE\b").unwrap())
}

fn re_result_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)---RESULT---(.+?)---END---").unwrap())
}

fn re_render_url() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https://[a-zA-Z0-9-]+\.onrender\.com\S*").unwrap())
}

fn re_railway_url() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https://[a-zA-Z0-9-]+\.up\.railway\.app\S*").unwrap())
}

fn re_pages_url() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https://[a-zA-Z0-9-]+\.github\.io/[a-zA-Z0-9-]+").unwrap())
}

fn re_github_url() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https://github\.com/[a-zA-Z0-9-]+/[a-zA-Z0-9-]+").unwrap())
}

/// Fields of a `---RESULT--- ... ---END---` block, with URL fallbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultSummary {
    pub project_name: Option<String>,
    pub github_url: Option<String>,
    pub deploy_url: Option<String>,
    pub deploy_platform: Option<String>,
    pub status: Option<String>,
}

impl ResultSummary {
    pub fn extract(output: &str) -> Self {
        let mut summary = Self::default();

        if let Some(caps) = re_result_block().captures(output) {
            let block = caps.get(1).map_or("", |m| m.as_str());
            for line in block.lines() {
                let Some((key, value)) = line.split_once(':') else {
                    continue;
                };
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                let slot = match key.trim() {
                    "PROJECT_NAME" => &mut summary.project_name,
                    "GITHUB_URL" => &mut summary.github_url,
                    "DEPLOY_URL" => &mut summary.deploy_url,
                    "DEPLOY_PLATFORM" => &mut summary.deploy_platform,
                    "STATUS" => &mut summary.status,
                    _ => continue,
                };
                if slot.is_none() {
                    *slot = Some(value.to_string());
                }
            }
        }

        if summary.deploy_url.is_none() {
            let fallbacks = [
                (re_render_url(), "Render"),
                (re_railway_url(), "Railway"),
                (re_pages_url(), "GitHub Pages"),
            ];
            for (re, platform) in fallbacks {
                if let Some(m) = re.find(output) {
                    summary.deploy_url = Some(m.as_str().trim_end_matches('/').to_string());
                    summary.deploy_platform = Some(platform.to_string());
                    break;
                }
            }
        }

        if summary.github_url.is_none() {
            summary.github_url = re_github_url().find(output).map(|m| m.as_str().to_string());
        }

        summary
    }
}
