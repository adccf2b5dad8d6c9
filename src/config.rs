use std::path::{Path, PathBuf};

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Config file name.
pub const CONFIG_TOML: &str = ".evolver.toml";

/// Find the config file for a project root.
///
/// Priority order:
/// 1. `<root>/.evolver.toml`
/// 2. `<config_dir>/evolver/config.toml` (per-user fallback)
pub fn find_config(root: &Path) -> Option<PathBuf> {
    let local = root.join(CONFIG_TOML);
    if local.exists() {
        return Some(local);
    }
    let user = dirs::config_dir()?.join("evolver").join("config.toml");
    user.exists().then_some(user)
}

/// Top-level `.evolver.toml` config.
///
/// Loaded once at startup and passed by reference; nothing reads it from
/// process-wide state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub ralph: RalphConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ProjectConfig {
    /// Working tree the evolution controller snapshots and modifies.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Where per-attempt artifact directories are created.
    #[serde(default)]
    pub tasks_dir: Option<PathBuf>,
}

/// Safety-level tables. Level 0 blocks, 3 is unrestricted, unmatched paths get 2.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SafetyConfig {
    #[serde(default = "default_forbidden_files")]
    pub forbidden_files: Vec<String>,
    #[serde(default = "default_forbidden_patterns")]
    pub forbidden_patterns: Vec<String>,
    #[serde(default = "default_core_files")]
    pub core_files: Vec<String>,
    #[serde(default = "default_guarded_files")]
    pub guarded_files: Vec<String>,
    #[serde(default = "default_free_dirs")]
    pub free_dirs: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            forbidden_files: default_forbidden_files(),
            forbidden_patterns: default_forbidden_patterns(),
            core_files: default_core_files(),
            guarded_files: default_guarded_files(),
            free_dirs: default_free_dirs(),
        }
    }
}

fn default_forbidden_files() -> Vec<String> {
    vec![
        "src/config.py".into(),
        "src/main.py".into(),
        ".env".into(),
        ".env.example".into(),
        "com.joey.ai-agent.plist".into(),
    ]
}

fn default_forbidden_patterns() -> Vec<String> {
    vec!["*.plist".into(), ".env*".into()]
}

fn default_core_files() -> Vec<String> {
    vec![
        "src/api/line_webhook.py".into(),
        "src/services/task_processor.py".into(),
        "src/services/notion_service.py".into(),
        "src/services/claude_code_service.py".into(),
    ]
}

fn default_guarded_files() -> Vec<String> {
    vec![
        "src/prompts/system_prompt.md".into(),
        "src/services/claude_service.py".into(),
        "src/services/line_service.py".into(),
    ]
}

fn default_free_dirs() -> Vec<String> {
    vec![
        "web-frontend/".into(),
        "tasks/".into(),
        "agent-tasks/".into(),
        "docs/".into(),
    ]
}

/// The supervised long-running service.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ServiceConfig {
    #[serde(default = "default_health_url")]
    pub health_url: String,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    /// In-place restart command. `{uid}` expands to the invoking user's uid.
    #[serde(default = "default_restart")]
    pub restart: Vec<String>,
    /// Fallback stop command, run when `restart` fails.
    #[serde(default = "default_stop")]
    pub stop: Vec<String>,
    /// Fallback start command, run after `stop`.
    #[serde(default = "default_start")]
    pub start: Vec<String>,
    #[serde(default = "default_restart_settle")]
    pub restart_settle_secs: u64,
    #[serde(default = "default_rollback_settle")]
    pub rollback_settle_secs: u64,
    #[serde(default = "default_stop_start_gap")]
    pub stop_start_gap_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            health_url: default_health_url(),
            health_timeout_secs: default_health_timeout(),
            restart: default_restart(),
            stop: default_stop(),
            start: default_start(),
            restart_settle_secs: default_restart_settle(),
            rollback_settle_secs: default_rollback_settle(),
            stop_start_gap_secs: default_stop_start_gap(),
        }
    }
}

const SERVICE_LABEL: &str = "com.joey.ai-agent";

fn default_health_url() -> String {
    "http://localhost:8000/health".into()
}

const fn default_health_timeout() -> u64 {
    10
}

fn default_restart() -> Vec<String> {
    vec![
        "launchctl".into(),
        "kickstart".into(),
        "-k".into(),
        format!("gui/{{uid}}/{SERVICE_LABEL}"),
    ]
}

fn default_stop() -> Vec<String> {
    vec!["launchctl".into(), "stop".into(), SERVICE_LABEL.into()]
}

fn default_start() -> Vec<String> {
    vec!["launchctl".into(), "start".into(), SERVICE_LABEL.into()]
}

const fn default_restart_settle() -> u64 {
    5
}

const fn default_rollback_settle() -> u64 {
    3
}

const fn default_stop_start_gap() -> u64 {
    2
}

/// The external coding agent launched by the Ralph loop.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentConfig {
    #[serde(default = "default_agent_program")]
    pub program: String,
    /// Arguments; `{prompt}` is replaced by the prompt. Without a
    /// placeholder the prompt is passed as `-p <prompt>` before them.
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    /// Pause between attempts.
    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            args: default_agent_args(),
            backoff_secs: default_backoff(),
        }
    }
}

fn default_agent_program() -> String {
    "claude".into()
}

fn default_agent_args() -> Vec<String> {
    vec![
        "-p".into(),
        "{prompt}".into(),
        "--print".into(),
        "--dangerously-skip-permissions".into(),
    ]
}

const fn default_backoff() -> u64 {
    10
}

/// Retry budget for complex tasks from the task processor.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RalphConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout(),
        }
    }
}

const fn default_max_attempts() -> u32 {
    10
}

const fn default_attempt_timeout() -> u64 {
    6 * 60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EvolutionConfig {
    /// Upper bound for the single evolution attempt.
    #[serde(default = "default_evolution_timeout")]
    pub timeout_secs: u64,
    /// Characters of agent output kept on the record.
    #[serde(default = "default_output_limit")]
    pub output_limit: usize,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_evolution_timeout(),
            output_limit: default_output_limit(),
        }
    }
}

const fn default_evolution_timeout() -> u64 {
    60 * 60
}

const fn default_output_limit() -> usize {
    5000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StoreConfig {
    /// Directory holding the record tables; defaults to `<root>/.evolver/store`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_analysis_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_analysis_timeout")]
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: default_analysis_endpoint(),
            model: default_analysis_model(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_analysis_timeout(),
        }
    }
}

fn default_analysis_endpoint() -> String {
    "https://api.anthropic.com/v1/messages".into()
}

fn default_analysis_model() -> String {
    "claude-sonnet-4-20250514".into()
}

const fn default_max_tokens() -> u32 {
    4096
}

const fn default_analysis_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NotifyChannel {
    /// Write notifications to the log only.
    #[default]
    Log,
    /// Push through the LINE messaging API.
    Line,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NotifyConfig {
    #[serde(default)]
    pub channel: NotifyChannel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AccessConfig {
    /// Sender identities allowed to submit tasks. Empty allows everyone.
    #[serde(default)]
    pub authorized_users: Vec<String>,
}

impl AccessConfig {
    pub fn is_authorized(&self, sender: &str) -> bool {
        self.authorized_users.is_empty() || self.authorized_users.iter().any(|u| u == sender)
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse_toml(&contents)
    }

    /// Load the config for a project root, or defaults when there is none.
    pub fn discover(root: &Path) -> anyhow::Result<Self> {
        match find_config(root) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::load(&path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_TOML}: {e}")).into())
    }

    /// Working tree root: `project.root`, else the given fallback.
    pub fn project_root(&self, fallback: &Path) -> PathBuf {
        self.project
            .root
            .clone()
            .unwrap_or_else(|| fallback.to_path_buf())
    }

    pub fn tasks_dir(&self, root: &Path) -> PathBuf {
        self.project
            .tasks_dir
            .clone()
            .unwrap_or_else(|| root.join("tasks"))
    }

    pub fn store_dir(&self, root: &Path) -> PathBuf {
        self.store
            .dir
            .clone()
            .unwrap_or_else(|| root.join(".evolver").join("store"))
    }
}

/// Credentials read from the environment, never from the config file.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub anthropic_api_key: Option<String>,
    pub line_access_token: Option<String>,
    pub line_user_id: Option<String>,
    /// Forwarded into the coding-agent environment.
    pub agent_env: Vec<(String, String)>,
}

const FORWARDED_AGENT_ENV: &[&str] = &["CLAUDE_CODE_OAUTH_TOKEN", "GITHUB_TOKEN", "RENDER_API_KEY"];

impl Secrets {
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
        Self {
            anthropic_api_key: var("ANTHROPIC_API_KEY"),
            line_access_token: var("LINE_CHANNEL_ACCESS_TOKEN"),
            line_user_id: var("LINE_USER_ID"),
            agent_env: FORWARDED_AGENT_ENV
                .iter()
                .filter_map(|k| var(k).map(|v| ((*k).to_string(), v)))
                .collect(),
        }
    }
}
