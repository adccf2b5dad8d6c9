use std::path::Path;
use std::time::Duration;

use crate::config::AgentConfig;
use crate::subprocess::{RunOutput, Tool};

/// Placeholder in `agent.args` replaced by the prompt text.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Launches the coding agent once.
pub trait AgentRunner {
    /// Run non-interactively in `cwd`, killing the process after `timeout`.
    fn run(&self, prompt: &str, cwd: &Path, timeout: Duration) -> anyhow::Result<RunOutput>;
}

/// The coding-agent CLI (`claude -p <prompt> --print --dangerously-skip-permissions`).
#[derive(Debug, Clone)]
pub struct AgentCli {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl AgentCli {
    pub fn new(config: &AgentConfig, env: Vec<(String, String)>) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            env,
        }
    }

    fn argv(&self, prompt: &str) -> Vec<String> {
        if self.args.iter().any(|a| a.contains(PROMPT_PLACEHOLDER)) {
            self.args
                .iter()
                .map(|a| a.replace(PROMPT_PLACEHOLDER, prompt))
                .collect()
        } else {
            let mut argv = vec!["-p".to_string(), prompt.to_string()];
            argv.extend(self.args.iter().cloned());
            argv
        }
    }
}

impl AgentRunner for AgentCli {
    fn run(&self, prompt: &str, cwd: &Path, timeout: Duration) -> anyhow::Result<RunOutput> {
        let argv = self.argv(prompt);
        let mut tool = Tool::new(&self.program)
            .current_dir(cwd)
            .timeout(timeout);
        for arg in &argv {
            tool = tool.arg(arg);
        }
        for (k, v) in &self.env {
            tool = tool.env(k, v);
        }
        tracing::info!(program = %self.program, cwd = %cwd.display(), timeout_secs = timeout.as_secs(), "launching agent");
        tool.run()
    }
}
