//! Template rendering for agent prompts and outbound reports.

use minijinja::{Environment, context};
use serde::Serialize;

const PREAMBLE: &str = include_str!("templates/preamble.md.jinja");
const RETRY_CONTEXT: &str = include_str!("templates/retry_context.md.jinja");
const EVOLUTION_PROMPT: &str = include_str!("templates/evolution_prompt.md.jinja");
const EVOLUTION_SUCCESS: &str = include_str!("templates/evolution_success.txt.jinja");
const EVOLUTION_FAILURE: &str = include_str!("templates/evolution_failure.txt.jinja");
const ANALYSIS_REQUEST: &str = include_str!("templates/analysis_request.md.jinja");

/// System prompt for the task analysis request.
pub const ANALYSIS_SYSTEM: &str = include_str!("templates/analysis_system.md");

/// Iterations the agent is told it may spend inside one attempt.
const PREAMBLE_ITERATIONS: u32 = 5;

fn render<S: Serialize>(name: &str, source: &'static str, ctx: S) -> anyhow::Result<String> {
    let mut env = Environment::new();
    env.add_template(name, source)?;
    let template = env.get_template(name)?;
    Ok(template.render(ctx)?)
}

/// Automated-execution instructions placed before every Ralph loop prompt.
pub fn render_preamble() -> anyhow::Result<String> {
    render(
        "preamble",
        PREAMBLE,
        context! { max_iterations => PREAMBLE_ITERATIONS },
    )
}

/// Failure feedback prepended to the prompt on attempt 2 and later.
pub fn render_retry_context(attempt: u32, error: &str) -> anyhow::Result<String> {
    render(
        "retry-context",
        RETRY_CONTEXT,
        context! { attempt, error },
    )
}

/// Inputs for the evolution task prompt.
#[derive(Debug, Serialize)]
pub struct EvolutionPromptContext<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub files: &'a str,
    pub verification: &'a str,
}

pub fn render_evolution_prompt(ctx: &EvolutionPromptContext<'_>) -> anyhow::Result<String> {
    render("evolution-prompt", EVOLUTION_PROMPT, ctx)
}

/// Inputs for the evolution outcome notification.
#[derive(Debug, Serialize)]
pub struct EvolutionReportContext<'a> {
    pub title: &'a str,
    pub duration: u64,
    pub level: &'a str,
    pub tag: &'a str,
    pub summary: &'a str,
    pub error: &'a str,
    pub rolled_back: bool,
}

pub fn render_evolution_success(ctx: &EvolutionReportContext<'_>) -> anyhow::Result<String> {
    render("evolution-success", EVOLUTION_SUCCESS, ctx)
}

pub fn render_evolution_failure(ctx: &EvolutionReportContext<'_>) -> anyhow::Result<String> {
    render("evolution-failure", EVOLUTION_FAILURE, ctx)
}

/// User message for the task analysis request.
pub fn render_analysis_request(
    memories: &str,
    input: &str,
    attachment: Option<&str>,
) -> anyhow::Result<String> {
    render(
        "analysis-request",
        ANALYSIS_REQUEST,
        context! { memories, input, attachment },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_describes_both_output_contracts() {
        let text = render_preamble().unwrap();
        assert!(text.contains("---RESULT---"));
        assert!(text.contains("---RALPH_STATUS---"));
        assert!(text.contains("At most 5 iterations"));
        assert!(text.ends_with("Begin the task now:\n"));
    }

    #[test]
    fn retry_context_carries_previous_error() {
        let text = render_retry_context(3, "npm ERR! missing script: build").unwrap();
        assert!(text.contains("attempt 3"));
        assert!(text.contains("npm ERR! missing script: build"));
        assert!(text.contains("Do not repeat the same mistake"));
    }

    #[test]
    fn evolution_prompt_fills_defaults() {
        let text = render_evolution_prompt(&EvolutionPromptContext {
            title: "Tidy docs",
            description: "Rewrite the intro",
            files: "",
            verification: "",
        })
        .unwrap();
        assert!(text.starts_with("# Evolution Task: Tidy docs"));
        assert!(text.contains("Rewrite the intro"));
        assert!(text.contains("No files specified"));
        assert!(text.contains("No verification steps specified"));
    }

    #[test]
    fn reports_render() {
        let ctx = EvolutionReportContext {
            title: "Tidy docs",
            duration: 42,
            level: "Level 3",
            tag: "post-evolution-abc-20260101-000000",
            summary: "done",
            error: "",
            rolled_back: true,
        };
        let ok = render_evolution_success(&ctx).unwrap();
        assert!(ok.contains("42s"));
        assert!(ok.contains("post-evolution-abc-20260101-000000"));
        let failed = render_evolution_failure(&ctx).unwrap();
        assert!(failed.contains("(rolled back)"));
        assert!(failed.contains("Error: Unknown error"));
    }

    #[test]
    fn analysis_request_includes_attachment_only_when_given() {
        let bare = render_analysis_request("- [pref] tz: UTC", "summarize this", None).unwrap();
        assert!(bare.contains("- [pref] tz: UTC"));
        assert!(bare.contains("summarize this"));
        assert!(!bare.contains("Attached content"));

        let with = render_analysis_request("", "summarize this", Some("page body")).unwrap();
        assert!(with.contains("## Attached content\n\npage body"));
    }
}
