//! Language-model task analysis: classify an inbound task as simple or
//! complex and collect the memory updates it implies.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;
use crate::error::ExitError;
use crate::store::Difficulty;
use crate::template;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryAction {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUpdate {
    pub action: MemoryAction,
    pub title: String,
    #[serde(default)]
    pub category: Option<String>,
    pub content: String,
    #[serde(default)]
    pub importance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleResult {
    pub summary: String,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexResult {
    pub summary: String,
    pub analysis: String,
    pub preparation: String,
    /// Instructions handed to the Ralph loop.
    #[serde(alias = "prompt_for_claude_code")]
    pub agent_prompt: String,
    pub estimated_time: String,
    pub reason: String,
}

/// Structured reply of the analysis model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub difficulty: Difficulty,
    pub title: String,
    #[serde(default)]
    pub simple_result: Option<SimpleResult>,
    #[serde(default)]
    pub complex_result: Option<ComplexResult>,
    #[serde(default)]
    pub memory_updates: Vec<MemoryUpdate>,
    /// Reply sent back to the requester.
    #[serde(alias = "line_message")]
    pub message: String,
}

impl Analysis {
    /// Degraded result used when the reply is not the expected JSON.
    pub fn unstructured(raw: &str) -> Self {
        Self {
            difficulty: Difficulty::Simple,
            title: "Processing result".to_string(),
            simple_result: Some(SimpleResult {
                summary: "AI response (unstructured)".to_string(),
                result: raw.to_string(),
            }),
            complex_result: None,
            memory_updates: Vec::new(),
            message: "Processing complete, see the review record".to_string(),
        }
    }

    /// The agent prompt, when the task is complex and carries one.
    pub fn agent_prompt(&self) -> Option<&str> {
        match (self.difficulty, &self.complex_result) {
            (Difficulty::Complex, Some(c)) => Some(c.agent_prompt.as_str()),
            _ => None,
        }
    }
}

/// Pull the JSON body out of a ```` ```json ```` fence, a bare fence, or the
/// whole reply.
fn json_body(content: &str) -> &str {
    let fenced = |marker: &str| {
        let start = content.find(marker)? + marker.len();
        let end = content[start..].find("```").map_or(content.len(), |i| start + i);
        Some(content[start..end].trim())
    };
    fenced("```json")
        .or_else(|| fenced("```"))
        .unwrap_or_else(|| content.trim())
}

/// Parse a model reply, falling back to [`Analysis::unstructured`].
pub fn parse_analysis(content: &str) -> Analysis {
    match serde_json::from_str(json_body(content)) {
        Ok(analysis) => analysis,
        Err(e) => {
            tracing::warn!("analysis reply is not valid JSON ({e}), using raw text");
            Analysis::unstructured(content)
        }
    }
}

/// What the analysis model sees.
#[derive(Debug, Clone)]
pub struct AnalysisRequest<'a> {
    pub input: &'a str,
    /// Output of [`crate::store::format_memories`].
    pub memories: &'a str,
    pub attachment: Option<&'a str>,
}

pub trait Analyzer {
    fn analyze(&self, request: &AnalysisRequest<'_>) -> anyhow::Result<Analysis>;
}

/// Anthropic Messages API client.
#[derive(Debug, Clone)]
pub struct AnthropicAnalyzer {
    endpoint: String,
    model: String,
    max_tokens: u32,
    timeout: Duration,
    api_key: String,
}

impl AnthropicAnalyzer {
    pub fn new(config: &AnalysisConfig, api_key: Option<String>) -> anyhow::Result<Self> {
        let api_key = api_key.ok_or_else(|| {
            ExitError::Config("ANTHROPIC_API_KEY is not set".to_string())
        })?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
            api_key,
        })
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

impl Analyzer for AnthropicAnalyzer {
    fn analyze(&self, request: &AnalysisRequest<'_>) -> anyhow::Result<Analysis> {
        let user_message =
            template::render_analysis_request(request.memories, request.input, request.attachment)?;
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": template::ANALYSIS_SYSTEM,
            "messages": [{ "role": "user", "content": user_message }],
        });

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(self.timeout))
            .http_status_as_error(false)
            .build()
            .into();
        tracing::info!(model = %self.model, "requesting task analysis");
        let mut resp = agent
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .send(body.to_string())
            .context("sending analysis request")?;
        let status = resp.status().as_u16();
        let text = resp
            .body_mut()
            .read_to_string()
            .context("reading analysis response")?;
        if !(200..300).contains(&status) {
            anyhow::bail!("analysis request failed with status {status}: {}", text.trim());
        }

        let parsed: MessagesResponse =
            serde_json::from_str(&text).context("decoding analysis response")?;
        let reply = parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .context("analysis response has no text content")?;
        let analysis = parse_analysis(&reply);
        tracing::info!(difficulty = ?analysis.difficulty, title = %analysis.title, "analysis received");
        Ok(analysis)
    }
}
