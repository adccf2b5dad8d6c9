use std::path::PathBuf;

use anyhow::Context;
use clap::Subcommand;

use super::Project;
use crate::analysis::AnthropicAnalyzer;
use crate::error::ExitError;
use crate::notify;
use crate::processor::{ProcessorSettings, TaskProcessor, inbox_title};
use crate::ralph::ThreadSleeper;
use crate::ralph::runner::AgentCli;
use crate::store::RecordStore;

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    /// Analyze one inbound message and act on it
    Process {
        /// Message text
        text: String,
        /// Sender identity, checked against access.authorized_users
        #[arg(long)]
        sender: Option<String>,
        /// Where the message came from
        #[arg(long, default_value = "cli")]
        source: String,
        /// File whose contents are attached to the analysis request
        #[arg(long)]
        attachment: Option<PathBuf>,
    },
    /// Process every pending inbox record
    Poll,
    /// Queue a message in the inbox without processing it
    Add {
        text: String,
        #[arg(long, default_value = "cli")]
        source: String,
    },
}

impl TaskCommand {
    pub fn execute(&self, project: &Project) -> anyhow::Result<()> {
        match self {
            Self::Process {
                text,
                sender,
                source,
                attachment,
            } => {
                let sender = sender.as_deref().unwrap_or_default();
                if !project.config.access.is_authorized(sender) {
                    tracing::warn!(sender, "unauthorized sender");
                    return Err(ExitError::Precondition(format!(
                        "sender {sender:?} is not authorized"
                    ))
                    .into());
                }
                let attachment = attachment
                    .as_ref()
                    .map(|path| {
                        std::fs::read_to_string(path)
                            .with_context(|| format!("reading attachment {}", path.display()))
                    })
                    .transpose()?;
                with_processor(project, |processor| {
                    let processed = processor.process(text, source, attachment.as_deref())?;
                    println!("{}", processed.review_id);
                    Ok(())
                })
            }
            Self::Poll => with_processor(project, |processor| {
                let summary = processor.poll()?;
                println!(
                    "processed {} task(s), {} failed",
                    summary.processed, summary.failed
                );
                if summary.failed > 0 {
                    return Err(ExitError::Other(format!(
                        "{} task(s) failed",
                        summary.failed
                    ))
                    .into());
                }
                Ok(())
            }),
            Self::Add { text, source } => {
                let store = project.open_store()?;
                let id = store.create_inbox(&inbox_title(text), text, source)?;
                println!("{id}");
                Ok(())
            }
        }
    }
}

fn with_processor(
    project: &Project,
    f: impl FnOnce(&TaskProcessor<'_>) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let config = &project.config;
    let analyzer =
        AnthropicAnalyzer::new(&config.analysis, project.secrets.anthropic_api_key.clone())?;
    let store = project.open_store()?;
    let runner = AgentCli::new(&config.agent, project.secrets.agent_env.clone());
    let notifier = notify::from_config(&config.notify, &project.secrets)?;
    let sleeper = ThreadSleeper;
    crate::lease::release_on_interrupt();

    let processor = TaskProcessor {
        store: &store,
        analyzer: &analyzer,
        runner: &runner,
        notifier: notifier.as_ref(),
        sleeper: &sleeper,
        settings: ProcessorSettings::from_config(config, &project.root),
    };
    f(&processor)
}
