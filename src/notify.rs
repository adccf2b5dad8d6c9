//! Outbound notifications. Delivery is best-effort: a failed push is logged
//! and never changes the outcome being reported.

use std::time::Duration;

use anyhow::Context;

use crate::config::{NotifyChannel, NotifyConfig, Secrets};
use crate::error::ExitError;
use crate::subprocess::truncate_chars;

const LINE_PUSH_URL: &str = "https://api.line.me/v2/bot/message/push";
const LINE_TEXT_LIMIT: usize = 5000;
const PUSH_TIMEOUT: Duration = Duration::from_secs(30);

pub trait Notifier {
    fn notify(&self, message: &str) -> anyhow::Result<()>;
}

/// Send and swallow any delivery error.
pub fn notify_best_effort(notifier: &dyn Notifier, message: &str) {
    if let Err(e) = notifier.notify(message) {
        tracing::error!("failed to send notification: {e:#}");
    }
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) -> anyhow::Result<()> {
        tracing::info!(target: "evolver::notify", "{message}");
        Ok(())
    }
}

/// LINE Messaging API push to a single user.
#[derive(Debug, Clone)]
pub struct LinePush {
    url: String,
    token: String,
    user_id: String,
}

impl LinePush {
    pub fn new(token: &str, user_id: &str) -> Self {
        Self {
            url: LINE_PUSH_URL.to_string(),
            token: token.to_string(),
            user_id: user_id.to_string(),
        }
    }

    #[cfg(test)]
    fn with_url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }
}

impl Notifier for LinePush {
    fn notify(&self, message: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "to": self.user_id,
            "messages": [{ "type": "text", "text": truncate_chars(message, LINE_TEXT_LIMIT) }],
        });
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(PUSH_TIMEOUT))
            .http_status_as_error(false)
            .build()
            .into();
        let mut resp = agent
            .post(&self.url)
            .header("authorization", &format!("Bearer {}", self.token))
            .header("content-type", "application/json")
            .send(body.to_string())
            .context("sending LINE push")?;
        let status = resp.status().as_u16();
        if status != 200 {
            let text = resp.body_mut().read_to_string().unwrap_or_default();
            anyhow::bail!("LINE push failed with status {status}: {}", text.trim());
        }
        tracing::debug!("LINE push delivered");
        Ok(())
    }
}

/// Build the notifier for the configured channel.
pub fn from_config(config: &NotifyConfig, secrets: &Secrets) -> anyhow::Result<Box<dyn Notifier>> {
    match config.channel {
        NotifyChannel::Log => Ok(Box::new(LogNotifier)),
        NotifyChannel::Line => {
            let (Some(token), Some(user)) = (&secrets.line_access_token, &secrets.line_user_id)
            else {
                return Err(ExitError::Config(
                    "notify.channel = \"line\" needs LINE_CHANNEL_ACCESS_TOKEN and LINE_USER_ID"
                        .to_string(),
                )
                .into());
            };
            Ok(Box::new(LinePush::new(token, user)))
        }
    }
}

/// Keeps every message; optionally fails delivery.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: std::sync::Mutex<Vec<String>>,
    fail: bool,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str) -> anyhow::Result<()> {
        self.messages.lock().unwrap().push(message.to_string());
        if self.fail {
            anyhow::bail!("notification channel down");
        }
        Ok(())
    }
}
