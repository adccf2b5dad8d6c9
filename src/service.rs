//! Liveness probing and restarts for the supervised service.

use std::io::ErrorKind;
use std::time::Duration;

use crate::config::ServiceConfig;
use crate::ralph::Sleeper;
use crate::subprocess::Tool;

const RESTART_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Health {
    pub healthy: bool,
    pub detail: String,
}

impl Health {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            detail: "healthy".to_string(),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
        }
    }

    /// `PASS` / `FAIL`, as used in verification reports.
    pub const fn verdict(&self) -> &'static str {
        if self.healthy { "PASS" } else { "FAIL" }
    }
}

pub trait HealthCheck {
    /// A single bounded request; never retries.
    fn probe(&self) -> Health;
}

pub trait ServiceControl {
    /// Restart the service. `Err` carries the failure detail.
    fn restart(&self) -> anyhow::Result<String>;
}

/// GET against the service's liveness endpoint.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    url: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            &config.health_url,
            Duration::from_secs(config.health_timeout_secs),
        )
    }
}

impl HealthCheck for HttpHealthProbe {
    fn probe(&self) -> Health {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(self.timeout))
            .http_status_as_error(false)
            .build()
            .into();

        let health = match agent.get(&self.url).call() {
            Ok(resp) if resp.status().as_u16() == 200 => Health::healthy(),
            Ok(resp) => Health::unhealthy(format!("Unhealthy: status {}", resp.status().as_u16())),
            Err(ureq::Error::Timeout(_)) => Health::unhealthy("Health check timed out"),
            Err(ureq::Error::Io(e)) => match e.kind() {
                ErrorKind::ConnectionRefused => {
                    Health::unhealthy("Connection refused - service may be down")
                }
                ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                    Health::unhealthy("Health check timed out")
                }
                _ => Health::unhealthy(format!("Health check error: {e}")),
            },
            Err(e) => {
                let msg = e.to_string();
                let lower = msg.to_lowercase();
                if lower.contains("connection refused") || lower.contains("connection failed") {
                    Health::unhealthy("Connection refused - service may be down")
                } else {
                    Health::unhealthy(format!("Health check error: {msg}"))
                }
            }
        };
        tracing::debug!(url = %self.url, healthy = health.healthy, detail = %health.detail, "health probe");
        health
    }
}

/// Restarts through the host's service manager, falling back to stop + start.
pub struct Supervisor<'a> {
    restart: Vec<String>,
    stop: Vec<String>,
    start: Vec<String>,
    gap: Duration,
    sleeper: &'a dyn Sleeper,
}

impl<'a> Supervisor<'a> {
    pub fn from_config(config: &ServiceConfig, sleeper: &'a dyn Sleeper) -> Self {
        let uid = current_uid();
        let expand = |argv: &[String]| -> Vec<String> {
            argv.iter().map(|a| a.replace("{uid}", &uid)).collect()
        };
        Self {
            restart: expand(&config.restart),
            stop: expand(&config.stop),
            start: expand(&config.start),
            gap: Duration::from_secs(config.stop_start_gap_secs),
            sleeper,
        }
    }

    fn run(argv: &[String], timeout: Duration) -> anyhow::Result<crate::subprocess::RunOutput> {
        Tool::from_argv(argv)?.timeout(timeout).run()
    }
}

impl ServiceControl for Supervisor<'_> {
    fn restart(&self) -> anyhow::Result<String> {
        match Self::run(&self.restart, RESTART_TIMEOUT) {
            Ok(out) if out.success() => {
                tracing::info!("service restarted");
                return Ok("Service restarted".to_string());
            }
            Ok(out) => tracing::warn!(
                code = out.exit_code,
                stderr = %out.stderr.trim(),
                "restart command failed, falling back to stop/start"
            ),
            Err(e) => tracing::warn!("restart command failed ({e:#}), falling back to stop/start"),
        }

        if let Err(e) = Self::run(&self.stop, STOP_START_TIMEOUT) {
            tracing::warn!("stop command failed: {e:#}");
        }
        self.sleeper.sleep(self.gap);

        let out = Self::run(&self.start, STOP_START_TIMEOUT)
            .map_err(|e| anyhow::anyhow!("Service restart error: {e:#}"))?;
        if out.success() {
            tracing::info!("service restarted via stop/start");
            Ok("Service restarted (stop/start)".to_string())
        } else {
            anyhow::bail!("Failed to restart: {}", out.stderr.trim())
        }
    }
}

fn current_uid() -> String {
    Tool::new("id")
        .arg("-u")
        .timeout(Duration::from_secs(5))
        .run()
        .ok()
        .filter(|o| o.success())
        .map(|o| o.stdout_trimmed().to_string())
        .unwrap_or_else(|| "501".to_string())
}
