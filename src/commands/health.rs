use super::Project;
use crate::error::ExitError;
use crate::service::{HealthCheck, HttpHealthProbe};

/// Probe the supervised service once.
pub fn run_health(project: &Project) -> anyhow::Result<()> {
    let probe = HttpHealthProbe::from_config(&project.config.service);
    let health = probe.probe();
    println!("{} - {}", health.verdict(), health.detail);
    if health.healthy {
        Ok(())
    } else {
        Err(ExitError::Other(format!("service unhealthy: {}", health.detail)).into())
    }
}
