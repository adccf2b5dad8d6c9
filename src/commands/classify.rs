use clap::Args;
use serde::Serialize;

use super::{OutputFormat, Project};
use crate::safety::{SafetyLevel, SafetyPolicy};

#[derive(Debug, Args)]
pub struct ClassifyArgs {
    /// Paths to classify, relative to the project root or absolute
    #[arg(required = true)]
    pub paths: Vec<String>,
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
struct PathLevel<'a> {
    path: &'a str,
    level: SafetyLevel,
}

#[derive(Debug, Serialize)]
struct Classification<'a> {
    paths: Vec<PathLevel<'a>>,
    task_level: SafetyLevel,
    forbidden: Vec<&'a str>,
}

impl ClassifyArgs {
    pub fn execute(&self, project: &Project) -> anyhow::Result<()> {
        let policy = SafetyPolicy::new(&project.config.safety)?.with_project_root(&project.root);
        let report = Classification {
            paths: self
                .paths
                .iter()
                .map(|p| PathLevel {
                    path: p,
                    level: policy.classify(p),
                })
                .collect(),
            task_level: policy.classify_task(&self.paths),
            forbidden: policy.forbidden(&self.paths),
        };

        match OutputFormat::resolve(self.format) {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Text => {
                for entry in &report.paths {
                    println!("{}\t{}", entry.level.as_u8(), entry.path);
                }
                println!("task\t{}", report.task_level.as_u8());
            }
            OutputFormat::Pretty => {
                for entry in &report.paths {
                    println!("  {}  {}", entry.level, entry.path);
                }
                println!(
                    "\nTask: {} ({})",
                    report.task_level,
                    report.task_level.description()
                );
                if !report.forbidden.is_empty() {
                    println!("Blocked: {}", report.forbidden.join(", "));
                }
            }
        }
        Ok(())
    }
}
