pub mod classify;
pub mod evolve;
pub mod health;
pub mod run;
pub mod schema;
pub mod task;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::config::{Config, Secrets};
use crate::store::JsonStore;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

impl OutputFormat {
    /// Pretty on a terminal, text when piped.
    pub fn resolve(format: Option<Self>) -> Self {
        format.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                Self::Pretty
            } else {
                Self::Text
            }
        })
    }
}

/// Project root, its config, and environment secrets, resolved once per
/// command.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub config: Config,
    pub secrets: Secrets,
}

impl Project {
    pub fn load(project_root: Option<&Path>) -> anyhow::Result<Self> {
        let start = match project_root {
            Some(root) => root.to_path_buf(),
            None => std::env::current_dir().context("resolving current directory")?,
        };
        let config = Config::discover(&start)?;
        let root = config.project_root(&start);
        tracing::debug!(root = %root.display(), "project resolved");
        Ok(Self {
            root,
            config,
            secrets: Secrets::from_env(),
        })
    }

    pub fn store_dir(&self) -> PathBuf {
        self.config.store_dir(&self.root)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.store_dir().join("locks")
    }

    pub fn open_store(&self) -> anyhow::Result<JsonStore> {
        JsonStore::open(&self.store_dir())
    }
}
