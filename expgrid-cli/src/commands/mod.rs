pub mod generate;
pub mod jobs;
pub mod pipeline;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use tokio::sync::watch;
use tracing::debug;

use expgrid_core::pipeline::PhaseServices;
use expgrid_core::utils::resolve_workspace_dir;
use expgrid_core::{Filters, Workspace, WorkspaceConfig};

/// Workspace location and instance selection, shared by every command
#[derive(Args, Debug, Clone)]
pub struct SelectArgs {
    /// Workspace directory (default: the enclosing workspace)
    #[arg(long, short = 'w', value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// Only instances where the predicate holds (repeatable, all must hold)
    #[arg(long = "where", value_name = "PREDICATE")]
    pub include_where: Vec<String>,

    /// Drop instances where the predicate holds (repeatable, any drops)
    #[arg(long = "exclude-where", value_name = "PREDICATE")]
    pub exclude_where: Vec<String>,

    /// Only instances carrying the tag (repeatable, all required)
    #[arg(long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,

    /// Instances processed concurrently
    #[arg(long, short = 'j', value_name = "N")]
    pub jobs: Option<usize>,
}

impl SelectArgs {
    pub fn filters(&self) -> Filters {
        Filters {
            include_where: self.include_where.clone(),
            exclude_where: self.exclude_where.clone(),
            tags: self.tags.clone(),
        }
    }

    /// Load the workspace config with command-line settings applied last
    pub fn load_config(&self) -> Result<WorkspaceConfig> {
        let root = resolve_workspace_dir(self.workspace.as_deref());
        debug!(root = %root.display(), "workspace root");
        let mut config = WorkspaceConfig::load(&root)?;
        if let Some(jobs) = self.jobs {
            config.settings.max_parallel = jobs.max(1);
        }
        Ok(config)
    }

    /// Build the workspace; Ctrl-C cancels waits in progress
    pub fn open(&self) -> Result<Workspace> {
        let config = self.load_config()?;
        let services = PhaseServices::new(&config).with_cancel(interrupt_flag());
        Ok(Workspace::from_config(config)?.with_services(services))
    }
}

/// Flips to true on the first Ctrl-C
fn interrupt_flag() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });
    rx
}
