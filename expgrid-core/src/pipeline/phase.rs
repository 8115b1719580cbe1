// Phases
// The phase capability, its run context and completion markers

use crate::config::{Settings, WorkspaceConfig};
use crate::experiment::{ExperimentInstance, STATE_DIR};
use crate::pipeline::install::{InstallError, Provisioner};
use crate::utils::{atomic_write, remove_if_exists};
use crate::variables::VariableError;
use crate::workflow::{
    backend_for, BackendKind, CommandRunner, ProcessRunner, WaitOptions, WorkflowError,
    WorkflowManager,
};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Directory under the instance state dir holding completion markers
pub const PHASES_DIR: &str = "phases";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Setup,
    Execute,
    Analyze,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 3] = [
        PipelineKind::Setup,
        PipelineKind::Execute,
        PipelineKind::Analyze,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Setup => "setup",
            PipelineKind::Execute => "execute",
            PipelineKind::Analyze => "analyze",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PipelineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PipelineKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| format!("unknown pipeline '{}'", s))
    }
}

/// Side-effect class of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    /// Reads or writes only expgrid's own local state
    Local,
    /// Renders files into run directories
    Render,
    /// Installs software
    Provision,
    /// Hands work to a scheduler
    Submit,
    /// Deletes or cancels something outside expgrid's state
    Destructive,
}

impl PhaseKind {
    /// Withheld by dry-run
    pub fn has_external_effects(&self) -> bool {
        matches!(
            self,
            PhaseKind::Provision | PhaseKind::Submit | PhaseKind::Destructive
        )
    }
}

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("{experiment}: not set up; run setup before submitting")]
    NotSetUp { experiment: String },

    #[error("{experiment}: no workflow manager configured")]
    NoWorkflowManager { experiment: String },

    #[error(
        "{experiment}: existing instance at {} differs from the current configuration; use --force to regenerate",
        .path.display()
    )]
    ExistingInstanceMismatch { experiment: String, path: PathBuf },

    #[error("{experiment}: {source}")]
    Install {
        experiment: String,
        #[source]
        source: InstallError,
    },

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("{experiment}: phase '{phase}': {source}")]
    Variable {
        experiment: String,
        phase: String,
        #[source]
        source: VariableError,
    },

    #[error("{experiment}: phase '{phase}': '{command}' exited with {code}: {message}")]
    Command {
        experiment: String,
        phase: String,
        command: String,
        code: String,
        message: String,
    },

    #[error("{experiment}: gave up waiting for the job after {polls} polls")]
    WaitTimedOut { experiment: String, polls: u32 },

    #[error("{experiment}: wait cancelled")]
    WaitCancelled { experiment: String },

    #[error("{experiment}: {}: {source}", .path.display())]
    Io {
        experiment: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Collaborators shared by every phase of a run
pub struct PhaseServices {
    pub settings: Settings,
    managers: HashMap<BackendKind, WorkflowManager>,
    pub provisioner: Provisioner,
    /// Runs custom phase commands; no timeout
    pub shell: Arc<dyn CommandRunner>,
    pub wait: WaitOptions,
    pub cancel: Option<watch::Receiver<bool>>,
}

impl PhaseServices {
    /// Real scheduler clients for every backend kind
    pub fn new(config: &WorkspaceConfig) -> Self {
        let scheduler: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
        let shell: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::with_timeout(None));

        let managers = BackendKind::ALL
            .into_iter()
            .filter_map(|kind| {
                backend_for(kind, Arc::clone(&scheduler), &config.settings.shell)
                    .map(|b| (kind, WorkflowManager::new(b)))
            })
            .collect();

        Self {
            settings: config.settings.clone(),
            managers,
            provisioner: Provisioner::from_config(
                &config.workspace().software,
                &config.settings.shell,
                config.root.clone(),
                Arc::clone(&shell),
            ),
            shell,
            wait: WaitOptions {
                interval: config.settings.poll_interval,
                timeout: config.settings.wait_timeout,
            },
            cancel: None,
        }
    }

    /// Replace the manager for its backend kind
    pub fn with_manager(mut self, manager: WorkflowManager) -> Self {
        self.managers.insert(manager.kind(), manager);
        self
    }

    pub fn with_provisioner(mut self, provisioner: Provisioner) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_shell(mut self, shell: Arc<dyn CommandRunner>) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_wait(mut self, wait: WaitOptions) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn manager(&self, kind: BackendKind) -> Option<&WorkflowManager> {
        self.managers.get(&kind)
    }
}

/// Everything one phase invocation may look at
pub struct PhaseContext<'a> {
    pub instance: &'a ExperimentInstance,
    pub pipeline: PipelineKind,
    pub dry_run: bool,
    pub force: bool,
    pub services: &'a PhaseServices,
}

impl<'a> PhaseContext<'a> {
    pub fn experiment(&self) -> String {
        self.instance.namespace()
    }

    /// The instance's workflow manager, or `NoWorkflowManager`
    pub fn manager(&self) -> Result<&'a WorkflowManager, PhaseError> {
        self.services
            .manager(self.instance.workflow_manager)
            .ok_or_else(|| PhaseError::NoWorkflowManager {
                experiment: self.experiment(),
            })
    }

    pub fn io_error(&self, path: &Path) -> impl FnOnce(std::io::Error) -> PhaseError {
        let experiment = self.experiment();
        let path = path.to_path_buf();
        move |source| PhaseError::Io {
            experiment,
            path,
            source,
        }
    }
}

/// One named, idempotent step of a pipeline
#[async_trait]
pub trait Phase: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> PhaseKind;

    /// Phases that must complete earlier in the same pipeline
    fn depends_on(&self) -> &[String];

    /// Runs every time, ignoring its completion marker
    fn repeatable(&self) -> bool {
        false
    }

    /// Returns a short detail line for the report
    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<Option<String>, PhaseError>;
}

/// `<run_dir>/.expgrid/phases/<pipeline>.<phase>.done`
pub fn marker_path(instance: &ExperimentInstance, pipeline: PipelineKind, phase: &str) -> PathBuf {
    instance
        .state_dir()
        .join(PHASES_DIR)
        .join(format!("{}.{}.done", pipeline, phase))
}

pub fn is_complete(instance: &ExperimentInstance, pipeline: PipelineKind, phase: &str) -> bool {
    marker_path(instance, pipeline, phase).is_file()
}

pub(crate) fn mark_complete(
    instance: &ExperimentInstance,
    pipeline: PipelineKind,
    phase: &str,
) -> std::io::Result<()> {
    atomic_write(
        &marker_path(instance, pipeline, phase),
        Utc::now().to_rfc3339().as_bytes(),
    )
}

/// Completed phases as `pipeline.phase`, sorted
pub fn completed_phases(run_dir: &Path) -> std::io::Result<Vec<String>> {
    let dir = run_dir.join(STATE_DIR).join(PHASES_DIR);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut phases = Vec::new();
    for entry in entries {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if let Some(phase) = name.strip_suffix(".done") {
            phases.push(phase.to_string());
        }
    }
    phases.sort();
    Ok(phases)
}

/// Forget every completed phase of one pipeline, returning how many markers
/// were removed
pub fn clear_markers(
    instance: &ExperimentInstance,
    pipeline: PipelineKind,
) -> std::io::Result<usize> {
    let prefix = format!("{}.", pipeline);
    let mut removed = 0;
    for done in completed_phases(&instance.run_dir)? {
        if let Some(phase) = done.strip_prefix(&prefix) {
            if remove_if_exists(&marker_path(instance, pipeline, phase))? {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::instance::tests::sample_instance;

    #[test]
    fn test_pipeline_kind_parse() {
        assert_eq!("analyze".parse::<PipelineKind>().unwrap(), PipelineKind::Analyze);
        assert!("archive".parse::<PipelineKind>().is_err());
    }

    #[test]
    fn test_external_kinds() {
        assert!(PhaseKind::Submit.has_external_effects());
        assert!(PhaseKind::Provision.has_external_effects());
        assert!(PhaseKind::Destructive.has_external_effects());
        assert!(!PhaseKind::Render.has_external_effects());
        assert!(!PhaseKind::Local.has_external_effects());
    }

    #[test]
    fn test_markers() {
        let temp = tempfile::tempdir().unwrap();
        let instance = sample_instance("a", temp.path());

        assert!(!is_complete(&instance, PipelineKind::Setup, "make_experiments"));
        mark_complete(&instance, PipelineKind::Setup, "make_experiments").unwrap();
        mark_complete(&instance, PipelineKind::Execute, "submit").unwrap();

        assert!(is_complete(&instance, PipelineKind::Setup, "make_experiments"));
        assert!(marker_path(&instance, PipelineKind::Setup, "make_experiments")
            .ends_with(".expgrid/phases/setup.make_experiments.done"));
        assert_eq!(
            completed_phases(&instance.run_dir).unwrap(),
            vec!["execute.submit", "setup.make_experiments"]
        );
    }

    #[test]
    fn test_clear_markers_is_per_pipeline() {
        let temp = tempfile::tempdir().unwrap();
        let instance = sample_instance("a", temp.path());

        mark_complete(&instance, PipelineKind::Setup, "make_experiments").unwrap();
        mark_complete(&instance, PipelineKind::Execute, "submit").unwrap();
        mark_complete(&instance, PipelineKind::Execute, "wait").unwrap();

        assert_eq!(clear_markers(&instance, PipelineKind::Execute).unwrap(), 2);
        assert!(!is_complete(&instance, PipelineKind::Execute, "submit"));
        assert!(is_complete(&instance, PipelineKind::Setup, "make_experiments"));
        assert_eq!(clear_markers(&instance, PipelineKind::Execute).unwrap(), 0);
    }

    #[test]
    fn test_completed_phases_without_state() {
        let temp = tempfile::tempdir().unwrap();
        assert!(completed_phases(temp.path()).unwrap().is_empty());
    }
}
