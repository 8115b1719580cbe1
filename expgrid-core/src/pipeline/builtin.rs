// Built-in Phases
// Setup, execute and analyze steps every workspace gets

use crate::experiment::{ExperimentInstance, MANIFEST_FILE};
use crate::pipeline::phase::{
    completed_phases, is_complete, Phase, PhaseContext, PhaseError, PhaseKind, PipelineKind,
};
use crate::utils::{atomic_write, shell_quote};
use crate::workflow::{StatusSnapshot, WaitOutcome};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

pub const SOFTWARE_INSTALL: &str = "software_install";
pub const MAKE_EXPERIMENTS: &str = "make_experiments";
pub const WRITE_INVENTORY: &str = "write_inventory";
pub const WRITE_STATUS: &str = "write_status";
pub const SUBMIT: &str = "submit";
pub const WAIT: &str = "wait";
pub const QUERY_STATUS: &str = "query_status";
pub const FETCH_LOGS: &str = "fetch_logs";

/// Written by write_inventory into the state dir
pub const INVENTORY_FILE: &str = "inventory.json";

/// Written by write_status into the state dir
pub const EXPERIMENT_STATUS_FILE: &str = "status.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    SoftwareInstall,
    MakeExperiments,
    WriteInventory,
    WriteStatus,
    Submit,
    Wait,
    QueryStatus,
    FetchLogs,
}

pub struct BuiltinPhase {
    name: &'static str,
    kind: PhaseKind,
    depends_on: Vec<String>,
    repeatable: bool,
    action: Action,
}

impl BuiltinPhase {
    fn new(name: &'static str, kind: PhaseKind, action: Action) -> Self {
        Self {
            name,
            kind,
            depends_on: Vec::new(),
            repeatable: false,
            action,
        }
    }

    fn after(mut self, dependencies: &[&str]) -> Self {
        self.depends_on = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    fn repeatable(mut self) -> Self {
        self.repeatable = true;
        self
    }
}

/// Built-in phases of a pipeline and its default order. Phases registered
/// but left out of the order (such as `wait`) run only when inserted.
pub fn builtin_phases(pipeline: PipelineKind) -> (Vec<BuiltinPhase>, Vec<&'static str>) {
    use Action::*;
    use PhaseKind::*;

    match pipeline {
        PipelineKind::Setup => (
            vec![
                BuiltinPhase::new(SOFTWARE_INSTALL, Provision, SoftwareInstall),
                BuiltinPhase::new(MAKE_EXPERIMENTS, Render, MakeExperiments)
                    .after(&[SOFTWARE_INSTALL]),
                BuiltinPhase::new(WRITE_INVENTORY, Render, WriteInventory)
                    .after(&[MAKE_EXPERIMENTS]),
                BuiltinPhase::new(WRITE_STATUS, Render, WriteStatus).after(&[MAKE_EXPERIMENTS]),
            ],
            vec![SOFTWARE_INSTALL, MAKE_EXPERIMENTS, WRITE_INVENTORY, WRITE_STATUS],
        ),
        PipelineKind::Execute => (
            vec![
                BuiltinPhase::new(SUBMIT, PhaseKind::Submit, Action::Submit),
                BuiltinPhase::new(WAIT, Local, Action::Wait)
                    .after(&[SUBMIT])
                    .repeatable(),
            ],
            vec![SUBMIT],
        ),
        PipelineKind::Analyze => (
            vec![
                BuiltinPhase::new(QUERY_STATUS, Local, QueryStatus).repeatable(),
                BuiltinPhase::new(FETCH_LOGS, Local, FetchLogs)
                    .after(&[QUERY_STATUS])
                    .repeatable(),
                BuiltinPhase::new(WRITE_STATUS, Render, WriteStatus)
                    .after(&[QUERY_STATUS])
                    .repeatable(),
            ],
            vec![QUERY_STATUS, FETCH_LOGS, WRITE_STATUS],
        ),
    }
}

#[async_trait]
impl Phase for BuiltinPhase {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> PhaseKind {
        self.kind
    }

    fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    fn repeatable(&self) -> bool {
        self.repeatable
    }

    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<Option<String>, PhaseError> {
        match self.action {
            Action::SoftwareInstall => software_install(ctx).await,
            Action::MakeExperiments => make_experiments(ctx),
            Action::WriteInventory => write_inventory(ctx),
            Action::WriteStatus => write_status(ctx),
            Action::Submit => submit(ctx).await,
            Action::Wait => wait(ctx).await,
            Action::QueryStatus => query_status(ctx).await,
            Action::FetchLogs => fetch_logs(ctx).await,
        }
    }
}

async fn software_install(ctx: &PhaseContext<'_>) -> Result<Option<String>, PhaseError> {
    let Some(environment) = &ctx.instance.environment else {
        return Ok(Some("no software environment".to_string()));
    };

    let manifest = ctx
        .services
        .provisioner
        .ensure(environment)
        .await
        .map_err(|source| PhaseError::Install {
            experiment: ctx.experiment(),
            source,
        })?;

    Ok(Some(format!(
        "{} ({} packages, {})",
        manifest.environment,
        manifest.packages.len(),
        manifest.installed_by
    )))
}

/// Shebang, scheduler directives, then the commands from the run directory
fn render_script(ctx: &PhaseContext<'_>) -> String {
    let instance = ctx.instance;
    let mut lines = vec![format!("#!{}", ctx.services.settings.shell)];
    if let Some(manager) = ctx.services.manager(instance.workflow_manager) {
        lines.extend(manager.backend().script_directives(instance));
    }
    lines.push(String::new());
    lines.push(format!("# {}", instance.namespace()));
    lines.push(format!("cd {}", shell_quote(&instance.run_dir)));
    lines.extend(instance.commands.iter().cloned());
    lines.push(String::new());
    lines.join("\n")
}

fn make_experiments(ctx: &PhaseContext<'_>) -> Result<Option<String>, PhaseError> {
    let instance = ctx.instance;
    let manifest_path = instance.manifest_path();

    if manifest_path.is_file() && !ctx.force {
        let existing = ExperimentInstance::read_manifest(&manifest_path)
            .map_err(ctx.io_error(&manifest_path))?;
        if existing.digest() == instance.digest() {
            debug!(experiment = %instance.namespace(), "existing instance matches");
            return Ok(Some("existing instance preserved".to_string()));
        }
        return Err(PhaseError::ExistingInstanceMismatch {
            experiment: ctx.experiment(),
            path: instance.run_dir.clone(),
        });
    }

    let script_path = instance.script_path();
    atomic_write(&script_path, render_script(ctx).as_bytes())
        .map_err(ctx.io_error(&script_path))?;
    make_executable(&script_path).map_err(ctx.io_error(&script_path))?;

    let manifest = instance.manifest_json().map_err(|e| PhaseError::Io {
        experiment: ctx.experiment(),
        path: manifest_path.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    atomic_write(&manifest_path, manifest.as_bytes()).map_err(ctx.io_error(&manifest_path))?;

    info!(experiment = %instance.namespace(), run_dir = %instance.run_dir.display(), "rendered experiment");
    Ok(Some(format!("rendered {}", instance.run_dir.display())))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[derive(Debug, Serialize)]
struct Inventory {
    experiment: String,
    digest: String,
    environment: Option<String>,
    /// Run-directory file -> SHA-256
    files: BTreeMap<String, String>,
    generated_at: DateTime<Utc>,
}

fn file_digest(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn write_inventory(ctx: &PhaseContext<'_>) -> Result<Option<String>, PhaseError> {
    let instance = ctx.instance;
    let mut files = BTreeMap::new();
    for path in [instance.manifest_path(), instance.script_path()] {
        if path.is_file() {
            let digest = file_digest(&path).map_err(ctx.io_error(&path))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| MANIFEST_FILE.to_string());
            files.insert(name, digest);
        }
    }

    let inventory = Inventory {
        experiment: instance.namespace(),
        digest: instance.digest(),
        environment: instance.environment.clone(),
        files,
        generated_at: Utc::now(),
    };

    let path = instance.state_dir().join(INVENTORY_FILE);
    let json = serde_json::to_vec_pretty(&inventory).map_err(|e| PhaseError::Io {
        experiment: ctx.experiment(),
        path: path.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    atomic_write(&path, &json).map_err(ctx.io_error(&path))?;
    Ok(Some(format!("{} files", inventory.files.len())))
}

#[derive(Debug, Serialize)]
struct ExperimentStatus {
    experiment: String,
    completed_phases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job: Option<StatusSnapshot>,
}

fn write_status(ctx: &PhaseContext<'_>) -> Result<Option<String>, PhaseError> {
    let instance = ctx.instance;
    let state_dir = instance.state_dir();
    let completed = completed_phases(&instance.run_dir).map_err(ctx.io_error(&state_dir))?;
    let job = StatusSnapshot::load(&state_dir).map_err(ctx.io_error(&state_dir))?;

    let summary = match &job {
        Some(snapshot) => format!("job {}", snapshot.status),
        None => format!("{} phases complete", completed.len()),
    };

    let status = ExperimentStatus {
        experiment: instance.namespace(),
        completed_phases: completed,
        job,
    };
    let path = state_dir.join(EXPERIMENT_STATUS_FILE);
    let yaml = serde_yaml::to_string(&status).map_err(|e| PhaseError::Io {
        experiment: ctx.experiment(),
        path: path.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    atomic_write(&path, yaml.as_bytes()).map_err(ctx.io_error(&path))?;
    Ok(Some(summary))
}

async fn submit(ctx: &PhaseContext<'_>) -> Result<Option<String>, PhaseError> {
    let manager = ctx.manager()?;
    if !is_complete(ctx.instance, PipelineKind::Setup, MAKE_EXPERIMENTS) {
        return Err(PhaseError::NotSetUp {
            experiment: ctx.experiment(),
        });
    }

    let record = manager
        .submit(ctx.instance, &ctx.instance.script_path())
        .await?;
    Ok(Some(format!("job {}", record.job_id)))
}

async fn wait(ctx: &PhaseContext<'_>) -> Result<Option<String>, PhaseError> {
    let manager = ctx.manager()?;
    let outcome = manager
        .wait(ctx.instance, ctx.services.wait, ctx.services.cancel.clone())
        .await?;

    match outcome {
        WaitOutcome::Finished(report) => Ok(Some(report.to_string())),
        WaitOutcome::TimedOut { polls } => Err(PhaseError::WaitTimedOut {
            experiment: ctx.experiment(),
            polls,
        }),
        WaitOutcome::Cancelled { .. } => Err(PhaseError::WaitCancelled {
            experiment: ctx.experiment(),
        }),
    }
}

async fn query_status(ctx: &PhaseContext<'_>) -> Result<Option<String>, PhaseError> {
    let Some(manager) = ctx.services.manager(ctx.instance.workflow_manager) else {
        return Ok(Some("no workflow manager".to_string()));
    };
    let report = manager.status(ctx.instance).await?;
    Ok(Some(report.to_string()))
}

async fn fetch_logs(ctx: &PhaseContext<'_>) -> Result<Option<String>, PhaseError> {
    let Some(manager) = ctx.services.manager(ctx.instance.workflow_manager) else {
        return Ok(Some("no workflow manager".to_string()));
    };
    let files = manager.fetch_logs(ctx.instance).await?;
    Ok(Some(format!("{} log files", files.len())))
}
