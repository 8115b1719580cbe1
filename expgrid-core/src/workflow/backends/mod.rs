// Scheduler Backends
// One implementation per workflow manager, selected by configuration

pub mod google_batch;
pub mod local;
pub mod pbs;
pub mod slurm;

pub use google_batch::GoogleBatchBackend;
pub use local::LocalBackend;
pub use pbs::PbsBackend;
pub use slurm::SlurmBackend;

use crate::experiment::ExperimentInstance;
use crate::variables::Value;
use crate::workflow::record::JobRecord;
use crate::workflow::runner::{CommandOutput, CommandRunner};
use crate::workflow::status::StatusMap;
use crate::workflow::BackendKind;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{backend}: failed to run '{command}': {source}")]
    Spawn {
        backend: BackendKind,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{backend}: '{command}' exited with {code}: {message}")]
    CommandFailed {
        backend: BackendKind,
        command: String,
        code: String,
        message: String,
    },

    #[error("{backend}: unexpected output from '{command}': {output:?}")]
    Malformed {
        backend: BackendKind,
        command: String,
        output: String,
    },

    #[error("{backend}: {path}: {source}")]
    Io {
        backend: BackendKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How a backend's wait loop decides the job is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Done as soon as the job leaves the live queue
    Existence,
    /// Done once a mapped query reports a terminal canonical status
    Status,
}

/// A native status string plus whatever descriptive fields came with it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeStatus {
    pub state: String,
    /// Node list, start and end times
    pub details: BTreeMap<String, String>,
}

impl NativeStatus {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: &str) -> Self {
        let value = value.trim();
        if !value.is_empty() && value != "Unknown" && value != "None" {
            self.details.insert(key.to_string(), value.to_string());
        }
        self
    }
}

/// Capability surface every scheduler implementation provides
#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn status_map(&self) -> &StatusMap;

    fn wait_strategy(&self) -> WaitStrategy;

    /// Scheduler pragmas placed after the shebang of the execute script
    fn script_directives(&self, _instance: &ExperimentInstance) -> Vec<String> {
        Vec::new()
    }

    /// Submit the rendered script and describe the job that was created
    async fn submit(
        &self,
        instance: &ExperimentInstance,
        script: &Path,
    ) -> Result<JobRecord, BackendError>;

    /// Live-queue state; `None` when the job is no longer active
    async fn query_active(&self, record: &JobRecord)
        -> Result<Option<NativeStatus>, BackendError>;

    /// Accounting/history state; `None` when the backend has never heard of it
    async fn query_history(
        &self,
        record: &JobRecord,
    ) -> Result<Option<NativeStatus>, BackendError>;

    /// Whether the live listing still shows the job
    async fn is_active(&self, record: &JobRecord) -> Result<bool, BackendError> {
        Ok(self.query_active(record).await?.is_some())
    }

    async fn cancel(&self, record: &JobRecord) -> Result<(), BackendError>;

    /// Bring the job's logs into `run_dir`, returning the files written
    async fn fetch_logs(
        &self,
        record: &JobRecord,
        run_dir: &Path,
    ) -> Result<Vec<PathBuf>, BackendError>;
}

/// Backend for a workflow manager kind; `None` for `BackendKind::None`.
/// `shell` is the interpreter the local backend runs scripts with.
pub fn backend_for(
    kind: BackendKind,
    runner: Arc<dyn CommandRunner>,
    shell: &str,
) -> Option<Arc<dyn SchedulerBackend>> {
    match kind {
        BackendKind::None => None,
        BackendKind::Local => Some(Arc::new(LocalBackend::new(runner, shell))),
        BackendKind::Slurm => Some(Arc::new(SlurmBackend::new(runner))),
        BackendKind::Pbs => Some(Arc::new(PbsBackend::new(runner))),
        BackendKind::GoogleBatch => Some(Arc::new(GoogleBatchBackend::new(runner))),
    }
}

/// Run a command, mapping spawn failures. Non-zero exits are returned as-is.
pub(crate) async fn run_command(
    runner: &dyn CommandRunner,
    backend: BackendKind,
    program: &str,
    args: &[String],
    working_dir: Option<&Path>,
) -> Result<CommandOutput, BackendError> {
    runner
        .run(program, args, working_dir)
        .await
        .map_err(|source| BackendError::Spawn {
            backend,
            command: program.to_string(),
            source,
        })
}

/// Run a command that must exit zero
pub(crate) async fn run_checked(
    runner: &dyn CommandRunner,
    backend: BackendKind,
    program: &str,
    args: &[String],
    working_dir: Option<&Path>,
) -> Result<CommandOutput, BackendError> {
    let output = run_command(runner, backend, program, args, working_dir).await?;
    if output.success() {
        return Ok(output);
    }
    Err(command_failed(backend, program, &output))
}

pub(crate) fn command_failed(
    backend: BackendKind,
    program: &str,
    output: &CommandOutput,
) -> BackendError {
    BackendError::CommandFailed {
        backend,
        command: program.to_string(),
        code: output
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string()),
        message: output.diagnostic(),
    }
}

/// Classify a failed query. Only the scheduler's own "no such job" answers
/// mean the job is gone; anything else (controller down, auth) is an error.
pub(crate) fn absent_or_failed(
    backend: BackendKind,
    program: &str,
    output: &CommandOutput,
    not_found: &[&str],
) -> Result<(), BackendError> {
    let said_absent = not_found
        .iter()
        .any(|marker| output.stderr.contains(marker) || output.stdout.contains(marker));
    if said_absent {
        Ok(())
    } else {
        Err(command_failed(backend, program, output))
    }
}

pub(crate) fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Integral instance variable, if set and positive
pub(crate) fn count_variable(instance: &ExperimentInstance, name: &str) -> Option<u64> {
    instance
        .variable(name)
        .and_then(Value::as_number)
        .filter(|n| *n >= 1.0)
        .map(|n| n as u64)
}

/// Non-empty string instance variable
pub(crate) fn text_variable(instance: &ExperimentInstance, name: &str) -> Option<String> {
    instance
        .variable(name)
        .map(Value::as_string)
        .filter(|s| !s.trim().is_empty())
}

/// Standard output/error file the scheduler writes into the run directory
pub(crate) fn output_path(instance: &ExperimentInstance) -> PathBuf {
    instance.run_dir.join(format!("{}.out", instance.name))
}

/// Existing files among the candidates
pub(crate) fn existing(paths: impl IntoIterator<Item = PathBuf>) -> Vec<PathBuf> {
    paths.into_iter().filter(|p| p.is_file()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::runner::tests::ScriptedRunner;

    #[test]
    fn test_backend_for_none_is_absent() {
        let runner: Arc<dyn CommandRunner> = Arc::new(ScriptedRunner::new());
        assert!(backend_for(BackendKind::None, runner.clone(), "/bin/sh").is_none());

        for kind in [
            BackendKind::Local,
            BackendKind::Slurm,
            BackendKind::Pbs,
            BackendKind::GoogleBatch,
        ] {
            let backend = backend_for(kind, runner.clone(), "/bin/sh").unwrap();
            assert_eq!(backend.kind(), kind);
        }
    }

    #[test]
    fn test_native_status_drops_placeholder_details() {
        let status = NativeStatus::new("R")
            .with_detail("nodes", "n[001-004]")
            .with_detail("end", "Unknown")
            .with_detail("start", "  ");
        assert_eq!(status.details.len(), 1);
        assert_eq!(status.details["nodes"], "n[001-004]");
    }

    #[tokio::test]
    async fn test_run_checked_reports_exit_code() {
        let runner = ScriptedRunner::new();
        runner.respond("qdel", "", 35);
        let err = run_checked(&runner, BackendKind::Pbs, "qdel", &args(["1"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::CommandFailed { ref code, .. } if code == "35"));
    }

    #[tokio::test]
    async fn test_spawn_failure_names_command() {
        let runner = ScriptedRunner::new();
        runner.fail("squeue", "permission denied");
        let err = run_command(&runner, BackendKind::Slurm, "squeue", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));
        assert!(err.to_string().contains("squeue"));
    }
}
