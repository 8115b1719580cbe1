// Local Backend
// Runs the execute script detached on this machine

use crate::experiment::ExperimentInstance;
use crate::utils::shell_quote;
use crate::workflow::backends::{
    existing, output_path, run_checked, run_command, BackendError, NativeStatus,
    SchedulerBackend, WaitStrategy,
};
use crate::workflow::record::JobRecord;
use crate::workflow::runner::CommandRunner;
use crate::workflow::status::{CanonicalStatus, StatusMap};
use crate::workflow::BackendKind;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const KIND: BackendKind = BackendKind::Local;

/// Written by the wrapper shell once the script exits
pub const EXIT_CODE_FILE: &str = "exit_code";

pub struct LocalBackend {
    runner: Arc<dyn CommandRunner>,
    /// Runs the detached wrapper and the script inside it
    shell: String,
    status_map: StatusMap,
}

impl LocalBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, shell: impl Into<String>) -> Self {
        Self {
            runner,
            shell: shell.into(),
            status_map: StatusMap::new(&[
                ("RUNNING", CanonicalStatus::Running),
                ("COMPLETED", CanonicalStatus::Complete),
                ("FAILED", CanonicalStatus::Failed),
            ]),
        }
    }

    fn exit_code_path(record: &JobRecord) -> Option<PathBuf> {
        record.metadata.get("exit_code_file").map(PathBuf::from)
    }

    async fn signal(&self, script: String) -> Result<bool, BackendError> {
        let output = run_command(
            self.runner.as_ref(),
            KIND,
            &self.shell,
            &["-c".to_string(), script],
            None,
        )
        .await?;
        Ok(output.success())
    }
}

fn pid(record: &JobRecord) -> Result<u32, BackendError> {
    record
        .job_id
        .parse()
        .map_err(|_| BackendError::Malformed {
            backend: KIND,
            command: "job record".to_string(),
            output: record.job_id.clone(),
        })
}

#[async_trait]
impl SchedulerBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn status_map(&self) -> &StatusMap {
        &self.status_map
    }

    fn wait_strategy(&self) -> WaitStrategy {
        WaitStrategy::Existence
    }

    async fn submit(
        &self,
        instance: &ExperimentInstance,
        script: &Path,
    ) -> Result<JobRecord, BackendError> {
        let state_dir = instance.state_dir();
        std::fs::create_dir_all(&state_dir).map_err(|source| BackendError::Io {
            backend: KIND,
            path: state_dir.clone(),
            source,
        })?;
        let exit_file = state_dir.join(EXIT_CODE_FILE);
        let output_file = output_path(instance);

        // The subshell outlives this call; its PID is the job id
        let wrapper = format!(
            "( {shell} {script} > {out} 2>&1; echo $? > {exit} ) > /dev/null 2>&1 & echo $!",
            shell = shell_quote(Path::new(&self.shell)),
            script = shell_quote(script),
            out = shell_quote(&output_file),
            exit = shell_quote(&exit_file),
        );
        let output = run_checked(
            self.runner.as_ref(),
            KIND,
            &self.shell,
            &["-c".to_string(), wrapper],
            Some(&instance.run_dir),
        )
        .await?;

        let job_id = output.stdout.trim();
        if job_id.parse::<u32>().is_err() {
            return Err(BackendError::Malformed {
                backend: KIND,
                command: self.shell.clone(),
                output: output.stdout.clone(),
            });
        }

        Ok(JobRecord::new(job_id, KIND, instance.job_name(), script)
            .with_metadata("exit_code_file", exit_file.display().to_string())
            .with_metadata("output", output_file.display().to_string()))
    }

    async fn query_active(
        &self,
        record: &JobRecord,
    ) -> Result<Option<NativeStatus>, BackendError> {
        let pid = pid(record)?;
        // An exited wrapper may linger as a zombie; the exit file is final
        if Self::exit_code_path(record).is_some_and(|p| p.is_file()) {
            return Ok(None);
        }
        let alive = self.signal(format!("kill -0 {}", pid)).await?;
        Ok(alive.then(|| NativeStatus::new("RUNNING")))
    }

    async fn query_history(
        &self,
        record: &JobRecord,
    ) -> Result<Option<NativeStatus>, BackendError> {
        let Some(path) = Self::exit_code_path(record) else {
            return Ok(None);
        };
        let code = match std::fs::read_to_string(&path) {
            Ok(code) => code.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(BackendError::Io {
                    backend: KIND,
                    path,
                    source,
                })
            }
        };

        let state = if code == "0" { "COMPLETED" } else { "FAILED" };
        Ok(Some(NativeStatus::new(state).with_detail("exit_code", &code)))
    }

    async fn cancel(&self, record: &JobRecord) -> Result<(), BackendError> {
        let pid = pid(record)?;
        let script = format!("pkill -TERM -P {pid} 2>/dev/null; kill -TERM {pid}", pid = pid);
        if self.signal(script).await? {
            Ok(())
        } else {
            Err(BackendError::CommandFailed {
                backend: KIND,
                command: "kill".to_string(),
                code: "1".to_string(),
                message: format!("process {} could not be signalled", pid),
            })
        }
    }

    async fn fetch_logs(
        &self,
        record: &JobRecord,
        _run_dir: &Path,
    ) -> Result<Vec<PathBuf>, BackendError> {
        Ok(existing(record.metadata.get("output").map(PathBuf::from)))
    }
}
