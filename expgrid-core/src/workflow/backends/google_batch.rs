// Google Batch Backend
// gcloud batch jobs submit / describe / delete and gcloud logging read

use crate::experiment::ExperimentInstance;
use crate::utils::atomic_write;
use crate::workflow::backends::{
    args, count_variable, run_checked, run_command, text_variable, BackendError, NativeStatus,
    SchedulerBackend, WaitStrategy,
};
use crate::workflow::record::JobRecord;
use crate::workflow::runner::CommandRunner;
use crate::workflow::status::{CanonicalStatus, StatusMap};
use crate::workflow::BackendKind;

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const KIND: BackendKind = BackendKind::GoogleBatch;

pub const DEFAULT_LOCATION: &str = "us-central1";

/// States in which the job still occupies the service
const ACTIVE_STATES: [&str; 3] = ["QUEUED", "SCHEDULED", "RUNNING"];

pub struct GoogleBatchBackend {
    runner: Arc<dyn CommandRunner>,
    status_map: StatusMap,
}

impl GoogleBatchBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        use CanonicalStatus::*;
        Self {
            runner,
            status_map: StatusMap::new(&[
                ("QUEUED", Queued),
                ("SCHEDULED", Queued),
                ("RUNNING", Running),
                ("SUCCEEDED", Complete),
                ("FAILED", Failed),
                ("DELETION_IN_PROGRESS", Failed),
                ("STATE_UNSPECIFIED", Unresolved),
                ("UNQUEUED", Unqueued),
                ("UNRESOLVED", Unresolved),
            ]),
        }
    }

    fn location(record: &JobRecord) -> String {
        record
            .metadata
            .get("location")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOCATION.to_string())
    }

    /// Batch job ids: lowercase letters, digits and hyphens, at most 63 chars
    fn job_id(instance: &ExperimentInstance) -> String {
        let mut id: String = instance
            .job_name()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        if !id.starts_with(|c: char| c.is_ascii_lowercase()) {
            id.insert(0, 'j');
        }
        let suffix = Utc::now().format("-%Y%m%d%H%M%S").to_string();
        id.truncate(63 - suffix.len());
        let mut id = id.trim_end_matches('-').to_string();
        id.push_str(&suffix);
        id
    }

    /// Job config: one task running the execute script
    fn job_config(instance: &ExperimentInstance, script: &str) -> serde_json::Value {
        let task_count = count_variable(instance, "n_nodes").unwrap_or(1);
        let mut config = serde_json::json!({
            "taskGroups": [{
                "taskCount": task_count,
                "taskSpec": {
                    "runnables": [{ "script": { "text": script } }]
                }
            }],
            "logsPolicy": { "destination": "CLOUD_LOGGING" }
        });
        if let Some(machine) = text_variable(instance, "machine_type") {
            config["allocationPolicy"] =
                serde_json::json!({ "instances": [{ "policy": { "machineType": machine } }] });
        }
        config
    }

    async fn describe(&self, record: &JobRecord) -> Result<Option<NativeStatus>, BackendError> {
        let location = Self::location(record);
        let output = run_command(
            self.runner.as_ref(),
            KIND,
            "gcloud",
            &args([
                "batch",
                "jobs",
                "describe",
                record.job_id.as_str(),
                "--location",
                location.as_str(),
                "--format=value(status.state)",
            ]),
            None,
        )
        .await?;

        if !output.success() {
            if output.stderr.contains("NOT_FOUND") {
                return Ok(None);
            }
            return Err(BackendError::CommandFailed {
                backend: KIND,
                command: "gcloud batch jobs describe".to_string(),
                code: output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                message: output.diagnostic(),
            });
        }

        let state = output.stdout.trim();
        Ok((!state.is_empty()).then(|| NativeStatus::new(state)))
    }
}

#[async_trait]
impl SchedulerBackend for GoogleBatchBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn status_map(&self) -> &StatusMap {
        &self.status_map
    }

    fn wait_strategy(&self) -> WaitStrategy {
        WaitStrategy::Status
    }

    async fn submit(
        &self,
        instance: &ExperimentInstance,
        script: &Path,
    ) -> Result<JobRecord, BackendError> {
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| BackendError::Io {
                backend: KIND,
                path,
                source,
            }
        };

        let text = std::fs::read_to_string(script).map_err(io_error(script))?;
        let config_path = instance.state_dir().join("batch_job.json");
        let config = serde_json::to_vec_pretty(&Self::job_config(instance, &text))
            .map_err(|e| BackendError::Io {
                backend: KIND,
                path: config_path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })?;
        atomic_write(&config_path, &config).map_err(io_error(&config_path))?;

        let job_id = Self::job_id(instance);
        let location =
            text_variable(instance, "batch_location").unwrap_or_else(|| DEFAULT_LOCATION.to_string());
        let config_arg = config_path.display().to_string();
        let output = run_checked(
            self.runner.as_ref(),
            KIND,
            "gcloud",
            &args([
                "batch",
                "jobs",
                "submit",
                job_id.as_str(),
                "--location",
                location.as_str(),
                "--config",
                config_arg.as_str(),
                "--format=value(uid)",
            ]),
            Some(&instance.run_dir),
        )
        .await?;

        let mut record = JobRecord::new(job_id, KIND, instance.job_name(), script)
            .with_metadata("location", location);
        let uid = output.stdout.trim();
        if !uid.is_empty() {
            record = record.with_metadata("uid", uid);
        }
        Ok(record)
    }

    async fn query_active(
        &self,
        record: &JobRecord,
    ) -> Result<Option<NativeStatus>, BackendError> {
        Ok(self
            .describe(record)
            .await?
            .filter(|status| ACTIVE_STATES.contains(&status.state.as_str())))
    }

    async fn query_history(
        &self,
        record: &JobRecord,
    ) -> Result<Option<NativeStatus>, BackendError> {
        self.describe(record).await
    }

    async fn cancel(&self, record: &JobRecord) -> Result<(), BackendError> {
        let location = Self::location(record);
        run_checked(
            self.runner.as_ref(),
            KIND,
            "gcloud",
            &args([
                "batch",
                "jobs",
                "delete",
                record.job_id.as_str(),
                "--location",
                location.as_str(),
                "--quiet",
            ]),
            None,
        )
        .await?;
        Ok(())
    }

    async fn fetch_logs(
        &self,
        record: &JobRecord,
        run_dir: &Path,
    ) -> Result<Vec<PathBuf>, BackendError> {
        let filter = match record.metadata.get("uid") {
            Some(uid) => format!("labels.job_uid=\"{}\"", uid),
            None => format!("labels.job_id=\"{}\"", record.job_id),
        };
        let output = run_checked(
            self.runner.as_ref(),
            KIND,
            "gcloud",
            &args([
                "logging",
                "read",
                filter.as_str(),
                "--order=asc",
                "--format=value(textPayload)",
            ]),
            None,
        )
        .await?;

        let path = run_dir.join(format!("{}.log", record.job_id));
        atomic_write(&path, output.stdout.as_bytes()).map_err(|source| BackendError::Io {
            backend: KIND,
            path: path.clone(),
            source,
        })?;
        Ok(vec![path])
    }
}
