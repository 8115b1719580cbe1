// Slurm Backend
// sbatch / squeue / sacct / scancel

use crate::experiment::ExperimentInstance;
use crate::workflow::backends::{
    absent_or_failed, args, count_variable, existing, output_path, run_checked, run_command,
    text_variable, BackendError, NativeStatus, SchedulerBackend, WaitStrategy,
};
use crate::workflow::record::JobRecord;
use crate::workflow::runner::CommandRunner;
use crate::workflow::status::{CanonicalStatus, StatusMap};
use crate::workflow::BackendKind;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const KIND: BackendKind = BackendKind::Slurm;

/// squeue's answer for ids it no longer knows
const SQUEUE_NOT_FOUND: &[&str] = &["Invalid job id specified"];

pub struct SlurmBackend {
    runner: Arc<dyn CommandRunner>,
    status_map: StatusMap,
}

impl SlurmBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        use CanonicalStatus::*;
        Self {
            runner,
            status_map: StatusMap::new(&[
                ("PD", Queued),
                ("CF", Queued),
                ("PENDING", Queued),
                ("R", Running),
                ("CG", Running),
                ("RUNNING", Running),
                ("COMPLETING", Running),
                ("COMPLETED", Complete),
                ("CD", Complete),
                ("FAILED", Failed),
                ("F", Failed),
                ("TIMEOUT", Failed),
                ("TO", Failed),
                ("CANCELLED", Failed),
                ("CA", Failed),
                ("NODE_FAIL", Failed),
                ("NF", Failed),
                ("OUT_OF_MEMORY", Failed),
                ("OOM", Failed),
            ]),
        }
    }

    /// First `|`-separated line of parsable output
    fn parse_line(stdout: &str, keys: &[&str]) -> Option<NativeStatus> {
        let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
        let mut fields = line.split('|');
        let state = fields.next()?.trim();
        if state.is_empty() {
            return None;
        }
        let mut status = NativeStatus::new(state);
        for (key, value) in keys.iter().zip(fields) {
            status = status.with_detail(key, value);
        }
        Some(status)
    }
}

#[async_trait]
impl SchedulerBackend for SlurmBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn status_map(&self) -> &StatusMap {
        &self.status_map
    }

    fn wait_strategy(&self) -> WaitStrategy {
        WaitStrategy::Existence
    }

    fn script_directives(&self, instance: &ExperimentInstance) -> Vec<String> {
        let mut directives = vec![
            format!("#SBATCH --job-name={}", instance.job_name()),
            format!("#SBATCH --output={}", output_path(instance).display()),
        ];
        if let Some(nodes) = count_variable(instance, "n_nodes") {
            directives.push(format!("#SBATCH --nodes={}", nodes));
        }
        if let Some(ppn) = count_variable(instance, "processes_per_node") {
            directives.push(format!("#SBATCH --ntasks-per-node={}", ppn));
        }
        if let Some(partition) = text_variable(instance, "partition") {
            directives.push(format!("#SBATCH --partition={}", partition));
        }
        if let Some(limit) = text_variable(instance, "time_limit") {
            directives.push(format!("#SBATCH --time={}", limit));
        }
        directives
    }

    async fn submit(
        &self,
        instance: &ExperimentInstance,
        script: &Path,
    ) -> Result<JobRecord, BackendError> {
        let output = run_checked(
            self.runner.as_ref(),
            KIND,
            "sbatch",
            &[
                "--parsable".to_string(),
                script.display().to_string(),
            ],
            Some(&instance.run_dir),
        )
        .await?;

        // `<id>` or `<id>;<cluster>`
        let line = output.stdout.lines().last().unwrap_or("").trim();
        let mut parts = line.split(';');
        let job_id = parts.next().unwrap_or("").trim();
        if job_id.is_empty() || !job_id.chars().all(|c| c.is_ascii_digit() || c == '_') {
            return Err(BackendError::Malformed {
                backend: KIND,
                command: "sbatch".to_string(),
                output: output.stdout,
            });
        }

        let mut record = JobRecord::new(job_id, KIND, instance.job_name(), script)
            .with_metadata("output", output_path(instance).display().to_string());
        if let Some(cluster) = parts.next().map(str::trim).filter(|c| !c.is_empty()) {
            record = record.with_metadata("cluster", cluster);
        }
        Ok(record)
    }

    async fn query_active(
        &self,
        record: &JobRecord,
    ) -> Result<Option<NativeStatus>, BackendError> {
        let output = run_command(
            self.runner.as_ref(),
            KIND,
            "squeue",
            &args(["-h", "-o", "%t|%N|%S", "-j", record.job_id.as_str()]),
            None,
        )
        .await?;

        // squeue exits non-zero for ids it has already purged
        if !output.success() {
            absent_or_failed(KIND, "squeue", &output, SQUEUE_NOT_FOUND)?;
            return Ok(None);
        }
        Ok(Self::parse_line(&output.stdout, &["nodes", "start"]))
    }

    async fn query_history(
        &self,
        record: &JobRecord,
    ) -> Result<Option<NativeStatus>, BackendError> {
        let output = run_checked(
            self.runner.as_ref(),
            KIND,
            "sacct",
            &args([
                "-o",
                "state,nodelist,start,end",
                "-X",
                "-n",
                "-P",
                "-j",
                record.job_id.as_str(),
            ]),
            None,
        )
        .await?;
        Ok(Self::parse_line(&output.stdout, &["nodes", "start", "end"]))
    }

    async fn cancel(&self, record: &JobRecord) -> Result<(), BackendError> {
        run_checked(
            self.runner.as_ref(),
            KIND,
            "scancel",
            &args([record.job_id.as_str()]),
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
        // Slurm writes output straight into the run directory
        let mut candidates: Vec<PathBuf> = record
            .metadata
            .get("output")
            .map(PathBuf::from)
            .into_iter()
            .collect();
        candidates.push(run_dir.join(format!("slurm-{}.out", record.job_id)));
        Ok(existing(candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::instance::tests::sample_instance;
    use crate::workflow::runner::tests::ScriptedRunner;
    use crate::workflow::status::StatusReport;

    fn backend(runner: &Arc<ScriptedRunner>) -> SlurmBackend {
        SlurmBackend::new(runner.clone())
    }

    fn record() -> JobRecord {
        JobRecord::new("4242", KIND, "hostname_local_a", "/run/execute.sh")
    }

    #[tokio::test]
    async fn test_submit_parses_parsable_output() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("sbatch", "4242;cluster1\n", 0);
        let instance = sample_instance("a", Path::new("/ws"));

        let record = backend(&runner)
            .submit(&instance, Path::new("/run/execute.sh"))
            .await
            .unwrap();
        assert_eq!(record.job_id, "4242");
        assert_eq!(record.metadata["cluster"], "cluster1");
        assert_eq!(
            runner.calls()[0],
            vec!["sbatch", "--parsable", "/run/execute.sh"]
        );
    }

    #[tokio::test]
    async fn test_submit_rejects_garbage() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("sbatch", "sbatch: error: Batch job submission failed", 0);
        let instance = sample_instance("a", Path::new("/ws"));

        let err = backend(&runner)
            .submit(&instance, Path::new("/run/execute.sh"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_query_active_maps_state() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("squeue", "R|nid001|2026-01-01T10:00:00\n", 0);
        let slurm = backend(&runner);

        let native = slurm.query_active(&record()).await.unwrap().unwrap();
        assert_eq!(native.state, "R");
        assert_eq!(native.details["nodes"], "nid001");
        let report = StatusReport::from_native(slurm.status_map(), &native.state);
        assert_eq!(report.status, CanonicalStatus::Running);
    }

    #[tokio::test]
    async fn test_purged_job_is_not_active() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond_stderr("squeue", "slurm_load_jobs error: Invalid job id specified", 1)
            .respond("squeue", "", 0);
        let slurm = backend(&runner);

        assert!(slurm.query_active(&record()).await.unwrap().is_none());
        assert!(!slurm.is_active(&record()).await.unwrap());
    }

    #[tokio::test]
    async fn test_controller_outage_is_an_error() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond_stderr(
                "squeue",
                "slurm_load_jobs error: Unable to contact slurm controller (connect failure)",
                1,
            )
            .respond_stderr("squeue", "slurm_load_jobs error: Socket timed out", 1);
        let slurm = backend(&runner);

        let err = slurm.query_active(&record()).await.unwrap_err();
        assert!(matches!(err, BackendError::CommandFailed { .. }));
        assert!(err.to_string().contains("Unable to contact slurm controller"));
        assert!(slurm.is_active(&record()).await.is_err());
    }

    #[tokio::test]
    async fn test_history_handles_cancelled_by_user() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("sacct", "CANCELLED by 1000|nid002|2026-01-01T10:00:00|2026-01-01T10:05:00\n", 0);
        let slurm = backend(&runner);

        let native = slurm.query_history(&record()).await.unwrap().unwrap();
        let report = StatusReport::from_native(slurm.status_map(), &native.state);
        assert_eq!(report.status, CanonicalStatus::Failed);
        assert_eq!(native.details["end"], "2026-01-01T10:05:00");
    }

    #[test]
    fn test_directives_follow_instance_variables() {
        let runner = Arc::new(ScriptedRunner::new());
        let instance = sample_instance("a", Path::new("/ws"));
        let directives = backend(&runner).script_directives(&instance);
        assert!(directives.contains(&"#SBATCH --job-name=hostname_local_a".to_string()));
        assert!(directives.contains(&"#SBATCH --nodes=1".to_string()));
    }
}
