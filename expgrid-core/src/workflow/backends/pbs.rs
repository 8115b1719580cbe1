// PBS Backend
// qsub / qstat / qstat -x / qdel

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

const KIND: BackendKind = BackendKind::Pbs;

/// qstat's answers for purged ids, and for finished ids queried without `-x`
const QSTAT_NOT_FOUND: &[&str] = &["Unknown Job Id", "Job has finished"];

/// Single-letter states that mean the job has left the live queue
const FINISHED_STATES: [&str; 2] = ["F", "X"];

pub struct PbsBackend {
    runner: Arc<dyn CommandRunner>,
    status_map: StatusMap,
}

impl PbsBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        use CanonicalStatus::*;
        Self {
            runner,
            status_map: StatusMap::new(&[
                ("Q", Queued),
                ("H", Queued),
                ("W", Queued),
                ("T", Queued),
                ("S", Queued),
                ("R", Running),
                ("E", Running),
                ("B", Running),
                ("F", Complete),
                ("X", Complete),
            ]),
        }
    }

    /// `qstat -f` prints `key = value` attribute lines
    fn parse_full(stdout: &str) -> Option<NativeStatus> {
        let attribute = |name: &str| {
            stdout.lines().find_map(|line| {
                let (key, value) = line.split_once('=')?;
                (key.trim() == name).then(|| value.trim().to_string())
            })
        };

        let state = attribute("job_state")?;
        let mut status = NativeStatus::new(state);
        for (key, name) in [("nodes", "exec_host"), ("start", "stime"), ("end", "obittime")] {
            if let Some(value) = attribute(name) {
                status = status.with_detail(key, &value);
            }
        }
        if let Some(code) = attribute("Exit_status") {
            status = status.with_detail("exit_status", &code);
        }
        Some(status)
    }

    async fn qstat(
        &self,
        record: &JobRecord,
        history: bool,
    ) -> Result<Option<NativeStatus>, BackendError> {
        let mut qstat_args = Vec::new();
        if history {
            qstat_args.push("-x".to_string());
        }
        qstat_args.extend(args(["-f", record.job_id.as_str()]));

        let output =
            run_command(self.runner.as_ref(), KIND, "qstat", &qstat_args, None).await?;
        // Unknown and already-finished ids exit non-zero
        if !output.success() {
            absent_or_failed(KIND, "qstat", &output, QSTAT_NOT_FOUND)?;
            return Ok(None);
        }
        Ok(Self::parse_full(&output.stdout))
    }
}

#[async_trait]
impl SchedulerBackend for PbsBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn status_map(&self) -> &StatusMap {
        &self.status_map
    }

    fn wait_strategy(&self) -> WaitStrategy {
        WaitStrategy::Status
    }

    fn script_directives(&self, instance: &ExperimentInstance) -> Vec<String> {
        let mut directives = vec![
            format!("#PBS -N {}", instance.job_name()),
            format!("#PBS -o {}", output_path(instance).display()),
            "#PBS -j oe".to_string(),
        ];
        let nodes = count_variable(instance, "n_nodes").unwrap_or(1);
        match count_variable(instance, "processes_per_node") {
            Some(ppn) => directives.push(format!("#PBS -l nodes={}:ppn={}", nodes, ppn)),
            None => directives.push(format!("#PBS -l nodes={}", nodes)),
        }
        if let Some(queue) = text_variable(instance, "queue") {
            directives.push(format!("#PBS -q {}", queue));
        }
        if let Some(limit) = text_variable(instance, "time_limit") {
            directives.push(format!("#PBS -l walltime={}", limit));
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
            "qsub",
            &[script.display().to_string()],
            Some(&instance.run_dir),
        )
        .await?;

        let job_id = output.stdout.trim();
        if job_id.is_empty() || job_id.contains(char::is_whitespace) {
            return Err(BackendError::Malformed {
                backend: KIND,
                command: "qsub".to_string(),
                output: output.stdout.clone(),
            });
        }
        Ok(JobRecord::new(job_id, KIND, instance.job_name(), script)
            .with_metadata("output", output_path(instance).display().to_string()))
    }

    async fn query_active(
        &self,
        record: &JobRecord,
    ) -> Result<Option<NativeStatus>, BackendError> {
        Ok(self
            .qstat(record, false)
            .await?
            .filter(|status| !FINISHED_STATES.contains(&status.state.as_str())))
    }

    async fn query_history(
        &self,
        record: &JobRecord,
    ) -> Result<Option<NativeStatus>, BackendError> {
        self.qstat(record, true).await
    }

    async fn cancel(&self, record: &JobRecord) -> Result<(), BackendError> {
        run_checked(
            self.runner.as_ref(),
            KIND,
            "qdel",
            &args([record.job_id.as_str()]),
            None,
        )
        .await?;
        Ok(())
    }

    async fn fetch_logs(
        &self,
        record: &JobRecord,
        _run_dir: &Path,
    ) -> Result<Vec<PathBuf>, BackendError> {
        Ok(existing(record.metadata.get("output").map(PathBuf::from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::instance::tests::sample_instance;
    use crate::workflow::runner::tests::ScriptedRunner;

    const QSTAT_RUNNING: &str = "Job Id: 77.pbs01\n    Job_Name = hostname_local_a\n    job_state = R\n    exec_host = node01/0*4\n    stime = Thu Jan  1 10:00:00 2026\n";
    const QSTAT_FINISHED: &str = "Job Id: 77.pbs01\n    job_state = F\n    Exit_status = 0\n    obittime = Thu Jan  1 10:30:00 2026\n";

    fn record() -> JobRecord {
        JobRecord::new("77.pbs01", KIND, "hostname_local_a", "/run/execute.sh")
    }

    #[tokio::test]
    async fn test_submit_records_server_qualified_id() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("qsub", "77.pbs01\n", 0);
        let instance = sample_instance("a", Path::new("/ws"));

        let record = PbsBackend::new(runner.clone())
            .submit(&instance, Path::new("/run/execute.sh"))
            .await
            .unwrap();
        assert_eq!(record.job_id, "77.pbs01");
    }

    #[tokio::test]
    async fn test_query_active_parses_full_listing() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("qstat", QSTAT_RUNNING, 0);

        let native = PbsBackend::new(runner.clone())
            .query_active(&record())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(native.state, "R");
        assert_eq!(native.details["nodes"], "node01/0*4");
        assert_eq!(runner.calls()[0], vec!["qstat", "-f", "77.pbs01"]);
    }

    #[tokio::test]
    async fn test_finished_job_is_not_active_but_in_history() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond("qstat", QSTAT_FINISHED, 0)
            .respond("qstat", QSTAT_FINISHED, 0);
        let pbs = PbsBackend::new(runner.clone());

        assert!(pbs.query_active(&record()).await.unwrap().is_none());
        let history = pbs.query_history(&record()).await.unwrap().unwrap();
        assert_eq!(pbs.status_map().map(&history.state), Some(CanonicalStatus::Complete));
        assert_eq!(history.details["exit_status"], "0");
        assert_eq!(runner.calls()[1], vec!["qstat", "-x", "-f", "77.pbs01"]);
    }

    #[tokio::test]
    async fn test_unknown_job_is_absent() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond_stderr("qstat", "qstat: Unknown Job Id 77.pbs01", 153)
            .respond_stderr("qstat", "qstat: 77.pbs01 Job has finished, use -x or -H", 35);
        let pbs = PbsBackend::new(runner.clone());
        assert!(pbs.query_active(&record()).await.unwrap().is_none());
        assert!(pbs.query_active(&record()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_outage_is_an_error() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond_stderr("qstat", "Connection refused\nqstat: cannot connect to server pbs01 (errno=111)", 1)
            .respond_stderr("qstat", "qstat: cannot connect to server pbs01 (errno=111)", 1);
        let pbs = PbsBackend::new(runner.clone());

        let err = pbs.query_active(&record()).await.unwrap_err();
        assert!(matches!(err, BackendError::CommandFailed { .. }));
        assert!(err.to_string().contains("cannot connect to server"));
        assert!(pbs.query_history(&record()).await.is_err());
    }

    #[test]
    fn test_directives() {
        let runner = Arc::new(ScriptedRunner::new());
        let instance = sample_instance("a", Path::new("/ws"));
        let directives = PbsBackend::new(runner).script_directives(&instance);
        assert_eq!(directives[0], "#PBS -N hostname_local_a");
        assert!(directives.contains(&"#PBS -l nodes=1".to_string()));
    }
}
