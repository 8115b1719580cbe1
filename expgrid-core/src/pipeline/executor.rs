// Pipeline Executor
// Runs a validated phase list over many instances with bounded parallelism

use crate::config::{InsertDirective, PhaseOverride};
use crate::experiment::ExperimentInstance;
use crate::pipeline::events::{EventSender, PhaseStatus, PipelineEvent, ProgressSender};
use crate::pipeline::order::{PhaseOrderError, PhaseRegistry, PhaseSelection};
use crate::pipeline::phase::{
    is_complete, mark_complete, marker_path, Phase, PhaseContext, PhaseError, PhaseServices,
    PipelineKind,
};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Result of one phase for one instance
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: String,
    pub status: PhaseStatus,
    pub duration: Duration,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceOutcome {
    Completed,
    /// The named phase failed; later phases did not run
    Failed { phase: String, error: String },
}

/// Everything that happened to one instance
#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub experiment: String,
    pub phases: Vec<PhaseReport>,
    pub outcome: InstanceOutcome,
    pub duration: Duration,
}

impl InstanceReport {
    pub fn success(&self) -> bool {
        self.outcome == InstanceOutcome::Completed
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == name)
    }
}

/// Result of a pipeline run, in instance order
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub pipeline: PipelineKind,
    pub dry_run: bool,
    pub phases: Vec<String>,
    pub instances: Vec<InstanceReport>,
    pub duration: Duration,
}

impl PipelineReport {
    pub fn succeeded(&self) -> usize {
        self.instances.iter().filter(|i| i.success()).count()
    }

    pub fn failed(&self) -> usize {
        self.instances.len() - self.succeeded()
    }

    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    pub fn instance(&self, experiment: &str) -> Option<&InstanceReport> {
        self.instances.iter().find(|i| i.experiment == experiment)
    }
}

/// Configuration for a pipeline run
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Instances processed concurrently (at least 1)
    pub max_parallel: usize,
    /// Render only; withhold provisioning, submission and destructive phases
    pub dry_run: bool,
    /// Ignore completion markers
    pub force: bool,
    pub selection: PhaseSelection,
    /// Applied after the workspace's own insert directives
    pub extra_inserts: Vec<InsertDirective>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            dry_run: false,
            force: false,
            selection: PhaseSelection::all(),
            extra_inserts: Vec::new(),
        }
    }
}

pub struct PipelineExecutor {
    registry: Arc<PhaseRegistry>,
    services: Arc<PhaseServices>,
    /// Workspace `phases:` block, keyed by pipeline name
    overrides: BTreeMap<String, PhaseOverride>,
    config: ExecutorConfig,
    event_tx: Option<ProgressSender>,
}

impl PipelineExecutor {
    pub fn new(registry: Arc<PhaseRegistry>, services: Arc<PhaseServices>) -> Self {
        Self {
            registry,
            services,
            overrides: BTreeMap::new(),
            config: ExecutorConfig::default(),
            event_tx: None,
        }
    }

    pub fn with_overrides(mut self, overrides: BTreeMap<String, PhaseOverride>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Effective phase list for `pipeline`
    pub fn plan(&self, pipeline: PipelineKind) -> Result<Vec<Arc<dyn Phase>>, PhaseOrderError> {
        self.registry.plan(
            pipeline,
            self.overrides.get(pipeline.as_str()),
            &self.config.extra_inserts,
            &self.config.selection,
        )
    }

    /// Validate the order, then run every instance through it. An order
    /// violation is returned before any phase starts; phase failures are
    /// recorded per instance.
    pub async fn execute(
        &self,
        pipeline: PipelineKind,
        instances: &[Arc<ExperimentInstance>],
    ) -> Result<PipelineReport, PhaseOrderError> {
        let phases = Arc::new(self.plan(pipeline)?);
        let phase_names: Vec<String> = phases.iter().map(|p| p.name().to_string()).collect();
        let start = Instant::now();

        self.event_tx.send_event(PipelineEvent::pipeline_started(
            pipeline,
            phase_names.clone(),
            instances.len(),
            self.config.dry_run,
        ));

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut handles = Vec::with_capacity(instances.len());

        for instance in instances {
            let run = InstanceRun {
                instance: Arc::clone(instance),
                phases: Arc::clone(&phases),
                services: Arc::clone(&self.services),
                pipeline,
                dry_run: self.config.dry_run,
                force: self.config.force,
                event_tx: self.event_tx.clone(),
            };
            let semaphore = Arc::clone(&semaphore);

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                run.execute().await
            }));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (handle, instance) in handles.into_iter().zip(instances) {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => InstanceReport {
                    experiment: instance.namespace(),
                    phases: Vec::new(),
                    outcome: InstanceOutcome::Failed {
                        phase: String::new(),
                        error: format!("instance task failed: {}", e),
                    },
                    duration: Duration::ZERO,
                },
            };
            reports.push(report);
        }

        let report = PipelineReport {
            pipeline,
            dry_run: self.config.dry_run,
            phases: phase_names,
            instances: reports,
            duration: start.elapsed(),
        };

        self.event_tx.send_event(PipelineEvent::pipeline_completed(
            pipeline,
            report.succeeded(),
            report.failed(),
            report.duration,
        ));

        Ok(report)
    }
}

/// One instance's sequential walk through the phase list
struct InstanceRun {
    instance: Arc<ExperimentInstance>,
    phases: Arc<Vec<Arc<dyn Phase>>>,
    services: Arc<PhaseServices>,
    pipeline: PipelineKind,
    dry_run: bool,
    force: bool,
    event_tx: Option<ProgressSender>,
}

impl InstanceRun {
    async fn execute(self) -> InstanceReport {
        let experiment = self.instance.namespace();
        let start = Instant::now();
        self.event_tx
            .send_event(PipelineEvent::instance_started(&experiment));

        let ctx = PhaseContext {
            instance: &self.instance,
            pipeline: self.pipeline,
            dry_run: self.dry_run,
            force: self.force,
            services: &self.services,
        };

        let mut phases = Vec::with_capacity(self.phases.len());
        let mut suppressed: HashSet<&str> = HashSet::new();
        let mut outcome = InstanceOutcome::Completed;

        for phase in self.phases.iter() {
            let name = phase.name();
            let phase_start = Instant::now();

            // Dependents of a withheld phase are withheld too
            let withheld = phase.kind().has_external_effects()
                || phase
                    .depends_on()
                    .iter()
                    .any(|d| suppressed.contains(d.as_str()));
            if self.dry_run && withheld {
                suppressed.insert(name);
                phases.push(self.finish(name, PhaseStatus::Suppressed, phase_start, None));
                continue;
            }

            if !self.force && !phase.repeatable() && is_complete(&self.instance, self.pipeline, name)
            {
                debug!(experiment = %experiment, phase = name, "already complete");
                phases.push(self.finish(name, PhaseStatus::Skipped, phase_start, None));
                continue;
            }

            self.event_tx
                .send_event(PipelineEvent::phase_started(&experiment, name));

            let result = match phase.run(&ctx).await {
                Ok(detail) if self.dry_run => Ok(detail),
                Ok(detail) => mark_complete(&self.instance, self.pipeline, name)
                    .map(|_| detail)
                    .map_err(|source| PhaseError::Io {
                        experiment: experiment.clone(),
                        path: marker_path(&self.instance, self.pipeline, name),
                        source,
                    }),
                Err(e) => Err(e),
            };

            match result {
                Ok(detail) => {
                    phases.push(self.finish(name, PhaseStatus::Ran, phase_start, detail));
                }
                Err(e) => {
                    warn!(experiment = %experiment, phase = name, error = %e, "phase failed");
                    let duration = phase_start.elapsed();
                    self.event_tx.send_event(PipelineEvent::phase_failed(
                        &experiment,
                        name,
                        e.to_string(),
                        duration,
                    ));
                    phases.push(PhaseReport {
                        phase: name.to_string(),
                        status: PhaseStatus::Failed,
                        duration,
                        detail: Some(e.to_string()),
                    });
                    outcome = InstanceOutcome::Failed {
                        phase: name.to_string(),
                        error: e.to_string(),
                    };
                    break;
                }
            }
        }

        let duration = start.elapsed();
        self.event_tx.send_event(PipelineEvent::instance_completed(
            &experiment,
            outcome == InstanceOutcome::Completed,
            duration,
        ));

        InstanceReport {
            experiment,
            phases,
            outcome,
            duration,
        }
    }

    fn finish(
        &self,
        phase: &str,
        status: PhaseStatus,
        started: Instant,
        detail: Option<String>,
    ) -> PhaseReport {
        let duration = started.elapsed();
        self.event_tx.send_event(PipelineEvent::phase_finished(
            self.instance.namespace(),
            phase,
            status,
            duration,
            detail.clone(),
        ));
        PhaseReport {
            phase: phase.to_string(),
            status,
            duration,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::experiment::instance::tests::sample_instance;
    use crate::experiment::MANIFEST_FILE;
    use crate::pipeline::builtin::*;
    use crate::pipeline::events::progress_channel;
    use crate::pipeline::order::{wait_after_submit, PhaseOrderErrorKind};
    use crate::pipeline::phase::PhaseKind;
    use crate::variables::Value;
    use crate::workflow::manager::tests::{FakeBackend, Live};
    use crate::workflow::{BackendKind, JobRecord, WaitOptions, WaitStrategy, WorkflowManager};

    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WORKSPACE: &str = r#"
workspace:
  custom_phases:
    check_nodes:
      pipeline: setup
      command: "test {n_nodes} -eq 1 || { echo too many nodes >&2; exit 3; }"
      depends_on: [make_experiments]
  phases:
    setup:
      insert:
        - { phase: check_nodes, after: make_experiments }
"#;

    struct Fixture {
        _temp: tempfile::TempDir,
        root: std::path::PathBuf,
        config: WorkspaceConfig,
    }

    fn fixture(yaml: &str) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_path_buf();
        let config = WorkspaceConfig::parse(&root, yaml).unwrap();
        Fixture {
            _temp: temp,
            root,
            config,
        }
    }

    fn executor(fixture: &Fixture, services: PhaseServices) -> PipelineExecutor {
        let registry = PhaseRegistry::from_config(&fixture.config).unwrap();
        PipelineExecutor::new(Arc::new(registry), Arc::new(services))
            .with_overrides(fixture.config.workspace().phases.clone())
    }

    fn instance(root: &Path, name: &str, nodes: f64) -> Arc<ExperimentInstance> {
        let mut instance = sample_instance(name, &root.join("experiments"));
        instance
            .variables
            .insert("n_nodes".to_string(), Value::Number(nodes));
        instance.workflow_manager = BackendKind::Local;
        Arc::new(instance)
    }

    fn statuses(report: &InstanceReport) -> Vec<(String, PhaseStatus)> {
        report
            .phases
            .iter()
            .map(|p| (p.phase.clone(), p.status))
            .collect()
    }

    fn fake_services(fixture: &Fixture, backend: FakeBackend) -> (PhaseServices, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        let services = PhaseServices::new(&fixture.config)
            .with_manager(WorkflowManager::new(backend.clone()))
            .with_wait(WaitOptions {
                interval: Duration::from_millis(10),
                timeout: Some(Duration::from_secs(5)),
            });
        (services, backend)
    }

    #[tokio::test]
    async fn test_setup_renders_and_marks_phases() {
        let fixture = fixture(WORKSPACE);
        let (services, _) = fake_services(&fixture, FakeBackend::new(WaitStrategy::Existence, vec![]));
        let executor = executor(&fixture, services);
        let a = instance(&fixture.root, "a", 1.0);

        let report = executor
            .execute(PipelineKind::Setup, &[a.clone()])
            .await
            .unwrap();
        assert!(report.success());
        assert_eq!(
            report.phases,
            vec![SOFTWARE_INSTALL, MAKE_EXPERIMENTS, "check_nodes", WRITE_INVENTORY, WRITE_STATUS]
        );

        assert!(a.run_dir.join(MANIFEST_FILE).is_file());
        let script = std::fs::read_to_string(a.script_path()).unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("\nhostname\n"));
        assert!(a.state_dir().join(INVENTORY_FILE).is_file());
        let status = std::fs::read_to_string(a.state_dir().join(EXPERIMENT_STATUS_FILE)).unwrap();
        assert!(status.contains("setup.make_experiments"));
        assert!(is_complete(&a, PipelineKind::Setup, "check_nodes"));
    }

    #[tokio::test]
    async fn test_rerun_skips_completed_phases() {
        let fixture = fixture(WORKSPACE);
        let (services, _) = fake_services(&fixture, FakeBackend::new(WaitStrategy::Existence, vec![]));
        let executor = executor(&fixture, services);
        let a = instance(&fixture.root, "a", 1.0);

        executor.execute(PipelineKind::Setup, &[a.clone()]).await.unwrap();
        let manifest = a.manifest_path();
        let before = std::fs::metadata(&manifest).unwrap().modified().unwrap();

        let report = executor.execute(PipelineKind::Setup, &[a.clone()]).await.unwrap();
        assert!(report.instances[0]
            .phases
            .iter()
            .all(|p| p.status == PhaseStatus::Skipped));
        assert_eq!(std::fs::metadata(&manifest).unwrap().modified().unwrap(), before);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_instance() {
        let fixture = fixture(WORKSPACE);
        let (services, _) = fake_services(&fixture, FakeBackend::new(WaitStrategy::Existence, vec![]));
        let executor = executor(&fixture, services);
        let good = instance(&fixture.root, "good", 1.0);
        let bad = instance(&fixture.root, "bad", 4.0);

        let report = executor
            .execute(PipelineKind::Setup, &[bad.clone(), good.clone()])
            .await
            .unwrap();

        assert_eq!(report.succeeded(), 1);
        let failed = report.instance(&bad.namespace()).unwrap();
        match &failed.outcome {
            InstanceOutcome::Failed { phase, error } => {
                assert_eq!(phase, "check_nodes");
                assert!(error.contains("too many nodes"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(failed.phase(WRITE_INVENTORY).is_none());
        assert!(!is_complete(&bad, PipelineKind::Setup, "check_nodes"));
        assert!(is_complete(&bad, PipelineKind::Setup, MAKE_EXPERIMENTS));
        assert!(report.instance(&good.namespace()).unwrap().success());
    }

    #[tokio::test]
    async fn test_dry_run_suppresses_provisioning_and_leaves_no_markers() {
        let fixture = fixture(WORKSPACE);
        let (services, _) = fake_services(&fixture, FakeBackend::new(WaitStrategy::Existence, vec![]));
        let executor = executor(&fixture, services).with_config(ExecutorConfig {
            dry_run: true,
            ..Default::default()
        });
        let a = instance(&fixture.root, "a", 1.0);

        let report = executor.execute(PipelineKind::Setup, &[a.clone()]).await.unwrap();
        let instance_report = &report.instances[0];
        assert_eq!(
            instance_report.phase(SOFTWARE_INSTALL).unwrap().status,
            PhaseStatus::Suppressed
        );
        assert_eq!(
            instance_report.phase(MAKE_EXPERIMENTS).unwrap().status,
            PhaseStatus::Ran
        );
        assert!(a.script_path().is_file());
        assert!(!is_complete(&a, PipelineKind::Setup, MAKE_EXPERIMENTS));
    }

    #[tokio::test]
    async fn test_changed_instance_is_not_overwritten_without_force() {
        let fixture = fixture("workspace: {}\n");
        let (services, _) = fake_services(&fixture, FakeBackend::new(WaitStrategy::Existence, vec![]));
        let executor = executor(&fixture, services);
        let original = instance(&fixture.root, "a", 1.0);
        executor.execute(PipelineKind::Setup, &[original]).await.unwrap();

        let mut changed = (*instance(&fixture.root, "a", 1.0)).clone();
        changed.commands = vec!["uname -a".to_string()];
        let changed = Arc::new(changed);

        std::fs::remove_file(marker_path(&changed, PipelineKind::Setup, MAKE_EXPERIMENTS)).unwrap();
        let report = executor.execute(PipelineKind::Setup, &[changed.clone()]).await.unwrap();
        assert!(matches!(
            &report.instances[0].outcome,
            InstanceOutcome::Failed { phase, error }
                if phase == MAKE_EXPERIMENTS && error.contains("--force")
        ));

        let executor = executor.with_config(ExecutorConfig {
            force: true,
            ..Default::default()
        });
        let report = executor.execute(PipelineKind::Setup, &[changed.clone()]).await.unwrap();
        assert!(report.success());
        let script = std::fs::read_to_string(changed.script_path()).unwrap();
        assert!(script.contains("uname -a"));
    }

    #[tokio::test]
    async fn test_submit_requires_setup() {
        let fixture = fixture("workspace: {}\n");
        let (services, backend) =
            fake_services(&fixture, FakeBackend::new(WaitStrategy::Existence, vec![Live::Gone]));
        let executor = executor(&fixture, services);
        let a = instance(&fixture.root, "a", 1.0);

        let report = executor.execute(PipelineKind::Execute, &[a.clone()]).await.unwrap();
        assert!(matches!(
            &report.instances[0].outcome,
            InstanceOutcome::Failed { phase, error } if phase == SUBMIT && error.contains("not set up")
        ));
        assert_eq!(backend.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_submit_without_workflow_manager() {
        let fixture = fixture("workspace: {}\n");
        let (services, _) = fake_services(&fixture, FakeBackend::new(WaitStrategy::Existence, vec![]));
        let executor = executor(&fixture, services);
        let mut none = (*instance(&fixture.root, "a", 1.0)).clone();
        none.workflow_manager = BackendKind::None;

        let report = executor
            .execute(PipelineKind::Execute, &[Arc::new(none)])
            .await
            .unwrap();
        assert!(matches!(
            &report.instances[0].outcome,
            InstanceOutcome::Failed { error, .. } if error.contains("no workflow manager")
        ));
    }

    #[tokio::test]
    async fn test_setup_then_execute_with_wait() {
        let fixture = fixture("workspace: {}\n");
        let (services, backend) =
            fake_services(&fixture, FakeBackend::new(WaitStrategy::Existence, vec![Live::Gone]));
        let executor = executor(&fixture, services);
        let a = instance(&fixture.root, "a", 1.0);
        executor.execute(PipelineKind::Setup, &[a.clone()]).await.unwrap();

        let execute = executor.with_config(ExecutorConfig {
            extra_inserts: vec![wait_after_submit()],
            ..Default::default()
        });
        let report = execute.execute(PipelineKind::Execute, &[a.clone()]).await.unwrap();
        assert!(report.success(), "{:?}", report.instances[0].outcome);
        assert_eq!(report.phases, vec![SUBMIT, WAIT]);
        assert_eq!(backend.submits.load(Ordering::SeqCst), 1);
        assert!(JobRecord::load(&a.state_dir()).unwrap().is_some());

        // submit is marked; wait is repeatable
        let report = execute.execute(PipelineKind::Execute, &[a.clone()]).await.unwrap();
        let statuses = statuses(&report.instances[0]);
        assert_eq!(statuses[0], (SUBMIT.to_string(), PhaseStatus::Skipped));
        assert_eq!(statuses[1], (WAIT.to_string(), PhaseStatus::Ran));
        assert_eq!(backend.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dry_run_execute_withholds_submit_and_its_dependents() {
        let fixture = fixture("workspace: {}\n");
        let (services, backend) =
            fake_services(&fixture, FakeBackend::new(WaitStrategy::Existence, vec![Live::Gone]));
        let executor = executor(&fixture, services).with_config(ExecutorConfig {
            dry_run: true,
            extra_inserts: vec![wait_after_submit()],
            ..Default::default()
        });
        let a = instance(&fixture.root, "a", 1.0);

        let report = executor.execute(PipelineKind::Execute, &[a]).await.unwrap();
        assert!(report.success());
        assert!(report.instances[0]
            .phases
            .iter()
            .all(|p| p.status == PhaseStatus::Suppressed));
        assert_eq!(backend.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_order_violation_starts_nothing() {
        let fixture = fixture(
            "workspace:\n  phases:\n    setup:\n      order: [make_experiments, software_install]\n",
        );
        let (services, _) = fake_services(&fixture, FakeBackend::new(WaitStrategy::Existence, vec![]));
        let (tx, mut rx) = progress_channel();
        let executor = executor(&fixture, services).with_progress(tx);
        let a = instance(&fixture.root, "a", 1.0);

        let err = executor
            .execute(PipelineKind::Setup, &[a.clone()])
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, PhaseOrderErrorKind::DependencyAfter);
        assert!(!a.run_dir.exists());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_selection_without_dependencies_is_rejected() {
        let fixture = fixture("workspace: {}\n");
        let (services, _) = fake_services(&fixture, FakeBackend::new(WaitStrategy::Existence, vec![]));
        let executor = executor(&fixture, services).with_config(ExecutorConfig {
            selection: PhaseSelection::matching(vec![MAKE_EXPERIMENTS.to_string()], false),
            ..Default::default()
        });

        let err = executor
            .execute(PipelineKind::Setup, &[instance(&fixture.root, "a", 1.0)])
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, PhaseOrderErrorKind::MissingDependency);
    }

    #[tokio::test]
    async fn test_analyze_tolerates_missing_workflow_manager() {
        let fixture = fixture("workspace: {}\n");
        let (services, _) = fake_services(&fixture, FakeBackend::new(WaitStrategy::Existence, vec![]));
        let executor = executor(&fixture, services);
        let mut none = (*instance(&fixture.root, "a", 1.0)).clone();
        none.workflow_manager = BackendKind::None;

        let report = executor
            .execute(PipelineKind::Analyze, &[Arc::new(none)])
            .await
            .unwrap();
        assert!(report.success());
        assert_eq!(
            report.instances[0].phase(QUERY_STATUS).unwrap().detail.as_deref(),
            Some("no workflow manager")
        );
    }

    #[tokio::test]
    async fn test_events_follow_phase_progress() {
        let fixture = fixture("workspace: {}\n");
        let (services, _) = fake_services(&fixture, FakeBackend::new(WaitStrategy::Existence, vec![]));
        let (tx, mut rx) = progress_channel();
        let executor = executor(&fixture, services).with_progress(tx);
        let a = instance(&fixture.root, "a", 1.0);

        executor.execute(PipelineKind::Setup, &[a]).await.unwrap();
        drop(executor);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(PipelineEvent::PipelineStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::PipelineCompleted { succeeded: 1, failed: 0, .. })
        ));
        let finished = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::PhaseFinished { .. }))
            .count();
        assert_eq!(finished, 4);
    }

    /// Records how many instances are inside it at once
    struct GaugePhase {
        depends_on: Vec<String>,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Phase for GaugePhase {
        fn name(&self) -> &str {
            "gauge"
        }

        fn kind(&self) -> PhaseKind {
            PhaseKind::Local
        }

        fn depends_on(&self) -> &[String] {
            &self.depends_on
        }

        async fn run(&self, _ctx: &PhaseContext<'_>) -> Result<Option<String>, PhaseError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let fixture = fixture("workspace: {}\n");
        let gauge = Arc::new(GaugePhase {
            depends_on: Vec::new(),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut registry = PhaseRegistry::builtin();
        registry.register(PipelineKind::Analyze, gauge.clone()).unwrap();

        let (services, _) = fake_services(&fixture, FakeBackend::new(WaitStrategy::Existence, vec![]));
        let executor = PipelineExecutor::new(Arc::new(registry), Arc::new(services))
            .with_overrides(BTreeMap::from([(
                "analyze".to_string(),
                PhaseOverride {
                    order: Some(vec!["gauge".to_string()]),
                    insert: Vec::new(),
                },
            )]))
            .with_config(ExecutorConfig {
                max_parallel: 2,
                ..Default::default()
            });

        let instances: Vec<_> = (0..6)
            .map(|i| instance(&fixture.root, &format!("i{}", i), 1.0))
            .collect();
        let report = executor.execute(PipelineKind::Analyze, &instances).await.unwrap();

        assert_eq!(report.succeeded(), 6);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
        assert!(gauge.peak.load(Ordering::SeqCst) >= 1);
        let names: Vec<_> = report.instances.iter().map(|i| i.experiment.clone()).collect();
        let expected: Vec<_> = instances.iter().map(|i| i.namespace()).collect();
        assert_eq!(names, expected);
    }
}
