// Workspace
// A loaded, built workspace and the operations the command layer runs on it

use crate::config::WorkspaceConfig;
use crate::error::{ExpgridError, ExpgridResult};
use crate::experiment::{ExperimentInstance, ExperimentSet, ExperimentSetBuilder, Filters};
use crate::pipeline::{
    clear_markers, wait_after_submit, ExecutorConfig, PhaseRegistry, PhaseSelection, PhaseServices,
    PipelineExecutor, PipelineKind, PipelineReport, ProgressSender, PHASES_DIR,
};
use crate::workflow::{
    CleanOptions, CleanOutcome, StatusReport, WaitOutcome, WorkflowError, WorkflowManager,
};

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Options shared by the pipeline commands
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub filters: Filters,
    pub dry_run: bool,
    pub force: bool,
    /// `--phases` globs; empty runs the whole pipeline
    pub phases: Vec<String>,
    /// Insert `wait` after `submit` (execute only)
    pub wait: bool,
}

/// One instance's answer from a workspace-wide lifecycle operation
#[derive(Debug)]
pub struct InstanceResult<T> {
    pub experiment: String,
    pub result: ExpgridResult<T>,
}

pub struct Workspace {
    config: Arc<WorkspaceConfig>,
    experiments: ExperimentSet,
    registry: Arc<PhaseRegistry>,
    services: Arc<PhaseServices>,
}

impl Workspace {
    /// Load `<root>/expgrid.yaml` and build every experiment
    pub fn open(root: &Path) -> ExpgridResult<Self> {
        Self::from_config(WorkspaceConfig::load(root)?)
    }

    /// Strict build: any template error fails
    pub fn from_config(config: WorkspaceConfig) -> ExpgridResult<Self> {
        let experiments = ExperimentSetBuilder::new(&config).build()?;
        let registry = PhaseRegistry::from_config(&config)?;
        let services = PhaseServices::new(&config);
        info!(
            root = %config.root.display(),
            experiments = experiments.len(),
            "workspace loaded"
        );

        Ok(Self {
            config: Arc::new(config),
            experiments,
            registry: Arc::new(registry),
            services: Arc::new(services),
        })
    }

    /// Replace the collaborators phases and lifecycle operations use
    pub fn with_services(mut self, services: PhaseServices) -> Self {
        self.services = Arc::new(services);
        self
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn experiments(&self) -> &ExperimentSet {
        &self.experiments
    }

    pub fn registry(&self) -> &PhaseRegistry {
        &self.registry
    }

    /// Active instances that pass `filters`, in build order
    pub fn select(&self, filters: &Filters) -> ExpgridResult<Vec<Arc<ExperimentInstance>>> {
        let selected = self.experiments.select(filters)?;
        debug!(selected = selected.len(), "selected experiments");
        Ok(selected)
    }

    pub fn executor_config(&self, pipeline: PipelineKind, options: &RunOptions) -> ExecutorConfig {
        let selection = if options.phases.is_empty() {
            PhaseSelection::all()
        } else {
            PhaseSelection::matching(
                options.phases.clone(),
                self.config.settings.include_phase_dependencies,
            )
        };

        let mut extra_inserts = Vec::new();
        if options.wait && pipeline == PipelineKind::Execute {
            extra_inserts.push(wait_after_submit());
        }

        ExecutorConfig {
            max_parallel: self.config.settings.max_parallel,
            dry_run: options.dry_run,
            force: options.force,
            selection,
            extra_inserts,
        }
    }

    pub fn executor(&self, pipeline: PipelineKind, options: &RunOptions) -> PipelineExecutor {
        PipelineExecutor::new(Arc::clone(&self.registry), Arc::clone(&self.services))
            .with_overrides(self.config.workspace().phases.clone())
            .with_config(self.executor_config(pipeline, options))
    }

    /// Run one pipeline over the selected instances
    pub async fn run_pipeline(
        &self,
        pipeline: PipelineKind,
        options: &RunOptions,
        progress: Option<ProgressSender>,
    ) -> ExpgridResult<PipelineReport> {
        let instances = self.select(&options.filters)?;
        let mut executor = self.executor(pipeline, options);
        if let Some(tx) = progress {
            executor = executor.with_progress(tx);
        }
        Ok(executor.execute(pipeline, &instances).await?)
    }

    pub async fn status(
        &self,
        filters: &Filters,
    ) -> ExpgridResult<Vec<InstanceResult<StatusReport>>> {
        self.each_instance(filters, |manager, instance| async move {
            manager.status(&instance).await
        })
        .await
    }

    pub async fn wait(&self, filters: &Filters) -> ExpgridResult<Vec<InstanceResult<WaitOutcome>>> {
        let options = self.services.wait;
        let cancel = self.services.cancel.clone();
        self.each_instance(filters, move |manager, instance| {
            let cancel = cancel.clone();
            async move { manager.wait(&instance, options, cancel).await }
        })
        .await
    }

    /// Remove job tracking; with `cancel`, active jobs are cancelled first.
    /// Once a record is gone the execute pipeline's markers go with it, so the
    /// next execute submits again.
    pub async fn clean(
        &self,
        filters: &Filters,
        options: CleanOptions,
    ) -> ExpgridResult<Vec<InstanceResult<CleanOutcome>>> {
        self.each_instance(filters, move |manager, instance| async move {
            let outcome = manager.clean(&instance, options).await?;
            if outcome.removed() {
                let cleared = clear_markers(&instance, PipelineKind::Execute).map_err(|source| {
                    WorkflowError::Io {
                        experiment: instance.namespace(),
                        path: instance.state_dir().join(PHASES_DIR),
                        source,
                    }
                })?;
                debug!(experiment = %instance.namespace(), cleared, "execute markers cleared");
            }
            Ok(outcome)
        })
        .await
    }

    pub async fn logs(&self, filters: &Filters) -> ExpgridResult<Vec<InstanceResult<Vec<PathBuf>>>> {
        self.each_instance(filters, |manager, instance| async move {
            manager.fetch_logs(&instance).await
        })
        .await
    }

    /// Run `op` for every selected instance, bounded by `max_parallel`.
    /// Each instance gets its own result; none fails the batch.
    async fn each_instance<T, F, Fut>(
        &self,
        filters: &Filters,
        op: F,
    ) -> ExpgridResult<Vec<InstanceResult<T>>>
    where
        T: Send + 'static,
        F: Fn(WorkflowManager, Arc<ExperimentInstance>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, WorkflowError>> + Send + 'static,
    {
        let instances = self.select(filters)?;
        let op = Arc::new(op);
        let semaphore = Arc::new(Semaphore::new(self.config.settings.max_parallel.max(1)));
        let mut pending = Vec::with_capacity(instances.len());

        for instance in instances {
            let experiment = instance.namespace();
            let Some(manager) = self.services.manager(instance.workflow_manager).cloned() else {
                pending.push((experiment, None));
                continue;
            };

            let op = Arc::clone(&op);
            let semaphore = Arc::clone(&semaphore);
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                op(manager, instance).await
            });
            pending.push((experiment, Some(handle)));
        }

        let mut results = Vec::with_capacity(pending.len());
        for (experiment, handle) in pending {
            let result = match handle {
                None => Err(ExpgridError::NoWorkflowManager {
                    experiment: experiment.clone(),
                }),
                Some(handle) => match handle.await {
                    Ok(result) => result.map_err(ExpgridError::from),
                    Err(e) => Err(ExpgridError::Task {
                        experiment: experiment.clone(),
                        message: e.to_string(),
                    }),
                },
            };
            results.push(InstanceResult { experiment, result });
        }
        Ok(results)
    }
}
