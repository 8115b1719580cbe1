// Workflow Manager
// Job lifecycle over a scheduler backend: submit, status, wait, clean, logs

use crate::experiment::ExperimentInstance;
use crate::workflow::backends::{BackendError, NativeStatus, SchedulerBackend, WaitStrategy};
use crate::workflow::record::{JobRecord, StatusSnapshot};
use crate::workflow::status::{StatusOrigin, StatusReport};
use crate::workflow::BackendKind;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{experiment}: no job record; submit the experiment first")]
    MissingJobRecord { experiment: String },

    #[error("{experiment}: job {job_id} is still queued or running; will not resubmit")]
    StillQueued { experiment: String, job_id: String },

    #[error(
        "{experiment}: job record for {job_id} is stale (the scheduler no longer lists it); run clean before resubmitting"
    )]
    StaleRecord { experiment: String, job_id: String },

    #[error("{experiment}: job {job_id} is still queued or running; use clean --cancel to cancel it")]
    StillActive { experiment: String, job_id: String },

    #[error("{experiment}: job {job_id} belongs to workflow manager '{recorded}', not '{current}'")]
    BackendMismatch {
        experiment: String,
        job_id: String,
        recorded: BackendKind,
        current: BackendKind,
    },

    #[error("{experiment}: {source}")]
    Backend {
        experiment: String,
        #[source]
        source: BackendError,
    },

    #[error("{experiment}: {path}: {source}")]
    Io {
        experiment: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Polling parameters for `wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub interval: Duration,
    /// Bound on the whole wait, distinct from the interval
    pub timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            interval: crate::config::DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The backend's termination test passed; carries the final status
    Finished(StatusReport),
    TimedOut { polls: u32 },
    Cancelled { polls: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanOutcome {
    /// No record or snapshot existed
    NothingToClean,
    /// The record referenced a job the scheduler no longer lists
    RemovedStale { job_id: String },
    /// The job was active, cancelled, and its record removed
    Cancelled { job_id: String },
    /// Dry run: the stale record would be removed
    WouldRemoveStale { job_id: String },
    /// Dry run: the active job would be cancelled and its record removed
    WouldCancel { job_id: String },
}

impl CleanOutcome {
    /// Whether local tracking was actually removed
    pub fn removed(&self) -> bool {
        matches!(
            self,
            CleanOutcome::RemovedStale { .. } | CleanOutcome::Cancelled { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanOptions {
    /// Cancel jobs that are still queued or running
    pub cancel: bool,
    /// Report what would happen without cancelling or removing anything
    pub dry_run: bool,
}

/// Lifecycle operations for every instance bound to one backend.
///
/// The job record in `<run_dir>/.expgrid/job.json` is only written by submit
/// and only removed by clean. Status and wait are read-only apart from the
/// best-effort snapshot refresh.
#[derive(Clone)]
pub struct WorkflowManager {
    backend: Arc<dyn SchedulerBackend>,
}

impl WorkflowManager {
    pub fn new(backend: Arc<dyn SchedulerBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn SchedulerBackend> {
        &self.backend
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    fn backend_error(instance: &ExperimentInstance) -> impl FnOnce(BackendError) -> WorkflowError {
        let experiment = instance.namespace();
        move |source| WorkflowError::Backend { experiment, source }
    }

    /// The local record, if any. A corrupt file is an error.
    pub fn record(&self, instance: &ExperimentInstance) -> Result<Option<JobRecord>, WorkflowError> {
        let state_dir = instance.state_dir();
        let record = JobRecord::load(&state_dir).map_err(|source| WorkflowError::Io {
            experiment: instance.namespace(),
            path: JobRecord::path(&state_dir),
            source,
        })?;

        match record {
            Some(record) if record.backend != self.kind() => Err(WorkflowError::BackendMismatch {
                experiment: instance.namespace(),
                job_id: record.job_id,
                recorded: record.backend,
                current: self.kind(),
            }),
            other => Ok(other),
        }
    }

    /// The local record; absent or empty ids fail loudly
    pub fn require_record(&self, instance: &ExperimentInstance) -> Result<JobRecord, WorkflowError> {
        match self.record(instance)? {
            Some(record) if !record.job_id.trim().is_empty() => Ok(record),
            _ => Err(WorkflowError::MissingJobRecord {
                experiment: instance.namespace(),
            }),
        }
    }

    /// Submit unless a record already exists. At most one outstanding job per
    /// instance: an active record refuses, a stale record requires clean.
    pub async fn submit(
        &self,
        instance: &ExperimentInstance,
        script: &std::path::Path,
    ) -> Result<JobRecord, WorkflowError> {
        if let Some(existing) = self.record(instance)? {
            let active = self
                .backend
                .is_active(&existing)
                .await
                .map_err(Self::backend_error(instance))?;

            if active {
                info!(
                    experiment = %instance.namespace(),
                    job_id = %existing.job_id,
                    backend = %self.kind(),
                    "job still queued, not resubmitting"
                );
                return Err(WorkflowError::StillQueued {
                    experiment: instance.namespace(),
                    job_id: existing.job_id,
                });
            }

            warn!(
                experiment = %instance.namespace(),
                job_id = %existing.job_id,
                backend = %self.kind(),
                "stale job record"
            );
            return Err(WorkflowError::StaleRecord {
                experiment: instance.namespace(),
                job_id: existing.job_id,
            });
        }

        let record = self
            .backend
            .submit(instance, script)
            .await
            .map_err(Self::backend_error(instance))?;

        let state_dir = instance.state_dir();
        record.save(&state_dir).map_err(|source| WorkflowError::Io {
            experiment: instance.namespace(),
            path: JobRecord::path(&state_dir),
            source,
        })?;

        info!(
            experiment = %instance.namespace(),
            job_id = %record.job_id,
            backend = %self.kind(),
            "submitted"
        );
        Ok(record)
    }

    /// Fresh status: live queue first, then history. Backend failures degrade
    /// to UNRESOLVED rather than erroring.
    pub async fn status(&self, instance: &ExperimentInstance) -> Result<StatusReport, WorkflowError> {
        let record = self.require_record(instance)?;
        Ok(self.query(instance, &record).await)
    }

    async fn query(&self, instance: &ExperimentInstance, record: &JobRecord) -> StatusReport {
        let (report, details) = match self.lookup(record).await {
            Ok(Some(native)) => (
                StatusReport::from_native(self.backend.status_map(), &native.state),
                native.details,
            ),
            Ok(None) => (StatusReport::absent(), BTreeMap::new()),
            Err(e) => {
                warn!(
                    experiment = %instance.namespace(),
                    job_id = %record.job_id,
                    backend = %self.kind(),
                    error = %e,
                    "status query failed"
                );
                (StatusReport::query_failed(e.to_string()), BTreeMap::new())
            }
        };

        if report.origin == StatusOrigin::Unmapped {
            warn!(
                experiment = %instance.namespace(),
                job_id = %record.job_id,
                backend = %self.kind(),
                native = report.native.as_deref().unwrap_or(""),
                "unrecognized scheduler state"
            );
        }

        let snapshot = StatusSnapshot::new(instance.namespace(), record, &report, details);
        if let Err(e) = snapshot.save(&instance.state_dir()) {
            debug!(experiment = %instance.namespace(), error = %e, "status snapshot not written");
        }
        report
    }

    async fn lookup(&self, record: &JobRecord) -> Result<Option<NativeStatus>, BackendError> {
        if let Some(native) = self.backend.query_active(record).await? {
            return Ok(Some(native));
        }
        self.backend.query_history(record).await
    }

    /// Poll until the backend's termination test passes, the timeout elapses
    /// or `cancel` flips to true
    pub async fn wait(
        &self,
        instance: &ExperimentInstance,
        options: WaitOptions,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<WaitOutcome, WorkflowError> {
        let record = self.require_record(instance)?;
        let deadline = options.timeout.map(|t| Instant::now() + t);
        let strategy = self.backend.wait_strategy();
        let mut polls = 0u32;

        loop {
            if is_cancelled(&cancel) {
                return Ok(WaitOutcome::Cancelled { polls });
            }

            polls += 1;
            match strategy {
                WaitStrategy::Existence => match self.backend.is_active(&record).await {
                    Ok(false) => {
                        let report = self.query(instance, &record).await;
                        return Ok(WaitOutcome::Finished(report));
                    }
                    Ok(true) => {}
                    Err(e) => warn!(
                        experiment = %instance.namespace(),
                        job_id = %record.job_id,
                        backend = %self.kind(),
                        error = %e,
                        "queue listing failed, retrying"
                    ),
                },
                WaitStrategy::Status => {
                    let report = self.query(instance, &record).await;
                    if report.ends_wait() {
                        return Ok(WaitOutcome::Finished(report));
                    }
                    debug!(experiment = %instance.namespace(), status = %report, "still waiting");
                }
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(WaitOutcome::TimedOut { polls });
                    }
                    options.interval.min(deadline - now)
                }
                None => options.interval,
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancelled(&mut cancel) => return Ok(WaitOutcome::Cancelled { polls }),
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(WaitOutcome::TimedOut { polls });
            }
        }
    }

    /// Remove local tracking for a job that is gone. An active job is left
    /// alone unless `cancel` is set, in which case it is cancelled first.
    /// A failed liveness query never counts as gone.
    pub async fn clean(
        &self,
        instance: &ExperimentInstance,
        options: CleanOptions,
    ) -> Result<CleanOutcome, WorkflowError> {
        let state_dir = instance.state_dir();
        let io_error = |source| WorkflowError::Io {
            experiment: instance.namespace(),
            path: JobRecord::path(&state_dir),
            source,
        };

        let Some(record) = self.record(instance)? else {
            // A snapshot without a record is leftover state
            if !options.dry_run {
                JobRecord::remove(&state_dir).map_err(io_error)?;
            }
            return Ok(CleanOutcome::NothingToClean);
        };

        let active = self
            .backend
            .is_active(&record)
            .await
            .map_err(Self::backend_error(instance))?;

        if active && !options.cancel {
            return Err(WorkflowError::StillActive {
                experiment: instance.namespace(),
                job_id: record.job_id,
            });
        }

        if options.dry_run {
            info!(
                experiment = %instance.namespace(),
                job_id = %record.job_id,
                active,
                "dry run, leaving job record in place"
            );
            return Ok(if active {
                CleanOutcome::WouldCancel {
                    job_id: record.job_id,
                }
            } else {
                CleanOutcome::WouldRemoveStale {
                    job_id: record.job_id,
                }
            });
        }

        if active {
            self.backend
                .cancel(&record)
                .await
                .map_err(Self::backend_error(instance))?;
            info!(
                experiment = %instance.namespace(),
                job_id = %record.job_id,
                backend = %self.kind(),
                "cancelled"
            );
        }

        JobRecord::remove(&state_dir).map_err(io_error)?;
        Ok(if active {
            CleanOutcome::Cancelled {
                job_id: record.job_id,
            }
        } else {
            info!(
                experiment = %instance.namespace(),
                job_id = %record.job_id,
                "removed stale job record"
            );
            CleanOutcome::RemovedStale {
                job_id: record.job_id,
            }
        })
    }

    /// Copy logs into the run directory; nothing to do without a record
    pub async fn fetch_logs(&self, instance: &ExperimentInstance) -> Result<Vec<PathBuf>, WorkflowError> {
        let Some(record) = self.record(instance)? else {
            debug!(experiment = %instance.namespace(), "no job record, no logs");
            return Ok(Vec::new());
        };
        if record.job_id.trim().is_empty() {
            return Err(WorkflowError::MissingJobRecord {
                experiment: instance.namespace(),
            });
        }
        self.backend
            .fetch_logs(&record, &instance.run_dir)
            .await
            .map_err(Self::backend_error(instance))
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

/// Resolves once the flag becomes true; never if there is no flag or the
/// sender is gone
async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = cancel.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
