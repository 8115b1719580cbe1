// Pipeline Events
// Progress reporting for phase pipeline runs

use crate::pipeline::PipelineKind;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for pipeline progress events
pub type ProgressSender = mpsc::UnboundedSender<PipelineEvent>;

/// Receiver for pipeline progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<PipelineEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// What happened to one phase of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Ran,
    /// Completion marker present and not forced
    Skipped,
    /// Side-effecting phase withheld by dry-run
    Suppressed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Ran => "ran",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Suppressed => "suppressed",
            PhaseStatus::Failed => "failed",
        }
    }
}

/// Events emitted during a pipeline run
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    PipelineStarted {
        pipeline: PipelineKind,
        phases: Vec<String>,
        total_instances: usize,
        dry_run: bool,
    },

    PipelineCompleted {
        pipeline: PipelineKind,
        succeeded: usize,
        failed: usize,
        duration: Duration,
    },

    InstanceStarted {
        experiment: String,
    },

    InstanceCompleted {
        experiment: String,
        success: bool,
        duration: Duration,
    },

    PhaseStarted {
        experiment: String,
        phase: String,
    },

    /// Ran, skipped or suppressed
    PhaseFinished {
        experiment: String,
        phase: String,
        status: PhaseStatus,
        duration: Duration,
        detail: Option<String>,
    },

    PhaseFailed {
        experiment: String,
        phase: String,
        error: String,
        duration: Duration,
    },
}

impl PipelineEvent {
    pub fn pipeline_started(
        pipeline: PipelineKind,
        phases: Vec<String>,
        total_instances: usize,
        dry_run: bool,
    ) -> Self {
        Self::PipelineStarted {
            pipeline,
            phases,
            total_instances,
            dry_run,
        }
    }

    pub fn pipeline_completed(
        pipeline: PipelineKind,
        succeeded: usize,
        failed: usize,
        duration: Duration,
    ) -> Self {
        Self::PipelineCompleted {
            pipeline,
            succeeded,
            failed,
            duration,
        }
    }

    pub fn instance_started(experiment: impl Into<String>) -> Self {
        Self::InstanceStarted {
            experiment: experiment.into(),
        }
    }

    pub fn instance_completed(
        experiment: impl Into<String>,
        success: bool,
        duration: Duration,
    ) -> Self {
        Self::InstanceCompleted {
            experiment: experiment.into(),
            success,
            duration,
        }
    }

    pub fn phase_started(experiment: impl Into<String>, phase: impl Into<String>) -> Self {
        Self::PhaseStarted {
            experiment: experiment.into(),
            phase: phase.into(),
        }
    }

    pub fn phase_finished(
        experiment: impl Into<String>,
        phase: impl Into<String>,
        status: PhaseStatus,
        duration: Duration,
        detail: Option<String>,
    ) -> Self {
        Self::PhaseFinished {
            experiment: experiment.into(),
            phase: phase.into(),
            status,
            duration,
            detail,
        }
    }

    pub fn phase_failed(
        experiment: impl Into<String>,
        phase: impl Into<String>,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self::PhaseFailed {
            experiment: experiment.into(),
            phase: phase.into(),
            error: error.into(),
            duration,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: PipelineEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: PipelineEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: PipelineEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(PipelineEvent::pipeline_started(
            PipelineKind::Setup,
            vec!["make_experiments".to_string()],
            2,
            false,
        ));
        tx.send_event(PipelineEvent::phase_started("a.b.c", "make_experiments"));

        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::PipelineStarted { total_instances: 2, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::PhaseStarted { .. }
        ));
    }

    #[test]
    fn test_send_without_receiver_is_ignored() {
        let none: Option<ProgressSender> = None;
        none.send_event(PipelineEvent::instance_started("a.b.c"));

        let (tx, rx) = progress_channel();
        drop(rx);
        tx.send_event(PipelineEvent::instance_started("a.b.c"));
    }

    #[test]
    fn test_phase_finished_construction() {
        let event = PipelineEvent::phase_finished(
            "hostname.local.test_1",
            "submit",
            PhaseStatus::Suppressed,
            Duration::ZERO,
            None,
        );
        if let PipelineEvent::PhaseFinished { phase, status, .. } = event {
            assert_eq!(phase, "submit");
            assert_eq!(status.as_str(), "suppressed");
        } else {
            panic!("wrong event type");
        }
    }
}
