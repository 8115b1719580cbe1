// Workflow Module
// Scheduler backends and the job lifecycle built on top of them

pub mod backends;
pub mod manager;
pub mod record;
pub mod runner;
pub mod status;

pub use backends::{backend_for, BackendError, NativeStatus, SchedulerBackend, WaitStrategy};
pub use manager::{CleanOptions, CleanOutcome, WaitOptions, WaitOutcome, WorkflowError, WorkflowManager};
pub use record::{JobRecord, StatusSnapshot, JOB_RECORD_FILE, STATUS_SNAPSHOT_FILE};
pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
pub use status::{CanonicalStatus, StatusMap, StatusOrigin, StatusReport};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which scheduler an experiment is submitted through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// No workflow manager; the experiment cannot be submitted
    #[default]
    None,
    Local,
    Slurm,
    Pbs,
    GoogleBatch,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::None,
        BackendKind::Local,
        BackendKind::Slurm,
        BackendKind::Pbs,
        BackendKind::GoogleBatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::None => "none",
            BackendKind::Local => "local",
            BackendKind::Slurm => "slurm",
            BackendKind::Pbs => "pbs",
            BackendKind::GoogleBatch => "google-batch",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown workflow manager '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("slurm".parse::<BackendKind>().unwrap(), BackendKind::Slurm);
        assert_eq!(
            "google_batch".parse::<BackendKind>().unwrap(),
            BackendKind::GoogleBatch
        );
        assert_eq!("None".parse::<BackendKind>().unwrap(), BackendKind::None);
        assert!("lsf9".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_backend_kind_serde_matches_display() {
        for kind in BackendKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }
}
