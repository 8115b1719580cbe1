// Job Records
// Per-instance job tracking files under the instance state directory

use crate::utils::{atomic_write, remove_if_exists};
use crate::workflow::status::{CanonicalStatus, StatusOrigin, StatusReport};
use crate::workflow::BackendKind;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

pub const JOB_RECORD_FILE: &str = "job.json";
pub const STATUS_SNAPSHOT_FILE: &str = "job_status.yaml";

/// What submit learned from the backend. Its presence on disk is what
/// "this instance has a job" means everywhere else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub backend: BackendKind,
    pub job_name: String,
    pub script: PathBuf,
    pub submitted_at: DateTime<Utc>,
    /// Backend-reported descriptive fields (location, output paths, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl JobRecord {
    pub fn new(
        job_id: impl Into<String>,
        backend: BackendKind,
        job_name: impl Into<String>,
        script: impl Into<PathBuf>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            backend,
            job_name: job_name.into(),
            script: script.into(),
            submitted_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(JOB_RECORD_FILE)
    }

    /// `Ok(None)` when no record exists
    pub fn load(state_dir: &Path) -> io::Result<Option<JobRecord>> {
        let raw = match std::fs::read_to_string(Self::path(state_dir)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn save(&self, state_dir: &Path) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        atomic_write(&Self::path(state_dir), &json)
    }

    /// Remove the record and the status snapshot; true if anything existed
    pub fn remove(state_dir: &Path) -> io::Result<bool> {
        let record = remove_if_exists(&Self::path(state_dir))?;
        let snapshot = remove_if_exists(&StatusSnapshot::path(state_dir))?;
        Ok(record || snapshot)
    }
}

/// Human-readable status artifact refreshed by status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub experiment: String,
    pub job_id: String,
    pub backend: BackendKind,
    pub status: CanonicalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_status: Option<String>,
    pub origin: StatusOrigin,
    pub checked_at: DateTime<Utc>,
    /// Nodes, start and end times, as far as the backend reports them
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl StatusSnapshot {
    pub fn new(
        experiment: impl Into<String>,
        record: &JobRecord,
        report: &StatusReport,
        details: BTreeMap<String, String>,
    ) -> Self {
        Self {
            experiment: experiment.into(),
            job_id: record.job_id.clone(),
            backend: record.backend,
            status: report.status,
            native_status: report.native.clone(),
            origin: report.origin,
            checked_at: Utc::now(),
            details,
        }
    }

    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(STATUS_SNAPSHOT_FILE)
    }

    pub fn save(&self, state_dir: &Path) -> io::Result<()> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        atomic_write(&Self::path(state_dir), yaml.as_bytes())
    }

    pub fn load(state_dir: &Path) -> io::Result<Option<StatusSnapshot>> {
        let raw = match std::fs::read_to_string(Self::path(state_dir)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_yaml::from_str(&raw)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        assert_eq!(JobRecord::load(temp.path()).unwrap(), None);

        let record = JobRecord::new("4242", BackendKind::Slurm, "app_wl_exp", "/run/execute.sh")
            .with_metadata("partition", "debug");
        record.save(temp.path()).unwrap();

        let loaded = JobRecord::load(temp.path()).unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(JobRecord::path(temp.path()), "{not json").unwrap();
        let err = JobRecord::load(temp.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_remove_clears_record_and_snapshot() {
        let temp = tempfile::tempdir().unwrap();
        let record = JobRecord::new("7", BackendKind::Pbs, "job", "/run/execute.sh");
        record.save(temp.path()).unwrap();
        StatusSnapshot::new("a.b.c", &record, &StatusReport::absent(), BTreeMap::new())
            .save(temp.path())
            .unwrap();

        assert!(JobRecord::remove(temp.path()).unwrap());
        assert!(!JobRecord::path(temp.path()).exists());
        assert!(!StatusSnapshot::path(temp.path()).exists());
        assert!(!JobRecord::remove(temp.path()).unwrap());
    }

    #[test]
    fn test_snapshot_is_readable_yaml() {
        let temp = tempfile::tempdir().unwrap();
        let record = JobRecord::new("7", BackendKind::Pbs, "job", "/run/execute.sh");
        let details = BTreeMap::from([("nodes".to_string(), "n001".to_string())]);
        StatusSnapshot::new("a.b.c", &record, &StatusReport::absent(), details)
            .save(temp.path())
            .unwrap();

        let raw = std::fs::read_to_string(StatusSnapshot::path(temp.path())).unwrap();
        assert!(raw.contains("status: UNQUEUED"));
        assert!(raw.contains("nodes: n001"));
        let loaded = StatusSnapshot::load(temp.path()).unwrap().unwrap();
        assert_eq!(loaded.job_id, "7");
    }
}
