// Experiment Instances
// Immutable, fully resolved runs and the set they are built into

use crate::experiment::filter::{FilterError, Filters};
use crate::variables::Value;
use crate::workflow::BackendKind;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory inside each run directory that holds expgrid's own state
pub const STATE_DIR: &str = ".expgrid";

/// Instance manifest written by setup
pub const MANIFEST_FILE: &str = "experiment.json";

/// Batch script rendered by setup and handed to the scheduler
pub const EXECUTE_SCRIPT: &str = "execute_experiment";

/// One concrete experiment. Never mutated after the builder creates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentInstance {
    pub application: String,
    pub workload: String,
    pub name: String,
    /// Name pattern of the template this instance came from
    pub template: String,
    /// 1-based position within its template
    pub index: usize,
    pub repeat_index: u32,
    pub run_dir: PathBuf,
    pub variables: BTreeMap<String, Value>,
    pub commands: Vec<String>,
    pub tags: BTreeSet<String>,
    pub workflow_manager: BackendKind,
    /// Software environment the provisioning phase installs
    pub environment: Option<String>,
}

impl ExperimentInstance {
    /// `application.workload.name`, unique within a workspace
    pub fn namespace(&self) -> String {
        format!("{}.{}.{}", self.application, self.workload, self.name)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.run_dir.join(STATE_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.run_dir.join(MANIFEST_FILE)
    }

    pub fn script_path(&self) -> PathBuf {
        self.run_dir.join(EXECUTE_SCRIPT)
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Scheduler job name
    pub fn job_name(&self) -> String {
        format!("{}_{}_{}", self.application, self.workload, self.name)
    }

    pub fn manifest_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// SHA-256 of the canonical JSON manifest
    pub fn digest(&self) -> String {
        // BTreeMap/BTreeSet fields keep the serialization stable
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }

    pub fn read_manifest(path: &Path) -> std::io::Result<ExperimentInstance> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl fmt::Display for ExperimentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.namespace())
    }
}

/// Why an instance is kept out of pipelines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum Exclusion {
    /// Listed by the template's `exclude` name set
    ExcludedByName,
    /// An `exclude.where` predicate held
    ExcludedByPredicate(String),
    /// A template `where` predicate did not hold
    NotIncluded(String),
    /// Base of a repeated experiment; its numbered repeats run instead
    RepeatBase,
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exclusion::ExcludedByName => write!(f, "excluded by name"),
            Exclusion::ExcludedByPredicate(p) => write!(f, "excluded where {}", p),
            Exclusion::NotIncluded(p) => write!(f, "not included: {}", p),
            Exclusion::RepeatBase => write!(f, "repeat base"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentEntry {
    pub instance: Arc<ExperimentInstance>,
    pub exclusion: Option<Exclusion>,
}

impl ExperimentEntry {
    pub fn is_active(&self) -> bool {
        self.exclusion.is_none()
    }
}

/// Every instance of a workspace in deterministic build order, including the
/// ones that are retained only for listing
#[derive(Debug, Clone, Default)]
pub struct ExperimentSet {
    entries: Vec<ExperimentEntry>,
}

impl ExperimentSet {
    pub fn new(entries: Vec<ExperimentEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ExperimentEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Instances eligible for pipelines before run-time filters
    pub fn active(&self) -> impl Iterator<Item = &Arc<ExperimentInstance>> {
        self.entries
            .iter()
            .filter(|e| e.is_active())
            .map(|e| &e.instance)
    }

    /// Active instances that also pass run-time filters
    pub fn select(&self, filters: &Filters) -> Result<Vec<Arc<ExperimentInstance>>, FilterError> {
        let mut selected = Vec::new();
        for instance in self.active() {
            if filters.matches(instance)? {
                selected.push(Arc::clone(instance));
            }
        }
        Ok(selected)
    }

    pub fn find(&self, namespace: &str) -> Option<&ExperimentEntry> {
        self.entries
            .iter()
            .find(|e| e.instance.namespace() == namespace)
    }
}
