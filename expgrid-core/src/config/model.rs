// Workspace Configuration Model
// Serde types for expgrid.yaml

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw YAML variable definitions, classified later by the variable store
pub type VariableMap = BTreeMap<String, serde_yaml::Value>;

/// Zip group name -> ordered member names
pub type ZipMap = BTreeMap<String, Vec<String>>;

/// Top-level workspace file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceFile {
    #[serde(default)]
    pub settings: SettingsFile,
    pub workspace: WorkspaceSection,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceSection {
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub zips: ZipMap,
    #[serde(default)]
    pub workflow_manager: Option<String>,
    #[serde(default)]
    pub commands: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Vec<String>,

    /// Pipeline name -> phase order override
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseOverride>,
    #[serde(default)]
    pub custom_phases: BTreeMap<String, CustomPhaseConfig>,
    #[serde(default)]
    pub software: SoftwareConfig,
    #[serde(default)]
    pub applications: BTreeMap<String, ApplicationConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationConfig {
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub zips: ZipMap,
    #[serde(default)]
    pub workflow_manager: Option<String>,
    #[serde(default)]
    pub commands: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub workloads: BTreeMap<String, WorkloadConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadConfig {
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub zips: ZipMap,
    #[serde(default)]
    pub workflow_manager: Option<String>,
    #[serde(default)]
    pub commands: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub experiments: BTreeMap<String, ExperimentConfig>,
}

/// One experiment template; its key is the name pattern
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub zips: ZipMap,
    #[serde(default)]
    pub workflow_manager: Option<String>,
    #[serde(default)]
    pub commands: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub matrix: Option<Vec<String>>,
    #[serde(default)]
    pub matrices: Vec<Vec<String>>,
    /// Inclusion predicates; all must hold
    #[serde(default, rename = "where")]
    pub include_where: Vec<String>,
    #[serde(default)]
    pub exclude: ExcludeConfig,
    #[serde(default)]
    pub n_repeats: u32,
}

impl ExperimentConfig {
    /// `matrix` followed by `matrices`, in declared order
    pub fn all_matrices(&self) -> Vec<Vec<String>> {
        self.matrix
            .iter()
            .cloned()
            .chain(self.matrices.iter().cloned())
            .collect()
    }
}

/// Instances to drop from a template, by rendered name or predicate
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExcludeConfig {
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub zips: ZipMap,
    #[serde(default)]
    pub matrix: Option<Vec<String>>,
    #[serde(default)]
    pub matrices: Vec<Vec<String>>,
    /// Exclusion predicates; any one excludes
    #[serde(default, rename = "where")]
    pub exclude_where: Vec<String>,
}

impl ExcludeConfig {
    pub fn all_matrices(&self) -> Vec<Vec<String>> {
        self.matrix
            .iter()
            .cloned()
            .chain(self.matrices.iter().cloned())
            .collect()
    }

    /// Whether this block renders an explicit set of names
    pub fn has_name_set(&self) -> bool {
        !self.variables.is_empty() || !self.zips.is_empty() || self.matrix.is_some() || !self.matrices.is_empty()
    }
}

/// Per-pipeline phase order override
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseOverride {
    /// Fully explicit order
    #[serde(default)]
    pub order: Option<Vec<String>>,
    /// Relative insertions applied to the default order
    #[serde(default)]
    pub insert: Vec<InsertDirective>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InsertDirective {
    pub phase: String,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
}

/// A user phase that runs a shell command
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CustomPhaseConfig {
    pub pipeline: String,
    pub command: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub destructive: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SoftwareConfig {
    /// Command template run once per environment; absent means the
    /// environment is managed by the user
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Optional settings layer (user file or workspace `settings:` block)
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SettingsFile {
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub wait_timeout_secs: Option<u64>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub include_phase_dependencies: Option<bool>,
}
