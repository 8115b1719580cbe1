// Expgrid Core Library
// Experiment generation, phase pipelines and batch job tracking

pub mod config;
pub mod error;
pub mod experiment;
pub mod expression;
pub mod pipeline;
pub mod utils;
pub mod variables;
pub mod workflow;
pub mod workspace;

// Re-export commonly used types
pub use error::{ExpgridError, ExpgridResult};

// Re-export configuration types
pub use config::{ConfigError, Settings, WorkspaceConfig};

// Re-export experiment types
pub use experiment::{
    BuildError, BuildOutcome, ExperimentInstance, ExperimentSet, ExperimentSetBuilder, Filters,
};

// Re-export pipeline types
pub use pipeline::{
    progress_channel, InstanceOutcome, PhaseStatus, PipelineEvent, PipelineKind, PipelineReport,
    ProgressReceiver, ProgressSender,
};

// Re-export workflow types
pub use workflow::{BackendKind, CanonicalStatus, CleanOptions, CleanOutcome, StatusReport, WaitOutcome};

pub use workspace::{InstanceResult, RunOptions, Workspace};
