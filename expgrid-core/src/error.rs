// Error Types
// Umbrella error for workspace-level operations

use crate::config::ConfigError;
use crate::experiment::{BuildError, FilterError};
use crate::pipeline::{PhaseOrderError, PhaseError};
use crate::workflow::WorkflowError;

use thiserror::Error;

pub type ExpgridResult<T> = Result<T, ExpgridError>;

#[derive(Debug, Error)]
pub enum ExpgridError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    PhaseOrder(#[from] PhaseOrderError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("{experiment}: no workflow manager configured")]
    NoWorkflowManager { experiment: String },

    #[error("{experiment}: {message}")]
    Task { experiment: String, message: String },
}
