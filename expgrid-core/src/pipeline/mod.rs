pub mod builtin;
pub mod custom;
pub mod events;
pub mod executor;
pub mod install;
pub mod order;
pub mod phase;

pub use builtin::{builtin_phases, BuiltinPhase};
pub use custom::CustomPhase;
pub use events::{
    progress_channel, EventSender, PhaseStatus, PipelineEvent, ProgressReceiver, ProgressSender,
};
pub use executor::{
    ExecutorConfig, InstanceOutcome, InstanceReport, PhaseReport, PipelineExecutor,
    PipelineReport,
};
pub use install::{CommandInstaller, InstallError, InstallManifest, Installer, Provisioner, UserManaged};
pub use order::{wait_after_submit, PhaseOrderError, PhaseOrderErrorKind, PhaseRegistry, PhaseSelection};
pub use phase::{
    clear_markers, completed_phases, is_complete, marker_path, Phase, PhaseContext, PhaseError,
    PhaseKind, PhaseServices, PipelineKind, PHASES_DIR,
};
