// Experiment Module
// Template expansion into concrete, uniquely named experiment instances

pub mod builder;
pub mod filter;
pub mod instance;
pub mod matrix;

pub use builder::{BuildError, BuildOutcome, ExperimentSetBuilder};
pub use filter::{check_predicate, FilterError, Filters};
pub use instance::{
    ExperimentEntry, ExperimentInstance, ExperimentSet, Exclusion, EXECUTE_SCRIPT, MANIFEST_FILE,
    STATE_DIR,
};
pub use matrix::{CombinationPlan, Combinator, CombinatorError, Tuple, IMPLICIT_ZIP};
