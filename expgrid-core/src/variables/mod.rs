// Variables Module
// Scoped variable definitions and formula resolution

pub mod expander;
pub mod store;
pub mod value;

pub use expander::{is_variable_name, Expander, Resolved};
pub use store::{has_reference, Definition, Scope, VariableLayer, VariableStore};
pub use value::Value;

use thiserror::Error;

/// Errors raised while resolving variables
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VariableError {
    #[error("circular variable reference: {}", .cycle.join(" -> "))]
    CircularReference { cycle: Vec<String> },

    #[error("undefined variable '{name}'{}", referrer(.referenced_by))]
    UndefinedVariable {
        name: String,
        referenced_by: Option<String>,
    },

    #[error("list variable '{name}' cannot be used as a single value{}", referrer(.referenced_by))]
    ListInterpolation {
        name: String,
        referenced_by: Option<String>,
    },

    #[error("invalid definition for variable '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },
}

fn referrer(referenced_by: &Option<String>) -> String {
    referenced_by
        .as_ref()
        .map(|r| format!(" (referenced by '{}')", r))
        .unwrap_or_default()
}
