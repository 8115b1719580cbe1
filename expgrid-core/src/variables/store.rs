// Variable Store
// Scoped variable definitions, narrowest scope first on lookup

use crate::variables::value::Value;
use crate::variables::VariableError;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Definition scope, ordered from widest to narrowest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// Variables expgrid defines itself (names, paths)
    Builtin,
    Global,
    Application,
    Workload,
    Experiment,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::Builtin => "builtin",
            Scope::Global => "global",
            Scope::Application => "application",
            Scope::Workload => "workload",
            Scope::Experiment => "experiment",
        };
        write!(f, "{}", name)
    }
}

/// How a variable is defined
#[derive(Debug, Clone, PartialEq)]
pub enum Definition {
    /// A literal value
    Scalar(Value),
    /// An ordered list of values; only the combinator expands these
    List(Vec<Value>),
    /// A string containing `{name}` references
    Formula(String),
}

impl Definition {
    /// Classify a plain value: strings with references become formulas
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(s) if has_reference(&s) => Definition::Formula(s),
            other => Definition::Scalar(other),
        }
    }

    /// Classify a YAML node from a `variables:` block
    pub fn from_yaml(name: &str, value: &serde_yaml::Value) -> Result<Self, VariableError> {
        if let Some(items) = value.as_sequence() {
            let values = items
                .iter()
                .map(|item| {
                    Value::from_yaml(item).ok_or_else(|| VariableError::InvalidDefinition {
                        name: name.to_string(),
                        reason: "list elements must be scalars".to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Definition::List(values));
        }

        Value::from_yaml(value)
            .map(Definition::from_value)
            .ok_or_else(|| VariableError::InvalidDefinition {
                name: name.to_string(),
                reason: "mappings cannot be used as variable values".to_string(),
            })
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Definition::List(_))
    }
}

/// Whether `text` contains at least one `{...}` that is not `${...}`
pub fn has_reference(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.iter().enumerate().any(|(i, &b)| {
        b == b'{' && (i == 0 || (bytes[i - 1] != b'$' && bytes[i - 1] != b'\\'))
    })
}

/// One scope's worth of variables and zip groups
#[derive(Debug, Clone)]
pub struct VariableLayer {
    pub scope: Scope,
    /// Human-readable owner, e.g. `application hostname`
    pub label: String,
    pub variables: BTreeMap<String, Definition>,
    pub zips: BTreeMap<String, Vec<String>>,
}

impl VariableLayer {
    pub fn new(scope: Scope, label: impl Into<String>) -> Self {
        Self {
            scope,
            label: label.into(),
            variables: BTreeMap::new(),
            zips: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, definition: Definition) -> Self {
        self.variables.insert(name.into(), definition);
        self
    }

    pub fn with_zip(mut self, name: impl Into<String>, members: Vec<String>) -> Self {
        self.zips.insert(name.into(), members);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, definition: Definition) {
        self.variables.insert(name.into(), definition);
    }

    /// Parse a YAML `variables:` mapping into this layer
    pub fn extend_from_yaml(
        &mut self,
        variables: &BTreeMap<String, serde_yaml::Value>,
    ) -> Result<(), VariableError> {
        for (name, value) in variables {
            self.variables
                .insert(name.clone(), Definition::from_yaml(name, value)?);
        }
        Ok(())
    }
}

/// An immutable stack of layers, widest first.
///
/// Narrower layers shadow wider ones without modifying them. Pushing a layer
/// returns a new store that shares the existing layers.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    layers: Vec<Arc<VariableLayer>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new store with `layer` as its narrowest scope
    pub fn with_layer(&self, layer: VariableLayer) -> Self {
        let mut layers = self.layers.clone();
        layers.push(Arc::new(layer));
        Self { layers }
    }

    pub fn layers(&self) -> &[Arc<VariableLayer>] {
        &self.layers
    }

    /// Narrowest definition of `name`, with the scope it was found in
    pub fn lookup(&self, name: &str) -> Option<(Scope, &Definition)> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.variables.get(name).map(|d| (layer.scope, d)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Narrowest zip group with this name
    pub fn zip(&self, name: &str) -> Option<&[String]> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.zips.get(name).map(Vec::as_slice))
    }

    /// Every variable name visible from the narrowest scope
    pub fn visible_names(&self) -> BTreeSet<String> {
        self.layers
            .iter()
            .flat_map(|layer| layer.variables.keys().cloned())
            .collect()
    }

    /// Every zip group name visible from the narrowest scope
    pub fn visible_zips(&self) -> BTreeSet<String> {
        self.layers
            .iter()
            .flat_map(|layer| layer.zips.keys().cloned())
            .collect()
    }

    /// Names whose narrowest definition is a list
    pub fn list_variables(&self) -> BTreeSet<String> {
        self.visible_names()
            .into_iter()
            .filter(|name| matches!(self.lookup(name), Some((_, d)) if d.is_list()))
            .collect()
    }
}
