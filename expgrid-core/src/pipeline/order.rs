// Phase Order
// Registered phases per pipeline and validation of the effective order

use crate::config::{InsertDirective, PhaseOverride, WorkspaceConfig};
use crate::pipeline::builtin::builtin_phases;
use crate::pipeline::custom::CustomPhase;
use crate::pipeline::phase::{Phase, PipelineKind};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Raised before any phase starts
#[derive(Debug, Clone, Error)]
#[error("phase order violation: {message}")]
pub struct PhaseOrderError {
    pub message: String,
    pub kind: PhaseOrderErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOrderErrorKind {
    /// A name that is not registered for the pipeline
    UnknownPhase,
    /// Listed twice, or registered twice
    DuplicatePhase,
    /// Insert directive relative to a phase that is not in the order
    UnknownAnchor,
    /// A depended-upon phase is absent from the effective order
    MissingDependency,
    /// A depended-upon phase is ordered after its dependent
    DependencyAfter,
    /// Custom phase declared for a pipeline that does not exist
    UnknownPipeline,
    /// Malformed `--phases` pattern, or one that selects nothing
    InvalidFilter,
}

impl PhaseOrderError {
    fn new(kind: PhaseOrderErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

/// `--phases` patterns
#[derive(Debug, Clone, Default)]
pub struct PhaseSelection {
    /// Glob patterns; empty selects every phase
    pub patterns: Vec<String>,
    /// Add back everything a selected phase transitively depends on
    pub include_dependencies: bool,
}

impl PhaseSelection {
    pub fn all() -> Self {
        Self {
            patterns: Vec::new(),
            include_dependencies: true,
        }
    }

    pub fn matching(patterns: Vec<String>, include_dependencies: bool) -> Self {
        Self {
            patterns,
            include_dependencies,
        }
    }
}

#[derive(Default)]
struct Registered {
    phases: HashMap<String, Arc<dyn Phase>>,
    default_order: Vec<String>,
}

/// Every phase a pipeline can run, plus its default order
#[derive(Default)]
pub struct PhaseRegistry {
    pipelines: BTreeMap<PipelineKind, Registered>,
}

impl PhaseRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for pipeline in PipelineKind::ALL {
            let (phases, order) = builtin_phases(pipeline);
            let registered = registry.pipelines.entry(pipeline).or_default();
            for phase in phases {
                registered
                    .phases
                    .insert(phase.name().to_string(), Arc::new(phase));
            }
            registered.default_order = order.into_iter().map(str::to_string).collect();
        }
        registry
    }

    /// Built-ins plus the workspace's `custom_phases`
    pub fn from_config(config: &WorkspaceConfig) -> Result<Self, PhaseOrderError> {
        let mut registry = Self::builtin();
        for (name, custom) in &config.workspace().custom_phases {
            let pipeline: PipelineKind = custom.pipeline.parse().map_err(|_| {
                PhaseOrderError::new(
                    PhaseOrderErrorKind::UnknownPipeline,
                    format!(
                        "custom phase '{}' names unknown pipeline '{}'",
                        name, custom.pipeline
                    ),
                )
            })?;
            registry.register(pipeline, Arc::new(CustomPhase::new(name.clone(), custom)))?;
        }
        Ok(registry)
    }

    pub fn register(
        &mut self,
        pipeline: PipelineKind,
        phase: Arc<dyn Phase>,
    ) -> Result<(), PhaseOrderError> {
        let registered = self.pipelines.entry(pipeline).or_default();
        let name = phase.name().to_string();
        if registered.phases.contains_key(&name) {
            return Err(PhaseOrderError::new(
                PhaseOrderErrorKind::DuplicatePhase,
                format!("{} pipeline: phase '{}' is already registered", pipeline, name),
            ));
        }
        registered.phases.insert(name, phase);
        Ok(())
    }

    pub fn phase(&self, pipeline: PipelineKind, name: &str) -> Option<&Arc<dyn Phase>> {
        self.pipelines.get(&pipeline)?.phases.get(name)
    }

    pub fn default_order(&self, pipeline: PipelineKind) -> &[String] {
        self.pipelines
            .get(&pipeline)
            .map(|r| r.default_order.as_slice())
            .unwrap_or_default()
    }

    /// Effective, validated phase list for one pipeline run.
    ///
    /// The base order is the override's explicit order or the default order.
    /// Insert directives from the override, then `extra`, are applied in turn.
    /// The selection narrows the result. Every remaining phase must find all
    /// of its dependencies earlier in the list.
    pub fn plan(
        &self,
        pipeline: PipelineKind,
        override_: Option<&PhaseOverride>,
        extra: &[InsertDirective],
        selection: &PhaseSelection,
    ) -> Result<Vec<Arc<dyn Phase>>, PhaseOrderError> {
        let mut order: Vec<String> = match override_.and_then(|o| o.order.as_ref()) {
            Some(order) => order.clone(),
            None => self.default_order(pipeline).to_vec(),
        };

        let inserts = override_.map(|o| o.insert.as_slice()).unwrap_or_default();
        for directive in inserts.iter().chain(extra) {
            apply_insert(pipeline, &mut order, directive)?;
        }

        let mut seen = HashSet::new();
        for name in &order {
            if self.phase(pipeline, name).is_none() {
                return Err(PhaseOrderError::new(
                    PhaseOrderErrorKind::UnknownPhase,
                    format!("{} pipeline: unknown phase '{}'", pipeline, name),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(PhaseOrderError::new(
                    PhaseOrderErrorKind::DuplicatePhase,
                    format!("{} pipeline: phase '{}' appears more than once", pipeline, name),
                ));
            }
        }

        let order = self.select(pipeline, order, selection)?;
        self.validate(pipeline, &order)?;

        Ok(order
            .iter()
            .filter_map(|name| self.phase(pipeline, name).cloned())
            .collect())
    }

    fn select(
        &self,
        pipeline: PipelineKind,
        order: Vec<String>,
        selection: &PhaseSelection,
    ) -> Result<Vec<String>, PhaseOrderError> {
        if selection.patterns.is_empty() {
            return Ok(order);
        }

        let patterns = selection
            .patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| {
                    PhaseOrderError::new(
                        PhaseOrderErrorKind::InvalidFilter,
                        format!("phase filter '{}': {}", p, e),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut selected: HashSet<String> = order
            .iter()
            .filter(|name| patterns.iter().any(|p| p.matches(name)))
            .cloned()
            .collect();

        if selected.is_empty() {
            return Err(PhaseOrderError::new(
                PhaseOrderErrorKind::InvalidFilter,
                format!(
                    "{} pipeline: no phase matches {}",
                    pipeline,
                    selection.patterns.join(",")
                ),
            ));
        }

        if selection.include_dependencies {
            let mut pending: Vec<String> = selected.iter().cloned().collect();
            while let Some(name) = pending.pop() {
                let Some(phase) = self.phase(pipeline, &name) else {
                    continue;
                };
                for dependency in phase.depends_on() {
                    if order.contains(dependency) && selected.insert(dependency.clone()) {
                        pending.push(dependency.clone());
                    }
                }
            }
        }

        Ok(order.into_iter().filter(|n| selected.contains(n)).collect())
    }

    fn validate(&self, pipeline: PipelineKind, order: &[String]) -> Result<(), PhaseOrderError> {
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        for (index, name) in order.iter().enumerate() {
            let Some(phase) = self.phase(pipeline, name) else {
                continue;
            };
            for dependency in phase.depends_on() {
                match position.get(dependency.as_str()) {
                    None => {
                        return Err(PhaseOrderError::new(
                            PhaseOrderErrorKind::MissingDependency,
                            format!(
                                "{} pipeline: phase '{}' depends on '{}', which is not in the effective order",
                                pipeline, name, dependency
                            ),
                        ))
                    }
                    Some(&at) if at > index => {
                        return Err(PhaseOrderError::new(
                            PhaseOrderErrorKind::DependencyAfter,
                            format!(
                                "{} pipeline: phase '{}' depends on '{}', which is ordered after it",
                                pipeline, name, dependency
                            ),
                        ))
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

fn apply_insert(
    pipeline: PipelineKind,
    order: &mut Vec<String>,
    directive: &InsertDirective,
) -> Result<(), PhaseOrderError> {
    if order.contains(&directive.phase) {
        return Err(PhaseOrderError::new(
            PhaseOrderErrorKind::DuplicatePhase,
            format!(
                "{} pipeline: cannot insert '{}', it is already in the order",
                pipeline, directive.phase
            ),
        ));
    }

    let (anchor, offset) = match (&directive.before, &directive.after) {
        (Some(before), _) => (before, 0),
        (None, Some(after)) => (after, 1),
        (None, None) => {
            return Err(PhaseOrderError::new(
                PhaseOrderErrorKind::UnknownAnchor,
                format!(
                    "{} pipeline: insert of '{}' needs 'before' or 'after'",
                    pipeline, directive.phase
                ),
            ))
        }
    };

    let Some(index) = order.iter().position(|name| name == anchor) else {
        return Err(PhaseOrderError::new(
            PhaseOrderErrorKind::UnknownAnchor,
            format!(
                "{} pipeline: cannot insert '{}' relative to '{}', which is not in the order",
                pipeline, directive.phase, anchor
            ),
        ));
    };
    order.insert(index + offset, directive.phase.clone());
    Ok(())
}

/// Insert `wait` right after `submit`
pub fn wait_after_submit() -> InsertDirective {
    InsertDirective {
        phase: crate::pipeline::builtin::WAIT.to_string(),
        before: None,
        after: Some(crate::pipeline::builtin::SUBMIT.to_string()),
    }
}
