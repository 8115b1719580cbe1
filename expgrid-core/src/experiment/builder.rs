// Experiment Graph Builder
// Turns templates plus combinator tuples into uniquely named instances

use crate::config::{ApplicationConfig, ExperimentConfig, WorkloadConfig, WorkspaceConfig};
use crate::experiment::filter::{check_predicate, FilterError};
use crate::experiment::instance::{ExperimentEntry, ExperimentInstance, ExperimentSet, Exclusion};
use crate::experiment::matrix::{CombinationPlan, Combinator, CombinatorError, Tuple};
use crate::variables::{
    Definition, Expander, Scope, Value, VariableError, VariableLayer, VariableStore,
};
use crate::workflow::BackendKind;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{context}: {source}")]
    Variable {
        context: String,
        #[source]
        source: VariableError,
    },

    #[error("{template}: {source}")]
    Combinator {
        template: String,
        #[source]
        source: CombinatorError,
    },

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("duplicate experiment '{namespace}' produced by templates '{first}' and '{second}'")]
    DuplicateExperimentName {
        namespace: String,
        first: String,
        second: String,
    },

    #[error("{context}: invalid value for '{variable}': {reason}")]
    InvalidValue {
        context: String,
        variable: String,
        reason: String,
    },

    #[error("{template}: unknown workflow manager '{name}'")]
    UnknownWorkflowManager { template: String, name: String },

    #[error("{} experiment templates failed to build:\n{}", .0.len(), describe_all(.0))]
    Templates(Vec<BuildError>),
}

fn describe_all(errors: &[BuildError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A build that kept going past template-level errors
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub set: ExperimentSet,
    pub errors: Vec<BuildError>,
}

/// Where one experiment template sits in the configuration
struct Template<'a> {
    application: &'a str,
    app: &'a ApplicationConfig,
    workload_key: &'a str,
    workload: &'a WorkloadConfig,
    pattern: &'a str,
    experiment: &'a ExperimentConfig,
}

impl Template<'_> {
    fn label(&self) -> String {
        format!("{}.{}.{}", self.application, self.workload_key, self.pattern)
    }
}

/// Builds the experiment set of a workspace. Pure: nothing touches disk.
pub struct ExperimentSetBuilder<'c> {
    config: &'c WorkspaceConfig,
}

impl<'c> ExperimentSetBuilder<'c> {
    pub fn new(config: &'c WorkspaceConfig) -> Self {
        Self { config }
    }

    /// Build every template; any error fails the whole build
    pub fn build(&self) -> Result<ExperimentSet, BuildError> {
        let mut outcome = self.build_lenient()?;
        match outcome.errors.len() {
            0 => Ok(outcome.set),
            1 => Err(outcome.errors.remove(0)),
            _ => Err(BuildError::Templates(outcome.errors)),
        }
    }

    /// Build what can be built. Workspace-wide problems (global variables,
    /// duplicate names) still fail outright; a broken template is reported
    /// in `errors` and skipped.
    pub fn build_lenient(&self) -> Result<BuildOutcome, BuildError> {
        let base = self.base_store()?;
        let mut outcome = BuildOutcome::default();
        let mut entries = Vec::new();
        let mut sources: Vec<String> = Vec::new();

        for template in self.templates() {
            match self.build_template(&base, &template) {
                Ok(built) => {
                    debug!(template = %template.label(), count = built.len(), "built template");
                    sources.extend(std::iter::repeat(template.label()).take(built.len()));
                    entries.extend(built);
                }
                Err(e) => outcome.errors.push(e),
            }
        }

        let mut seen: HashMap<String, &str> = HashMap::new();
        for (entry, source) in entries.iter().zip(&sources) {
            let namespace = entry.instance.namespace();
            if let Some(first) = seen.insert(namespace.clone(), source) {
                return Err(BuildError::DuplicateExperimentName {
                    namespace,
                    first: first.to_string(),
                    second: source.clone(),
                });
            }
        }

        outcome.set = ExperimentSet::new(entries);
        Ok(outcome)
    }

    fn templates(&self) -> Vec<Template<'c>> {
        let mut templates = Vec::new();
        for (application, app) in &self.config.workspace().applications {
            for (workload_key, workload) in &app.workloads {
                for (pattern, experiment) in &workload.experiments {
                    templates.push(Template {
                        application,
                        app,
                        workload_key,
                        workload,
                        pattern,
                        experiment,
                    });
                }
            }
        }
        templates
    }

    fn base_store(&self) -> Result<VariableStore, BuildError> {
        let ws = self.config.workspace();
        let builtin = VariableLayer::new(Scope::Builtin, "builtin")
            .with_variable(
                "workspace_root",
                Definition::Scalar(Value::String(self.config.root.display().to_string())),
            )
            .with_variable(
                "experiments_dir",
                Definition::Scalar(Value::String(
                    self.config.experiments_dir().display().to_string(),
                )),
            );

        let mut global = VariableLayer::new(Scope::Global, "workspace");
        global.zips = ws.zips.clone();
        global
            .extend_from_yaml(&ws.variables)
            .map_err(|source| BuildError::Variable {
                context: "workspace".to_string(),
                source,
            })?;

        Ok(VariableStore::new().with_layer(builtin).with_layer(global))
    }

    /// Template store: builtins of each scope sit under the user's own
    /// definitions at that scope
    fn template_store(
        &self,
        base: &VariableStore,
        t: &Template<'_>,
    ) -> Result<VariableStore, BuildError> {
        let wrap = |source| BuildError::Variable {
            context: t.label(),
            source,
        };

        let mut app = VariableLayer::new(Scope::Application, format!("application {}", t.application))
            .with_variable("application_name", Definition::Scalar(t.application.into()))
            .with_variable(
                "application_namespace",
                Definition::Formula("{application_name}".to_string()),
            )
            .with_variable(
                "application_run_dir",
                Definition::Formula("{experiments_dir}/{application_name}".to_string()),
            );
        app.zips = t.app.zips.clone();
        app.extend_from_yaml(&t.app.variables).map_err(wrap)?;

        let mut workload = VariableLayer::new(Scope::Workload, format!("workload {}", t.workload_key))
            .with_variable("workload_name", Definition::from_value(t.workload_key.into()))
            .with_variable(
                "workload_namespace",
                Definition::Formula("{application_name}.{workload_name}".to_string()),
            )
            .with_variable(
                "workload_run_dir",
                Definition::Formula("{application_run_dir}/{workload_name}".to_string()),
            );
        workload.zips = t.workload.zips.clone();
        workload.extend_from_yaml(&t.workload.variables).map_err(wrap)?;

        let mut experiment = VariableLayer::new(Scope::Experiment, format!("experiment {}", t.pattern))
            .with_variable("experiment_name", Definition::from_value(t.pattern.into()))
            .with_variable(
                "experiment_namespace",
                Definition::Formula(
                    "{application_name}.{workload_name}.{experiment_name}".to_string(),
                ),
            )
            .with_variable(
                "experiment_run_dir",
                Definition::Formula("{workload_run_dir}/{experiment_name}".to_string()),
            )
            .with_variable("experiment_index", Definition::Scalar(Value::Number(1.0)))
            .with_variable("repeat_index", Definition::Scalar(Value::Number(0.0)));
        experiment.zips = t.experiment.zips.clone();
        experiment
            .extend_from_yaml(&t.experiment.variables)
            .map_err(wrap)?;

        Ok(base.with_layer(app).with_layer(workload).with_layer(experiment))
    }

    fn build_template(
        &self,
        base: &VariableStore,
        t: &Template<'_>,
    ) -> Result<Vec<ExperimentEntry>, BuildError> {
        let store = self.template_store(base, t)?;
        let plan = CombinationPlan {
            matrices: t.experiment.all_matrices(),
        };
        let tuples = Combinator::new(&store)
            .expand(&plan)
            .map_err(|source| BuildError::Combinator {
                template: t.label(),
                source,
            })?;

        let excluded_names = self.excluded_names(&store, t)?;
        let mut entries = Vec::new();

        for (i, tuple) in tuples.iter().enumerate() {
            let index = i + 1;
            let bound = store.with_layer(binding_layer(tuple, index));
            let bound = match derive_mpi_layer(&bound, &context(t, tuple))? {
                Some(layer) => bound.with_layer(layer),
                None => bound,
            };

            let instance = self.materialize(&bound, t, tuple, index, 0)?;
            let exclusion = self.exclusion_for(&bound, t, &instance, &excluded_names)?;

            let n_repeats = t.experiment.n_repeats;
            let base_exclusion = match (&exclusion, n_repeats) {
                (None, n) if n > 0 => Some(Exclusion::RepeatBase),
                _ => exclusion.clone(),
            };
            let base_name = instance.name.clone();
            entries.push(ExperimentEntry {
                instance: Arc::new(instance),
                exclusion: base_exclusion,
            });

            for repeat in 1..=n_repeats {
                let repeated = bound.with_layer(
                    VariableLayer::new(Scope::Experiment, "repeat")
                        .with_variable(
                            "experiment_name",
                            Definition::Scalar(Value::String(format!("{}.{}", base_name, repeat))),
                        )
                        .with_variable(
                            "repeat_index",
                            Definition::Scalar(Value::Number(repeat as f64)),
                        ),
                );
                let instance = self.materialize(&repeated, t, tuple, index, repeat)?;
                entries.push(ExperimentEntry {
                    instance: Arc::new(instance),
                    exclusion: exclusion.clone(),
                });
            }
        }

        Ok(entries)
    }

    /// Resolve everything an instance carries
    fn materialize(
        &self,
        store: &VariableStore,
        t: &Template<'_>,
        tuple: &Tuple,
        index: usize,
        repeat_index: u32,
    ) -> Result<ExperimentInstance, BuildError> {
        let ctx = context(t, tuple);
        let wrap = |source| BuildError::Variable {
            context: ctx.clone(),
            source,
        };

        let mut expander = Expander::new(store);
        let variables = expander.resolve_all().map_err(wrap)?;
        let text = |name: &str| {
            variables
                .get(name)
                .map(Value::as_string)
                .unwrap_or_default()
        };

        let ws = self.config.workspace();
        let commands = t
            .experiment
            .commands
            .as_ref()
            .or(t.workload.commands.as_ref())
            .or(t.app.commands.as_ref())
            .or(ws.commands.as_ref())
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(|c| expander.expand(c))
            .collect::<Result<Vec<_>, _>>()
            .map_err(wrap)?;

        let workflow_manager = match t
            .experiment
            .workflow_manager
            .as_ref()
            .or(t.workload.workflow_manager.as_ref())
            .or(t.app.workflow_manager.as_ref())
            .or(ws.workflow_manager.as_ref())
        {
            Some(raw) => {
                let name = expander.expand(raw).map_err(wrap)?;
                name.parse::<BackendKind>()
                    .map_err(|_| BuildError::UnknownWorkflowManager {
                        template: t.label(),
                        name,
                    })?
            }
            None => BackendKind::None,
        };

        let tags: BTreeSet<String> = ws
            .tags
            .iter()
            .chain(&t.app.tags)
            .chain(&t.workload.tags)
            .chain(&t.experiment.tags)
            .cloned()
            .collect();

        let environment_name = variables
            .get("env_name")
            .map(Value::as_string)
            .unwrap_or_else(|| t.application.to_string());
        let environment = ws
            .software
            .environments
            .contains_key(&environment_name)
            .then_some(environment_name);

        Ok(ExperimentInstance {
            application: t.application.to_string(),
            workload: text("workload_name"),
            name: text("experiment_name"),
            template: t.pattern.to_string(),
            index,
            repeat_index,
            run_dir: PathBuf::from(text("experiment_run_dir")),
            commands,
            tags,
            workflow_manager,
            environment,
            variables,
        })
    }

    /// Rendered `(workload, name)` pairs of the template's exclude block
    fn excluded_names(
        &self,
        store: &VariableStore,
        t: &Template<'_>,
    ) -> Result<BTreeSet<(String, String)>, BuildError> {
        let exclude = &t.experiment.exclude;
        let mut names = BTreeSet::new();
        if !exclude.has_name_set() {
            return Ok(names);
        }

        let label = format!("{} (exclude)", t.label());
        let mut layer = VariableLayer::new(Scope::Experiment, "exclude");
        layer.zips = exclude.zips.clone();
        layer
            .extend_from_yaml(&exclude.variables)
            .map_err(|source| BuildError::Variable {
                context: label.clone(),
                source,
            })?;
        let store = store.with_layer(layer);

        let tuples = Combinator::new(&store)
            .expand(&CombinationPlan {
                matrices: exclude.all_matrices(),
            })
            .map_err(|source| BuildError::Combinator {
                template: label.clone(),
                source,
            })?;

        for (i, tuple) in tuples.iter().enumerate() {
            let bound = store.with_layer(binding_layer(tuple, i + 1));
            let bound = match derive_mpi_layer(&bound, &label)? {
                Some(layer) => bound.with_layer(layer),
                None => bound,
            };
            let mut expander = Expander::new(&bound);
            let resolve = |expander: &mut Expander<'_>, name: &str| {
                expander
                    .resolve_scalar(name)
                    .map(|v| v.as_string())
                    .map_err(|source| BuildError::Variable {
                        context: label.clone(),
                        source,
                    })
            };
            let workload = resolve(&mut expander, "workload_name")?;
            let name = resolve(&mut expander, "experiment_name")?;
            names.insert((workload, name));
        }

        Ok(names)
    }

    fn exclusion_for(
        &self,
        store: &VariableStore,
        t: &Template<'_>,
        instance: &ExperimentInstance,
        excluded_names: &BTreeSet<(String, String)>,
    ) -> Result<Option<Exclusion>, BuildError> {
        if excluded_names.contains(&(instance.workload.clone(), instance.name.clone())) {
            return Ok(Some(Exclusion::ExcludedByName));
        }

        let namespace = instance.namespace();
        let mut expander = Expander::new(store);
        for predicate in &t.experiment.exclude.exclude_where {
            if check_predicate(&mut expander, &namespace, predicate)? {
                return Ok(Some(Exclusion::ExcludedByPredicate(predicate.clone())));
            }
        }
        for predicate in &t.experiment.include_where {
            if !check_predicate(&mut expander, &namespace, predicate)? {
                return Ok(Some(Exclusion::NotIncluded(predicate.clone())));
            }
        }
        Ok(None)
    }
}

fn context(t: &Template<'_>, tuple: &Tuple) -> String {
    if tuple.is_empty() {
        return t.label();
    }
    let bindings: Vec<String> = tuple.iter().map(|(n, v)| format!("{}={}", n, v)).collect();
    format!("{} [{}]", t.label(), bindings.join(", "))
}

/// Experiment-scope overrides for one tuple
fn binding_layer(tuple: &Tuple, index: usize) -> VariableLayer {
    let mut layer = VariableLayer::new(Scope::Experiment, "binding")
        .with_variable("experiment_index", Definition::Scalar(Value::Number(index as f64)));
    for (name, value) in tuple.iter() {
        layer.set(name, Definition::from_value(value.clone()));
    }
    layer
}

const N_RANKS: &str = "n_ranks";
const PPN: &str = "processes_per_node";
const N_NODES: &str = "n_nodes";
const N_THREADS: &str = "n_threads";

/// Fill in whichever of ranks / processes per node / nodes is missing.
/// Values the user defined are never overridden.
fn derive_mpi_layer(store: &VariableStore, ctx: &str) -> Result<Option<VariableLayer>, BuildError> {
    let mut expander = Expander::new(store);
    let mut number = |name: &str| -> Result<Option<f64>, BuildError> {
        if !store.contains(name) {
            return Ok(None);
        }
        let value = expander
            .resolve_scalar(name)
            .map_err(|source| BuildError::Variable {
                context: ctx.to_string(),
                source,
            })?;
        match value.as_number() {
            Some(n) if n > 0.0 => Ok(Some(n)),
            _ => Err(BuildError::InvalidValue {
                context: ctx.to_string(),
                variable: name.to_string(),
                reason: format!("expected a positive number, found '{}'", value),
            }),
        }
    };

    let ranks = number(N_RANKS)?;
    let ppn = number(PPN)?;
    let nodes = number(N_NODES)?;

    let mut layer = VariableLayer::new(Scope::Experiment, "derived");
    let mut set = |name: &str, n: f64| layer.set(name, Definition::Scalar(Value::Number(n)));

    match (ranks, ppn, nodes) {
        (Some(r), Some(p), None) => set(N_NODES, (r / p).ceil()),
        (Some(r), None, Some(n)) => set(PPN, (r / n).ceil()),
        (None, Some(p), Some(n)) => set(N_RANKS, p * n),
        (Some(r), None, None) => {
            set(N_NODES, 1.0);
            set(PPN, r);
        }
        (None, Some(p), None) => {
            set(N_NODES, 1.0);
            set(N_RANKS, p);
        }
        (None, None, None) => set(N_NODES, 1.0),
        (None, None, Some(_)) | (Some(_), Some(_), Some(_)) => {}
    }
    if !store.contains(N_THREADS) {
        set(N_THREADS, 1.0);
    }

    Ok((!layer.variables.is_empty()).then_some(layer))
}
