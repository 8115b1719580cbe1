// Custom Phases
// User-declared phases that run a shell command in the run directory

use crate::config::CustomPhaseConfig;
use crate::experiment::ExperimentInstance;
use crate::pipeline::phase::{Phase, PhaseContext, PhaseError, PhaseKind};
use crate::variables::{Definition, Expander, Scope, VariableError, VariableLayer, VariableStore};

use async_trait::async_trait;
use tracing::debug;

pub struct CustomPhase {
    name: String,
    kind: PhaseKind,
    depends_on: Vec<String>,
    command: String,
}

impl CustomPhase {
    pub fn new(name: impl Into<String>, config: &CustomPhaseConfig) -> Self {
        Self {
            name: name.into(),
            kind: if config.destructive {
                PhaseKind::Destructive
            } else {
                PhaseKind::Local
            },
            depends_on: config.depends_on.clone(),
            command: config.command.clone(),
        }
    }

    /// Substitute the instance's resolved variables into the command
    fn render(&self, instance: &ExperimentInstance) -> Result<String, VariableError> {
        let mut layer = VariableLayer::new(Scope::Experiment, instance.namespace());
        for (name, value) in &instance.variables {
            layer.set(name.clone(), Definition::Scalar(value.clone()));
        }
        let store = VariableStore::new().with_layer(layer);
        Expander::new(&store).expand(&self.command)
    }
}

#[async_trait]
impl Phase for CustomPhase {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PhaseKind {
        self.kind
    }

    fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<Option<String>, PhaseError> {
        let command = self
            .render(ctx.instance)
            .map_err(|source| PhaseError::Variable {
                experiment: ctx.experiment(),
                phase: self.name.clone(),
                source,
            })?;

        std::fs::create_dir_all(&ctx.instance.run_dir)
            .map_err(ctx.io_error(&ctx.instance.run_dir))?;

        debug!(experiment = %ctx.experiment(), phase = %self.name, command = %command, "running");
        let shell = &ctx.services.settings.shell;
        let output = ctx
            .services
            .shell
            .run(
                shell,
                &["-c".to_string(), command.clone()],
                Some(&ctx.instance.run_dir),
            )
            .await
            .map_err(ctx.io_error(&ctx.instance.run_dir))?;

        if !output.success() {
            return Err(PhaseError::Command {
                experiment: ctx.experiment(),
                phase: self.name.clone(),
                command,
                code: output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                message: output.diagnostic(),
            });
        }

        let last_line = output.stdout.lines().last().map(str::to_string);
        Ok(last_line.filter(|line| !line.trim().is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::experiment::instance::tests::sample_instance;
    use crate::pipeline::phase::{PhaseServices, PipelineKind};

    fn config(command: &str, destructive: bool) -> CustomPhaseConfig {
        CustomPhaseConfig {
            pipeline: "setup".to_string(),
            command: command.to_string(),
            depends_on: vec!["make_experiments".to_string()],
            destructive,
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(CustomPhase::new("a", &config("true", false)).kind(), PhaseKind::Local);
        assert_eq!(
            CustomPhase::new("b", &config("rm -rf {experiment_run_dir}", true)).kind(),
            PhaseKind::Destructive
        );
    }

    #[tokio::test]
    async fn test_runs_in_run_dir_with_variables() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = WorkspaceConfig::parse(temp.path(), "workspace: {}\n").unwrap();
        let services = PhaseServices::new(&workspace);
        let instance = sample_instance("a", temp.path());

        let phase = CustomPhase::new(
            "stage_inputs",
            &config("echo nodes={n_nodes} > staged.txt; X=done; echo ${X}", false),
        );
        let ctx = PhaseContext {
            instance: &instance,
            pipeline: PipelineKind::Setup,
            dry_run: false,
            force: false,
            services: &services,
        };

        let detail = phase.run(&ctx).await.unwrap();
        assert_eq!(detail.as_deref(), Some("done"));
        let staged = std::fs::read_to_string(instance.run_dir.join("staged.txt")).unwrap();
        assert_eq!(staged.trim(), "nodes=1");
    }

    #[tokio::test]
    async fn test_failure_reports_command_and_exit_code() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = WorkspaceConfig::parse(temp.path(), "workspace: {}\n").unwrap();
        let services = PhaseServices::new(&workspace);
        let instance = sample_instance("a", temp.path());

        let phase = CustomPhase::new("check", &config("echo broken >&2; exit 7", false));
        let ctx = PhaseContext {
            instance: &instance,
            pipeline: PipelineKind::Setup,
            dry_run: false,
            force: false,
            services: &services,
        };

        match phase.run(&ctx).await.unwrap_err() {
            PhaseError::Command { code, message, phase, .. } => {
                assert_eq!(code, "7");
                assert_eq!(message, "broken");
                assert_eq!(phase, "check");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undefined_variable_names_phase() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = WorkspaceConfig::parse(temp.path(), "workspace: {}\n").unwrap();
        let services = PhaseServices::new(&workspace);
        let instance = sample_instance("a", temp.path());

        let phase = CustomPhase::new("stage", &config("cp {input_file} .", false));
        let ctx = PhaseContext {
            instance: &instance,
            pipeline: PipelineKind::Setup,
            dry_run: false,
            force: false,
            services: &services,
        };

        let err = phase.run(&ctx).await.unwrap_err();
        assert!(matches!(err, PhaseError::Variable { ref phase, .. } if phase == "stage"));
        assert!(err.to_string().contains("input_file"));
    }
}
