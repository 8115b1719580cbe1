// Software Provisioning
// Installs each software environment at most once per run

use crate::config::{EnvironmentConfig, SoftwareConfig};
use crate::variables::{Definition, Expander, Scope, Value, VariableLayer, VariableStore};
use crate::workflow::CommandRunner;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallError {
    #[error("unknown software environment '{environment}'")]
    UnknownEnvironment { environment: String },

    #[error("environment '{environment}': install command is invalid: {message}")]
    InvalidCommand {
        environment: String,
        message: String,
    },

    #[error("environment '{environment}': failed to run install command: {message}")]
    Spawn {
        environment: String,
        message: String,
    },

    #[error("environment '{environment}': install command exited with {code}: {message}")]
    Failed {
        environment: String,
        code: String,
        message: String,
    },
}

/// What an installer reports back for one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallManifest {
    pub environment: String,
    pub packages: Vec<String>,
    /// `user` when nothing was installed
    pub installed_by: String,
}

/// Package/build collaborator behind the software_install phase
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(
        &self,
        environment: &str,
        spec: &EnvironmentConfig,
    ) -> Result<InstallManifest, InstallError>;
}

/// Environments the user provisions themselves
#[derive(Debug, Clone, Copy, Default)]
pub struct UserManaged;

#[async_trait]
impl Installer for UserManaged {
    async fn install(
        &self,
        environment: &str,
        spec: &EnvironmentConfig,
    ) -> Result<InstallManifest, InstallError> {
        debug!(environment, "environment is user-managed");
        Ok(InstallManifest {
            environment: environment.to_string(),
            packages: spec.packages.clone(),
            installed_by: "user".to_string(),
        })
    }
}

/// Runs `install_command` through the shell, with `{environment}` and
/// `{packages}` substituted
pub struct CommandInstaller {
    template: String,
    shell: String,
    working_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl CommandInstaller {
    pub fn new(
        template: impl Into<String>,
        shell: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            template: template.into(),
            shell: shell.into(),
            working_dir: working_dir.into(),
            runner,
        }
    }

    fn render(&self, environment: &str, spec: &EnvironmentConfig) -> Result<String, InstallError> {
        let layer = VariableLayer::new(Scope::Builtin, "install")
            .with_variable(
                "environment",
                Definition::Scalar(Value::from(environment)),
            )
            .with_variable(
                "packages",
                Definition::Scalar(Value::String(spec.packages.join(" "))),
            );
        let store = VariableStore::new().with_layer(layer);
        Expander::new(&store)
            .expand(&self.template)
            .map_err(|e| InstallError::InvalidCommand {
                environment: environment.to_string(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl Installer for CommandInstaller {
    async fn install(
        &self,
        environment: &str,
        spec: &EnvironmentConfig,
    ) -> Result<InstallManifest, InstallError> {
        let command = self.render(environment, spec)?;
        info!(environment, command = %command, "installing software environment");

        let output = self
            .runner
            .run(
                &self.shell,
                &["-c".to_string(), command],
                Some(&self.working_dir),
            )
            .await
            .map_err(|e| InstallError::Spawn {
                environment: environment.to_string(),
                message: e.to_string(),
            })?;

        if !output.success() {
            return Err(InstallError::Failed {
                environment: environment.to_string(),
                code: output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                message: output.diagnostic(),
            });
        }

        Ok(InstallManifest {
            environment: environment.to_string(),
            packages: spec.packages.clone(),
            installed_by: self.template.clone(),
        })
    }
}

type InstallCell = Arc<OnceCell<Result<InstallManifest, InstallError>>>;

/// Shared by every instance of a run. Concurrent requests for the same
/// environment wait on one installation and share its result.
pub struct Provisioner {
    installer: Arc<dyn Installer>,
    environments: BTreeMap<String, EnvironmentConfig>,
    cells: Mutex<HashMap<String, InstallCell>>,
}

impl Provisioner {
    pub fn new(
        installer: Arc<dyn Installer>,
        environments: BTreeMap<String, EnvironmentConfig>,
    ) -> Self {
        Self {
            installer,
            environments,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// User-managed unless the workspace sets `install_command`
    pub fn from_config(
        software: &SoftwareConfig,
        shell: &str,
        working_dir: PathBuf,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let installer: Arc<dyn Installer> = match &software.install_command {
            Some(template) => Arc::new(CommandInstaller::new(
                template.clone(),
                shell,
                working_dir,
                runner,
            )),
            None => Arc::new(UserManaged),
        };
        Self::new(installer, software.environments.clone())
    }

    pub async fn ensure(&self, environment: &str) -> Result<InstallManifest, InstallError> {
        let spec = self
            .environments
            .get(environment)
            .ok_or_else(|| InstallError::UnknownEnvironment {
                environment: environment.to_string(),
            })?;

        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(cells.entry(environment.to_string()).or_default())
        };

        cell.get_or_init(|| self.installer.install(environment, spec))
            .await
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::runner::tests::ScriptedRunner;
    use crate::workflow::ProcessRunner;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingInstaller {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Installer for CountingInstaller {
        async fn install(
            &self,
            environment: &str,
            spec: &EnvironmentConfig,
        ) -> Result<InstallManifest, InstallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(InstallManifest {
                environment: environment.to_string(),
                packages: spec.packages.clone(),
                installed_by: "test".to_string(),
            })
        }
    }

    fn environments() -> BTreeMap<String, EnvironmentConfig> {
        BTreeMap::from([
            (
                "hostname".to_string(),
                EnvironmentConfig {
                    packages: vec!["hostname".to_string(), "coreutils".to_string()],
                },
            ),
            ("gromacs".to_string(), EnvironmentConfig::default()),
        ])
    }

    #[tokio::test]
    async fn test_concurrent_requests_install_once() {
        let installer = Arc::new(CountingInstaller {
            calls: AtomicUsize::new(0),
        });
        let provisioner = Arc::new(Provisioner::new(installer.clone(), environments()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provisioner = Arc::clone(&provisioner);
            handles.push(tokio::spawn(async move {
                provisioner.ensure("hostname").await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        provisioner.ensure("gromacs").await.unwrap();

        assert_eq!(installer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_environment() {
        let provisioner = Provisioner::new(Arc::new(UserManaged), environments());
        assert_eq!(
            provisioner.ensure("lammps").await.unwrap_err(),
            InstallError::UnknownEnvironment {
                environment: "lammps".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_command_installer_substitutes_packages() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("/bin/sh", "", 0);
        let installer = CommandInstaller::new(
            "spack install {packages} # ${SPACK_ROOT}",
            "/bin/sh",
            "/ws",
            runner.clone(),
        );

        let manifest = installer
            .install("hostname", &environments()["hostname"])
            .await
            .unwrap();
        assert_eq!(manifest.packages.len(), 2);
        assert_eq!(
            runner.calls()[0][2],
            "spack install hostname coreutils # ${SPACK_ROOT}"
        );
    }

    #[tokio::test]
    async fn test_failed_install_is_shared() {
        let temp = tempfile::tempdir().unwrap();
        let software = SoftwareConfig {
            install_command: Some("echo cannot install {environment} >&2; exit 4".to_string()),
            environments: environments(),
        };
        let provisioner = Provisioner::from_config(
            &software,
            "sh",
            temp.path().to_path_buf(),
            Arc::new(ProcessRunner::new()),
        );

        let first = provisioner.ensure("gromacs").await.unwrap_err();
        let second = provisioner.ensure("gromacs").await.unwrap_err();
        assert_eq!(first, second);
        assert!(matches!(
            first,
            InstallError::Failed { ref code, ref message, .. }
                if code == "4" && message == "cannot install gromacs"
        ));
    }
}
