// Configuration Module
// Loads expgrid.yaml and the layered run settings

pub mod error;
pub mod model;
pub mod settings;

pub use error::{ConfigError, ParseError};
pub use model::{
    ApplicationConfig, CustomPhaseConfig, EnvironmentConfig, ExcludeConfig, ExperimentConfig,
    InsertDirective, PhaseOverride, SettingsFile, SoftwareConfig, WorkloadConfig, WorkspaceFile,
    WorkspaceSection,
};
pub use settings::{Settings, DEFAULT_POLL_INTERVAL, DEFAULT_SHELL};

use crate::utils::WORKSPACE_FILE;

use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory under the workspace root holding experiment run directories
pub const EXPERIMENTS_DIR: &str = "experiments";

/// A loaded workspace. Immutable after load and shared by reference.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    pub file: WorkspaceFile,
    pub settings: Settings,
}

impl WorkspaceConfig {
    /// Load `<root>/expgrid.yaml`, layering user settings underneath
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        Self::load_with_user_settings(root, Settings::user_settings_path().as_deref())
    }

    pub fn load_with_user_settings(
        root: &Path,
        user_settings: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let path = root.join(WORKSPACE_FILE);
        let source = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        let mut settings = Settings::default();
        if let Some(user_path) = user_settings {
            if let Some(layer) = Settings::read_layer(user_path)? {
                debug!(path = %user_path.display(), "applied user settings");
                settings.apply(&layer);
            }
        }

        Self::parse_with_settings(root, &source, settings)
    }

    /// Parse workspace YAML with default settings underneath
    pub fn parse(root: &Path, source: &str) -> Result<Self, ConfigError> {
        Self::parse_with_settings(root, source, Settings::default())
    }

    fn parse_with_settings(
        root: &Path,
        source: &str,
        mut settings: Settings,
    ) -> Result<Self, ConfigError> {
        let path = root.join(WORKSPACE_FILE);
        let file: WorkspaceFile =
            serde_yaml::from_str(source).map_err(|e| ConfigError::Parse {
                path: path.clone(),
                source: ParseError::from_yaml_error(&e, source),
            })?;

        settings.apply(&file.settings);

        let config = Self {
            root: root.to_path_buf(),
            file,
            settings,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            path: self.root.join(WORKSPACE_FILE),
            message,
        };

        for (name, override_) in &self.workspace().phases {
            for directive in &override_.insert {
                if directive.before.is_some() == directive.after.is_some() {
                    return Err(invalid(format!(
                        "insert directive for phase '{}' needs exactly one of 'before' or 'after'",
                        directive.phase
                    )));
                }
            }

            if override_.order.is_some() && !override_.insert.is_empty() {
                return Err(invalid(format!(
                    "pipeline '{}' sets both 'order' and 'insert'",
                    name
                )));
            }
        }

        Ok(())
    }

    pub fn workspace(&self) -> &WorkspaceSection {
        &self.file.workspace
    }

    pub fn experiments_dir(&self) -> PathBuf {
        self.root.join(EXPERIMENTS_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_layers_settings() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(
            temp.path().join(WORKSPACE_FILE),
            "settings:\n  max_parallel: 3\nworkspace: {}\n",
        )
        .unwrap();
        let user = temp.path().join("user.yaml");
        std::fs::write(&user, "max_parallel: 9\npoll_interval_secs: 20\n").unwrap();

        let config = WorkspaceConfig::load_with_user_settings(temp.path(), Some(&user)).unwrap();
        assert_eq!(config.settings.max_parallel, 3);
        assert_eq!(config.settings.poll_interval.as_secs(), 20);
        assert_eq!(config.experiments_dir(), temp.path().join("experiments"));
    }

    #[test]
    fn test_load_missing_file() {
        let temp = tempfile::tempdir().unwrap();
        assert!(matches!(
            WorkspaceConfig::load_with_user_settings(temp.path(), None),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = WorkspaceConfig::parse(Path::new("/ws"), "workspace:\n  variables: [1\n")
            .unwrap_err();
        match err {
            ConfigError::Parse { source, .. } => assert!(source.line >= 2),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_insert_directive_needs_one_anchor() {
        let source = "workspace:\n  phases:\n    setup:\n      insert:\n        - { phase: x }\n";
        assert!(matches!(
            WorkspaceConfig::parse(Path::new("/ws"), source),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_order_and_insert_are_exclusive() {
        let source = "workspace:\n  phases:\n    setup:\n      order: [a]\n      insert:\n        - { phase: x, after: a }\n";
        assert!(matches!(
            WorkspaceConfig::parse(Path::new("/ws"), source),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
