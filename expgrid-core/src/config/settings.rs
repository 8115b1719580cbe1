// Run Settings
// Layered defaults -> user file -> workspace block -> command line

use crate::config::error::{ConfigError, ParseError};
use crate::config::model::SettingsFile;

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reference polling interval for scheduler queries
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Effective settings for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Instances processed concurrently
    pub max_parallel: usize,
    pub poll_interval: Duration,
    /// Upper bound on a single wait; `None` waits until a terminal state
    pub wait_timeout: Option<Duration>,
    pub shell: String,
    /// Add the dependencies of explicitly selected phases back in
    pub include_phase_dependencies: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            poll_interval: DEFAULT_POLL_INTERVAL,
            wait_timeout: None,
            shell: DEFAULT_SHELL.to_string(),
            include_phase_dependencies: true,
        }
    }
}

impl Settings {
    /// Overlay the values present in `layer`
    pub fn apply(&mut self, layer: &SettingsFile) {
        if let Some(max_parallel) = layer.max_parallel {
            self.max_parallel = max_parallel.max(1);
        }
        if let Some(secs) = layer.poll_interval_secs {
            self.poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = layer.wait_timeout_secs {
            self.wait_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(shell) = &layer.shell {
            self.shell = shell.clone();
        }
        if let Some(include) = layer.include_phase_dependencies {
            self.include_phase_dependencies = include;
        }
    }

    /// `<config_dir>/expgrid/settings.yaml`
    pub fn user_settings_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("expgrid").join("settings.yaml"))
    }

    /// Read a settings file; a missing file is not an error
    pub fn read_layer(path: &Path) -> Result<Option<SettingsFile>, ConfigError> {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_yaml::from_str(&source)
            .map(Some)
            .map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: ParseError::from_yaml_error(&e, &source),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.poll_interval, Duration::from_secs(10));
        assert_eq!(settings.wait_timeout, None);
        assert!(settings.include_phase_dependencies);
    }

    #[test]
    fn test_apply_layers_in_order() {
        let mut settings = Settings::default();
        settings.apply(&SettingsFile {
            max_parallel: Some(8),
            poll_interval_secs: Some(30),
            ..Default::default()
        });
        settings.apply(&SettingsFile {
            max_parallel: Some(2),
            ..Default::default()
        });

        assert_eq!(settings.max_parallel, 2);
        assert_eq!(settings.poll_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_apply_clamps_zero_values() {
        let mut settings = Settings::default();
        settings.apply(&SettingsFile {
            max_parallel: Some(0),
            poll_interval_secs: Some(0),
            ..Default::default()
        });
        assert_eq!(settings.max_parallel, 1);
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_read_layer_missing_file() {
        let temp = tempfile::tempdir().unwrap();
        assert!(Settings::read_layer(&temp.path().join("none.yaml"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_read_layer_reports_parse_errors() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("settings.yaml");
        std::fs::write(&path, "max_paralel: 3\n").unwrap();

        let err = Settings::read_layer(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
