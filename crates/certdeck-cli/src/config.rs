//! Configuration file loading.
//!
//! ```json
//! {
//!   "domainsFile": "domains.txt",
//!   "environment": {"stage": "prod"},
//!   "plugins": {
//!     "names": {},
//!     "audit": {"path": "/opt/certdeck/audit-plugin", "config": {"level": 2}},
//!     "labels": {"enabled": false}
//!   },
//!   "timeouts": {"initializeSecs": 10, "callSecs": 30, "closeSecs": 5},
//!   "failurePolicy": "skip"
//! }
//! ```
//!
//! Relative paths are resolved against the directory holding the config file.

use anyhow::{Context, Result};
use certdeck_core::config::AppConfig;
use certdeck_core::{FailurePolicy, PluginDescriptor, PluginTimeouts, ValueMap};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CliConfig {
    #[serde(default)]
    pub domains_file: Option<PathBuf>,
    #[serde(default)]
    pub environment: ValueMap,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginDescriptor>,
    #[serde(default)]
    pub timeouts: Option<PluginTimeouts>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Directory of the file this was loaded from.
    #[serde(skip)]
    base_dir: PathBuf,
}

impl CliConfig {
    /// `<config dir>/certdeck/config.json`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| {
            dir.join(AppConfig::CONFIG_DIR_NAME)
                .join(AppConfig::CONFIG_FILE_NAME)
        })
    }

    /// Load `path`. A missing file is only an error when `required`.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                debug!("No config file at {}, using defaults", path.display());
                return Ok(Self {
                    base_dir,
                    ..Self::default()
                });
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config {}", path.display()))
            }
        };

        let mut config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.base_dir = base_dir;
        Ok(config)
    }

    /// The backing file: `override_path` if given, else the configured or
    /// default file next to the config.
    pub fn domains_file(&self, override_path: Option<&Path>) -> PathBuf {
        match override_path {
            Some(path) => path.to_path_buf(),
            None => self.resolve(
                self.domains_file
                    .as_deref()
                    .unwrap_or_else(|| Path::new(AppConfig::DEFAULT_DOMAINS_FILE)),
            ),
        }
    }

    /// Plugin descriptors in name order, with names filled in from the map
    /// keys and relative executable paths resolved.
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.plugins
            .iter()
            .map(|(name, descriptor)| {
                let path = if descriptor.is_builtin() {
                    PathBuf::new()
                } else {
                    self.resolve(&descriptor.path)
                };
                PluginDescriptor {
                    name: name.clone(),
                    path,
                    ..descriptor.clone()
                }
            })
            .collect()
    }

    pub fn timeouts(&self) -> PluginTimeouts {
        self.timeouts.unwrap_or_default()
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_missing_optional_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        let config = CliConfig::load(&path, false).unwrap();

        assert!(config.plugins.is_empty());
        assert_eq!(config.failure_policy, FailurePolicy::Abort);
        assert_eq!(config.domains_file(None), temp_dir.path().join("domains.txt"));
        assert!(CliConfig::load(&path, true).is_err());
    }

    #[test]
    fn test_full_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "domainsFile": "lists/prod.txt",
                "environment": {"stage": "prod"},
                "plugins": {
                    "names": {},
                    "audit": {"path": "bin/audit", "config": {"level": 2}},
                    "labels": {"enabled": false}
                },
                "timeouts": {"initializeSecs": 2, "callSecs": 0.5, "closeSecs": 1},
                "failurePolicy": "skip"
            }"#,
        )
        .unwrap();

        let config = CliConfig::load(&path, true).unwrap();
        assert_eq!(
            config.domains_file(None),
            temp_dir.path().join("lists/prod.txt")
        );
        assert_eq!(
            config.domains_file(Some(Path::new("/tmp/other.txt"))),
            PathBuf::from("/tmp/other.txt")
        );
        assert_eq!(config.failure_policy, FailurePolicy::Skip);
        assert_eq!(config.timeouts().call, Duration::from_millis(500));

        let descriptors = config.descriptors();
        let names: Vec<_> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["audit", "labels", "names"]);
        assert_eq!(descriptors[0].path, temp_dir.path().join("bin/audit"));
        assert!(!descriptors[1].enabled);
        assert!(descriptors[2].is_builtin());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, r#"{"domainFile": "typo.txt"}"#).unwrap();
        assert!(CliConfig::load(&path, true).is_err());
    }
}
