//! Plugins compiled into the core, selected by name when a descriptor has no path.
//!
//! - `names` - facts derived from the entry's names (wildcards, count, base domain)
//! - `labels` - static labels from configuration, per-domain overrides, and
//!   selected environment keys

use super::{MetadataPlugin, MetadataRequest};
use crate::error::{CertdeckError, Result};
use crate::value::{Value, ValueMap};
use async_trait::async_trait;
use std::sync::RwLock;

/// Names of every built-in plugin, sorted.
pub const BUILTIN_NAMES: &[&str] = &["labels", "names"];

/// Instantiate the built-in called `name`.
pub fn create(name: &str) -> Option<Box<dyn MetadataPlugin>> {
    match name {
        "labels" => Some(Box::new(LabelsPlugin::default())),
        "names" => Some(Box::new(NamesPlugin::default())),
        _ => None,
    }
}

fn config_error(message: impl Into<String>) -> CertdeckError {
    CertdeckError::Config {
        message: message.into(),
    }
}

fn lock_error() -> CertdeckError {
    CertdeckError::Other("Failed to acquire plugin settings lock".to_string())
}

/// Reports name facts for each entry.
pub struct NamesPlugin {
    max_names: RwLock<u64>,
}

impl NamesPlugin {
    pub const DEFAULT_MAX_NAMES: u64 = 100;
}

impl Default for NamesPlugin {
    fn default() -> Self {
        Self {
            max_names: RwLock::new(Self::DEFAULT_MAX_NAMES),
        }
    }
}

#[async_trait]
impl MetadataPlugin for NamesPlugin {
    async fn initialize(&self, config: ValueMap) -> Result<()> {
        let max_names = match config.get("maxNames") {
            None => Self::DEFAULT_MAX_NAMES,
            Some(value) => value
                .as_u64()
                .filter(|n| *n > 0)
                .ok_or_else(|| config_error("maxNames must be a positive integer"))?,
        };
        *self.max_names.write().map_err(|_| lock_error())? = max_names;
        Ok(())
    }

    async fn get_metadata(&self, request: &MetadataRequest) -> Result<ValueMap> {
        let max_names = *self.max_names.read().map_err(|_| lock_error())?;

        let names: Vec<&str> = std::iter::once(request.domain.as_str())
            .chain(request.alternative_names.iter().map(String::as_str))
            .collect();
        let wildcard = names.iter().any(|n| n.starts_with("*."));

        let bare = request.domain.trim_start_matches("*.");
        let labels: Vec<&str> = bare.split('.').collect();
        let base_domain = if labels.len() >= 2 {
            labels[labels.len() - 2..].join(".")
        } else {
            bare.to_string()
        };
        let tld = labels.last().copied().unwrap_or_default();

        let mut out = ValueMap::new();
        out.insert("wildcard".into(), wildcard.into());
        out.insert("nameCount".into(), names.len().into());
        out.insert("names".into(), names.clone().into());
        out.insert("baseDomain".into(), base_domain.into());
        out.insert("tld".into(), tld.into());
        out.insert("overLimit".into(), (names.len() as u64 > max_names).into());
        Ok(out)
    }
}

#[derive(Debug, Default, Clone)]
struct LabelSettings {
    labels: ValueMap,
    domains: ValueMap,
    environment_keys: Vec<String>,
}

/// Attaches configured labels to each entry.
///
/// Config keys: `labels` (map applied to every entry), `domains` (domain ->
/// map layered on top for that domain), `environmentKeys` (environment
/// entries copied under `environment`).
#[derive(Default)]
pub struct LabelsPlugin {
    settings: RwLock<LabelSettings>,
}

#[async_trait]
impl MetadataPlugin for LabelsPlugin {
    async fn initialize(&self, config: ValueMap) -> Result<()> {
        let map_at = |key: &str| -> Result<ValueMap> {
            match config.get(key) {
                None => Ok(ValueMap::new()),
                Some(Value::Map(map)) => Ok(map.clone()),
                Some(other) => Err(config_error(format!(
                    "{} must be a map, got {}",
                    key,
                    other.kind()
                ))),
            }
        };

        let labels = map_at("labels")?;
        let domains = map_at("domains")?;
        if let Some((domain, other)) = domains.iter().find(|(_, v)| v.as_map().is_none()) {
            return Err(config_error(format!(
                "domains.{} must be a map, got {}",
                domain,
                other.kind()
            )));
        }

        let environment_keys: Vec<String> = match config.get("environmentKeys") {
            None => Vec::new(),
            Some(Value::List(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| config_error("environmentKeys must be a list of strings"))
                })
                .collect::<Result<_>>()?,
            Some(other) => {
                return Err(config_error(format!(
                    "environmentKeys must be a list, got {}",
                    other.kind()
                )))
            }
        };

        *self.settings.write().map_err(|_| lock_error())? = LabelSettings {
            labels,
            domains,
            environment_keys,
        };
        Ok(())
    }

    async fn get_metadata(&self, request: &MetadataRequest) -> Result<ValueMap> {
        let settings = self.settings.read().map_err(|_| lock_error())?.clone();

        let mut out = settings.labels;
        if let Some(Value::Map(overrides)) = settings.domains.get(&request.domain) {
            out.extend(overrides.clone());
        }

        let environment: ValueMap = settings
            .environment_keys
            .iter()
            .filter_map(|key| {
                request
                    .environment
                    .get(key)
                    .map(|value| (key.clone(), value.clone()))
            })
            .collect();
        if !environment.is_empty() {
            out.insert("environment".into(), Value::Map(environment));
        }
        Ok(out)
    }
}
