//! Metadata plugins.
//!
//! A plugin answers one question: given a domain entry, what extra metadata
//! goes with it. Plugins either run in process (built-ins) or as a child
//! process speaking the framed JSON-RPC protocol in [`protocol`]. Both kinds
//! sit behind the same [`PluginConnection`].

pub mod builtin;
pub mod connection;
pub mod protocol;
pub mod registry;
pub mod sdk;
pub mod transport;

pub use connection::{PluginConnection, PluginInfo, PluginKind};
pub use registry::PluginRegistry;
pub use transport::ExternalPlugin;

use crate::domains::DomainEntry;
use crate::error::Result;
use crate::value::ValueMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What a plugin is asked about for each entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRequest {
    pub domain: String,
    #[serde(default)]
    pub alternative_names: Vec<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub comment: String,
    /// Deployment context shared by every call (environment name, region, ...).
    #[serde(default)]
    pub environment: ValueMap,
}

impl MetadataRequest {
    pub fn for_entry(entry: &DomainEntry, environment: &ValueMap) -> Self {
        Self {
            domain: entry.domain.clone(),
            alternative_names: entry.alternative_names.clone(),
            alias: entry.alias.clone(),
            enabled: entry.enabled,
            comment: entry.comment.clone(),
            environment: environment.clone(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// The three-operation plugin contract.
///
/// `initialize` is called once before any `get_metadata`; `close` once at the
/// end. Implementations are shared across tasks, so they take `&self`.
#[async_trait]
pub trait MetadataPlugin: Send + Sync + 'static {
    /// Receive the plugin's configuration map.
    async fn initialize(&self, config: ValueMap) -> Result<()>;

    /// Produce metadata for one entry.
    async fn get_metadata(&self, request: &MetadataRequest) -> Result<ValueMap>;

    /// Release whatever `initialize` acquired.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// How a plugin is declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    /// Registry name. Filled from the configuration map key when absent.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Absolute path to the plugin executable. Empty selects a built-in by name.
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub config: ValueMap,
}

impl PluginDescriptor {
    /// An enabled built-in with no configuration.
    pub fn builtin(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            path: PathBuf::new(),
            config: ValueMap::new(),
        }
    }

    pub fn external(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::builtin(name)
        }
    }

    pub fn with_config(mut self, config: ValueMap) -> Self {
        self.config = config;
        self
    }

    pub fn is_builtin(&self) -> bool {
        self.path.as_os_str().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_entry() {
        let entry = DomainEntry::new("example.com")
            .with_alternative_names(["www.example.com"])
            .with_alias("edge");
        let mut environment = ValueMap::new();
        environment.insert("stage".into(), "prod".into());

        let request = MetadataRequest::for_entry(&entry, &environment);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "domain": "example.com",
                "alternativeNames": ["www.example.com"],
                "alias": "edge",
                "enabled": true,
                "comment": "",
                "environment": {"stage": "prod"}
            })
        );
    }

    #[test]
    fn test_descriptor_defaults() {
        let descriptor: PluginDescriptor = serde_json::from_str("{}").unwrap();
        assert!(descriptor.enabled);
        assert!(descriptor.is_builtin());
        assert!(descriptor.config.is_empty());

        let descriptor: PluginDescriptor =
            serde_json::from_str(r#"{"enabled": false, "path": "/opt/plugin", "config": {"k": 1}}"#)
                .unwrap();
        assert!(!descriptor.enabled);
        assert!(!descriptor.is_builtin());
        assert_eq!(descriptor.config["k"].as_i64(), Some(1));
    }
}
