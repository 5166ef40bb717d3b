//! Enrichment: attach every plugin's metadata to domain entries.
//!
//! Entries are read from the registry first (a snapshot or a page copy) and
//! enriched afterwards, so no registry lock is held while plugins run. Every
//! plugin is asked concurrently; each answer lands under `metadata[plugin]`.

use crate::config::PluginTimeouts;
use crate::domains::{DomainEntry, DomainPage, DomainRegistry, ListQuery};
use crate::error::Result;
use crate::plugins::{MetadataRequest, PluginConnection, PluginRegistry};
use crate::value::ValueMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What to do when a plugin fails for an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Fail the whole read.
    #[default]
    Abort,
    /// Log and leave that plugin's metadata out.
    Skip,
}

/// Reads entries and runs them through every loaded plugin.
pub struct Enricher {
    registry: Arc<DomainRegistry>,
    plugins: Arc<PluginRegistry>,
    environment: ValueMap,
    policy: FailurePolicy,
    call_timeout: Duration,
}

impl Enricher {
    pub fn new(registry: Arc<DomainRegistry>, plugins: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            plugins,
            environment: ValueMap::new(),
            policy: FailurePolicy::default(),
            call_timeout: PluginTimeouts::default().call,
        }
    }

    /// Context passed to every plugin call.
    pub fn with_environment(mut self, environment: ValueMap) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Deadline for each `get_metadata` call.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<DomainRegistry> {
        &self.registry
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Enrich one entry in place. Metadata from plugins not loaded now is kept.
    pub async fn enrich(&self, entry: &mut DomainEntry) -> Result<()> {
        let plugins = self.plugins.all();
        if plugins.is_empty() {
            return Ok(());
        }
        self.enrich_with(&plugins, entry).await
    }

    /// Enrich a batch. Entries are processed concurrently; under
    /// [`FailurePolicy::Abort`] the first failure (in entry order) is returned.
    pub async fn enrich_all(&self, entries: &mut [DomainEntry]) -> Result<()> {
        let plugins = self.plugins.all();
        if plugins.is_empty() {
            return Ok(());
        }
        let results = join_all(
            entries
                .iter_mut()
                .map(|entry| self.enrich_with(&plugins, entry)),
        )
        .await;
        results.into_iter().collect()
    }

    /// Look up and enrich one entry.
    pub async fn get(&self, domain: &str, alias: Option<&str>) -> Result<DomainEntry> {
        let mut entry = self.registry.get(domain, alias)?;
        self.enrich(&mut entry).await?;
        Ok(entry)
    }

    /// List a page and enrich every entry on it.
    pub async fn list(&self, query: &ListQuery) -> Result<DomainPage> {
        let mut page = self.registry.list(query)?;
        self.enrich_all(&mut page.entries).await?;
        Ok(page)
    }

    async fn enrich_with(
        &self,
        plugins: &[Arc<PluginConnection>],
        entry: &mut DomainEntry,
    ) -> Result<()> {
        let request = MetadataRequest::for_entry(entry, &self.environment);
        // Every call runs to completion; a call dropped mid-exchange leaves
        // its plugin unhealthy.
        let results = join_all(
            plugins
                .iter()
                .map(|plugin| plugin.get_metadata(&request, self.call_timeout)),
        )
        .await;

        let mut first_error = None;
        for (plugin, result) in plugins.iter().zip(results) {
            match result {
                Ok(metadata) => {
                    entry.metadata.insert(plugin.name().to_string(), metadata);
                }
                Err(e) => match self.policy {
                    FailurePolicy::Abort => {
                        warn!("Plugin {} failed for {}: {}", plugin.name(), entry.domain, e);
                        first_error.get_or_insert(e);
                    }
                    FailurePolicy::Skip => {
                        warn!(
                            "Plugin {} failed for {}, skipping: {}",
                            plugin.name(),
                            entry.domain,
                            e
                        );
                    }
                },
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("Enriched {} with {} plugin(s)", entry.domain, plugins.len());
                Ok(())
            }
        }
    }
}
