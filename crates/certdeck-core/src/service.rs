//! One-stop construction of the registry, plugins and watcher.

use crate::config::PluginTimeouts;
use crate::domains::DomainRegistry;
use crate::enrich::{Enricher, FailurePolicy};
use crate::error::Result;
use crate::plugins::{PluginDescriptor, PluginRegistry};
use crate::value::ValueMap;
use crate::watcher::ChangeWatcher;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tracing::{info, warn};

/// Builder for [`CertdeckService`].
///
/// # Example
///
/// ```rust,ignore
/// use certdeck_core::CertdeckService;
///
/// let service = CertdeckService::builder("/etc/certdeck/domains.txt")
///     .plugins(descriptors)
///     .watch(true)
///     .build()
///     .await?;
/// let page = service.enricher().list(&Default::default()).await?;
/// service.shutdown().await?;
/// ```
pub struct CertdeckServiceBuilder {
    domains_file: PathBuf,
    plugins: Vec<PluginDescriptor>,
    environment: ValueMap,
    timeouts: PluginTimeouts,
    policy: FailurePolicy,
    watch: bool,
}

impl CertdeckServiceBuilder {
    pub fn new(domains_file: impl Into<PathBuf>) -> Self {
        Self {
            domains_file: domains_file.into(),
            plugins: Vec::new(),
            environment: ValueMap::new(),
            timeouts: PluginTimeouts::default(),
            policy: FailurePolicy::default(),
            watch: false,
        }
    }

    /// Plugins to load, in order. Disabled descriptors are skipped.
    pub fn plugins(mut self, descriptors: Vec<PluginDescriptor>) -> Self {
        self.plugins = descriptors;
        self
    }

    pub fn environment(mut self, environment: ValueMap) -> Self {
        self.environment = environment;
        self
    }

    pub fn timeouts(mut self, timeouts: PluginTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Reload the registry when the backing file changes on disk.
    ///
    /// Default: `false`
    pub fn watch(mut self, enable: bool) -> Self {
        self.watch = enable;
        self
    }

    /// Open the registry, load plugins and start the watcher.
    ///
    /// If any plugin fails to load, the ones already loaded are closed before
    /// the error is returned.
    pub async fn build(self) -> Result<CertdeckService> {
        let registry = Arc::new(DomainRegistry::open(&self.domains_file)?);
        let plugins = Arc::new(PluginRegistry::new());

        if let Err(e) = plugins.load_descriptors(&self.plugins, self.timeouts).await {
            if let Err(close_err) = plugins.close().await {
                warn!("Cleanup after failed plugin load: {}", close_err);
            }
            return Err(e);
        }

        let watcher = if self.watch {
            let target: Weak<DomainRegistry> = Arc::downgrade(&registry);
            let watcher = ChangeWatcher::start(
                registry.path(),
                Arc::new(move || {
                    if let Some(registry) = target.upgrade() {
                        if let Err(e) = registry.reload() {
                            warn!("Reload of {} failed: {}", registry.path().display(), e);
                        }
                    }
                }),
            );
            let watcher = match watcher {
                Ok(watcher) => watcher,
                Err(e) => {
                    if let Err(close_err) = plugins.close().await {
                        warn!("Cleanup after failed watcher start: {}", close_err);
                    }
                    return Err(e);
                }
            };
            registry.attach_watcher(watcher.control());
            Some(watcher)
        } else {
            None
        };

        let enricher = Enricher::new(Arc::clone(&registry), Arc::clone(&plugins))
            .with_environment(self.environment)
            .with_policy(self.policy)
            .with_call_timeout(self.timeouts.call);

        info!(
            "certdeck ready: {} domain(s), {} plugin(s)",
            registry.len(),
            plugins.len()
        );
        Ok(CertdeckService {
            registry,
            plugins,
            enricher,
            watcher,
        })
    }
}

/// A domain registry with its plugins and (optionally) its file watcher.
pub struct CertdeckService {
    registry: Arc<DomainRegistry>,
    plugins: Arc<PluginRegistry>,
    enricher: Enricher,
    watcher: Option<ChangeWatcher>,
}

impl CertdeckService {
    pub fn builder(domains_file: impl Into<PathBuf>) -> CertdeckServiceBuilder {
        CertdeckServiceBuilder::new(domains_file)
    }

    pub fn registry(&self) -> &Arc<DomainRegistry> {
        &self.registry
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn enricher(&self) -> &Enricher {
        &self.enricher
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Stop watching and close every plugin.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        self.plugins.close().await
    }
}
