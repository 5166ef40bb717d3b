//! Name-keyed set of loaded plugins.
//!
//! # Thread Safety
//!
//! The map sits behind a `std::sync::Mutex` that is only held for map
//! bookkeeping, never across an await. A load first reserves its name, then
//! spawns/initializes without the lock, then fills the reservation.
//! Once [`PluginRegistry::close`] has run, a load still in flight closes its
//! own connection instead of filling the reservation.

use super::builtin;
use super::connection::PluginConnection;
use super::PluginDescriptor;
use crate::config::PluginTimeouts;
use crate::error::{CertdeckError, PluginCloseFailure, Result};
use crate::value::ValueMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

enum Slot {
    Loading,
    Ready(Arc<PluginConnection>),
}

/// Owns every active plugin connection.
#[derive(Default)]
pub struct PluginRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    /// Only changed while `slots` is locked.
    closed: AtomicBool,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load one plugin under `name`.
    ///
    /// An empty `path` selects the built-in of that name. The connection is
    /// stored only if loading succeeds and the registry has not been closed
    /// in the meantime.
    pub async fn load(
        &self,
        name: &str,
        path: &Path,
        config: ValueMap,
        timeouts: PluginTimeouts,
    ) -> Result<Arc<PluginConnection>> {
        let load_error = |message: &str| CertdeckError::PluginLoad {
            plugin: name.to_string(),
            message: message.to_string(),
        };

        if name.trim().is_empty() {
            return Err(load_error("plugin name must not be empty"));
        }

        {
            let mut slots = self.lock()?;
            if self.is_closed() {
                return Err(load_error("registry closed"));
            }
            if slots.contains_key(name) {
                return Err(load_error("already loaded"));
            }
            slots.insert(name.to_string(), Slot::Loading);
        }

        let loaded = if path.as_os_str().is_empty() {
            match builtin::create(name) {
                Some(plugin) => PluginConnection::builtin(name, plugin, config, timeouts).await,
                None => Err(load_error("unknown built-in")),
            }
        } else {
            PluginConnection::external(name, path, config, timeouts).await
        };

        let late = {
            let mut slots = self.lock()?;
            if !self.is_closed() {
                return match loaded {
                    Ok(connection) => {
                        let connection = Arc::new(connection);
                        slots.insert(name.to_string(), Slot::Ready(Arc::clone(&connection)));
                        info!("Plugin {} loaded ({:?})", name, connection.kind());
                        Ok(connection)
                    }
                    Err(e) => {
                        slots.remove(name);
                        warn!("Failed to load plugin {}: {}", name, e);
                        Err(e)
                    }
                };
            }
            slots.remove(name);
            loaded
        };

        if let Ok(connection) = late {
            warn!("Plugin {} finished loading after close, closing it", name);
            if let Err(e) = connection.close().await {
                warn!("Failed to close late plugin {}: {}", name, e);
            }
        }
        Err(load_error("registry closed"))
    }

    /// Load every enabled descriptor, stopping at the first failure.
    pub async fn load_descriptors(
        &self,
        descriptors: &[PluginDescriptor],
        timeouts: PluginTimeouts,
    ) -> Result<usize> {
        let mut loaded = 0;
        for descriptor in descriptors {
            if !descriptor.enabled {
                info!("Plugin {} is disabled, skipping", descriptor.name);
                continue;
            }
            self.load(
                &descriptor.name,
                &descriptor.path,
                descriptor.config.clone(),
                timeouts,
            )
            .await?;
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginConnection>> {
        match self.lock().ok()?.get(name) {
            Some(Slot::Ready(connection)) => Some(Arc::clone(connection)),
            _ => None,
        }
    }

    /// Every ready connection, sorted by name.
    pub fn all(&self) -> Vec<Arc<PluginConnection>> {
        let mut connections: Vec<_> = match self.lock() {
            Ok(slots) => slots
                .values()
                .filter_map(|slot| match slot {
                    Slot::Ready(connection) => Some(Arc::clone(connection)),
                    Slot::Loading => None,
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        connections.sort_by(|a, b| a.name().cmp(b.name()));
        connections
    }

    pub fn names(&self) -> Vec<String> {
        self.all().iter().map(|c| c.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once [`close`](Self::close) has started. Closed registries refuse
    /// new loads.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every plugin and empty the registry.
    ///
    /// Every connection is closed even if earlier ones fail; all failures are
    /// reported together as [`CertdeckError::PluginClose`].
    pub async fn close(&self) -> Result<()> {
        let connections: Vec<Arc<PluginConnection>> = {
            let mut slots = self.lock()?;
            self.closed.store(true, Ordering::SeqCst);
            let mut ready = Vec::new();
            slots.retain(|_, slot| match slot {
                Slot::Ready(connection) => {
                    ready.push(Arc::clone(connection));
                    false
                }
                Slot::Loading => true,
            });
            ready
        };

        let results = futures::future::join_all(connections.iter().map(|c| c.close())).await;

        let failures: Vec<PluginCloseFailure> = connections
            .iter()
            .zip(results)
            .filter_map(|(connection, result)| {
                result.err().map(|e| PluginCloseFailure {
                    plugin: connection.name().to_string(),
                    message: e.to_string(),
                })
            })
            .collect();

        if failures.is_empty() {
            info!("Closed {} plugin(s)", connections.len());
            Ok(())
        } else {
            for failure in &failures {
                warn!("Plugin {} failed to close: {}", failure.plugin, failure.message);
            }
            Err(CertdeckError::PluginClose { failures })
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Slot>>> {
        self.slots
            .lock()
            .map_err(|e| CertdeckError::Other(format!("Failed to acquire plugin registry lock: {}", e)))
    }
}
