//! Uniform wrapper over in-process and out-of-process plugins.

use super::protocol::{method, MetadataResult};
use super::transport::ExternalPlugin;
use super::{MetadataPlugin, MetadataRequest};
use crate::config::PluginTimeouts;
use crate::error::{CertdeckError, Result};
use crate::value::ValueMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Where a plugin runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Builtin,
    External,
}

/// Summary of a loaded plugin, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub name: String,
    pub kind: PluginKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub healthy: bool,
}

/// The two ways a plugin can be hosted.
pub enum PluginBackend {
    InProcess(Box<dyn MetadataPlugin>),
    OutOfProcess(ExternalPlugin),
}

/// A loaded, initialized plugin.
///
/// Callers see the same three operations whichever backend is underneath.
pub struct PluginConnection {
    name: String,
    backend: PluginBackend,
    timeouts: PluginTimeouts,
    closed: AtomicBool,
}

impl std::fmt::Debug for PluginConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginConnection")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("pid", &self.pid())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PluginConnection {
    /// Initialize an in-process plugin.
    pub async fn builtin(
        name: &str,
        plugin: Box<dyn MetadataPlugin>,
        config: ValueMap,
        timeouts: PluginTimeouts,
    ) -> Result<Self> {
        let initialized = tokio::time::timeout(timeouts.initialize, plugin.initialize(config)).await;
        let failure = match initialized {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("initialize timed out after {:?}", timeouts.initialize)),
        };
        if let Some(message) = failure {
            // Best effort; the plugin never became usable.
            let _ = plugin.close().await;
            return Err(CertdeckError::PluginLoad {
                plugin: name.to_string(),
                message,
            });
        }

        info!("Loaded built-in plugin {}", name);
        Ok(Self {
            name: name.to_string(),
            backend: PluginBackend::InProcess(plugin),
            timeouts,
            closed: AtomicBool::new(false),
        })
    }

    /// Spawn and initialize an external plugin.
    pub async fn external(
        name: &str,
        path: &Path,
        config: ValueMap,
        timeouts: PluginTimeouts,
    ) -> Result<Self> {
        let plugin = ExternalPlugin::launch(name, path, config, timeouts.initialize).await?;
        Ok(Self {
            name: name.to_string(),
            backend: PluginBackend::OutOfProcess(plugin),
            timeouts,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PluginKind {
        match self.backend {
            PluginBackend::InProcess(_) => PluginKind::Builtin,
            PluginBackend::OutOfProcess(_) => PluginKind::External,
        }
    }

    pub fn timeouts(&self) -> PluginTimeouts {
        self.timeouts
    }

    pub fn pid(&self) -> Option<u32> {
        match &self.backend {
            PluginBackend::InProcess(_) => None,
            PluginBackend::OutOfProcess(plugin) => plugin.pid(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        !self.is_closed()
            && match &self.backend {
                PluginBackend::InProcess(_) => true,
                PluginBackend::OutOfProcess(plugin) => plugin.is_healthy(),
            }
    }

    pub fn info(&self) -> PluginInfo {
        let path = match &self.backend {
            PluginBackend::InProcess(_) => None,
            PluginBackend::OutOfProcess(plugin) => Some(plugin.path().to_path_buf()),
        };
        PluginInfo {
            name: self.name.clone(),
            kind: self.kind(),
            path,
            pid: self.pid(),
            healthy: self.is_healthy(),
        }
    }

    /// Ask the plugin for one entry's metadata, giving up after `timeout`.
    pub async fn get_metadata(&self, request: &MetadataRequest, timeout: Duration) -> Result<ValueMap> {
        if self.is_closed() {
            return Err(self.invocation_error("plugin is closed".to_string()));
        }

        match &self.backend {
            PluginBackend::InProcess(plugin) => {
                match tokio::time::timeout(timeout, plugin.get_metadata(request)).await {
                    Ok(result) => result.map_err(|e| self.attribute(e)),
                    Err(_) => Err(self.timeout_error(method::GET_METADATA, timeout)),
                }
            }
            PluginBackend::OutOfProcess(plugin) => {
                let params = serde_json::to_value(request)?;
                let raw = plugin.call(method::GET_METADATA, params, timeout).await?;
                let result: MetadataResult = serde_json::from_value(raw).map_err(|e| {
                    self.invocation_error(format!("malformed get_metadata result: {}", e))
                })?;
                result
                    .into_metadata()
                    .map_err(|message| self.invocation_error(message))
            }
        }
    }

    /// Close the plugin. Only the first call does anything.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing plugin {}", self.name);

        let timeout = self.timeouts.close;
        match &self.backend {
            PluginBackend::InProcess(plugin) => {
                match tokio::time::timeout(timeout, plugin.close()).await {
                    Ok(result) => result.map_err(|e| self.attribute(e)),
                    Err(_) => Err(self.timeout_error(method::CLOSE, timeout)),
                }
            }
            PluginBackend::OutOfProcess(plugin) => plugin.close(timeout).await,
        }
    }

    /// Keep errors that already name a plugin, wrap everything else.
    fn attribute(&self, err: CertdeckError) -> CertdeckError {
        if err.plugin().is_some() {
            err
        } else {
            self.invocation_error(err.to_string())
        }
    }

    fn invocation_error(&self, message: String) -> CertdeckError {
        CertdeckError::PluginInvocation {
            plugin: self.name.clone(),
            message,
        }
    }

    fn timeout_error(&self, operation: &str, after: Duration) -> CertdeckError {
        CertdeckError::PluginTimeout {
            plugin: self.name.clone(),
            operation: operation.to_string(),
            after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::DomainEntry;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Scripted {
        fail_init: bool,
        slow: bool,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MetadataPlugin for Scripted {
        async fn initialize(&self, _config: ValueMap) -> Result<()> {
            if self.fail_init {
                return Err(CertdeckError::Config {
                    message: "bad config".into(),
                });
            }
            Ok(())
        }

        async fn get_metadata(&self, request: &MetadataRequest) -> Result<ValueMap> {
            if self.slow {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if request.domain.starts_with("fail.") {
                return Err(CertdeckError::Other("no data".into()));
            }
            let mut out = ValueMap::new();
            out.insert("seen".into(), request.domain.as_str().into());
            Ok(out)
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scripted(fail_init: bool, slow: bool) -> (Box<dyn MetadataPlugin>, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let plugin = Scripted {
            fail_init,
            slow,
            closes: Arc::clone(&closes),
        };
        (Box::new(plugin), closes)
    }

    fn request(domain: &str) -> MetadataRequest {
        MetadataRequest::for_entry(&DomainEntry::new(domain), &ValueMap::new())
    }

    #[tokio::test]
    async fn test_builtin_initialize_failure_is_load_error() {
        let (plugin, closes) = scripted(true, false);
        let result =
            PluginConnection::builtin("s", plugin, ValueMap::new(), PluginTimeouts::default()).await;
        assert!(matches!(result, Err(CertdeckError::PluginLoad { .. })));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_attributed_to_the_plugin() {
        let (plugin, _) = scripted(false, false);
        let conn = PluginConnection::builtin("s", plugin, ValueMap::new(), PluginTimeouts::default())
            .await
            .unwrap();

        let ok = conn
            .get_metadata(&request("example.com"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ok["seen"].as_str(), Some("example.com"));

        let err = conn
            .get_metadata(&request("fail.example.com"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.plugin(), Some("s"));
        assert_eq!(conn.kind(), PluginKind::Builtin);
        assert_eq!(conn.pid(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_builtin_call_timeout() {
        let (plugin, _) = scripted(false, true);
        let conn = PluginConnection::builtin("slow", plugin, ValueMap::new(), PluginTimeouts::default())
            .await
            .unwrap();
        let err = conn
            .get_metadata(&request("example.com"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CertdeckError::PluginTimeout { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (plugin, closes) = scripted(false, false);
        let conn = PluginConnection::builtin("s", plugin, ValueMap::new(), PluginTimeouts::default())
            .await
            .unwrap();

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!conn.is_healthy());
        assert!(conn
            .get_metadata(&request("example.com"), Duration::from_secs(1))
            .await
            .is_err());
    }
}
