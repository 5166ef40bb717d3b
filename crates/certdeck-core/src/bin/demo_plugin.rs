//! Reference external plugin.
//!
//! Answers `get_metadata` with what it knows about itself (registry name,
//! scratch directory, process id) plus the entry's domain. Its config can make
//! it slow or failing on purpose, which the integration tests rely on:
//!
//! | key                  | effect                                          |
//! |----------------------|-------------------------------------------------|
//! | `tag`                | echoed back in every answer                     |
//! | `failInitialize`     | initialize returns an error                     |
//! | `initializeDelayMs`  | sleep before answering initialize               |
//! | `metadataDelayMs`    | sleep before answering each get_metadata        |
//! | `failDomains`        | domains whose get_metadata reports an error     |
//! | `failClose`          | close returns an error                          |
//! | `closeDelayMs`       | sleep before answering close                    |
//! | `lingerAfterCloseMs` | keep the process alive this long after close    |

use async_trait::async_trait;
use certdeck_core::config::PluginProtocolConfig;
use certdeck_core::error::{CertdeckError, Result};
use certdeck_core::plugins::sdk::serve_stdio;
use certdeck_core::plugins::{MetadataPlugin, MetadataRequest};
use certdeck_core::value::{Value, ValueMap};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default, Clone)]
struct DemoSettings {
    tag: Option<String>,
    metadata_delay: Duration,
    fail_domains: Vec<String>,
    fail_close: bool,
    close_delay: Duration,
    linger: Duration,
}

#[derive(Default)]
struct DemoPlugin {
    settings: RwLock<DemoSettings>,
}

impl DemoPlugin {
    fn settings(&self) -> Result<DemoSettings> {
        self.settings
            .read()
            .map(|s| s.clone())
            .map_err(|_| CertdeckError::Other("settings lock poisoned".into()))
    }
}

fn millis(config: &ValueMap, key: &str) -> Duration {
    Duration::from_millis(config.get(key).and_then(Value::as_u64).unwrap_or(0))
}

fn flag(config: &ValueMap, key: &str) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[async_trait]
impl MetadataPlugin for DemoPlugin {
    async fn initialize(&self, config: ValueMap) -> Result<()> {
        tokio::time::sleep(millis(&config, "initializeDelayMs")).await;
        if flag(&config, "failInitialize") {
            return Err(CertdeckError::Config {
                message: "failInitialize is set".into(),
            });
        }

        let settings = DemoSettings {
            tag: config.get("tag").and_then(Value::as_str).map(str::to_string),
            metadata_delay: millis(&config, "metadataDelayMs"),
            fail_domains: config
                .get("failDomains")
                .and_then(Value::as_list)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            fail_close: flag(&config, "failClose"),
            close_delay: millis(&config, "closeDelayMs"),
            linger: millis(&config, "lingerAfterCloseMs"),
        };
        *self
            .settings
            .write()
            .map_err(|_| CertdeckError::Other("settings lock poisoned".into()))? = settings;
        info!("demo plugin initialized");
        Ok(())
    }

    async fn get_metadata(&self, request: &MetadataRequest) -> Result<ValueMap> {
        let settings = self.settings()?;
        tokio::time::sleep(settings.metadata_delay).await;

        if settings.fail_domains.iter().any(|d| *d == request.domain) {
            return Err(CertdeckError::Other(format!(
                "no metadata for {}",
                request.domain
            )));
        }

        let env = |key: &str| std::env::var(key).unwrap_or_default();
        let mut out = ValueMap::new();
        out.insert("domain".into(), request.domain.as_str().into());
        out.insert("plugin".into(), env(PluginProtocolConfig::ENV_PLUGIN_NAME).into());
        out.insert("scratchDir".into(), env(PluginProtocolConfig::ENV_PLUGIN_DIR).into());
        out.insert("pid".into(), u64::from(std::process::id()).into());
        if let Some(tag) = settings.tag {
            out.insert("tag".into(), tag.into());
        }
        if !request.environment.is_empty() {
            out.insert("environment".into(), Value::Map(request.environment.clone()));
        }
        Ok(out)
    }

    async fn close(&self) -> Result<()> {
        let settings = self.settings()?;
        tokio::time::sleep(settings.close_delay).await;
        if settings.fail_close {
            return Err(CertdeckError::Other("failClose is set".into()));
        }
        info!("demo plugin closed");
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let plugin = DemoPlugin::default();
    if let Err(e) = serve_stdio(&plugin).await {
        error!("demo plugin stopped: {}", e);
        std::process::exit(1);
    }

    let linger = plugin.settings().map(|s| s.linger).unwrap_or_default();
    if !linger.is_zero() {
        tokio::time::sleep(linger).await;
    }
}
