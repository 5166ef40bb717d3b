//! Centralized configuration for certdeck.
//!
//! Fixed limits and timings live here as associated constants; the only
//! runtime-tunable piece is [`PluginTimeouts`], which callers pass to plugin
//! operations.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "certdeck";
    pub const CONFIG_DIR_NAME: &'static str = "certdeck";
    pub const CONFIG_FILE_NAME: &'static str = "config.json";
    pub const DEFAULT_DOMAINS_FILE: &'static str = "domains.txt";
}

/// Domain registry limits.
pub struct RegistryConfig;

impl RegistryConfig {
    pub const DEFAULT_PER_PAGE: usize = 20;
    pub const MAX_PER_PAGE: usize = 100;
    pub const MAX_DOMAIN_LENGTH: usize = 253;
    pub const MAX_LABEL_LENGTH: usize = 63;
}

/// Change watcher timing.
pub struct WatcherConfig;

impl WatcherConfig {
    /// Notifications for one path closer together than this collapse into a
    /// single reload.
    pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);
    /// How often the watcher thread wakes up to flush settled paths.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(20);
}

/// Plugin wire protocol constants.
pub struct PluginProtocolConfig;

impl PluginProtocolConfig {
    pub const PROTOCOL_VERSION: u32 = 1;
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// Environment variable carrying the plugin's registry name.
    pub const ENV_PLUGIN_NAME: &'static str = "CERTDECK_PLUGIN_NAME";
    /// Environment variable carrying the plugin's private scratch directory.
    pub const ENV_PLUGIN_DIR: &'static str = "CERTDECK_PLUGIN_DIR";
    /// How long a plugin gets to exit on its own after `close` before it is killed.
    pub const EXIT_GRACE: Duration = Duration::from_millis(500);
}

/// Deadlines applied to plugin calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginTimeouts {
    #[serde(with = "duration_secs", rename = "initializeSecs")]
    pub initialize: Duration,
    #[serde(with = "duration_secs", rename = "callSecs")]
    pub call: Duration,
    #[serde(with = "duration_secs", rename = "closeSecs")]
    pub close: Duration,
}

impl Default for PluginTimeouts {
    fn default() -> Self {
        Self {
            initialize: Duration::from_secs(10),
            call: Duration::from_secs(30),
            close: Duration::from_secs(5),
        }
    }
}

impl PluginTimeouts {
    /// Same deadline for every operation.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            initialize: timeout,
            call: timeout,
            close: timeout,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(serde::de::Error::custom("timeout must be a positive number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_reasonable() {
        let t = PluginTimeouts::default();
        assert!(t.initialize > Duration::ZERO);
        assert!(t.call >= t.initialize);
        assert!(WatcherConfig::POLL_INTERVAL < WatcherConfig::DEBOUNCE_WINDOW);
    }

    #[test]
    fn test_timeouts_deserialize_from_seconds() {
        let t: PluginTimeouts =
            serde_json::from_str(r#"{"initializeSecs": 2, "callSecs": 0.5, "closeSecs": 1}"#)
                .unwrap();
        assert_eq!(t.initialize, Duration::from_secs(2));
        assert_eq!(t.call, Duration::from_millis(500));
        assert_eq!(t.close, Duration::from_secs(1));
    }

    #[test]
    fn test_timeouts_reject_zero() {
        let result: std::result::Result<PluginTimeouts, _> =
            serde_json::from_str(r#"{"initializeSecs": 0, "callSecs": 1, "closeSecs": 1}"#);
        assert!(result.is_err());
    }
}
