//! Error types for certdeck.
//!
//! Every failure the core can report is a distinct variant so that callers
//! (the HTTP layer, the CLI) can map them to status codes without looking at
//! message text.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// One plugin that failed to shut down cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCloseFailure {
    pub plugin: String,
    pub message: String,
}

impl std::fmt::Display for PluginCloseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.plugin, self.message)
    }
}

/// Main error type for certdeck.
#[derive(Debug, Error)]
pub enum CertdeckError {
    // Domain registry errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Domain not found: {domain}{}", .alias.as_deref().map(|a| format!(" (alias {a})")).unwrap_or_default())]
    NotFound {
        domain: String,
        alias: Option<String>,
    },

    #[error("Domain already exists: {domain}")]
    DuplicateDomain { domain: String },

    #[error("Failed to persist {path:?}: {message}")]
    Persistence {
        message: String,
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    // Plugin errors
    #[error("Failed to load plugin {plugin}: {message}")]
    PluginLoad { plugin: String, message: String },

    #[error("Plugin {plugin} failed: {message}")]
    PluginInvocation { plugin: String, message: String },

    #[error("Plugin {plugin} did not answer {operation} within {after:?}")]
    PluginTimeout {
        plugin: String,
        operation: String,
        after: Duration,
    },

    #[error("Failed to close {} plugin(s): {}", .failures.len(), .failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; "))]
    PluginClose { failures: Vec<PluginCloseFailure> },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Change watcher errors
    #[error("File watcher error: {message}")]
    Watch { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for certdeck operations.
pub type Result<T> = std::result::Result<T, CertdeckError>;

impl From<std::io::Error> for CertdeckError {
    fn from(err: std::io::Error) -> Self {
        CertdeckError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CertdeckError {
    fn from(err: serde_json::Error) -> Self {
        CertdeckError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<notify::Error> for CertdeckError {
    fn from(err: notify::Error) -> Self {
        CertdeckError::Watch {
            message: err.to_string(),
        }
    }
}

impl CertdeckError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        CertdeckError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Shorthand for a validation failure on `field`.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CertdeckError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// The plugin this error is attributed to, if any.
    pub fn plugin(&self) -> Option<&str> {
        match self {
            CertdeckError::PluginLoad { plugin, .. }
            | CertdeckError::PluginInvocation { plugin, .. }
            | CertdeckError::PluginTimeout { plugin, .. } => Some(plugin),
            _ => None,
        }
    }

    /// True for failures scoped to a single plugin rather than the core.
    pub fn is_plugin_failure(&self) -> bool {
        matches!(
            self,
            CertdeckError::PluginLoad { .. }
                | CertdeckError::PluginInvocation { .. }
                | CertdeckError::PluginTimeout { .. }
                | CertdeckError::PluginClose { .. }
        )
    }

    /// HTTP status code a front end should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            CertdeckError::Validation { .. } => 400,
            CertdeckError::NotFound { .. } => 404,
            CertdeckError::DuplicateDomain { .. } => 409,
            CertdeckError::PluginInvocation { .. } | CertdeckError::Protocol { .. } => 502,
            CertdeckError::PluginTimeout { .. } => 504,
            _ => 500,
        }
    }

    /// Convert to a JSON-RPC error code for the plugin wire protocol.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Plugin failure
    /// - -32002: Not found
    /// - -32005: Validation or configuration error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            CertdeckError::PluginLoad { .. }
            | CertdeckError::PluginInvocation { .. }
            | CertdeckError::PluginTimeout { .. }
            | CertdeckError::PluginClose { .. } => -32000,

            CertdeckError::NotFound { .. } => -32002,

            CertdeckError::Validation { .. }
            | CertdeckError::DuplicateDomain { .. }
            | CertdeckError::Config { .. } => -32005,

            CertdeckError::Protocol { .. } => -32600,

            _ => -32603,
        }
    }
}
