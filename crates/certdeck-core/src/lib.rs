//! certdeck core - a file-backed registry of certificate domain entries,
//! enriched with metadata from pluggable extensions.
//!
//! The registry keeps a plain text file (one entry per line) and an in-memory
//! cache in sync. Plugins, either built in or external processes speaking a
//! framed JSON-RPC protocol over stdio, contribute metadata to each entry on
//! read. A file watcher picks up edits made outside the process.
//!
//! # Example
//!
//! ```rust,ignore
//! use certdeck_core::{CertdeckService, DomainEntry, ListQuery, PluginDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> certdeck_core::Result<()> {
//!     let service = CertdeckService::builder("/etc/certdeck/domains.txt")
//!         .plugins(vec![PluginDescriptor::builtin("names")])
//!         .watch(true)
//!         .build()
//!         .await?;
//!
//!     service
//!         .registry()
//!         .create(DomainEntry::new("example.com").with_alias("edge"))?;
//!
//!     let page = service.enricher().list(&ListQuery::default()).await?;
//!     println!("{} entries", page.total);
//!
//!     service.shutdown().await
//! }
//! ```

pub mod config;
pub mod domains;
pub mod enrich;
pub mod error;
pub mod plugins;
pub mod value;
pub mod watcher;

mod service;

pub use config::{PluginTimeouts, RegistryConfig};
pub use domains::{
    DomainEntry, DomainPage, DomainRegistry, DomainUpdate, ListQuery, SortField, SortSpec,
};
pub use enrich::{Enricher, FailurePolicy};
pub use error::{CertdeckError, PluginCloseFailure, Result};
pub use plugins::{
    MetadataPlugin, MetadataRequest, PluginConnection, PluginDescriptor, PluginInfo, PluginKind,
    PluginRegistry,
};
pub use service::{CertdeckService, CertdeckServiceBuilder};
pub use value::{Value, ValueMap};
pub use watcher::{ChangeWatcher, WatchControl};
