//! certdeck - manage the certificate domain list from the command line.
//!
//! Every command prints its result as pretty JSON on stdout; logs go to stderr.

mod config;

use anyhow::{bail, Context, Result};
use certdeck_core::{
    CertdeckService, DomainEntry, DomainRegistry, DomainUpdate, ListQuery, RegistryConfig,
    SortSpec,
};
use clap::{Parser, Subcommand};
use config::CliConfig;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "certdeck")]
#[command(about = "Certificate domain registry with metadata plugins")]
struct Args {
    /// Config file (defaults to <config dir>/certdeck/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Domains file, overriding the config's domainsFile
    #[arg(long, global = true)]
    domains: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List entries with plugin metadata
    List {
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = RegistryConfig::DEFAULT_PER_PAGE)]
        per_page: usize,
        /// Sort key: domain, alias, comment or enabled; prefix with '-' or
        /// suffix with ':desc' for descending
        #[arg(long, allow_hyphen_values = true)]
        sort: Option<SortSpec>,
        /// Case-insensitive substring filter
        #[arg(long)]
        search: Option<String>,
    },
    /// Show one entry with plugin metadata
    Get {
        domain: String,
        #[arg(long)]
        alias: Option<String>,
    },
    /// Add an entry
    Add {
        domain: String,
        /// Alternative names
        alternative_names: Vec<String>,
        #[arg(long)]
        alias: Option<String>,
        #[arg(long)]
        comment: Option<String>,
        /// Store the entry commented out
        #[arg(long)]
        disabled: bool,
    },
    /// Change fields of the first entry for a domain
    Update {
        domain: String,
        /// New primary domain
        #[arg(long = "domain", value_name = "NEW_DOMAIN")]
        new_domain: Option<String>,
        /// Replace alternative names (comma separated, empty to clear)
        #[arg(long, value_delimiter = ',', num_args = 0..)]
        alt_names: Option<Vec<String>>,
        #[arg(long, conflicts_with = "clear_alias")]
        alias: Option<String>,
        #[arg(long)]
        clear_alias: bool,
        #[arg(long)]
        comment: Option<String>,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
    /// Remove an entry
    Delete {
        domain: String,
        #[arg(long)]
        alias: Option<String>,
    },
    /// Load the configured plugins and list them
    Plugins,
    /// Watch the domains file and reload on change until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let (config_path, required) = match &args.config {
        Some(path) => (path.clone(), true),
        None => (
            CliConfig::default_path().context("No config directory on this platform")?,
            false,
        ),
    };
    let config = CliConfig::load(&config_path, required)?;
    let domains_file = config.domains_file(args.domains.as_deref());
    debug!("Using domains file {}", domains_file.display());

    match args.command {
        Command::List {
            page,
            per_page,
            sort,
            search,
        } => {
            let service = start(&config, &domains_file, false).await?;
            let query = ListQuery {
                page,
                per_page,
                sort,
                search,
            };
            let result = service.enricher().list(&query).await;
            finish(service, result).await
        }
        Command::Get { domain, alias } => {
            let service = start(&config, &domains_file, false).await?;
            let result = service.enricher().get(&domain, alias.as_deref()).await;
            finish(service, result).await
        }
        Command::Add {
            domain,
            alternative_names,
            alias,
            comment,
            disabled,
        } => {
            let mut entry = DomainEntry::new(domain)
                .with_alternative_names(alternative_names)
                .with_enabled(!disabled);
            if let Some(alias) = alias {
                entry = entry.with_alias(alias);
            }
            if let Some(comment) = comment {
                entry = entry.with_comment(comment);
            }
            let registry = DomainRegistry::open(&domains_file)?;
            print_json(&registry.create(entry)?)
        }
        Command::Update {
            domain,
            new_domain,
            alt_names,
            alias,
            clear_alias,
            comment,
            enable,
            disable,
        } => {
            let update = DomainUpdate {
                domain: new_domain,
                alternative_names: alt_names
                    .map(|names| names.into_iter().filter(|n| !n.is_empty()).collect()),
                alias: if clear_alias { Some(None) } else { alias.map(Some) },
                enabled: match (enable, disable) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                comment,
            };
            if update.is_empty() {
                bail!("Nothing to update");
            }
            let registry = DomainRegistry::open(&domains_file)?;
            print_json(&registry.update(&domain, &update)?)
        }
        Command::Delete { domain, alias } => {
            let registry = DomainRegistry::open(&domains_file)?;
            print_json(&registry.delete(&domain, alias.as_deref())?)
        }
        Command::Plugins => {
            let service = start(&config, &domains_file, false).await?;
            let infos: Vec<_> = service.plugins().all().iter().map(|p| p.info()).collect();
            finish(service, Ok(infos)).await
        }
        Command::Watch => {
            let service = start(&config, &domains_file, true).await?;
            info!(
                "Watching {} ({} entries), Ctrl-C to stop",
                domains_file.display(),
                service.registry().len()
            );
            let result = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received, exiting");
            service.shutdown().await?;
            result?;
            Ok(())
        }
    }
}

async fn start(config: &CliConfig, domains_file: &Path, watch: bool) -> Result<CertdeckService> {
    let service = CertdeckService::builder(domains_file)
        .plugins(config.descriptors())
        .environment(config.environment.clone())
        .timeouts(config.timeouts())
        .failure_policy(config.failure_policy)
        .watch(watch)
        .build()
        .await?;
    Ok(service)
}

/// Shut the service down, then report the command's result. Plugins are
/// closed even when the command failed.
async fn finish<T: Serialize>(
    service: CertdeckService,
    result: certdeck_core::Result<T>,
) -> Result<()> {
    let shutdown = service.shutdown().await;
    let value = result?;
    shutdown?;
    print_json(&value)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    // Output for callers and scripts (intentional stdout)
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
