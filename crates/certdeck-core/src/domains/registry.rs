//! File-backed domain registry.
//!
//! The registry keeps the parsed backing file in memory behind a single
//! read-write lock. Mutations are computed on a copy, written to disk, and
//! only then swapped in, so the cache never holds state the file lacks.

use super::atomic::atomic_write_text;
use super::codec::{read_entries_file, serialize_entries};
use super::validation::validate_entry;
use super::{DomainEntry, DomainUpdate};
use crate::config::RegistryConfig;
use crate::error::{CertdeckError, Result};
use crate::watcher::WatchControl;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Field a listing can be sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    Domain,
    Alias,
    Comment,
    Enabled,
}

/// Sort key plus direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: SortField,
    #[serde(default)]
    pub descending: bool,
}

impl FromStr for SortSpec {
    type Err = CertdeckError;

    /// Accepts `domain`, `-domain`, `domain:asc` and `domain:desc`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (name, descending) = if let Some(rest) = s.strip_prefix('-') {
            (rest, true)
        } else if let Some((name, dir)) = s.split_once(':') {
            match dir.to_ascii_lowercase().as_str() {
                "asc" => (name, false),
                "desc" => (name, true),
                other => {
                    return Err(CertdeckError::validation(
                        "sort",
                        format!("unknown direction '{}'", other),
                    ))
                }
            }
        } else {
            (s, false)
        };

        let field = match name.to_ascii_lowercase().as_str() {
            "domain" => SortField::Domain,
            "alias" => SortField::Alias,
            "comment" => SortField::Comment,
            "enabled" => SortField::Enabled,
            other => {
                return Err(CertdeckError::validation(
                    "sort",
                    format!("unknown sort field '{}'", other),
                ))
            }
        };
        Ok(Self { field, descending })
    }
}

impl SortSpec {
    fn compare(&self, a: &DomainEntry, b: &DomainEntry) -> Ordering {
        let ordering = match self.field {
            SortField::Domain => a.domain.cmp(&b.domain),
            SortField::Alias => a.alias.cmp(&b.alias),
            SortField::Comment => a.comment.cmp(&b.comment),
            SortField::Enabled => a.enabled.cmp(&b.enabled),
        };
        if self.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

/// Listing parameters. Out-of-range values are clamped, never rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: usize,
    pub per_page: usize,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub search: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: RegistryConfig::DEFAULT_PER_PAGE,
            sort: None,
            search: None,
        }
    }
}

impl ListQuery {
    fn clamped_page(&self) -> usize {
        self.page.max(1)
    }

    fn clamped_per_page(&self) -> usize {
        self.per_page.clamp(1, RegistryConfig::MAX_PER_PAGE)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainPage {
    pub entries: Vec<DomainEntry>,
    /// Matches across all pages.
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

fn matches_search(entry: &DomainEntry, needle: &str) -> bool {
    let contains = |haystack: &str| haystack.to_lowercase().contains(needle);
    contains(&entry.domain)
        || entry.alternative_names.iter().any(|n| contains(n))
        || entry.alias.as_deref().is_some_and(contains)
        || contains(&entry.comment)
}

/// Thread-safe, file-backed cache of domain entries.
pub struct DomainRegistry {
    path: PathBuf,
    cache: RwLock<Vec<DomainEntry>>,
    watch_control: RwLock<Option<WatchControl>>,
}

impl DomainRegistry {
    /// Open the registry for `path` and load it. A missing file is an empty registry.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let registry = Self {
            path: path.into(),
            cache: RwLock::new(Vec::new()),
            watch_control: RwLock::new(None),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Silence the given watcher around this registry's own writes.
    pub fn attach_watcher(&self, control: WatchControl) {
        if let Ok(mut slot) = self.watch_control.write() {
            *slot = Some(control);
        }
    }

    /// Re-read the backing file and swap it in. Returns the entry count.
    pub fn reload(&self) -> Result<usize> {
        let entries = read_entries_file(&self.path)?;
        let count = entries.len();
        *self.write_cache()? = entries;
        info!("Loaded {} domain entries from {}", count, self.path.display());
        Ok(count)
    }

    /// Copy of every cached entry, in cache order.
    pub fn snapshot(&self) -> Result<Vec<DomainEntry>> {
        Ok(self.read_cache()?.clone())
    }

    pub fn len(&self) -> usize {
        self.read_cache().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First entry matching `domain` (and `alias`, when given).
    pub fn get(&self, domain: &str, alias: Option<&str>) -> Result<DomainEntry> {
        self.read_cache()?
            .iter()
            .find(|e| e.matches(domain, alias))
            .cloned()
            .ok_or_else(|| not_found(domain, alias))
    }

    /// Filtered, optionally sorted, paginated view of the cache.
    pub fn list(&self, query: &ListQuery) -> Result<DomainPage> {
        let needle = query
            .search
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        let mut matched: Vec<DomainEntry> = {
            let cache = self.read_cache()?;
            cache
                .iter()
                .filter(|e| needle.as_deref().map_or(true, |n| matches_search(e, n)))
                .cloned()
                .collect()
        };

        if let Some(sort) = &query.sort {
            matched.sort_by(|a, b| sort.compare(a, b));
        }

        let page = query.clamped_page();
        let per_page = query.clamped_per_page();
        let total = matched.len();
        let entries = matched
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();

        Ok(DomainPage {
            entries,
            total,
            page,
            per_page,
        })
    }

    /// Validate and append a new entry. Any existing entry with the same
    /// domain blocks creation, whatever its alias.
    pub fn create(&self, entry: DomainEntry) -> Result<DomainEntry> {
        let entry = entry.without_metadata().normalized();
        validate_entry(&entry)?;

        self.mutate(|entries| {
            if entries.iter().any(|e| e.domain == entry.domain) {
                return Err(CertdeckError::DuplicateDomain {
                    domain: entry.domain.clone(),
                });
            }
            entries.push(entry.clone());
            Ok(entry.clone())
        })
        .inspect(|e| debug!("Created domain entry {}", e.domain))
    }

    /// Replace the fields present in `update` on the first entry for `domain`.
    pub fn update(&self, domain: &str, update: &DomainUpdate) -> Result<DomainEntry> {
        self.mutate(|entries| {
            let index = entries
                .iter()
                .position(|e| e.domain == domain)
                .ok_or_else(|| not_found(domain, None))?;

            let updated = update.apply_to(&entries[index]);
            validate_entry(&updated)?;

            if updated.domain != domain
                && entries
                    .iter()
                    .enumerate()
                    .any(|(i, e)| i != index && e.domain == updated.domain)
            {
                return Err(CertdeckError::DuplicateDomain {
                    domain: updated.domain.clone(),
                });
            }

            entries[index] = updated.clone();
            Ok(updated)
        })
        .inspect(|e| debug!("Updated domain entry {}", e.domain))
    }

    /// Remove the first entry matching `domain` (and `alias`, when given).
    pub fn delete(&self, domain: &str, alias: Option<&str>) -> Result<DomainEntry> {
        self.mutate(|entries| {
            let index = entries
                .iter()
                .position(|e| e.matches(domain, alias))
                .ok_or_else(|| not_found(domain, alias))?;
            Ok(entries.remove(index))
        })
        .inspect(|e| debug!("Deleted domain entry {}", e.domain))
    }

    /// Run `change` on a copy of the cache, persist the copy, then swap it in.
    fn mutate<T>(&self, change: impl FnOnce(&mut Vec<DomainEntry>) -> Result<T>) -> Result<T> {
        // Declared before the cache guard so it drops (and resumes the
        // watcher, which reloads) after the write lock is released.
        let _suspended = self.suspend_watcher();
        let mut cache = self.write_cache()?;

        let mut next = cache.clone();
        let result = change(&mut next)?;
        atomic_write_text(&self.path, &serialize_entries(&next))?;
        *cache = next;
        Ok(result)
    }

    fn suspend_watcher(&self) -> SuspendGuard {
        let control = self
            .watch_control
            .read()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(control) = &control {
            control.suspend();
        }
        SuspendGuard(control)
    }

    fn read_cache(&self) -> Result<RwLockReadGuard<'_, Vec<DomainEntry>>> {
        self.cache
            .read()
            .map_err(|e| CertdeckError::Other(format!("Failed to acquire domain cache lock: {}", e)))
    }

    fn write_cache(&self) -> Result<RwLockWriteGuard<'_, Vec<DomainEntry>>> {
        self.cache
            .write()
            .map_err(|e| CertdeckError::Other(format!("Failed to acquire domain cache lock: {}", e)))
    }
}

/// Resumes the attached watcher when dropped.
struct SuspendGuard(Option<WatchControl>);

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        if let Some(control) = self.0.take() {
            control.resume();
        }
    }
}

fn not_found(domain: &str, alias: Option<&str>) -> CertdeckError {
    CertdeckError::NotFound {
        domain: domain.to_string(),
        alias: alias.map(str::to_string),
    }
}
