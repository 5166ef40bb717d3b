//! Domain-name grammar and field validation.
//!
//! A name is dot-separated labels with an optional leading `*.` wildcard.
//! Labels are ASCII letters, digits and hyphens, never starting or ending
//! with a hyphen; the last label (the TLD) is at least two characters.

use super::DomainEntry;
use crate::config::RegistryConfig;
use crate::error::{CertdeckError, Result};
use regex::Regex;
use std::sync::LazyLock;

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:\*\.)?(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z0-9][A-Za-z0-9-]{0,61}[A-Za-z0-9]$",
    )
    .expect("valid regex")
});

/// Check a name against the grammar.
pub fn is_valid_domain_name(name: &str) -> bool {
    name.len() <= RegistryConfig::MAX_DOMAIN_LENGTH && DOMAIN_RE.is_match(name)
}

/// Check a name against the grammar, reporting `field` on failure.
pub fn validate_domain_name(field: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CertdeckError::validation(field, "must not be empty"));
    }
    if name.len() > RegistryConfig::MAX_DOMAIN_LENGTH {
        return Err(CertdeckError::validation(
            field,
            format!(
                "'{}' is longer than {} characters",
                name,
                RegistryConfig::MAX_DOMAIN_LENGTH
            ),
        ));
    }
    if !DOMAIN_RE.is_match(name) {
        return Err(CertdeckError::validation(
            field,
            format!("'{}' is not a valid domain name", name),
        ));
    }
    Ok(())
}

/// Aliases share the line with the names, so they cannot contain the
/// characters the line grammar splits on.
pub fn validate_alias(alias: &str) -> Result<()> {
    if alias.is_empty() {
        return Err(CertdeckError::validation("alias", "must not be empty"));
    }
    if let Some(bad) = alias
        .chars()
        .find(|c| c.is_whitespace() || *c == '#' || *c == '>')
    {
        return Err(CertdeckError::validation(
            "alias",
            format!("'{}' contains forbidden character {:?}", alias, bad),
        ));
    }
    Ok(())
}

pub fn validate_comment(comment: &str) -> Result<()> {
    if comment.contains(['\n', '\r']) {
        return Err(CertdeckError::validation(
            "comment",
            "must be a single line",
        ));
    }
    Ok(())
}

/// Validate every field of an entry. Alternative names are held to the same
/// grammar as the primary name.
pub fn validate_entry(entry: &DomainEntry) -> Result<()> {
    validate_domain_name("domain", &entry.domain)?;
    for (i, name) in entry.alternative_names.iter().enumerate() {
        validate_domain_name(&format!("alternativeNames[{}]", i), name)?;
    }
    if let Some(alias) = &entry.alias {
        validate_alias(alias)?;
    }
    validate_comment(&entry.comment)
}
