//! Domain entries and the file-backed registry that holds them.
//!
//! - `validation` - the domain-name grammar and per-field checks
//! - `codec` - the line-oriented backing file format
//! - `atomic` - crash-safe text file replacement
//! - `registry` - the cached, lock-guarded [`DomainRegistry`]

pub mod atomic;
pub mod codec;
pub mod registry;
pub mod validation;

pub use codec::{format_entry, parse_entries, parse_line, serialize_entries, sort_for_persistence};
pub use registry::{DomainPage, DomainRegistry, ListQuery, SortField, SortSpec};
pub use validation::{is_valid_domain_name, validate_entry};

use crate::value::ValueMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

fn default_enabled() -> bool {
    true
}

/// One certificate subject: a primary name plus alternative names.
///
/// `domain` alone is not unique in the backing file; `(domain, alias)`
/// tells flavors of the same subject apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEntry {
    pub domain: String,
    #[serde(default)]
    pub alternative_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub comment: String,
    /// Plugin name -> what that plugin returned. Only present on enriched reads.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, ValueMap>,
}

impl DomainEntry {
    /// An enabled entry with no alternative names, alias or comment.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            alternative_names: Vec::new(),
            alias: None,
            enabled: true,
            comment: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_alternative_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alternative_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Structural match used by lookups. `alias: None` matches any flavor.
    pub fn matches(&self, domain: &str, alias: Option<&str>) -> bool {
        self.domain == domain
            && match alias {
                Some(alias) => self.alias.as_deref() == Some(alias),
                None => true,
            }
    }

    /// Trim every text field and fold an empty alias into "no alias".
    pub fn normalized(mut self) -> Self {
        self.domain = self.domain.trim().to_string();
        self.alternative_names = self
            .alternative_names
            .iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        self.alias = self
            .alias
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        self.comment = self.comment.trim().to_string();
        self
    }

    /// The entry without any plugin metadata.
    pub fn without_metadata(&self) -> Self {
        Self {
            metadata: BTreeMap::new(),
            ..self.clone()
        }
    }
}

/// Partial update: only fields that are `Some` are replaced.
///
/// `alias` distinguishes "leave alone" (`None`) from "clear" (`Some(None)`);
/// in JSON that is an absent key versus `"alias": null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative_names: Option<Vec<String>>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub alias: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn present_or_null<'de, D>(deserializer: D) -> std::result::Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

impl DomainUpdate {
    pub fn is_empty(&self) -> bool {
        self.domain.is_none()
            && self.alternative_names.is_none()
            && self.alias.is_none()
            && self.enabled.is_none()
            && self.comment.is_none()
    }

    /// Apply the present fields on top of `entry`.
    pub fn apply_to(&self, entry: &DomainEntry) -> DomainEntry {
        let mut updated = entry.without_metadata();
        if let Some(domain) = &self.domain {
            updated.domain = domain.clone();
        }
        if let Some(names) = &self.alternative_names {
            updated.alternative_names = names.clone();
        }
        if let Some(alias) = &self.alias {
            updated.alias = alias.clone();
        }
        if let Some(enabled) = self.enabled {
            updated.enabled = enabled;
        }
        if let Some(comment) = &self.comment {
            updated.comment = comment.clone();
        }
        updated.normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_with_and_without_alias() {
        let entry = DomainEntry::new("example.com").with_alias("prod");
        assert!(entry.matches("example.com", None));
        assert!(entry.matches("example.com", Some("prod")));
        assert!(!entry.matches("example.com", Some("staging")));
        assert!(!entry.matches("example.org", None));
    }

    #[test]
    fn test_normalized_trims_and_drops_empty_alias() {
        let entry = DomainEntry::new("  example.com ")
            .with_alternative_names([" www.example.com", ""])
            .with_alias("  ")
            .with_comment(" note ")
            .normalized();
        assert_eq!(entry.domain, "example.com");
        assert_eq!(entry.alternative_names, vec!["www.example.com"]);
        assert_eq!(entry.alias, None);
        assert_eq!(entry.comment, "note");
    }

    #[test]
    fn test_update_distinguishes_absent_and_null_alias() {
        let keep: DomainUpdate = serde_json::from_str(r#"{"enabled": false}"#).unwrap();
        assert_eq!(keep.alias, None);

        let clear: DomainUpdate = serde_json::from_str(r#"{"alias": null}"#).unwrap();
        assert_eq!(clear.alias, Some(None));

        let set: DomainUpdate = serde_json::from_str(r#"{"alias": "blue"}"#).unwrap();
        assert_eq!(set.alias, Some(Some("blue".to_string())));
    }

    #[test]
    fn test_update_only_touches_present_fields() {
        let entry = DomainEntry::new("example.com")
            .with_alternative_names(["www.example.com"])
            .with_alias("prod")
            .with_comment("keep me");
        let update = DomainUpdate {
            enabled: Some(false),
            alias: Some(None),
            ..Default::default()
        };

        let updated = update.apply_to(&entry);
        assert_eq!(updated.domain, "example.com");
        assert_eq!(updated.alternative_names, vec!["www.example.com"]);
        assert_eq!(updated.alias, None);
        assert!(!updated.enabled);
        assert_eq!(updated.comment, "keep me");
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = DomainEntry::new("example.com").with_alias("a");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "domain": "example.com",
                "alternativeNames": [],
                "alias": "a",
                "enabled": true,
                "comment": ""
            })
        );
        let back: DomainEntry = serde_json::from_str(r#"{"domain": "example.com"}"#).unwrap();
        assert!(back.enabled);
    }
}
