//! Line-oriented domain list format.
//!
//! One entry per line:
//!
//! ```text
//! [#]domain [altName ...] [> alias] [# comment]
//! ```
//!
//! A leading `#` disables the entry. The first remaining `#` starts the
//! inline comment, `>` separates the alias from the names. Lines with no
//! names are skipped; lines whose names or alias fail validation are dropped.

use super::atomic::read_text_if_exists;
use super::validation::validate_entry;
use super::DomainEntry;
use crate::error::Result;
use std::path::Path;
use tracing::{debug, warn};

/// Parse a single line.
///
/// Returns `Ok(None)` for lines that carry no entry (blank, or a bare `#`),
/// and a validation error for lines whose entry is malformed.
pub fn parse_line(line: &str) -> Result<Option<DomainEntry>> {
    let mut rest = line.trim();
    let mut enabled = true;
    if let Some(stripped) = rest.strip_prefix('#') {
        enabled = false;
        rest = stripped;
    }

    let (main, comment) = match rest.split_once('#') {
        Some((main, comment)) => (main, comment.trim()),
        None => (rest, ""),
    };
    let (names, alias) = match main.split_once('>') {
        Some((names, alias)) => (names, Some(alias.trim()).filter(|a| !a.is_empty())),
        None => (main, None),
    };

    let mut tokens = names.split_whitespace();
    let Some(domain) = tokens.next() else {
        return Ok(None);
    };

    let entry = DomainEntry {
        domain: domain.to_string(),
        alternative_names: tokens.map(str::to_string).collect(),
        alias: alias.map(str::to_string),
        enabled,
        comment: comment.to_string(),
        metadata: Default::default(),
    };
    validate_entry(&entry)?;
    Ok(Some(entry))
}

/// Parse a whole file's contents, dropping malformed lines.
pub fn parse_entries(text: &str) -> Vec<DomainEntry> {
    let mut entries = Vec::new();
    for (index, line) in text.lines().enumerate() {
        match parse_line(line) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            // Disabled lines are often prose comments, not broken entries.
            Err(e) if line.trim_start().starts_with('#') => {
                debug!("Skipping line {}: {}", index + 1, e);
            }
            Err(e) => {
                warn!("Dropping line {}: {}", index + 1, e);
            }
        }
    }
    entries
}

/// Render one entry as a line (no trailing newline).
pub fn format_entry(entry: &DomainEntry) -> String {
    let mut line = String::new();
    if !entry.enabled {
        line.push_str("# ");
    }
    line.push_str(&entry.domain);
    for name in &entry.alternative_names {
        line.push(' ');
        line.push_str(name);
    }
    if let Some(alias) = &entry.alias {
        line.push_str(" > ");
        line.push_str(alias);
    }
    if !entry.comment.is_empty() {
        line.push_str(" # ");
        line.push_str(&entry.comment);
    }
    line
}

/// Order used when writing the file: by domain, alias-less entries before
/// aliased ones, then by alias.
pub fn sort_for_persistence(entries: &mut [DomainEntry]) {
    // Option orders None before Some, which is exactly the alias rule.
    entries.sort_by(|a, b| (&a.domain, &a.alias).cmp(&(&b.domain, &b.alias)));
}

/// Sort a copy of `entries` and render it as file contents.
pub fn serialize_entries(entries: &[DomainEntry]) -> String {
    let mut sorted = entries.to_vec();
    sort_for_persistence(&mut sorted);
    let mut out = String::new();
    for entry in &sorted {
        out.push_str(&format_entry(entry));
        out.push('\n');
    }
    out
}

/// Read and parse the backing file. A missing file is an empty list.
pub fn read_entries_file(path: &Path) -> Result<Vec<DomainEntry>> {
    Ok(read_text_if_exists(path)?
        .map(|text| parse_entries(&text))
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_full_line_parses_and_reproduces() {
        let line = "example.com www.example.com > myalias # prod";
        let entry = parse_line(line).unwrap().unwrap();

        assert_eq!(entry.domain, "example.com");
        assert_eq!(entry.alternative_names, vec!["www.example.com"]);
        assert_eq!(entry.alias.as_deref(), Some("myalias"));
        assert!(entry.enabled);
        assert_eq!(entry.comment, "prod");

        assert_eq!(format_entry(&entry), line);
    }

    #[test]
    fn test_disabled_line() {
        let entry = parse_line("# disabled.com").unwrap().unwrap();
        assert_eq!(entry.domain, "disabled.com");
        assert!(!entry.enabled);
        assert!(entry.alternative_names.is_empty());
        assert_eq!(entry.alias, None);

        let entry = parse_line("#tight.example.org > x # note # more").unwrap().unwrap();
        assert!(!entry.enabled);
        assert_eq!(entry.alias.as_deref(), Some("x"));
        assert_eq!(entry.comment, "note # more");
    }

    #[test]
    fn test_lines_without_names_are_skipped() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("#").unwrap().is_none());
        assert!(parse_line("  > alias # only a comment").unwrap().is_none());
    }

    #[test]
    fn test_empty_alias_is_none() {
        let entry = parse_line("example.com > # c").unwrap().unwrap();
        assert_eq!(entry.alias, None);
        assert_eq!(entry.comment, "c");
    }

    #[test]
    fn test_strict_policy_drops_bad_alternative_names() {
        let text = "good.example.com\n\
                    bad_primary www.example.com\n\
                    ok.example.com not_valid.example.com\n\
                    # just some prose about the file\n\
                    *.wild.example.net other.example.net\n";
        let entries = parse_entries(text);
        let domains: Vec<_> = entries.iter().map(|e| e.domain.as_str()).collect();
        assert_eq!(domains, vec!["good.example.com", "*.wild.example.net"]);
    }

    #[test]
    fn test_sort_order_for_persistence() {
        let mut entries = vec![
            DomainEntry::new("b.example.com"),
            DomainEntry::new("a.example.com").with_alias("zeta"),
            DomainEntry::new("a.example.com"),
            DomainEntry::new("a.example.com").with_alias("alpha"),
        ];
        sort_for_persistence(&mut entries);
        let keys: Vec<_> = entries
            .iter()
            .map(|e| (e.domain.as_str(), e.alias.as_deref()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a.example.com", None),
                ("a.example.com", Some("alpha")),
                ("a.example.com", Some("zeta")),
                ("b.example.com", None),
            ]
        );
    }

    #[test]
    fn test_parse_of_serialized_sorted_list_is_identity() {
        let cases = vec![
            vec![
                DomainEntry::new("zeta.example.com").with_comment("last # really"),
                DomainEntry::new("example.com")
                    .with_alternative_names(["www.example.com", "*.cdn.example.com"])
                    .with_alias("edge"),
                DomainEntry::new("example.com").with_enabled(false),
                DomainEntry::new("mail.example.org")
                    .with_enabled(false)
                    .with_alias("mx")
                    .with_comment("paused"),
            ],
            // Disabled wildcards.
            vec![
                DomainEntry::new("*.example.net")
                    .with_alternative_names(["*.eu.example.net", "*.us.example.net"])
                    .with_enabled(false),
                DomainEntry::new("example.net")
                    .with_alternative_names(["*.example.net"])
                    .with_enabled(false)
                    .with_alias("wild"),
            ],
            // Comments holding the alias separator.
            vec![
                DomainEntry::new("api.example.com")
                    .with_alias("v1")
                    .with_comment("moved > v2"),
                DomainEntry::new("api.example.com").with_comment("a > b > c"),
                DomainEntry::new("old.example.com")
                    .with_enabled(false)
                    .with_comment("-> see > api"),
            ],
        ];

        for mut entries in cases {
            sort_for_persistence(&mut entries);
            let text = serialize_entries(&entries);
            assert_eq!(parse_entries(&text), entries, "{text}");
            assert_eq!(text.lines().count(), entries.len());
            assert!(text.ends_with('\n'));
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let entries = read_entries_file(&temp_dir.path().join("absent.txt")).unwrap();
        assert!(entries.is_empty());
    }
}
