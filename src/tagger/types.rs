use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::TagError;
use crate::matcher::{MatchSpan, PatternStore};

/// Blacklist and whitelist versions are the timestamps of their snapshots.
pub type Version = DateTime<Utc>;

/// 2020-01-01T00:00:00Z, the version of a source that has no snapshot.
pub const EPOCH_SENTINEL_SECS: i64 = 1_577_836_800;

pub fn epoch_sentinel() -> Version {
    DateTime::from_timestamp(EPOCH_SENTINEL_SECS, 0).unwrap_or_default()
}

/// Fixed-width RFC 3339, so stored versions also sort correctly as text.
pub fn format_version(version: &Version) -> String {
    version.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a version; the empty string stands for the sentinel.
pub fn parse_version(value: &str) -> Result<Version, TagError> {
    if value.trim().is_empty() {
        return Ok(epoch_sentinel());
    }
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TagError::malformed("version", format!("'{}': {}", value, e)))
}

/// Field names used to read whitelist groups out of raw snapshot records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistFields {
    pub key: String,
    pub words: String,
}

/// Everything needed to construct one dictionary's tagger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryDefinition {
    pub name: String,
    pub entity_type: i32,
    #[serde(default)]
    pub dictionary_source: String,
    #[serde(default)]
    pub blacklist_source: String,
    #[serde(default)]
    pub whitelist_source: String,
    #[serde(default)]
    pub whitelist_fields: Option<WhitelistFields>,
    /// Rendering of a single binding, `{id}` and `{type}` are substituted.
    #[serde(default)]
    pub link_template: Option<String>,
    /// Name of the document-level identifier list this dictionary maintains.
    #[serde(default)]
    pub summary_field: Option<String>,
}

impl DictionaryDefinition {
    pub fn new(name: &str, entity_type: i32) -> Self {
        DictionaryDefinition {
            name: name.to_string(),
            entity_type,
            dictionary_source: String::new(),
            blacklist_source: String::new(),
            whitelist_source: String::new(),
            whitelist_fields: None,
            link_template: None,
            summary_field: None,
        }
    }

    pub fn with_dictionary_source(mut self, source: &str) -> Self {
        self.dictionary_source = source.to_string();
        self
    }

    pub fn with_blacklist_source(mut self, source: &str) -> Self {
        self.blacklist_source = source.to_string();
        self
    }

    pub fn with_whitelist_source(mut self, source: &str, key: &str, words: &str) -> Self {
        self.whitelist_source = source.to_string();
        self.whitelist_fields = Some(WhitelistFields {
            key: key.to_string(),
            words: words.to_string(),
        });
        self
    }

    pub fn with_link_template(mut self, template: &str) -> Self {
        self.link_template = Some(template.to_string());
        self
    }

    pub fn with_summary_field(mut self, field: &str) -> Self {
        self.summary_field = Some(field.to_string());
        self
    }

    /// The whitelist is only consulted when both its source and field names are set.
    pub fn has_whitelist(&self) -> bool {
        !self.whitelist_source.is_empty() && self.whitelist_fields.is_some()
    }

    pub fn summary_field(&self) -> &str {
        self.summary_field.as_deref().unwrap_or(&self.name)
    }
}

/// A canonical identifier and its surface forms; the first form is the display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub identifier: String,
    pub surface_forms: Vec<String>,
}

impl Entry {
    pub fn display_name(&self) -> Option<&str> {
        self.surface_forms.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistSnapshot {
    pub words: BTreeSet<String>,
    pub version: Version,
}

/// Raw whitelist snapshot; groups are extracted with the definition's field names.
#[derive(Debug, Clone, PartialEq)]
pub struct WhitelistSnapshot {
    pub records: Vec<serde_json::Value>,
    pub version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictionaryVersions {
    pub blacklist: Version,
    pub whitelist: Version,
}

impl Default for DictionaryVersions {
    fn default() -> Self {
        DictionaryVersions {
            blacklist: epoch_sentinel(),
            whitelist: epoch_sentinel(),
        }
    }
}

/// An immutable, published matcher for one dictionary.
#[derive(Debug)]
pub struct Tagger {
    pub name: String,
    pub entity_types: BTreeSet<i32>,
    pub versions: DictionaryVersions,
    pub generation: u64,
    pub built_at: DateTime<Utc>,
    store: PatternStore,
}

impl Tagger {
    pub fn new(
        name: &str,
        entity_types: BTreeSet<i32>,
        versions: DictionaryVersions,
        generation: u64,
        store: PatternStore,
    ) -> Self {
        Tagger {
            name: name.to_string(),
            entity_types,
            versions,
            generation,
            built_at: Utc::now(),
            store,
        }
    }

    pub fn scan(&self, text: &str) -> Vec<MatchSpan> {
        self.store.scan(text)
    }

    pub fn store(&self) -> &PatternStore {
        &self.store
    }

    pub fn info(&self) -> DictionaryInfo {
        DictionaryInfo {
            name: self.name.clone(),
            entity_types: self.entity_types.iter().copied().collect(),
            blacklist: format_version(&self.versions.blacklist),
            whitelist: format_version(&self.versions.whitelist),
        }
    }
}

/// Registry state of one dictionary as reported by `GET /dictionaries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryInfo {
    pub name: String,
    pub entity_types: Vec<i32>,
    #[serde(default)]
    pub blacklist: String,
    #[serde(default)]
    pub whitelist: String,
}

impl DictionaryInfo {
    pub fn versions(&self) -> Result<DictionaryVersions, TagError> {
        Ok(DictionaryVersions {
            blacklist: parse_version(&self.blacklist)?,
            whitelist: parse_version(&self.whitelist)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_is_2020() {
        assert_eq!(format_version(&epoch_sentinel()), "2020-01-01T00:00:00.000000Z");
    }

    #[test]
    fn test_empty_version_is_sentinel() {
        assert_eq!(parse_version("").unwrap(), epoch_sentinel());
        assert!(parse_version("yesterday").is_err());
    }

    #[test]
    fn test_version_text_roundtrip_and_order() {
        let earlier = parse_version("2024-03-01T10:00:00Z").unwrap();
        let later = parse_version("2024-03-01T10:00:00.5+00:00").unwrap();
        assert!(format_version(&earlier) < format_version(&later));
        assert_eq!(parse_version(&format_version(&later)).unwrap(), later);
    }

    #[test]
    fn test_definition_defaults() {
        let def = DictionaryDefinition::new("protein", 9606).with_dictionary_source("uniprot");
        assert!(!def.has_whitelist());
        assert_eq!(def.summary_field(), "protein");

        let def = def
            .with_whitelist_source("protein_whitelist", "primary_accession", "words")
            .with_summary_field("primary_accession");
        assert!(def.has_whitelist());
        assert_eq!(def.summary_field(), "primary_accession");
    }
}
