use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

use super::source::DictionarySource;
use super::types::{
    epoch_sentinel, DictionaryDefinition, DictionaryVersions, Tagger, WhitelistFields,
};
use super::TARGET_TAGGER;
use crate::error::TagError;
use crate::matcher::PatternStore;

/// One whitelist group: a key and the surface forms bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistGroup {
    pub key: String,
    pub surface_forms: Vec<String>,
}

/// Reads a whitelist group out of a raw snapshot record.
pub fn extract_whitelist_group(
    record: &serde_json::Value,
    fields: &WhitelistFields,
    source_ref: &str,
) -> Result<WhitelistGroup, TagError> {
    let key = record
        .get(&fields.key)
        .and_then(|v| v.as_str())
        .filter(|k| !k.is_empty())
        .ok_or_else(|| TagError::malformed(source_ref, format!("missing '{}'", fields.key)))?;

    let words = record
        .get(&fields.words)
        .and_then(|v| v.as_array())
        .ok_or_else(|| TagError::malformed(source_ref, format!("missing '{}'", fields.words)))?;

    let surface_forms = words
        .iter()
        .map(|w| {
            w.as_str().map(str::to_string).ok_or_else(|| {
                TagError::malformed(source_ref, format!("non-string word under '{}'", key))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(WhitelistGroup {
        key: key.to_string(),
        surface_forms,
    })
}

/// Builds a complete tagger for `definition`: entries first, then blacklist
/// blocks, then whitelist additions.
///
/// Whitelisted surface forms are exempt from the blacklist loaded in the same
/// build. Malformed records are skipped; an unreadable source aborts the build.
pub async fn build_tagger<S: DictionarySource + ?Sized>(
    source: &S,
    definition: &DictionaryDefinition,
    generation: u64,
) -> Result<Tagger, TagError> {
    let name = definition.name.as_str();
    let entity_type = definition.entity_type;
    info!(target: TARGET_TAGGER, "Building tagger for dictionary '{}' (generation {})", name, generation);

    let mut builder = PatternStore::builder();
    let mut malformed = 0usize;

    if !definition.dictionary_source.is_empty() {
        let entries = source.entries(&definition.dictionary_source).await?;
        let total = entries.len();
        for entry in entries {
            match entry {
                Ok(entry) => {
                    for word in &entry.surface_forms {
                        builder.insert(word, entity_type, &entry.identifier);
                    }
                }
                Err(err) => {
                    warn!(target: TARGET_TAGGER, "Skipping entry for '{}': {}", name, err);
                    malformed += 1;
                }
            }
        }
        debug!(target: TARGET_TAGGER, "Loaded {} entries from '{}'", total - malformed, definition.dictionary_source);
    }

    let blacklist = if definition.blacklist_source.is_empty() {
        None
    } else {
        source.latest_blacklist(&definition.blacklist_source).await?
    };

    let whitelist = match (&definition.whitelist_fields, definition.has_whitelist()) {
        (Some(fields), true) => source
            .latest_whitelist(&definition.whitelist_source)
            .await?
            .map(|snapshot| (snapshot, fields)),
        _ => None,
    };

    let mut groups = Vec::new();
    if let Some((snapshot, fields)) = &whitelist {
        for record in &snapshot.records {
            match extract_whitelist_group(record, fields, &definition.whitelist_source) {
                Ok(group) => groups.push(group),
                Err(err) => {
                    warn!(target: TARGET_TAGGER, "Skipping whitelist group for '{}': {}", name, err);
                    malformed += 1;
                }
            }
        }
    }

    let whitelisted: HashSet<&str> = groups
        .iter()
        .flat_map(|g| g.surface_forms.iter().map(String::as_str))
        .collect();

    if let Some(snapshot) = &blacklist {
        for word in &snapshot.words {
            if whitelisted.contains(word.as_str()) {
                debug!(target: TARGET_TAGGER, "'{}' is whitelisted, not blocking it in '{}'", word, name);
                continue;
            }
            builder.block(word);
        }
    }

    for group in &groups {
        for word in &group.surface_forms {
            builder.insert(word, entity_type, &group.key);
        }
    }

    let versions = DictionaryVersions {
        blacklist: blacklist
            .as_ref()
            .map(|s| s.version)
            .unwrap_or_else(epoch_sentinel),
        whitelist: whitelist
            .as_ref()
            .map(|(s, _)| s.version)
            .unwrap_or_else(epoch_sentinel),
    };

    let store = builder.build();
    info!(
        target: TARGET_TAGGER,
        "Dictionary '{}' built: {} surface forms, {} blocked, {} whitelist groups, {} malformed records skipped",
        name,
        store.surface_form_count(),
        store.blocked_count(),
        groups.len(),
        malformed
    );

    Ok(Tagger::new(
        name,
        BTreeSet::from([entity_type]),
        versions,
        generation,
        store,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::matcher::Binding;
    use crate::tagger::types::parse_version;
    use serde_json::json;

    async fn seeded() -> Database {
        let db = Database::new(":memory:").await.unwrap();
        db.import_entries(
            "chem_dict",
            &[
                json!({"identifier": "CHEMBL25", "surface_forms": ["aspirin", "acetylsalicylic acid"]}),
                json!({"identifier": "CHEMBL1", "surface_forms": ["ABC"]}),
                json!({"identifier": "", "surface_forms": ["broken"]}),
                json!({"identifier": "CHEMBL2", "surface_forms": "not-a-list"}),
            ],
        )
        .await
        .unwrap();
        db
    }

    #[test]
    fn test_extract_whitelist_group() {
        let fields = WhitelistFields {
            key: "key".to_string(),
            words: "words".to_string(),
        };
        let group =
            extract_whitelist_group(&json!({"key": "W1", "words": ["a", "b"]}), &fields, "wl")
                .unwrap();
        assert_eq!(group.key, "W1");
        assert_eq!(group.surface_forms, vec!["a", "b"]);

        assert!(extract_whitelist_group(&json!({"words": ["a"]}), &fields, "wl").is_err());
        assert!(extract_whitelist_group(&json!({"key": "W1", "words": [1]}), &fields, "wl").is_err());
    }

    #[tokio::test]
    async fn test_malformed_entries_are_skipped() {
        let db = seeded().await;
        let def = DictionaryDefinition::new("chembl", -1).with_dictionary_source("chem_dict");

        let tagger = build_tagger(&db, &def, 1).await.unwrap();
        assert_eq!(tagger.store().surface_form_count(), 3);
        assert_eq!(tagger.versions, DictionaryVersions::default());

        let spans = tagger.scan("aspirin and broken ABC");
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].bindings, vec![Binding::new(-1, "CHEMBL25")]);
    }

    #[tokio::test]
    async fn test_blacklist_blocks_and_sets_version() {
        let db = seeded().await;
        let v1 = parse_version("2024-01-01T00:00:00Z").unwrap();
        let v2 = parse_version("2024-06-01T00:00:00Z").unwrap();
        db.add_blacklist_snapshot("chem_black", &["aspirin".to_string()], v1)
            .await
            .unwrap();
        db.add_blacklist_snapshot("chem_black", &["ABC".to_string()], v2)
            .await
            .unwrap();

        let def = DictionaryDefinition::new("chembl", -1)
            .with_dictionary_source("chem_dict")
            .with_blacklist_source("chem_black");
        let tagger = build_tagger(&db, &def, 1).await.unwrap();

        // Only the newest snapshot is active
        assert_eq!(tagger.versions.blacklist, v2);
        let spans = tagger.scan("aspirin ABC");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 0);
    }

    #[tokio::test]
    async fn test_whitelist_survives_blacklist() {
        let db = seeded().await;
        let version = parse_version("2024-02-02T00:00:00Z").unwrap();
        db.add_blacklist_snapshot("chem_black", &["ABC".to_string(), "aspirin".to_string()], version)
            .await
            .unwrap();
        db.add_whitelist_snapshot(
            "chem_white",
            &[json!({"cid": "2244", "names": ["ABC", "ASA"]})],
            version,
        )
        .await
        .unwrap();

        let def = DictionaryDefinition::new("pubchem", -1)
            .with_dictionary_source("chem_dict")
            .with_blacklist_source("chem_black")
            .with_whitelist_source("chem_white", "cid", "names");
        let tagger = build_tagger(&db, &def, 1).await.unwrap();

        assert_eq!(tagger.versions.whitelist, version);
        let text = "ABC, ASA, aspirin";
        let spans = tagger.scan(text);
        let surfaces: Vec<&str> = spans.iter().filter_map(|s| s.surface(text)).collect();
        assert_eq!(surfaces, vec!["ABC", "ASA"]);
        assert!(spans[0].bindings.contains(&Binding::new(-1, "2244")));
    }

    #[tokio::test]
    async fn test_missing_source_aborts_build() {
        let db = Database::new(":memory:").await.unwrap();
        let def = DictionaryDefinition::new("protein", 9606).with_dictionary_source("nowhere");

        let err = build_tagger(&db, &def, 1).await.unwrap_err();
        assert!(matches!(err, TagError::SourceUnavailable { .. }));
    }
}
