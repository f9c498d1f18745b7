use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::builder::build_tagger;
use super::source::DictionarySource;
use super::types::{
    epoch_sentinel, DictionaryDefinition, DictionaryInfo, DictionaryVersions, Tagger,
};
use super::TARGET_TAGGER;
use crate::error::TagError;

/// Outcome of one `rebuild_if_stale` pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadReport {
    pub rebuilt: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Owns the live tagger of every dictionary.
///
/// Publishing replaces the `Arc` stored under a name; readers clone the `Arc`
/// out and scan without holding any lock, so a scan that started on one
/// generation finishes on it even if a newer one is published meanwhile.
#[derive(Default)]
pub struct TaggerRegistry {
    taggers: DashMap<String, Arc<Tagger>>,
    generation: AtomicU64,
    // Serializes rebuild passes; never taken by readers.
    reload_lock: Mutex<()>,
}

impl TaggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live tagger for `name`.
    pub fn current(&self, name: &str) -> Result<Arc<Tagger>, TagError> {
        self.taggers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TagError::NotFound(name.to_string()))
    }

    /// Atomically replaces the tagger published under its name, returning the previous one.
    pub fn publish(&self, tagger: Tagger) -> Option<Arc<Tagger>> {
        let name = tagger.name.clone();
        let generation = tagger.generation;
        let previous = self.taggers.insert(name.clone(), Arc::new(tagger));
        info!(target: TARGET_TAGGER, "Published dictionary '{}' generation {}", name, generation);
        previous
    }

    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Registry state, sorted by dictionary name.
    pub fn dictionaries(&self) -> Vec<DictionaryInfo> {
        let mut infos: Vec<DictionaryInfo> = self
            .taggers
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.taggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taggers.is_empty()
    }

    /// Reads the definitions from `source` and rebuilds what changed.
    pub async fn reload<S: DictionarySource + ?Sized>(
        &self,
        source: &S,
    ) -> Result<ReloadReport, TagError> {
        let definitions = source.definitions().await?;
        Ok(self.rebuild_if_stale(source, &definitions).await)
    }

    /// Rebuilds every dictionary whose blacklist or whitelist version differs
    /// from its live tagger, or that has no live tagger yet.
    ///
    /// Failures are logged and reported per dictionary; the previously live
    /// tagger of a failed dictionary stays published.
    pub async fn rebuild_if_stale<S: DictionarySource + ?Sized>(
        &self,
        source: &S,
        definitions: &[DictionaryDefinition],
    ) -> ReloadReport {
        let _guard = self.reload_lock.lock().await;
        let mut report = ReloadReport::default();

        for definition in definitions {
            match self.rebuild_one(source, definition).await {
                Ok(true) => report.rebuilt.push(definition.name.clone()),
                Ok(false) => report.unchanged.push(definition.name.clone()),
                Err(err) => {
                    error!(target: TARGET_TAGGER, "Failed to rebuild dictionary '{}': {}", definition.name, err);
                    report.failed.push((definition.name.clone(), err.to_string()));
                }
            }
        }

        info!(
            target: TARGET_TAGGER,
            "Dictionary reload: {} rebuilt, {} unchanged, {} failed",
            report.rebuilt.len(),
            report.unchanged.len(),
            report.failed.len()
        );
        report
    }

    async fn rebuild_one<S: DictionarySource + ?Sized>(
        &self,
        source: &S,
        definition: &DictionaryDefinition,
    ) -> Result<bool, TagError> {
        let latest = latest_versions(source, definition).await?;

        if let Ok(live) = self.current(&definition.name) {
            if live.versions == latest {
                debug!(target: TARGET_TAGGER, "Dictionary '{}' is up to date", definition.name);
                return Ok(false);
            }
        }

        let tagger = build_tagger(source, definition, self.next_generation()).await?;
        self.publish(tagger);
        Ok(true)
    }
}

/// Current blacklist and whitelist versions of a definition's sources.
pub async fn latest_versions<S: DictionarySource + ?Sized>(
    source: &S,
    definition: &DictionaryDefinition,
) -> Result<DictionaryVersions, TagError> {
    let blacklist = if definition.blacklist_source.is_empty() {
        None
    } else {
        source
            .latest_blacklist_version(&definition.blacklist_source)
            .await?
    };

    let whitelist = if definition.has_whitelist() {
        source
            .latest_whitelist_version(&definition.whitelist_source)
            .await?
    } else {
        None
    };

    Ok(DictionaryVersions {
        blacklist: blacklist.unwrap_or_else(epoch_sentinel),
        whitelist: whitelist.unwrap_or_else(epoch_sentinel),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::tagger::types::parse_version;
    use serde_json::json;

    async fn protein_db() -> (Database, DictionaryDefinition) {
        let db = Database::new(":memory:").await.unwrap();
        db.import_entries(
            "uniprot",
            &[
                json!({"identifier": "P04637", "surface_forms": ["p53", "TP53"]}),
                json!({"identifier": "P38398", "surface_forms": ["BRCA1"]}),
            ],
        )
        .await
        .unwrap();
        db.add_blacklist_snapshot(
            "protein_black",
            &["BRCA1".to_string()],
            parse_version("2024-01-01T00:00:00Z").unwrap(),
        )
        .await
        .unwrap();

        let def = DictionaryDefinition::new("protein", 9606)
            .with_dictionary_source("uniprot")
            .with_blacklist_source("protein_black");
        db.define_dictionary(&def).await.unwrap();
        (db, def)
    }

    #[tokio::test]
    async fn test_current_unknown_is_not_found() {
        let registry = TaggerRegistry::new();
        assert!(matches!(
            registry.current("protein"),
            Err(TagError::NotFound(name)) if name == "protein"
        ));
    }

    #[tokio::test]
    async fn test_rebuild_twice_is_noop() {
        let (db, _) = protein_db().await;
        let registry = TaggerRegistry::new();

        let first = registry.reload(&db).await.unwrap();
        assert_eq!(first.rebuilt, vec!["protein".to_string()]);
        let before = registry.current("protein").unwrap();
        let scan_before = before.scan("p53 and BRCA1");

        let second = registry.reload(&db).await.unwrap();
        assert!(second.rebuilt.is_empty());
        assert_eq!(second.unchanged, vec!["protein".to_string()]);

        let after = registry.current("protein").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.scan("p53 and BRCA1"), scan_before);
        assert_eq!(scan_before.len(), 1);
    }

    #[tokio::test]
    async fn test_new_blacklist_triggers_rebuild() {
        let (db, _) = protein_db().await;
        let registry = TaggerRegistry::new();
        registry.reload(&db).await.unwrap();
        let old = registry.current("protein").unwrap();

        let v2 = parse_version("2024-05-01T00:00:00Z").unwrap();
        db.add_blacklist_snapshot("protein_black", &["p53".to_string()], v2)
            .await
            .unwrap();
        let report = registry.reload(&db).await.unwrap();
        assert_eq!(report.rebuilt, vec!["protein".to_string()]);

        let new = registry.current("protein").unwrap();
        assert!(new.generation > old.generation);
        assert_eq!(new.versions.blacklist, v2);

        // The old generation is untouched and still usable by whoever holds it
        assert_eq!(old.scan("p53 BRCA1").len(), 1);
        let spans = new.scan("p53 TP53 BRCA1");
        assert_eq!(spans.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_previous_tagger() {
        let (db, def) = protein_db().await;
        let registry = TaggerRegistry::new();
        registry.rebuild_if_stale(&db, &[def.clone()]).await;
        let live = registry.current("protein").unwrap();

        let broken = def.clone().with_blacklist_source("missing_blacklist");
        let report = registry.rebuild_if_stale(&db, &[broken]).await;
        assert_eq!(report.failed.len(), 1);

        let still = registry.current("protein").unwrap();
        assert!(Arc::ptr_eq(&live, &still));
    }

    #[tokio::test]
    async fn test_one_failure_does_not_affect_others() {
        let (db, def) = protein_db().await;
        let registry = TaggerRegistry::new();
        let never = DictionaryDefinition::new("pdb", -3).with_dictionary_source("no_such_source");

        let report = registry.rebuild_if_stale(&db, &[never, def]).await;
        assert_eq!(report.rebuilt, vec!["protein".to_string()]);
        assert_eq!(report.failed[0].0, "pdb");
        assert!(matches!(registry.current("pdb"), Err(TagError::NotFound(_))));
        assert!(registry.current("protein").is_ok());
    }

    #[tokio::test]
    async fn test_dictionaries_sorted_with_versions() {
        let (db, _) = protein_db().await;
        let chem = DictionaryDefinition::new("chembl", -1);
        db.define_dictionary(&chem).await.unwrap();

        let registry = TaggerRegistry::new();
        registry.reload(&db).await.unwrap();

        let infos = registry.dictionaries();
        let names: Vec<&str> = infos.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["chembl", "protein"]);
        assert_eq!(infos[0].entity_types, vec![-1]);
        assert_eq!(infos[0].blacklist, "2020-01-01T00:00:00.000000Z");
        assert_eq!(infos[1].blacklist, "2024-01-01T00:00:00.000000Z");
    }

    #[tokio::test]
    async fn test_scan_during_reload_uses_its_generation() {
        let (db, _) = protein_db().await;
        let registry = Arc::new(TaggerRegistry::new());
        registry.reload(&db).await.unwrap();

        let text = "p53 ".repeat(20_000);
        let held = registry.current("protein").unwrap();
        let scanning = tokio::task::spawn_blocking(move || (held.generation, held.scan(&text)));

        db.add_blacklist_snapshot(
            "protein_black",
            &["p53".to_string()],
            parse_version("2024-09-09T00:00:00Z").unwrap(),
        )
        .await
        .unwrap();
        registry.reload(&db).await.unwrap();

        let (generation, spans) = scanning.await.unwrap();
        assert_eq!(spans.len(), 20_000);
        assert!(registry.current("protein").unwrap().generation > generation);
        assert!(registry.current("protein").unwrap().scan("p53").is_empty());
    }
}
