use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

use super::core::Database;
use crate::error::TagError;
use crate::tagger::source::DictionarySource;
use crate::tagger::types::{
    format_version, parse_version, BlacklistSnapshot, DictionaryDefinition, Entry, Version,
    WhitelistFields, WhitelistSnapshot,
};
use crate::TARGET_DB;

pub const SOURCE_ENTRIES: &str = "ENTRIES";
pub const SOURCE_BLACKLIST: &str = "BLACKLIST";
pub const SOURCE_WHITELIST: &str = "WHITELIST";

impl Database {
    /// Inserts or replaces a dictionary definition.
    #[instrument(target = "db", level = "info", skip(self, definition), fields(name = %definition.name))]
    pub async fn define_dictionary(&self, definition: &DictionaryDefinition) -> Result<(), sqlx::Error> {
        let (key_field, words_field) = match &definition.whitelist_fields {
            Some(fields) => (Some(fields.key.as_str()), Some(fields.words.as_str())),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO dictionary_definitions (
                name, entity_type, dictionary_source, blacklist_source, whitelist_source,
                whitelist_key_field, whitelist_words_field, link_template, summary_field, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(name) DO UPDATE SET
                entity_type = excluded.entity_type,
                dictionary_source = excluded.dictionary_source,
                blacklist_source = excluded.blacklist_source,
                whitelist_source = excluded.whitelist_source,
                whitelist_key_field = excluded.whitelist_key_field,
                whitelist_words_field = excluded.whitelist_words_field,
                link_template = excluded.link_template,
                summary_field = excluded.summary_field,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&definition.name)
        .bind(definition.entity_type)
        .bind(&definition.dictionary_source)
        .bind(&definition.blacklist_source)
        .bind(&definition.whitelist_source)
        .bind(key_field)
        .bind(words_field)
        .bind(&definition.link_template)
        .bind(&definition.summary_field)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;

        info!(target: TARGET_DB, "Defined dictionary '{}'", definition.name);
        Ok(())
    }

    pub async fn list_definitions(&self) -> Result<Vec<DictionaryDefinition>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT name, entity_type, dictionary_source, blacklist_source, whitelist_source,
                   whitelist_key_field, whitelist_words_field, link_template, summary_field
            FROM dictionary_definitions
            ORDER BY name
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let key: Option<String> = row.get("whitelist_key_field");
                let words: Option<String> = row.get("whitelist_words_field");
                DictionaryDefinition {
                    name: row.get("name"),
                    entity_type: row.get("entity_type"),
                    dictionary_source: row.get("dictionary_source"),
                    blacklist_source: row.get("blacklist_source"),
                    whitelist_source: row.get("whitelist_source"),
                    whitelist_fields: key.zip(words).map(|(key, words)| WhitelistFields { key, words }),
                    link_template: row.get("link_template"),
                    summary_field: row.get("summary_field"),
                }
            })
            .collect())
    }

    async fn register_source(&self, name: &str, kind: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO sources (name, kind, created_at) VALUES (?1, ?2, ?3) ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(kind)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn source_exists(&self, name: &str) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources WHERE name = ?1")
            .bind(name)
            .fetch_one(self.pool())
            .await?;
        Ok(count > 0)
    }

    async fn require_source(&self, name: &str) -> Result<(), TagError> {
        if self.source_exists(name).await? {
            Ok(())
        } else {
            Err(TagError::source_unavailable(name, "no such source"))
        }
    }

    /// Appends raw entry records (`{"identifier": ..., "surface_forms": [...]}`)
    /// to a dictionary source, registering the source if needed. Records are
    /// stored as delivered and validated when a tagger is built.
    #[instrument(target = "db", level = "info", skip(self, records))]
    pub async fn import_entries(
        &self,
        source: &str,
        records: &[serde_json::Value],
    ) -> Result<usize, sqlx::Error> {
        self.register_source(source, SOURCE_ENTRIES).await?;

        let mut tx = self.pool().begin().await?;
        for record in records {
            let identifier = record
                .get("identifier")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let surface_forms = record
                .get("surface_forms")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "null".to_string());

            sqlx::query(
                "INSERT INTO dictionary_entries (source, identifier, surface_forms) VALUES (?1, ?2, ?3)",
            )
            .bind(source)
            .bind(identifier)
            .bind(surface_forms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!(target: TARGET_DB, "Imported {} entries into '{}'", records.len(), source);
        Ok(records.len())
    }

    /// Removes all entries of a source, keeping it registered.
    pub async fn clear_entries(&self, source: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM dictionary_entries WHERE source = ?1")
            .bind(source)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(target = "db", level = "info", skip(self, words))]
    pub async fn add_blacklist_snapshot(
        &self,
        source: &str,
        words: &[String],
        version: Version,
    ) -> Result<(), sqlx::Error> {
        self.register_source(source, SOURCE_BLACKLIST).await?;
        let words = serde_json::to_string(words)
            .map_err(|e| sqlx::Error::Protocol(format!("Failed to encode blacklist: {}", e)))?;

        sqlx::query("INSERT INTO blacklist_snapshots (source, words, version) VALUES (?1, ?2, ?3)")
            .bind(source)
            .bind(words)
            .bind(format_version(&version))
            .execute(self.pool())
            .await?;

        debug!(target: TARGET_DB, "Added blacklist snapshot for '{}' at {}", source, version);
        Ok(())
    }

    #[instrument(target = "db", level = "info", skip(self, records))]
    pub async fn add_whitelist_snapshot(
        &self,
        source: &str,
        records: &[serde_json::Value],
        version: Version,
    ) -> Result<(), sqlx::Error> {
        self.register_source(source, SOURCE_WHITELIST).await?;
        let records = serde_json::to_string(records)
            .map_err(|e| sqlx::Error::Protocol(format!("Failed to encode whitelist: {}", e)))?;

        sqlx::query("INSERT INTO whitelist_snapshots (source, records, version) VALUES (?1, ?2, ?3)")
            .bind(source)
            .bind(records)
            .bind(format_version(&version))
            .execute(self.pool())
            .await?;

        debug!(target: TARGET_DB, "Added whitelist snapshot for '{}' at {}", source, version);
        Ok(())
    }

    async fn latest_snapshot_row(
        &self,
        table: &str,
        payload: &str,
        source: &str,
    ) -> Result<Option<(String, Version)>, TagError> {
        self.require_source(source).await?;

        let query = format!(
            "SELECT {payload}, version FROM {table} WHERE source = ?1 ORDER BY version DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(source)
            .fetch_optional(self.pool())
            .await?;

        match row {
            Some(row) => {
                let version: String = row.get("version");
                Ok(Some((row.get(payload), parse_version(&version)?)))
            }
            None => Ok(None),
        }
    }

    async fn latest_version(&self, table: &str, source: &str) -> Result<Option<Version>, TagError> {
        self.require_source(source).await?;

        let query = format!("SELECT MAX(version) FROM {table} WHERE source = ?1");
        let version: Option<String> = sqlx::query_scalar(&query)
            .bind(source)
            .fetch_one(self.pool())
            .await?;

        version.as_deref().map(parse_version).transpose()
    }
}

fn parse_entry(source: &str, identifier: String, surface_forms: &str) -> Result<Entry, TagError> {
    if identifier.is_empty() {
        return Err(TagError::malformed(source, "entry without identifier"));
    }

    let surface_forms: Vec<String> = serde_json::from_str(surface_forms).map_err(|e| {
        TagError::malformed(source, format!("surface forms of '{}': {}", identifier, e))
    })?;
    if surface_forms.is_empty() {
        return Err(TagError::malformed(
            source,
            format!("'{}' has no surface forms", identifier),
        ));
    }

    Ok(Entry {
        identifier,
        surface_forms,
    })
}

#[async_trait]
impl DictionarySource for Database {
    async fn definitions(&self) -> Result<Vec<DictionaryDefinition>, TagError> {
        Ok(self.list_definitions().await?)
    }

    async fn entries(&self, source_ref: &str) -> Result<Vec<Result<Entry, TagError>>, TagError> {
        self.require_source(source_ref).await?;

        let rows = sqlx::query(
            "SELECT identifier, surface_forms FROM dictionary_entries WHERE source = ?1 ORDER BY id",
        )
        .bind(source_ref)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let surface_forms: String = row.get("surface_forms");
                parse_entry(source_ref, row.get("identifier"), &surface_forms)
            })
            .collect())
    }

    async fn latest_blacklist_version(&self, source_ref: &str) -> Result<Option<Version>, TagError> {
        self.latest_version("blacklist_snapshots", source_ref).await
    }

    async fn latest_blacklist(&self, source_ref: &str) -> Result<Option<BlacklistSnapshot>, TagError> {
        let Some((words, version)) = self
            .latest_snapshot_row("blacklist_snapshots", "words", source_ref)
            .await?
        else {
            return Ok(None);
        };

        let words: BTreeSet<String> = serde_json::from_str(&words)
            .map_err(|e| TagError::source_unavailable(source_ref, format!("unreadable blacklist: {}", e)))?;
        Ok(Some(BlacklistSnapshot { words, version }))
    }

    async fn latest_whitelist_version(&self, source_ref: &str) -> Result<Option<Version>, TagError> {
        self.latest_version("whitelist_snapshots", source_ref).await
    }

    async fn latest_whitelist(&self, source_ref: &str) -> Result<Option<WhitelistSnapshot>, TagError> {
        let Some((records, version)) = self
            .latest_snapshot_row("whitelist_snapshots", "records", source_ref)
            .await?
        else {
            return Ok(None);
        };

        let records: Vec<serde_json::Value> = serde_json::from_str(&records)
            .map_err(|e| TagError::source_unavailable(source_ref, format!("unreadable whitelist: {}", e)))?;
        Ok(Some(WhitelistSnapshot { records, version }))
    }
}
