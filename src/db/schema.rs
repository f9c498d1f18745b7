use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            -- One row per served dictionary
            CREATE TABLE IF NOT EXISTS dictionary_definitions (
                name TEXT PRIMARY KEY,
                entity_type INTEGER NOT NULL,
                dictionary_source TEXT NOT NULL DEFAULT '',
                blacklist_source TEXT NOT NULL DEFAULT '',
                whitelist_source TEXT NOT NULL DEFAULT '',
                whitelist_key_field TEXT,
                whitelist_words_field TEXT,
                link_template TEXT,
                summary_field TEXT,
                updated_at TEXT NOT NULL
            );

            -- Known entry, blacklist and whitelist sources
            CREATE TABLE IF NOT EXISTS sources (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL, -- ENTRIES, BLACKLIST, WHITELIST
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dictionary_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                identifier TEXT NOT NULL,
                surface_forms TEXT NOT NULL -- JSON array, as delivered by the importer
            );
            CREATE INDEX IF NOT EXISTS idx_dictionary_entries_source ON dictionary_entries (source);

            CREATE TABLE IF NOT EXISTS blacklist_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                words TEXT NOT NULL, -- JSON array of blocked surface forms
                version TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_blacklist_snapshots_source_version ON blacklist_snapshots (source, version);

            CREATE TABLE IF NOT EXISTS whitelist_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                records TEXT NOT NULL, -- JSON array of group objects
                version TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_whitelist_snapshots_source_version ON whitelist_snapshots (source, version);

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                elements TEXT NOT NULL, -- JSON object: element name -> original text
                summaries TEXT NOT NULL DEFAULT '{}',
                rendered TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                modified_at TEXT
            );

            -- One tag record per (document, dictionary), replaced wholesale on retag
            CREATE TABLE IF NOT EXISTS document_tags (
                document_id TEXT NOT NULL,
                dictionary_name TEXT NOT NULL,
                spans TEXT NOT NULL, -- JSON object: element name -> match spans
                blacklist_version TEXT NOT NULL,
                whitelist_version TEXT NOT NULL,
                tagged_at TEXT NOT NULL,
                PRIMARY KEY (document_id, dictionary_name),
                FOREIGN KEY (document_id) REFERENCES documents (id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_document_tags_dictionary ON document_tags (dictionary_name);

            CREATE TABLE IF NOT EXISTS statistics (
                name TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await?;

        info!(target: TARGET_DB, "Database schema initialized");
        Ok(())
    }
}
