use chrono::{DateTime, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use sqlx::Row;
use std::collections::BTreeMap;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, instrument, warn};

use super::core::{Database, DbLockErrorExt};
use crate::retag::types::{Document, DocumentTagRecord};
use crate::tagger::types::{format_version, parse_version, DictionaryVersions};
use crate::TARGET_DB;

const SAVE_MAX_RETRIES: u32 = 5;

fn decode_json<T: DeserializeOwned>(value: &str) -> Result<T, sqlx::Error> {
    serde_json::from_str(value).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn encode_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, sqlx::Error> {
    serde_json::to_string(value).map_err(|e| sqlx::Error::Protocol(format!("JSON encoding failed: {}", e)))
}

fn decode_version(value: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    parse_version(value).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

impl Database {
    /// Stores a document's original element texts.
    ///
    /// Returns `true` if the document is new or its elements changed. Changed
    /// elements drop all stored tags so the next sweep retags the document.
    #[instrument(target = "db", level = "info", skip(self, elements))]
    pub async fn add_document(
        &self,
        id: &str,
        elements: &BTreeMap<String, String>,
    ) -> Result<bool, sqlx::Error> {
        let encoded = encode_json(elements)?;
        let mut tx = self.pool().begin().await?;

        let existing: Option<String> = sqlx::query_scalar("SELECT elements FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let changed = match existing {
            None => {
                sqlx::query("INSERT INTO documents (id, elements, created_at) VALUES (?1, ?2, ?3)")
                    .bind(id)
                    .bind(&encoded)
                    .bind(Utc::now().to_rfc3339())
                    .execute(&mut *tx)
                    .await?;
                info!(target: TARGET_DB, "Added document {}", id);
                true
            }
            Some(stored) => {
                let stored: BTreeMap<String, String> = decode_json(&stored)?;
                if &stored == elements {
                    debug!(target: TARGET_DB, "Document {} unchanged", id);
                    false
                } else {
                    sqlx::query("UPDATE documents SET elements = ?1 WHERE id = ?2")
                        .bind(&encoded)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query("DELETE FROM document_tags WHERE document_id = ?1")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    info!(target: TARGET_DB, "Updated document {}, stored tags dropped", id);
                    true
                }
            }
        };

        tx.commit().await?;
        Ok(changed)
    }

    pub async fn list_document_ids(&self) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT id FROM documents ORDER BY id")
            .fetch_all(self.pool())
            .await
    }

    pub async fn load_document(&self, id: &str) -> Result<Option<Document>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, elements, summaries, rendered, modified_at FROM documents WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let elements: String = row.get("elements");
        let summaries: String = row.get("summaries");
        let rendered: String = row.get("rendered");
        let modified_at: Option<String> = row.get("modified_at");

        Ok(Some(Document {
            id: row.get("id"),
            elements: decode_json(&elements)?,
            summaries: decode_json(&summaries)?,
            rendered: decode_json(&rendered)?,
            modified_at: modified_at.as_deref().map(decode_version).transpose()?,
        }))
    }

    /// Stored tag records of one document, keyed by dictionary name.
    pub async fn load_tag_records(
        &self,
        document_id: &str,
    ) -> Result<BTreeMap<String, DocumentTagRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, dictionary_name, spans, blacklist_version, whitelist_version, tagged_at
            FROM document_tags
            WHERE document_id = ?1
            "#,
        )
        .bind(document_id)
        .fetch_all(self.pool())
        .await?;

        let mut records = BTreeMap::new();
        for row in rows {
            let record = tag_record_from_row(&row)?;
            records.insert(record.dictionary.clone(), record);
        }
        Ok(records)
    }

    /// Every stored tag record of one dictionary.
    pub async fn load_dictionary_tag_records(
        &self,
        dictionary: &str,
    ) -> Result<Vec<DocumentTagRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, dictionary_name, spans, blacklist_version, whitelist_version, tagged_at
            FROM document_tags
            WHERE dictionary_name = ?1
            ORDER BY document_id
            "#,
        )
        .bind(dictionary)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(tag_record_from_row).collect()
    }

    /// Original element texts of every document.
    pub async fn load_all_elements(&self) -> Result<Vec<(String, BTreeMap<String, String>)>, sqlx::Error> {
        let rows = sqlx::query("SELECT id, elements FROM documents ORDER BY id")
            .fetch_all(self.pool())
            .await?;

        rows.into_iter()
            .map(|row| {
                let elements: String = row.get("elements");
                Ok((row.get("id"), decode_json(&elements)?))
            })
            .collect()
    }

    /// Replaces the given tag records and the document's derived fields in
    /// one transaction, retrying while the database is locked.
    ///
    /// Returns `false` without writing anything if the document's elements no
    /// longer match `document.elements`, i.e. it was re-added while being tagged.
    #[instrument(target = "db", level = "info", skip(self, document, records), fields(id = %document.id))]
    pub async fn save_retag(
        &self,
        document: &Document,
        records: &[DocumentTagRecord],
    ) -> Result<bool, sqlx::Error> {
        for attempt in 1..=SAVE_MAX_RETRIES {
            match self.try_save_retag(document, records).await {
                Ok(true) => {
                    debug!(target: TARGET_DB, "Saved {} tag records for {}", records.len(), document.id);
                    return Ok(true);
                }
                Ok(false) => {
                    info!(target: TARGET_DB, "Document {} changed while being tagged, tags discarded", document.id);
                    return Ok(false);
                }
                Err(err) if err.is_database_lock_error() => {
                    let jitter = rand::rng().random_range(0..50);
                    let Some(delay) = retry_delay(attempt, SAVE_MAX_RETRIES, jitter) else {
                        break;
                    };
                    warn!(target: TARGET_DB, "Database is locked, waiting {:?} before retrying attempt {}/{}: {}", delay, attempt, SAVE_MAX_RETRIES, document.id);
                    sleep(delay).await;
                }
                Err(err) => {
                    error!(target: TARGET_DB, "Failed to save tags of {}: {}", document.id, err);
                    return Err(err);
                }
            }
        }

        Err(sqlx::Error::Protocol(format!(
            "Maximum retries exceeded saving tags of {}",
            document.id
        )))
    }

    async fn try_save_retag(
        &self,
        document: &Document,
        records: &[DocumentTagRecord],
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(
            "UPDATE documents SET summaries = ?1, rendered = ?2, modified_at = ?3 WHERE id = ?4 AND elements = ?5",
        )
        .bind(encode_json(&document.summaries)?)
        .bind(encode_json(&document.rendered)?)
        .bind(document.modified_at.as_ref().map(format_version))
        .bind(&document.id)
        .bind(encode_json(&document.elements)?)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO document_tags (
                    document_id, dictionary_name, spans, blacklist_version, whitelist_version, tagged_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(document_id, dictionary_name) DO UPDATE SET
                    spans = excluded.spans,
                    blacklist_version = excluded.blacklist_version,
                    whitelist_version = excluded.whitelist_version,
                    tagged_at = excluded.tagged_at
                "#,
            )
            .bind(&record.document_id)
            .bind(&record.dictionary)
            .bind(encode_json(&record.spans)?)
            .bind(format_version(&record.versions.blacklist))
            .bind(format_version(&record.versions.whitelist))
            .bind(format_version(&record.tagged_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

/// Exponential backoff from 50ms plus `jitter_ms`, or `None` once `attempt`
/// is the last one.
fn retry_delay(attempt: u32, max_retries: u32, jitter_ms: u64) -> Option<Duration> {
    if attempt >= max_retries {
        return None;
    }
    let backoff = 50u64.saturating_mul(1 << attempt.saturating_sub(1).min(16));
    Some(Duration::from_millis(backoff + jitter_ms))
}

fn tag_record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DocumentTagRecord, sqlx::Error> {
    let spans: String = row.get("spans");
    let blacklist: String = row.get("blacklist_version");
    let whitelist: String = row.get("whitelist_version");
    let tagged_at: String = row.get("tagged_at");

    Ok(DocumentTagRecord {
        document_id: row.get("document_id"),
        dictionary: row.get("dictionary_name"),
        spans: decode_json(&spans)?,
        versions: DictionaryVersions {
            blacklist: decode_version(&blacklist)?,
            whitelist: decode_version(&whitelist)?,
        },
        tagged_at: decode_version(&tagged_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{Binding, MatchSpan};

    fn elements(title: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("briefTitle".to_string(), title.to_string())])
    }

    fn record(document_id: &str, dictionary: &str) -> DocumentTagRecord {
        DocumentTagRecord {
            document_id: document_id.to_string(),
            dictionary: dictionary.to_string(),
            spans: BTreeMap::from([(
                "briefTitle".to_string(),
                vec![MatchSpan {
                    start: 0,
                    end: 2,
                    bindings: vec![Binding::new(-1, "X1")],
                }],
            )]),
            versions: DictionaryVersions {
                blacklist: parse_version("2024-01-01T00:00:00Z").unwrap(),
                whitelist: parse_version("").unwrap(),
            },
            tagged_at: parse_version("2024-02-01T12:00:00Z").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_add_document_is_idempotent() {
        let db = Database::new(":memory:").await.unwrap();
        assert!(db.add_document("NCT1", &elements("ABC compound")).await.unwrap());
        assert!(!db.add_document("NCT1", &elements("ABC compound")).await.unwrap());
        assert_eq!(db.list_document_ids().await.unwrap(), vec!["NCT1"]);

        let doc = db.load_document("NCT1").await.unwrap().unwrap();
        assert_eq!(doc.elements, elements("ABC compound"));
        assert!(doc.rendered.is_empty());
        assert!(doc.modified_at.is_none());
        assert!(db.load_document("NCT2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_retag_roundtrip() {
        let db = Database::new(":memory:").await.unwrap();
        db.add_document("NCT1", &elements("ABC compound")).await.unwrap();

        let mut doc = db.load_document("NCT1").await.unwrap().unwrap();
        doc.summaries.insert("chembl".to_string(), vec!["X1".to_string()]);
        doc.rendered.insert("briefTitle".to_string(), "ABC(X1) compound".to_string());
        doc.modified_at = Some(parse_version("2024-02-01T12:00:00Z").unwrap());

        assert!(db.save_retag(&doc, &[record("NCT1", "chembl")]).await.unwrap());

        assert_eq!(db.load_document("NCT1").await.unwrap().unwrap(), doc);
        let records = db.load_tag_records("NCT1").await.unwrap();
        assert_eq!(records["chembl"], record("NCT1", "chembl"));
        assert_eq!(db.load_dictionary_tag_records("chembl").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_elements_drop_tags() {
        let db = Database::new(":memory:").await.unwrap();
        db.add_document("NCT1", &elements("ABC compound")).await.unwrap();
        let doc = db.load_document("NCT1").await.unwrap().unwrap();
        db.save_retag(&doc, &[record("NCT1", "chembl")]).await.unwrap();

        assert!(db.add_document("NCT1", &elements("XYZ compound")).await.unwrap());
        assert!(db.load_tag_records("NCT1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_retag_skips_document_changed_meanwhile() {
        let db = Database::new(":memory:").await.unwrap();
        db.add_document("NCT1", &elements("ABC compound")).await.unwrap();
        let mut doc = db.load_document("NCT1").await.unwrap().unwrap();

        // Re-added while its tags were being computed
        db.add_document("NCT1", &elements("XYZ compound")).await.unwrap();

        doc.rendered.insert("briefTitle".to_string(), "ABC(X1) compound".to_string());
        doc.modified_at = Some(parse_version("2024-02-01T12:00:00Z").unwrap());
        assert!(!db.save_retag(&doc, &[record("NCT1", "chembl")]).await.unwrap());

        let stored = db.load_document("NCT1").await.unwrap().unwrap();
        assert_eq!(stored.elements, elements("XYZ compound"));
        assert!(stored.rendered.is_empty());
        assert!(stored.modified_at.is_none());
        assert!(db.load_tag_records("NCT1").await.unwrap().is_empty());
    }

    #[test]
    fn test_retry_delay_backs_off_and_stops_after_last_attempt() {
        assert_eq!(retry_delay(1, 5, 0), Some(Duration::from_millis(50)));
        assert_eq!(retry_delay(2, 5, 7), Some(Duration::from_millis(107)));
        assert_eq!(retry_delay(4, 5, 0), Some(Duration::from_millis(400)));
        assert_eq!(retry_delay(5, 5, 0), None);
        assert_eq!(retry_delay(6, 5, 10), None);
    }
}
