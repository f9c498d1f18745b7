use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::client::TagClient;
use super::staleness::is_stale;
use super::stats::update_statistics;
use super::types::{Document, DocumentTagRecord, SweepReport};
use super::TARGET_RETAG;
use crate::annotate::{render_element, AnnotationLayer, DEFAULT_LINK_TEMPLATE};
use crate::db::Database;
use crate::tagger::{DictionaryDefinition, DictionaryInfo, DictionaryVersions};

/// Keeps stored document tags in step with the live dictionaries.
pub struct RetagOrchestrator {
    client: Arc<dyn TagClient>,
    db: Database,
    elements: Vec<String>,
    concurrency: usize,
    top_n: usize,
    // One writer per document at a time.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RetagOrchestrator {
    pub fn new(
        client: Arc<dyn TagClient>,
        db: Database,
        elements: Vec<String>,
        concurrency: usize,
        top_n: usize,
    ) -> Self {
        RetagOrchestrator {
            client,
            db,
            elements,
            concurrency: concurrency.max(1),
            top_n,
            locks: DashMap::new(),
        }
    }

    /// Refreshes the dictionaries, retags every stale (document, dictionary)
    /// pair and recomputes statistics if anything changed.
    ///
    /// A failing document is logged and counted; the sweep moves on.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let dictionaries = self
            .client
            .update_dictionaries()
            .await
            .context("Failed to update dictionaries")?;
        let definitions: BTreeMap<String, DictionaryDefinition> = self
            .db
            .list_definitions()
            .await
            .context("Failed to load dictionary definitions")?
            .into_iter()
            .map(|def| (def.name.clone(), def))
            .collect();
        let ids = self
            .db
            .list_document_ids()
            .await
            .context("Failed to list documents")?;

        info!(target: TARGET_RETAG, "Retag sweep over {} documents and {} dictionaries", ids.len(), dictionaries.len());

        let mut report = SweepReport {
            documents: ids.len(),
            ..Default::default()
        };

        for id in &ids {
            match self.retag_document(id, &dictionaries, &definitions).await {
                Ok(0) => {}
                Ok(records) => {
                    report.retagged += 1;
                    report.records += records;
                }
                Err(err) => {
                    warn!(target: TARGET_RETAG, "Failed to retag document {}: {:#}", id, err);
                    report.failed.push((id.clone(), format!("{:#}", err)));
                }
            }
        }

        if report.retagged > 0 {
            let names: Vec<String> = dictionaries.iter().map(|d| d.name.clone()).collect();
            match update_statistics(&self.db, &names, &self.elements, self.top_n).await {
                Ok(()) => report.statistics_updated = true,
                Err(err) => error!(target: TARGET_RETAG, "Failed to update statistics: {:#}", err),
            }
        }

        info!(
            target: TARGET_RETAG,
            "Retag sweep done: {} of {} documents retagged ({} records), {} failed",
            report.retagged,
            report.documents,
            report.records,
            report.failed.len()
        );
        Ok(report)
    }

    /// Retags the stale dictionaries of one document and returns how many
    /// tag records were replaced.
    ///
    /// Returns 0 if the document changed while it was being tagged; its
    /// records were dropped by the change, so the next sweep picks it up.
    pub async fn retag_document(
        &self,
        id: &str,
        dictionaries: &[DictionaryInfo],
        definitions: &BTreeMap<String, DictionaryDefinition>,
    ) -> Result<usize> {
        let lock = self.locks.entry(id.to_string()).or_default().clone();
        let retagged = {
            let _guard = lock.lock().await;
            self.retag_locked(id, dictionaries, definitions).await
        };
        drop(lock);
        // Only the map still holds it: nobody is waiting on this document.
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
        retagged
    }

    async fn retag_locked(
        &self,
        id: &str,
        dictionaries: &[DictionaryInfo],
        definitions: &BTreeMap<String, DictionaryDefinition>,
    ) -> Result<usize> {
        let mut document = self
            .db
            .load_document(id)
            .await?
            .ok_or_else(|| anyhow!("Document {} does not exist", id))?;
        let mut records = self.db.load_tag_records(id).await?;

        let mut fresh = Vec::new();
        for info in dictionaries {
            let versions = info.versions()?;
            if !is_stale(records.get(&info.name), &versions) {
                continue;
            }
            debug!(target: TARGET_RETAG, "Document {} is stale for '{}'", id, info.name);
            fresh.push(self.tag_document(&document, &info.name, versions).await?);
        }

        if fresh.is_empty() {
            return Ok(0);
        }

        for record in &fresh {
            let summary_field = definitions
                .get(&record.dictionary)
                .map(|def| def.summary_field().to_string())
                .unwrap_or_else(|| record.dictionary.clone());
            document
                .summaries
                .insert(summary_field, record.identifiers(&self.elements));
            records.insert(record.dictionary.clone(), record.clone());
        }

        document.rendered = self.render(&document, &records, definitions);
        document.modified_at = Some(Utc::now());

        let saved = self
            .db
            .save_retag(&document, &fresh)
            .await
            .with_context(|| format!("Failed to save tags of {}", id))?;
        if !saved {
            info!(target: TARGET_RETAG, "Document {} changed during retag, left for the next sweep", id);
            return Ok(0);
        }

        info!(target: TARGET_RETAG, "Retagged document {} with {} dictionaries", id, fresh.len());
        Ok(fresh.len())
    }

    /// Tags every configured element of `document` with one dictionary.
    ///
    /// The record is stamped with the versions of the tagger that did the
    /// work when the client reports them, else with `versions`.
    async fn tag_document(
        &self,
        document: &Document,
        dictionary: &str,
        versions: DictionaryVersions,
    ) -> Result<DocumentTagRecord> {
        let (elements, texts): (Vec<&String>, Vec<&str>) = self
            .elements
            .iter()
            .filter_map(|element| document.elements.get_key_value(element))
            .map(|(element, text)| (element, text.as_str()))
            .unzip();

        let tagged = self
            .client
            .tag_elements(dictionary, &texts, self.concurrency)
            .await
            .with_context(|| format!("Tagging {} with '{}'", document.id, dictionary))?;
        if tagged.spans.len() != elements.len() {
            bail!(
                "Tagging {} with '{}' returned {} results for {} elements",
                document.id,
                dictionary,
                tagged.spans.len(),
                elements.len()
            );
        }

        Ok(DocumentTagRecord {
            document_id: document.id.clone(),
            dictionary: dictionary.to_string(),
            spans: elements.into_iter().cloned().zip(tagged.spans).collect(),
            versions: tagged.versions.unwrap_or(versions),
            tagged_at: Utc::now(),
        })
    }

    fn render(
        &self,
        document: &Document,
        records: &BTreeMap<String, DocumentTagRecord>,
        definitions: &BTreeMap<String, DictionaryDefinition>,
    ) -> BTreeMap<String, String> {
        let mut rendered = BTreeMap::new();
        for element in &self.elements {
            let Some(original) = document.elements.get(element) else {
                continue;
            };
            let layers: Vec<AnnotationLayer<'_>> = records
                .values()
                .filter_map(|record| {
                    let spans = record.spans.get(element)?;
                    let link_template = definitions
                        .get(&record.dictionary)
                        .and_then(|def| def.link_template.as_deref())
                        .unwrap_or(DEFAULT_LINK_TEMPLATE);
                    Some(AnnotationLayer {
                        dictionary: &record.dictionary,
                        link_template,
                        spans,
                    })
                })
                .collect();
            rendered.insert(element.clone(), render_element(original, &layers));
        }
        rendered
    }
}
