use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{info, warn};

use super::types::DocumentTagRecord;
use super::TARGET_RETAG;
use crate::db::Database;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierCount {
    pub identifier: String,
    /// Number of spans binding the identifier.
    pub tags: usize,
    /// Number of documents mentioning it at least once.
    pub documents: usize,
}

/// Frequency statistics of one dictionary over all stored documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DictionaryStatistics {
    pub total_documents: usize,
    pub total_words: usize,
    pub total_tagged_words: usize,
    /// Counted case-insensitively.
    pub distinct_tagged_words: usize,
    pub average_tagged_words_per_document: f64,
    pub average_distinct_tagged_words_per_document: f64,
    pub top_tagged_words: Vec<(String, usize)>,
    pub total_identifiers: usize,
    pub distinct_identifiers: usize,
    pub average_identifiers_per_document: f64,
    pub average_distinct_identifiers_per_document: f64,
    pub top_identifiers: Vec<IdentifierCount>,
}

/// Occurrence counts that remember first-seen order for ties.
#[derive(Default)]
struct Tally {
    index: HashMap<String, usize>,
    counts: Vec<(String, usize)>,
}

impl Tally {
    fn add(&mut self, key: &str) {
        match self.index.get(key) {
            Some(&i) => self.counts[i].1 += 1,
            None => {
                self.index.insert(key.to_string(), self.counts.len());
                self.counts.push((key.to_string(), 1));
            }
        }
    }

    fn get(&self, key: &str) -> usize {
        self.index.get(key).map(|&i| self.counts[i].1).unwrap_or(0)
    }

    fn top(&self, n: usize) -> Vec<(String, usize)> {
        let mut sorted = self.counts.clone();
        sorted.sort_by(|a, b| b.1.cmp(&a.1));
        sorted.truncate(n);
        sorted
    }
}

fn average(total: usize, documents: usize) -> f64 {
    if documents == 0 {
        0.0
    } else {
        total as f64 / documents as f64
    }
}

/// Computes one dictionary's statistics from its tag records and the
/// original texts of every document.
pub fn compute_statistics(
    documents: &[(String, BTreeMap<String, String>)],
    records: &[DocumentTagRecord],
    elements: &[String],
    top_n: usize,
) -> DictionaryStatistics {
    let texts: HashMap<&str, &BTreeMap<String, String>> = documents
        .iter()
        .map(|(id, elements)| (id.as_str(), elements))
        .collect();

    let total_words = documents
        .iter()
        .flat_map(|(_, doc)| elements.iter().filter_map(|e| doc.get(e)))
        .map(|text| text.split_whitespace().count())
        .sum();

    let mut words = Tally::default();
    let mut folded = HashSet::new();
    let mut identifiers = Tally::default();
    let mut mentioned = Tally::default();

    for record in records {
        let Some(doc) = texts.get(record.document_id.as_str()) else {
            warn!(target: TARGET_RETAG, "Tag record for unknown document {}", record.document_id);
            continue;
        };

        let mut in_document = HashSet::new();
        for element in elements {
            let (Some(spans), Some(text)) = (record.spans.get(element), doc.get(element)) else {
                continue;
            };
            for span in spans {
                if let Some(word) = span.surface(text) {
                    words.add(word);
                    folded.insert(word.to_lowercase());
                }
                for id in span.identifiers() {
                    identifiers.add(id);
                    in_document.insert(id);
                }
            }
        }
        for id in in_document {
            mentioned.add(id);
        }
    }

    let total_documents = documents.len();
    let total_tagged_words: usize = words.counts.iter().map(|(_, c)| c).sum();
    let total_identifiers: usize = identifiers.counts.iter().map(|(_, c)| c).sum();
    let distinct_identifiers = identifiers.counts.len();

    DictionaryStatistics {
        total_documents,
        total_words,
        total_tagged_words,
        distinct_tagged_words: folded.len(),
        average_tagged_words_per_document: average(total_tagged_words, total_documents),
        average_distinct_tagged_words_per_document: average(folded.len(), total_documents),
        top_tagged_words: words.top(top_n),
        total_identifiers,
        distinct_identifiers,
        average_identifiers_per_document: average(total_identifiers, total_documents),
        average_distinct_identifiers_per_document: average(distinct_identifiers, total_documents),
        top_identifiers: identifiers
            .top(top_n)
            .into_iter()
            .map(|(identifier, tags)| IdentifierCount {
                documents: mentioned.get(&identifier),
                identifier,
                tags,
            })
            .collect(),
    }
}

/// Recomputes and stores the statistics of every named dictionary.
pub async fn update_statistics(
    db: &Database,
    dictionaries: &[String],
    elements: &[String],
    top_n: usize,
) -> Result<()> {
    info!(target: TARGET_RETAG, "Updating statistics for {} dictionaries", dictionaries.len());
    let documents = db
        .load_all_elements()
        .await
        .context("Failed to load document texts")?;

    for name in dictionaries {
        let records = db
            .load_dictionary_tag_records(name)
            .await
            .with_context(|| format!("Failed to load tag records of '{}'", name))?;
        let statistics = compute_statistics(&documents, &records, elements, top_n);
        db.save_statistics(name, &statistics)
            .await
            .with_context(|| format!("Failed to save statistics of '{}'", name))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{Binding, MatchSpan};
    use crate::tagger::DictionaryVersions;
    use chrono::Utc;

    fn span(start: usize, end: usize, ids: &[&str]) -> MatchSpan {
        MatchSpan {
            start,
            end,
            bindings: ids.iter().map(|id| Binding::new(-1, id)).collect(),
        }
    }

    fn record(document_id: &str, spans: Vec<MatchSpan>) -> DocumentTagRecord {
        DocumentTagRecord {
            document_id: document_id.to_string(),
            dictionary: "chembl".to_string(),
            spans: BTreeMap::from([("briefTitle".to_string(), spans)]),
            versions: DictionaryVersions::default(),
            tagged_at: Utc::now(),
        }
    }

    #[test]
    fn test_compute_statistics() {
        let documents = vec![
            (
                "NCT1".to_string(),
                BTreeMap::from([("briefTitle".to_string(), "ABC and abc with ABC".to_string())]),
            ),
            (
                "NCT2".to_string(),
                BTreeMap::from([("briefTitle".to_string(), "ABC alone".to_string())]),
            ),
            ("NCT3".to_string(), BTreeMap::new()),
        ];
        let records = vec![
            record(
                "NCT1",
                vec![span(0, 2, &["X1"]), span(8, 10, &["X1", "X2"]), span(17, 19, &["X1"])],
            ),
            record("NCT2", vec![span(0, 2, &["X1"])]),
        ];
        let elements = vec!["briefTitle".to_string()];

        let stats = compute_statistics(&documents, &records, &elements, 200);
        assert_eq!(stats.total_documents, 3);
        assert_eq!(stats.total_words, 7);
        assert_eq!(stats.total_tagged_words, 4);
        assert_eq!(stats.distinct_tagged_words, 1);
        assert_eq!(stats.top_tagged_words[0], ("ABC".to_string(), 3));
        assert_eq!(stats.total_identifiers, 5);
        assert_eq!(stats.distinct_identifiers, 2);
        assert_eq!(
            stats.top_identifiers[0],
            IdentifierCount {
                identifier: "X1".to_string(),
                tags: 4,
                documents: 2
            }
        );
        assert_eq!(stats.top_identifiers[1].documents, 1);

        let top_one = compute_statistics(&documents, &records, &elements, 1);
        assert_eq!(top_one.top_identifiers.len(), 1);
    }

    #[test]
    fn test_no_documents() {
        let stats = compute_statistics(&[], &[], &[], 10);
        assert_eq!(stats.total_documents, 0);
        assert_eq!(stats.average_tagged_words_per_document, 0.0);
    }
}
