use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::matcher::MatchSpan;
use crate::tagger::DictionaryVersions;

/// A stored document: original element texts plus everything derived from them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub id: String,
    /// Element name -> original text.
    pub elements: BTreeMap<String, String>,
    /// Summary field -> distinct identifiers in first-seen order.
    pub summaries: BTreeMap<String, Vec<String>>,
    /// Element name -> text with links inserted.
    pub rendered: BTreeMap<String, String>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Spans of one dictionary over one document, replaced wholesale on retag.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentTagRecord {
    pub document_id: String,
    pub dictionary: String,
    /// Element name -> spans, in (start, end) order.
    pub spans: BTreeMap<String, Vec<MatchSpan>>,
    pub versions: DictionaryVersions,
    pub tagged_at: DateTime<Utc>,
}

impl DocumentTagRecord {
    /// Distinct identifiers over all elements, in element then span order.
    pub fn identifiers(&self, element_order: &[String]) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut identifiers = Vec::new();
        for element in element_order {
            for span in self.spans.get(element).into_iter().flatten() {
                for id in span.identifiers() {
                    if seen.insert(id) {
                        identifiers.push(id.to_string());
                    }
                }
            }
        }
        identifiers
    }
}

/// Outcome of one sweep over all documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub documents: usize,
    /// Documents with at least one retagged dictionary.
    pub retagged: usize,
    /// (document, dictionary) records that were replaced.
    pub records: usize,
    pub failed: Vec<(String, String)>,
    pub statistics_updated: bool,
}
