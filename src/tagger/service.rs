use std::sync::Arc;
use tracing::debug;

use super::registry::TaggerRegistry;
use super::TARGET_TAGGER;
use crate::error::TagError;
use crate::matcher::MatchSpan;

/// Answers tag requests against whatever tagger is live for a dictionary.
#[derive(Clone)]
pub struct MatchService {
    registry: Arc<TaggerRegistry>,
}

impl MatchService {
    pub fn new(registry: Arc<TaggerRegistry>) -> Self {
        MatchService { registry }
    }

    pub fn registry(&self) -> &Arc<TaggerRegistry> {
        &self.registry
    }

    pub fn tag(&self, dictionary: &str, text: &str) -> Result<Vec<MatchSpan>, TagError> {
        let tagger = self.registry.current(dictionary)?;
        let spans = tagger.scan(text);
        debug!(
            target: TARGET_TAGGER,
            "Tagged {} bytes with '{}' (generation {}): {} matches",
            text.len(),
            dictionary,
            tagger.generation,
            spans.len()
        );
        Ok(spans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::PatternStore;
    use crate::tagger::types::{DictionaryVersions, Tagger};
    use std::collections::BTreeSet;

    #[test]
    fn test_tag_delegates_to_live_tagger() {
        let registry = Arc::new(TaggerRegistry::new());
        let mut builder = PatternStore::builder();
        builder.insert("ABC", -1, "X1");
        registry.publish(Tagger::new(
            "chembl",
            BTreeSet::from([-1]),
            DictionaryVersions::default(),
            registry.next_generation(),
            builder.build(),
        ));

        let service = MatchService::new(registry);
        let spans = service.tag("chembl", "ABC compound").unwrap();
        assert_eq!((spans[0].start, spans[0].end), (0, 2));

        assert!(matches!(
            service.tag("pubchem", "ABC"),
            Err(TagError::NotFound(_))
        ));
    }
}
