use super::types::DocumentTagRecord;
use crate::tagger::DictionaryVersions;

/// A record is stale when either of its versions is older than the live tagger's.
pub fn is_stale(record: Option<&DocumentTagRecord>, live: &DictionaryVersions) -> bool {
    match record {
        None => true,
        Some(record) => {
            record.versions.blacklist < live.blacklist || record.versions.whitelist < live.whitelist
        }
    }
}
