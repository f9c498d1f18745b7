use async_trait::async_trait;

use super::types::{BlacklistSnapshot, DictionaryDefinition, Entry, Version, WhitelistSnapshot};
use crate::error::TagError;

/// Where dictionary definitions, entries and blacklist/whitelist snapshots come from.
///
/// Source references are opaque names taken from a `DictionaryDefinition`.
/// A reference the backend does not know yields `TagError::SourceUnavailable`;
/// a known source without snapshots yields `None`.
#[async_trait]
pub trait DictionarySource: Send + Sync {
    async fn definitions(&self) -> Result<Vec<DictionaryDefinition>, TagError>;

    /// All entries of a dictionary source. Records that cannot be read are
    /// returned as `Err(TagError::MalformedEntry)` in place.
    async fn entries(&self, source_ref: &str) -> Result<Vec<Result<Entry, TagError>>, TagError>;

    async fn latest_blacklist_version(&self, source_ref: &str)
        -> Result<Option<Version>, TagError>;

    async fn latest_blacklist(&self, source_ref: &str)
        -> Result<Option<BlacklistSnapshot>, TagError>;

    async fn latest_whitelist_version(&self, source_ref: &str)
        -> Result<Option<Version>, TagError>;

    async fn latest_whitelist(&self, source_ref: &str)
        -> Result<Option<WhitelistSnapshot>, TagError>;
}
