use thiserror::Error;

/// Failures surfaced by the matching engine, the registry and the dictionary sources.
#[derive(Debug, Error)]
pub enum TagError {
    /// No dictionary of this name has ever built successfully.
    #[error("Unknown dictionary: {0}")]
    NotFound(String),

    /// A source could not be read while rebuilding; the live tagger is kept.
    #[error("Source '{source_ref}' unavailable: {reason}")]
    SourceUnavailable { source_ref: String, reason: String },

    /// A single record could not be interpreted; it is skipped.
    #[error("Malformed entry in '{source_ref}': {reason}")]
    MalformedEntry { source_ref: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl TagError {
    pub fn source_unavailable(source_ref: &str, reason: impl Into<String>) -> Self {
        TagError::SourceUnavailable {
            source_ref: source_ref.to_string(),
            reason: reason.into(),
        }
    }

    pub fn malformed(source_ref: &str, reason: impl Into<String>) -> Self {
        TagError::MalformedEntry {
            source_ref: source_ref.to_string(),
            reason: reason.into(),
        }
    }
}
