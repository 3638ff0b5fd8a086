//! Crate-wide error types.
//!
//! Each pipeline stage surfaces failures through [`Error`]; stage-local
//! soft conditions (rate limiting, per-row skips) are reported as flags or
//! counters on the stage output instead of errors.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Content-generation pipeline errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A stage was invoked before an upstream stage produced its output.
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    /// Required input was absent or empty.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// A referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Generated content failed validation after all retry attempts.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The language model returned an unusable response.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Retrieval produced no grounding chunks for a node.
    #[error("retrieval returned no chunks for query: {0}")]
    RetrievalEmpty(String),

    /// The LLM response did not match the requested schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// An asset upload to the blob store failed.
    #[error("asset upload failed: {0}")]
    AssetUpload(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error reports that the model's context window was
    /// exceeded. Providers signal this only through message text, so the
    /// check is a substring match on the rendered error.
    pub fn is_context_length_exceeded(&self) -> bool {
        let message = self.to_string();
        message.contains("context_length_exceeded")
            || message.contains("context length")
            || message.contains("maximum context")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_length_detected_by_substring() {
        let error = Error::Generation("context_length_exceeded: 210000 > 200000".into());
        assert!(error.is_context_length_exceeded());

        let error = Error::Generation("this model's maximum context length is 128000".into());
        assert!(error.is_context_length_exceeded());
    }

    #[test]
    fn unrelated_errors_are_not_context_length() {
        let error = Error::Generation("rate limited".into());
        assert!(!error.is_context_length_exceeded());
    }
}
