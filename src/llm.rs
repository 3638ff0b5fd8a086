//! Language model contract.
//!
//! The crate never talks to a provider directly; stages receive a
//! [`LlmClient`] and work against its request/response shapes. Schema-constrained
//! JSON generation is the primary operation — the doc builder, runtime planner,
//! and meta scrub all go through `generate_json`.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// A generated binary asset (image or video) with its MIME type.
#[derive(Debug, Clone)]
pub struct GeneratedMedia {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// Options for video generation.
#[derive(Debug, Clone, Default)]
pub struct VideoOptions {
    pub duration_sec: Option<u32>,
}

/// Client seam for all language-model operations.
///
/// Implementations live outside this crate. `generate_json` must return a
/// value conforming to `schema` (a JSON Schema document); non-conforming
/// responses surface as [`Error::SchemaMismatch`].
///
/// [`Error::SchemaMismatch`]: crate::error::Error::SchemaMismatch
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a JSON object constrained by the named schema.
    async fn generate_json(
        &self,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: &Value,
    ) -> Result<Value>;

    /// Embed a batch of texts. Returns one vector per input, same order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Generate an image from a prompt.
    async fn generate_image(&self, prompt: &str) -> Result<GeneratedMedia>;

    /// Generate a video from a prompt.
    async fn generate_video(&self, prompt: &str, options: &VideoOptions) -> Result<GeneratedMedia>;
}

/// Whether a provider error message reports an exceeded context window.
///
/// Providers signal this condition only through message text; the acceptance
/// checker relies on this exact substring behavior.
pub fn is_context_length_error(message: &str) -> bool {
    message.contains("context_length_exceeded")
        || message.contains("context length")
        || message.contains("maximum context")
}

#[cfg(test)]
pub mod testing {
    //! Scripted fake client for stage tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Returns queued responses in order; errors once the queue is empty.
    pub struct ScriptedLlm {
        responses: Mutex<VecDeque<Result<Value>>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        pub fn new(responses: Vec<Result<Value>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate_json(
            &self,
            _system: &str,
            user: &str,
            schema_name: &str,
            _schema: &Value,
        ) -> Result<Value> {
            self.calls.lock().unwrap().push(format!("{schema_name}: {user}"));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(crate::error::Error::Generation("script exhausted".into())))
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 8]).collect())
        }

        async fn generate_image(&self, _prompt: &str) -> Result<GeneratedMedia> {
            Ok(GeneratedMedia { bytes: vec![0x89, 0x50], mime: "image/png".into() })
        }

        async fn generate_video(
            &self,
            _prompt: &str,
            _options: &VideoOptions,
        ) -> Result<GeneratedMedia> {
            Ok(GeneratedMedia { bytes: vec![0x00], mime: "video/mp4".into() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_length_substrings_match() {
        assert!(is_context_length_error("error: context_length_exceeded"));
        assert!(is_context_length_error("this model's maximum context is 200k"));
        assert!(!is_context_length_error("rate_limit_exceeded"));
    }
}
