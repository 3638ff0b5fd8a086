//! Lesson-doc construction pipeline.
//!
//! Flow per node: retrieve grounding chunks, generate JSON with the LLM,
//! run the deterministic auto-fix cascade, validate, then persist canonical
//! JSON with its content and sources hashes.

pub mod autofix;
pub mod builder;
pub mod canonical;
pub mod citations;
pub mod excerpts;
pub mod model;
pub mod sanitize;
pub mod template;
pub mod validate;

pub use autofix::{autofix, AutofixContext, AutofixReport, MediaAsset, Threading};
pub use builder::{DocBuildOutcome, DocBuildRequest, DocBuilder};
pub use canonical::{canonicalize, content_hash, sources_hash};
pub use model::{Block, BlockKind, Citation, NodeDoc};
pub use template::{DocTemplate, TemplateRequirements};
pub use validate::{validate, ValidationContext, ValidationResult};
