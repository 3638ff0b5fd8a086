//! pathforge: content-generation core for a personalized-learning backend.
//!
//! From a user's material set (files → chunks → concepts) the crate
//! synthesizes a structured learning path, grounded per-lesson documents,
//! adaptive runtime pacing, and targeted probe questions. It coordinates a
//! language model, a vector index, a relational store, and a blob store
//! behind trait seams, and enforces strict structural and citation
//! invariants on everything it emits.
//!
//! Stage order per material set: canonicalize → retrieve → build docs →
//! probe-select → runtime-plan → evaluate. Stages are idempotent and
//! restartable; see [`pipeline::ContentPipeline`].

pub mod blob;
pub mod canonical;
pub mod compaction;
pub mod config;
pub mod db;
pub mod doc;
pub mod error;
pub mod grouping;
pub mod llm;
pub mod media;
pub mod pipeline;
pub mod plan;
pub mod probes;
pub mod progress;
pub mod retrieval;
pub mod signals;
pub mod store;
pub mod variants;
pub mod vector;
pub mod webfetch;

pub use error::{Error, Result};
pub use pipeline::{ContentPipeline, PipelineDeps, PipelineReport, PipelineSettings};
pub use store::ContentStore;
