//! Doc builder: retrieval → generation → auto-fix → validation → persistence.
//!
//! Generation runs as a small state machine (generating → validating →
//! feedback → generating), capped at the configured attempt count. Every
//! attempt persists a generation-run record; a doc is only written once it
//! validates, inside a single transaction together with its variant row and
//! the user's library counter.

use serde_json::{json, Value};

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::DocBuildConfig;
use crate::doc::autofix::{autofix, AutofixContext, AutofixReport, MediaAsset, Threading};
use crate::doc::canonical::{canonicalize, content_hash, sources_hash};
use crate::doc::excerpts::render_excerpts;
use crate::doc::model::NodeDoc;
use crate::doc::template::{DocTemplate, TemplateRequirements};
use crate::doc::validate::{validate, ValidationContext};
use crate::error::{Error, Result};
use crate::llm::LlmClient;
use crate::retrieval::{retrieve_chunk_ids, RetrievalQuery};
use crate::store::docs::GenerationRun;
use crate::store::nodes::PathNode;
use crate::store::ContentStore;
use crate::vector::{chunk_namespace, VectorIndex};

/// Per-node build request.
#[derive(Debug, Clone, Default)]
pub struct DocBuildRequest {
    pub node_id: String,
    /// When set, a per-user variant row is written alongside the node doc.
    pub user_id: Option<String>,
    /// Chunk IDs the doc must cite somewhere.
    pub must_cite: Vec<String>,
    /// Outline headings the doc must follow in order.
    pub outline: Vec<String>,
    /// Objectives from the node blueprint.
    pub blueprint_objectives: Vec<String>,
    pub threading: Threading,
}

/// What a successful build produced.
#[derive(Debug, Clone)]
pub struct DocBuildOutcome {
    pub node_id: String,
    pub content_hash: String,
    pub sources_hash: String,
    pub chunk_ids: Vec<String>,
    pub attempts: usize,
    pub report: AutofixReport,
}

/// Builds one node doc at a time. Cheap to clone per worker.
pub struct DocBuilder {
    store: Arc<ContentStore>,
    llm: Arc<dyn LlmClient>,
    vector: Arc<dyn VectorIndex>,
    config: DocBuildConfig,
    vector_timeout_ms: u64,
}

impl DocBuilder {
    pub fn new(
        store: Arc<ContentStore>,
        llm: Arc<dyn LlmClient>,
        vector: Arc<dyn VectorIndex>,
        config: DocBuildConfig,
        vector_timeout_ms: u64,
    ) -> Self {
        Self { store, llm, vector, config, vector_timeout_ms }
    }

    /// Build, validate, and persist the doc for one node.
    pub async fn build(&self, request: &DocBuildRequest) -> Result<DocBuildOutcome> {
        let node = self
            .store
            .node(&request.node_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("node {}", request.node_id)))?;
        let path = self
            .store
            .path(&node.path_id)
            .await?
            .ok_or_else(|| Error::MissingDependency(format!("path {}", node.path_id)))?;
        let set = self
            .store
            .material_set(&path.set_id)
            .await?
            .ok_or_else(|| Error::MissingDependency(format!("material set {}", path.set_id)))?;

        let retrieval_set_id = set.retrieval_set_id().to_owned();
        let files = self.store.files_in_set(&retrieval_set_id).await?;
        let file_ids: Vec<String> = files.iter().map(|f| f.id.clone()).collect();
        let chunks = self.store.chunks_by_files(&file_ids).await?;
        if chunks.is_empty() {
            return Err(Error::RetrievalEmpty(node.title.clone()));
        }

        // Retrieval.
        let query_text = build_query_text(&node, &path.title);
        let embeddings = self.llm.embed(&[query_text.clone()]).await?;
        let embedding = embeddings.into_iter().next().unwrap_or_default();
        let retrieval = RetrievalQuery {
            namespace: &chunk_namespace(&retrieval_set_id),
            text: &query_text,
            embedding: &embedding,
            allowed_file_ids: &file_ids,
            chunks: &chunks,
            k: self.config.retrieval_k,
            timeout_ms: self.vector_timeout_ms,
        };
        let chunk_ids = retrieve_chunk_ids(self.vector.as_ref(), &self.store, &retrieval).await?;
        if chunk_ids.is_empty() {
            return Err(Error::RetrievalEmpty(query_text));
        }

        let excerpts = render_excerpts(
            &chunk_ids,
            &chunks,
            self.config.excerpt_max_chars,
            self.config.excerpt_max_lines,
        );
        let allowed: HashSet<String> = chunks.keys().cloned().collect();
        let template =
            DocTemplate::from_str_lossy(node.doc_template().unwrap_or("narrative"));
        let mut requirements = TemplateRequirements::for_node(node.kind, template);
        if self.config.premium {
            requirements = requirements.premium(node.kind, template);
        }

        let figures: Vec<MediaAsset> = self
            .store
            .node_figures(&node.id)
            .await?
            .into_iter()
            .map(|row| MediaAsset {
                storage_key: row.storage_key,
                file_name: row.file_name,
                url: row.url,
            })
            .collect();
        let videos: Vec<MediaAsset> = self
            .store
            .node_videos(&node.id)
            .await?
            .into_iter()
            .map(|row| MediaAsset {
                storage_key: row.storage_key,
                file_name: row.file_name,
                url: row.url,
            })
            .collect();

        // Generation loop with validator feedback.
        let system = SYSTEM_PROMPT;
        let schema = node_doc_schema();
        let mut feedback: Option<String> = None;
        let mut last_errors: Vec<String> = Vec::new();

        for attempt in 1..=self.config.max_attempts {
            let user_prompt = build_user_prompt(&node, &excerpts, feedback.as_deref());
            let generated = self
                .llm
                .generate_json(system, &user_prompt, "node_doc_v1", &schema)
                .await;

            let value = match generated {
                Ok(value) => value,
                Err(error) => {
                    last_errors = vec![error.to_string()];
                    self.record_run(&node, request, attempt as i64, "generation_error", &last_errors)
                        .await?;
                    if error.is_context_length_exceeded() || attempt == self.config.max_attempts {
                        self.record_run(&node, request, attempt as i64, "failed", &last_errors)
                            .await?;
                        return Err(error);
                    }
                    feedback = Some(last_errors.join("; "));
                    continue;
                }
            };

            let mut doc: NodeDoc = match serde_json::from_value(value) {
                Ok(doc) => doc,
                Err(error) => {
                    last_errors = vec![format!("schema mismatch: {error}")];
                    self.record_run(&node, request, attempt as i64, "schema_mismatch", &last_errors)
                        .await?;
                    feedback = Some(last_errors.join("; "));
                    continue;
                }
            };
            if doc.concept_keys.is_empty() {
                doc.concept_keys = node.concept_keys();
            }

            if self.config.polish_enabled {
                doc = self.polish(doc).await;
            }

            let mut used_media = HashSet::new();
            let concept_keys = node.concept_keys();
            let mut fix_ctx = AutofixContext {
                allowed_chunks: &allowed,
                preferred_fallback: &chunk_ids,
                must_cite: &request.must_cite,
                requirements: &requirements,
                blueprint_objectives: &request.blueprint_objectives,
                threading: &request.threading,
                figures: &figures,
                videos: &videos,
                used_media: &mut used_media,
                concept_keys: &concept_keys,
            };
            let report = autofix(&mut doc, &mut fix_ctx);

            let validation = validate(
                &doc,
                &ValidationContext {
                    allowed_chunks: &allowed,
                    requirements: &requirements,
                    outline: &request.outline,
                    must_cite: &request.must_cite,
                    threading: &request.threading,
                },
            );

            if validation.valid {
                let outcome = self
                    .persist(&node, request, &doc, &chunk_ids, attempt, report)
                    .await?;
                self.record_run(&node, request, attempt as i64, "succeeded", &[]).await?;
                tracing::info!(
                    node_id = %node.id,
                    attempt,
                    content_hash = %outcome.content_hash,
                    "node doc built"
                );
                return Ok(outcome);
            }

            last_errors = validation.errors;
            self.record_run(&node, request, attempt as i64, "validation_failed", &last_errors)
                .await?;
            feedback = Some(last_errors.join("; "));
        }

        self.record_run(
            &node,
            request,
            self.config.max_attempts as i64,
            "failed",
            &last_errors,
        )
        .await?;
        Err(Error::Validation(format!(
            "doc for node {} failed validation after {} attempts: {}",
            node.id,
            self.config.max_attempts,
            last_errors.join("; ")
        )))
    }

    /// Optional LLM-assisted meta scrub. Any failure keeps the input doc.
    async fn polish(&self, doc: NodeDoc) -> NodeDoc {
        let Ok(doc_value) = serde_json::to_value(&doc) else { return doc };
        let prompt = format!(
            "Rewrite prose fields to remove meta or templating phrasing. Keep every block, \
             block id, type, and citation exactly as is. Return the full document JSON.\n{doc_value}"
        );
        match self
            .llm
            .generate_json(SYSTEM_PROMPT, &prompt, "node_doc_v1", &node_doc_schema())
            .await
        {
            Ok(value) => match serde_json::from_value::<NodeDoc>(value) {
                Ok(polished) if polished.blocks.len() == doc.blocks.len() => polished,
                _ => doc,
            },
            Err(error) => {
                tracing::warn!(%error, "doc polish failed, keeping unpolished doc");
                doc
            }
        }
    }

    async fn persist(
        &self,
        node: &PathNode,
        request: &DocBuildRequest,
        doc: &NodeDoc,
        chunk_ids: &[String],
        attempts: usize,
        report: AutofixReport,
    ) -> Result<DocBuildOutcome> {
        let canonical = canonicalize(doc)?;
        let canonical_text = String::from_utf8(canonical)
            .map_err(|e| Error::Validation(format!("canonical JSON is not UTF-8: {e}")))?;
        let hash = content_hash(doc)?;
        let sources = sources_hash(&self.config.prompt_version, chunk_ids);

        let mut tx = self.store.begin().await?;
        ContentStore::save_node_doc_tx(&mut tx, &node.id, &canonical_text, &hash, &sources)
            .await?;
        if let Some(user_id) = &request.user_id {
            ContentStore::save_node_doc_variant_tx(
                &mut tx,
                &node.id,
                user_id,
                &canonical_text,
                &hash,
                &sources,
            )
            .await?;
            ContentStore::bump_library_counter_tx(&mut tx, user_id).await?;
        }
        tx.commit().await?;

        Ok(DocBuildOutcome {
            node_id: node.id.clone(),
            content_hash: hash,
            sources_hash: sources,
            chunk_ids: chunk_ids.to_vec(),
            attempts,
            report,
        })
    }

    async fn record_run(
        &self,
        node: &PathNode,
        request: &DocBuildRequest,
        attempt: i64,
        status: &str,
        errors: &[String],
    ) -> Result<()> {
        self.store
            .record_generation_run(&GenerationRun {
                id: uuid::Uuid::new_v4().to_string(),
                node_id: node.id.clone(),
                user_id: request.user_id.clone(),
                attempt,
                status: status.to_owned(),
                errors: errors.to_vec(),
                metrics: json!({ "error_count": errors.len() }),
            })
            .await
    }
}

const SYSTEM_PROMPT: &str = "You are a curriculum writer. Produce a single lesson document as \
JSON. Ground every claim in the provided source excerpts and cite them by chunk_id. Teach a \
concept before testing it.";

fn build_query_text(node: &PathNode, path_title: &str) -> String {
    let mut parts = vec![node.title.clone()];
    if let Some(goal) = node.goal() {
        parts.push(goal.to_owned());
    }
    let keys = node.concept_keys();
    if !keys.is_empty() {
        parts.push(keys.join(" "));
    }
    parts.push(path_title.to_owned());
    parts.join("\n")
}

fn build_user_prompt(node: &PathNode, excerpts: &str, feedback: Option<&str>) -> String {
    let mut prompt = format!(
        "Write the lesson document for \"{title}\" ({kind}).\n\nSource excerpts:\n{excerpts}\n",
        title = node.title,
        kind = node.kind,
    );
    if let Some(goal) = node.goal() {
        prompt.push_str(&format!("\nLesson goal: {goal}\n"));
    }
    if let Some(feedback) = feedback {
        prompt.push_str(&format!(
            "\nThe previous attempt was rejected. Fix these problems:\n{feedback}\n"
        ));
    }
    prompt
}

/// JSON schema for the `node_doc_v1` generation request. Block payloads are
/// open-ended by design; the typed model and validators own the real rules.
fn node_doc_schema() -> Value {
    json!({
        "type": "object",
        "required": ["schema_version", "title", "blocks"],
        "properties": {
            "schema_version": { "type": "integer" },
            "title": { "type": "string" },
            "summary": { "type": "string" },
            "concept_keys": { "type": "array", "items": { "type": "string" } },
            "estimated_minutes": { "type": "integer" },
            "blocks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["type"],
                    "properties": {
                        "id": { "type": "string" },
                        "type": { "type": "string" },
                        "citations": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["chunk_id"],
                                "properties": {
                                    "chunk_id": { "type": "string" },
                                    "quote": { "type": "string" },
                                    "loc": {
                                        "type": "object",
                                        "properties": {
                                            "page": { "type": "integer" },
                                            "start": { "type": "integer" },
                                            "end": { "type": "integer" }
                                        }
                                    }
                                }
                            }
                        }
                    },
                    "additionalProperties": true
                }
            }
        }
    })
}
