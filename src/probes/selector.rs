//! Probe selection over a lookahead window.
//!
//! Enumerates quick-check and flashcard blocks in upcoming node docs,
//! scores them against the user's concept state, enforces per-node, total,
//! and hourly-rate caps, then persists the chosen probes and annotates the
//! docs in one transaction.

use serde_json::json;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::ProbeConfig;
use crate::doc::canonical::{canonicalize, content_hash};
use crate::doc::model::NodeDoc;
use crate::error::{Error, Result};
use crate::probes::scoring;
use crate::store::probes::{DocProbe, ProbeStatus};
use crate::store::ContentStore;

/// Default lookahead when the request does not set one.
const DEFAULT_LOOKAHEAD: usize = 3;
/// Review paths look further ahead: their nodes are smaller.
const REVIEW_LOOKAHEAD: usize = 5;

/// One selection request.
#[derive(Debug, Clone, Default)]
pub struct ProbeSelectionRequest {
    pub user_id: String,
    pub path_id: String,
    /// Window anchor; defaults to the user's active node on the path.
    pub anchor_node_id: Option<String>,
    /// Window size; defaults per path kind.
    pub lookahead: Option<usize>,
    /// Explicit node list; when non-empty the window computation is skipped.
    pub node_ids: Vec<String>,
}

/// What a selection run did.
#[derive(Debug, Clone, Default)]
pub struct ProbeSelectionOutcome {
    pub probes_selected: usize,
    pub rate_limited: bool,
    /// Node IDs examined, in window order.
    pub window: Vec<String>,
}

struct Candidate {
    node_id: String,
    block_id: String,
    block_type: String,
    concept_keys: Vec<String>,
    concept_ids: Vec<String>,
    info_gain: f64,
    score: f64,
    trigger_after: Vec<String>,
    /// Insertion order, the final tiebreak.
    sequence: usize,
}

pub struct ProbeSelector {
    store: Arc<ContentStore>,
    config: ProbeConfig,
}

impl ProbeSelector {
    pub fn new(store: Arc<ContentStore>, config: ProbeConfig) -> Self {
        Self { store, config }
    }

    pub async fn select(&self, request: &ProbeSelectionRequest) -> Result<ProbeSelectionOutcome> {
        let window = self.resolve_window(request).await?;
        let mut outcome = ProbeSelectionOutcome { window: window.clone(), ..Default::default() };
        if window.is_empty() {
            return Ok(outcome);
        }

        // Hourly rate limit. Zero remaining means no writes at all.
        let recent = self.store.probes_in_last_hour(&request.user_id).await?;
        let remaining = self.config.rate_per_hour.saturating_sub(recent.max(0) as usize);
        if remaining == 0 {
            outcome.rate_limited = true;
            tracing::info!(user_id = %request.user_id, "probe selection rate limited");
            return Ok(outcome);
        }

        let existing = self
            .store
            .existing_probe_keys(&request.user_id, &window)
            .await?;

        // Enumerate and score candidates per node.
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut sequence = 0;
        for node_id in &window {
            let Some(doc) = self.load_doc(node_id, &request.user_id).await? else {
                continue;
            };
            let node = self
                .store
                .node(node_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;

            // Canonical concept IDs for everything this node's candidates
            // and prerequisites reference.
            let mut keys: HashSet<String> = doc.concept_keys.iter().cloned().collect();
            keys.extend(node.prereq_keys());
            for block in &doc.blocks {
                keys.extend(block.string_list("concept_keys"));
            }
            let key_list: Vec<String> = keys.into_iter().collect();
            let key_to_id = self.store.canonical_ids_for_keys(&key_list).await?;
            let all_ids: Vec<String> = key_to_id.values().cloned().collect();
            let states = self.store.concept_states(&request.user_id, &all_ids).await?;
            let misconceptions = self
                .store
                .active_misconception_concepts(&request.user_id, &all_ids)
                .await?;

            let unresolved_prereqs: HashSet<String> = node
                .prereq_keys()
                .into_iter()
                .filter(|key| match key_to_id.get(key) {
                    Some(id) => scoring::is_unresolved_prereq(
                        id,
                        &states,
                        &misconceptions,
                        self.config.min_ready_mastery,
                    ),
                    None => true,
                })
                .collect();

            for (index, block) in doc.blocks.iter().enumerate() {
                if !scoring::is_probe_block(&block.kind) {
                    continue;
                }
                let Some(block_id) = block.id.clone().filter(|id| !id.is_empty()) else {
                    continue;
                };
                if existing.contains(&(node_id.clone(), block_id.clone())) {
                    continue;
                }

                let mut concept_keys = block.string_list("concept_keys");
                if concept_keys.is_empty() {
                    concept_keys = doc.concept_keys.clone();
                }
                let concept_ids: Vec<String> = concept_keys
                    .iter()
                    .filter_map(|key| key_to_id.get(key).cloned())
                    .collect();

                let info_gain = scoring::info_gain(&concept_ids, &states);
                let is_prereq_target = concept_keys
                    .iter()
                    .any(|key| unresolved_prereqs.contains(key));
                if info_gain < self.config.min_info_gain && !is_prereq_target {
                    continue;
                }

                let testlet = self.store.testlet_state(&request.user_id, &block_id).await?;
                let testlet_uncertainty = scoring::testlet_uncertainty(testlet.as_ref());
                let has_misconception =
                    concept_ids.iter().any(|id| misconceptions.contains(id));

                let score = scoring::score(
                    &self.config,
                    info_gain,
                    testlet_uncertainty,
                    has_misconception,
                    is_prereq_target,
                );
                let trigger_after = scoring::infer_trigger_blocks(&doc, index);

                candidates.push(Candidate {
                    node_id: node_id.clone(),
                    block_id,
                    block_type: block.kind.as_str().to_owned(),
                    concept_keys,
                    concept_ids,
                    info_gain,
                    score,
                    trigger_after,
                    sequence,
                });
                sequence += 1;
            }
        }

        // Score-descending, block_id ascending, then insertion order.
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.block_id.cmp(&b.block_id))
                .then_with(|| a.sequence.cmp(&b.sequence))
        });

        // Caps: per node (counting already-open probes), total, rate budget.
        let mut per_node: HashMap<String, usize> = HashMap::new();
        for node_id in &window {
            let open = self.store.open_probe_count(&request.user_id, node_id).await?;
            per_node.insert(node_id.clone(), open.max(0) as usize);
        }
        let total_cap = self.config.max_per_lookahead.min(remaining);

        let mut selected: Vec<Candidate> = Vec::new();
        for candidate in candidates {
            if selected.len() >= total_cap {
                break;
            }
            let node_count = per_node.entry(candidate.node_id.clone()).or_insert(0);
            if *node_count >= self.config.max_per_node {
                continue;
            }
            *node_count += 1;
            selected.push(candidate);
        }

        if selected.is_empty() {
            return Ok(outcome);
        }

        // Persist probes and doc annotations together.
        let mut tx = self.store.begin().await?;
        let mut annotated_nodes: HashSet<String> = HashSet::new();
        for candidate in &selected {
            ContentStore::insert_probe_tx(
                &mut tx,
                &DocProbe {
                    id: uuid::Uuid::new_v4().to_string(),
                    user_id: request.user_id.clone(),
                    node_id: candidate.node_id.clone(),
                    block_id: candidate.block_id.clone(),
                    block_type: candidate.block_type.clone(),
                    concept_keys: candidate.concept_keys.clone(),
                    concept_ids: candidate.concept_ids.clone(),
                    info_gain: candidate.info_gain,
                    score: candidate.score,
                    policy_version: self.config.policy_version.clone(),
                    status: ProbeStatus::Planned,
                },
            )
            .await?;
            annotated_nodes.insert(candidate.node_id.clone());
        }

        for node_id in &annotated_nodes {
            let node_candidates: Vec<&Candidate> =
                selected.iter().filter(|c| &c.node_id == node_id).collect();
            self.annotate_stored_docs(&mut tx, node_id, &request.user_id, &node_candidates)
                .await?;
        }
        tx.commit().await?;

        outcome.probes_selected = selected.len();
        tracing::info!(
            user_id = %request.user_id,
            path_id = %request.path_id,
            selected = outcome.probes_selected,
            "probes planned"
        );
        Ok(outcome)
    }

    /// The window: explicit node list, else `lookahead` nodes strictly after
    /// the anchor in path order.
    async fn resolve_window(&self, request: &ProbeSelectionRequest) -> Result<Vec<String>> {
        if !request.node_ids.is_empty() {
            return Ok(request.node_ids.clone());
        }
        let nodes = self.store.nodes_in_path(&request.path_id).await?;
        let anchor = match &request.anchor_node_id {
            Some(id) => Some(id.clone()),
            None => self.store.active_node(&request.user_id, &request.path_id).await?,
        };
        let lookahead = match request.lookahead {
            Some(n) => n,
            None => self.default_lookahead(&request.path_id).await?,
        };
        let anchor_position = anchor
            .and_then(|id| nodes.iter().find(|n| n.id == id).map(|n| n.position))
            .unwrap_or(-1);
        Ok(nodes
            .into_iter()
            .filter(|n| n.position > anchor_position)
            .take(lookahead)
            .map(|n| n.id)
            .collect())
    }

    async fn default_lookahead(&self, path_id: &str) -> Result<usize> {
        let path = self.store.path(path_id).await?;
        let kind = path
            .and_then(|p| p.metadata.get("kind").and_then(|v| v.as_str().map(str::to_owned)));
        Ok(match kind.as_deref() {
            Some("review") => REVIEW_LOOKAHEAD,
            _ => DEFAULT_LOOKAHEAD,
        })
    }

    /// The doc candidates are enumerated from: the user's variant when one
    /// exists, else the shared node doc.
    async fn load_doc(&self, node_id: &str, user_id: &str) -> Result<Option<NodeDoc>> {
        if let Some(variant) = self.store.node_doc_variant(node_id, user_id).await? {
            return Ok(serde_json::from_str(&variant.doc).ok());
        }
        match self.store.node_doc(node_id).await? {
            Some(row) => Ok(serde_json::from_str(&row.doc).ok()),
            None => Ok(None),
        }
    }

    /// Annotate the stored node doc and the user's variant (when one
    /// exists), each in place: re-parse, mark the selected blocks, then
    /// re-canonicalize and re-hash that row's own bytes. Reads go through
    /// the open transaction so the probe rows and doc rewrites commit
    /// together.
    async fn annotate_stored_docs(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        node_id: &str,
        user_id: &str,
        candidates: &[&Candidate],
    ) -> Result<()> {
        let doc_row: Option<(String, String)> = sqlx::query_as(
            "SELECT doc, sources_hash FROM node_docs WHERE node_id = ?",
        )
        .bind(node_id)
        .fetch_optional(&mut **tx)
        .await?;
        if let Some((stored, sources_hash)) = doc_row {
            if let Ok(mut doc) = serde_json::from_str::<NodeDoc>(&stored) {
                if annotate_doc(&mut doc, candidates) {
                    let (text, hash) = render(&doc)?;
                    ContentStore::save_node_doc_tx(tx, node_id, &text, &hash, &sources_hash)
                        .await?;
                }
            }
        }

        let variant_row: Option<(String, String)> = sqlx::query_as(
            "SELECT doc, sources_hash FROM node_doc_variants WHERE node_id = ? AND user_id = ?",
        )
        .bind(node_id)
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;
        if let Some((stored, sources_hash)) = variant_row {
            if let Ok(mut doc) = serde_json::from_str::<NodeDoc>(&stored) {
                if annotate_doc(&mut doc, candidates) {
                    let (text, hash) = render(&doc)?;
                    ContentStore::save_node_doc_variant_tx(
                        tx,
                        node_id,
                        user_id,
                        &text,
                        &hash,
                        &sources_hash,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }
}

fn render(doc: &NodeDoc) -> Result<(String, String)> {
    let text = String::from_utf8(canonicalize(doc)?)
        .map_err(|e| Error::Validation(format!("canonical JSON is not UTF-8: {e}")))?;
    let hash = content_hash(doc)?;
    Ok((text, hash))
}

/// Mark the selected blocks (matched by stable ID) and backfill their
/// trigger lists. Returns true when anything changed.
fn annotate_doc(doc: &mut NodeDoc, candidates: &[&Candidate]) -> bool {
    let mut changed = false;
    for candidate in candidates {
        let Some(index) = doc.index_of(&candidate.block_id) else { continue };
        let block = &mut doc.blocks[index];
        block.extra.insert("probe".into(), json!(true));
        block.extra.insert("probe_score".into(), json!(candidate.score));
        block.extra.insert("probe_info_gain".into(), json!(candidate.info_gain));
        block
            .extra
            .insert("probe_concept_keys".into(), json!(candidate.concept_keys));
        block
            .extra
            .insert("probe_concept_ids".into(), json!(candidate.concept_ids));
        if block.string_list("trigger_after_block_ids").is_empty()
            && !candidate.trigger_after.is_empty()
        {
            block.set_string_list("trigger_after_block_ids", &candidate.trigger_after);
        }
        changed = true;
    }
    changed
}
