//! Grouping refinement: recluster an intake's files and revise its proposed
//! path structure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::config::GroupingConfig;
use crate::error::{Error, Result};
use crate::grouping::cluster::{cluster, detect_bridges, BridgeFile, Clustering, ScoredPair};
use crate::grouping::similarity::{blend_with_cross_encoder, pair_score};
use crate::store::materials::MaterialFile;
use crate::store::ContentStore;

/// Optional reranker applied to the top-K pairs per file.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    /// Relevance of two files in [0, 1], judged from their textual signatures.
    async fn score(&self, a: &MaterialFile, b: &MaterialFile) -> Result<f64>;
}

/// Transport for the user-facing disambiguation question.
#[async_trait]
pub trait ThreadNotifier: Send + Sync {
    async fn post(&self, thread_id: &str, message: &str) -> Result<()>;
}

/// Structural revision mode chosen for an intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefineMode {
    Merge,
    Split,
    Recluster,
    Segmented,
    Single,
}

impl std::fmt::Display for RefineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Merge => "merge",
            Self::Split => "split",
            Self::Recluster => "recluster",
            Self::Segmented => "segmented",
            Self::Single => "single",
        };
        f.write_str(name)
    }
}

/// Terminal status of one refinement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefineStatus {
    Refined,
    NoChange,
    SkippedLowConfidence,
    NeedsClarification,
}

/// One proposed path as stored in intake metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedPath {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub file_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segment_bridge_file_ids: Vec<String>,
}

/// Outcome of one refinement run.
#[derive(Debug, Clone)]
pub struct GroupingOutcome {
    pub status: RefineStatus,
    pub mode: RefineMode,
    pub paths_before: usize,
    pub paths_after: usize,
    pub clusters: usize,
    pub bridges: usize,
    pub confidence: f64,
}

pub struct GroupingRefiner {
    store: Arc<ContentStore>,
    config: GroupingConfig,
    cross_encoder: Option<Arc<dyn CrossEncoder>>,
    notifier: Option<Arc<dyn ThreadNotifier>>,
}

impl GroupingRefiner {
    pub fn new(store: Arc<ContentStore>, config: GroupingConfig) -> Self {
        Self { store, config, cross_encoder: None, notifier: None }
    }

    pub fn with_cross_encoder(mut self, encoder: Arc<dyn CrossEncoder>) -> Self {
        self.cross_encoder = Some(encoder);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ThreadNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Refine one intake's proposed paths.
    pub async fn refine_intake(&self, intake_id: &str) -> Result<GroupingOutcome> {
        let intake = self
            .store
            .intake(intake_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("intake {intake_id}")))?;
        let files = self.store.files_in_set(&intake.set_id).await?;
        if files.is_empty() {
            return Err(Error::MissingInput(format!("intake {intake_id} has no files")));
        }

        let proposed: Vec<ProposedPath> = intake
            .metadata
            .get("paths")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        // Pair scoring, serial; optional cross-encoder pass in parallel.
        let mut pairs = score_all_pairs(&files);
        if let Some(encoder) = &self.cross_encoder {
            if self.config.cross_encoder_top_k > 0 {
                self.apply_cross_encoder(encoder, &files, &mut pairs).await?;
            }
        }

        let thresholds = self.effective_thresholds(&intake.metadata);
        let file_ids: Vec<String> = files.iter().map(|f| f.id.clone()).collect();
        let clustering = cluster(&file_ids, &pairs, thresholds.merge);
        let bridges = detect_bridges(
            &clustering,
            &pairs,
            self.config.strong_bridge,
            self.config.weak_bridge,
        );
        let confidence =
            (0.5 + clustering.intra_avg - clustering.inter_avg).clamp(0.0, 1.0);

        let mode = select_mode(&clustering, &bridges, proposed.len());

        // Unchanged structure: report and leave the metadata alone.
        if grouping_equivalent(&proposed, &clustering.clusters) {
            return Ok(GroupingOutcome {
                status: RefineStatus::NoChange,
                mode,
                paths_before: proposed.len(),
                paths_after: proposed.len(),
                clusters: clustering.clusters.len(),
                bridges: bridges.len(),
                confidence,
            });
        }

        let applies = match mode {
            RefineMode::Merge => clustering.intra_avg >= thresholds.merge,
            RefineMode::Split => {
                clustering.inter_avg <= thresholds.split && bridges.is_empty()
            }
            RefineMode::Recluster => {
                clustering.intra_avg >= thresholds.merge
                    && clustering.inter_avg <= thresholds.split
            }
            RefineMode::Segmented => {
                clustering.inter_avg >= self.config.weak_bridge && !bridges.is_empty()
            }
            RefineMode::Single => true,
        };

        if !applies {
            return self
                .handle_low_confidence(&intake.id, &intake.metadata, mode, &proposed, &clustering, &bridges, confidence)
                .await;
        }

        let new_paths = build_paths(mode, &clustering, &bridges);
        let paths_after = new_paths.len();
        let primary = new_paths
            .iter()
            .max_by_key(|p| (p.file_ids.len(), std::cmp::Reverse(p.id.clone())))
            .map(|p| p.id.clone());

        let mut metadata = intake.metadata.clone();
        if let Some(map) = metadata.as_object_mut() {
            map.insert("paths".into(), serde_json::to_value(&new_paths)?);
            map.insert("paths_confirmed".into(), json!(true));
            map.insert("paths_refined".into(), json!(true));
            map.insert("paths_refine_mode".into(), json!(mode.to_string()));
            map.insert("confidence".into(), json!(confidence));
            map.remove("intake_refine_pending");
        }
        self.store
            .update_intake(&intake.id, &metadata, primary.as_deref())
            .await?;

        tracing::info!(
            intake_id,
            %mode,
            paths_before = proposed.len(),
            paths_after,
            confidence,
            "intake paths refined"
        );
        Ok(GroupingOutcome {
            status: RefineStatus::Refined,
            mode,
            paths_before: proposed.len(),
            paths_after,
            clusters: clustering.clusters.len(),
            bridges: bridges.len(),
            confidence,
        })
    }

    async fn handle_low_confidence(
        &self,
        intake_id: &str,
        metadata: &serde_json::Value,
        mode: RefineMode,
        proposed: &[ProposedPath],
        clustering: &Clustering,
        bridges: &[BridgeFile],
        confidence: f64,
    ) -> Result<GroupingOutcome> {
        let thread_id = metadata.get("thread_id").and_then(|v| v.as_str());
        let status = if self.config.wait_for_user {
            if let (Some(notifier), Some(thread_id)) = (&self.notifier, thread_id) {
                let message = format!(
                    "Your materials could be organized two ways:\n\
                     1. Keep the current {} path(s)\n\
                     2. Reorganize into {} group(s)\n\
                     Reply with 1 or 2.",
                    proposed.len().max(1),
                    clustering.clusters.len(),
                );
                notifier.post(thread_id, &message).await?;
            }
            let mut updated = metadata.clone();
            if let Some(map) = updated.as_object_mut() {
                map.insert("intake_refine_pending".into(), json!(true));
                map.insert("needs_clarification".into(), json!(true));
            }
            self.store.update_intake(intake_id, &updated, None).await?;
            RefineStatus::NeedsClarification
        } else {
            RefineStatus::SkippedLowConfidence
        };

        Ok(GroupingOutcome {
            status,
            mode,
            paths_before: proposed.len(),
            paths_after: proposed.len(),
            clusters: clustering.clusters.len(),
            bridges: bridges.len(),
            confidence,
        })
    }

    /// Preference knobs shift the configured thresholds.
    fn effective_thresholds(&self, metadata: &serde_json::Value) -> Thresholds {
        let mut merge = self.config.merge_threshold;
        let mut split = self.config.split_threshold;
        if metadata.get("prefer_single_path").and_then(|v| v.as_bool()).unwrap_or(false) {
            merge -= 0.05;
            split -= 0.05;
        }
        if metadata.get("prefer_multi_path").and_then(|v| v.as_bool()).unwrap_or(false) {
            merge += 0.05;
            split += 0.05;
        }
        if let Some(bias) = metadata.get("merge_bias").and_then(|v| v.as_f64()) {
            merge += bias;
        }
        Thresholds { merge: merge.clamp(0.0, 1.0), split: split.clamp(0.0, 1.0) }
    }

    async fn apply_cross_encoder(
        &self,
        encoder: &Arc<dyn CrossEncoder>,
        files: &[MaterialFile],
        pairs: &mut [ScoredPair],
    ) -> Result<()> {
        // Top-K pairs per file by base score.
        let mut selected: BTreeSet<usize> = BTreeSet::new();
        for file in files {
            let mut touching: Vec<(usize, f64)> = pairs
                .iter()
                .enumerate()
                .filter(|(_, p)| p.a == file.id || p.b == file.id)
                .map(|(index, p)| (index, p.score))
                .collect();
            touching.sort_by(|a, b| b.1.total_cmp(&a.1));
            for (index, _) in touching.into_iter().take(self.config.cross_encoder_top_k) {
                selected.insert(index);
            }
        }

        let by_id: HashMap<&str, &MaterialFile> =
            files.iter().map(|f| (f.id.as_str(), f)).collect();
        let mut tasks = tokio::task::JoinSet::new();
        for index in selected {
            let pair = &pairs[index];
            let (Some(a), Some(b)) = (by_id.get(pair.a.as_str()), by_id.get(pair.b.as_str()))
            else {
                continue;
            };
            let encoder = Arc::clone(encoder);
            let a = (*a).clone();
            let b = (*b).clone();
            tasks.spawn(async move {
                let score = encoder.score(&a, &b).await;
                (index, score)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let (index, score) = joined
                .map_err(|e| Error::Other(anyhow::anyhow!("cross-encoder task failed: {e}")))?;
            match score {
                Ok(cross) => {
                    pairs[index].score = blend_with_cross_encoder(pairs[index].score, cross);
                }
                Err(error) => {
                    tracing::warn!(%error, "cross-encoder scoring failed for a pair, keeping base score");
                }
            }
        }
        Ok(())
    }
}

struct Thresholds {
    merge: f64,
    split: f64,
}

/// All unordered pairs, scored serially in deterministic order.
fn score_all_pairs(files: &[MaterialFile]) -> Vec<ScoredPair> {
    let mut pairs = Vec::new();
    for (i, a) in files.iter().enumerate() {
        for b in files.iter().skip(i + 1) {
            pairs.push(ScoredPair {
                a: a.id.clone(),
                b: b.id.clone(),
                score: pair_score(a, b),
            });
        }
    }
    pairs
}

/// Mode selection from cluster structure and the proposed path count.
fn select_mode(
    clustering: &Clustering,
    bridges: &[BridgeFile],
    proposed_paths: usize,
) -> RefineMode {
    let clusters = clustering.clusters.len();
    if clusters == 1 && proposed_paths > 1 {
        return RefineMode::Merge;
    }
    if clusters > 1 && !bridges.is_empty() {
        return RefineMode::Segmented;
    }
    if clusters > 1 && proposed_paths <= 1 && bridges.is_empty() {
        return RefineMode::Split;
    }
    if clusters > 1 && proposed_paths > 1 {
        return RefineMode::Recluster;
    }
    RefineMode::Single
}

/// Whether the proposed paths already express the clustering: the multiset
/// of sorted file-ID sets is identical.
pub fn grouping_equivalent(proposed: &[ProposedPath], clusters: &[Vec<String>]) -> bool {
    if proposed.is_empty() {
        return false;
    }
    let mut before: Vec<Vec<String>> = proposed
        .iter()
        .map(|p| {
            let mut ids = p.file_ids.clone();
            ids.sort_unstable();
            ids
        })
        .collect();
    before.sort();
    let mut after: Vec<Vec<String>> = clusters.to_vec();
    for group in &mut after {
        group.sort_unstable();
    }
    after.sort();
    before == after
}

/// Build the revised paths array for an applied mode.
fn build_paths(
    mode: RefineMode,
    clustering: &Clustering,
    bridges: &[BridgeFile],
) -> Vec<ProposedPath> {
    match mode {
        RefineMode::Merge | RefineMode::Single => {
            let mut all: Vec<String> =
                clustering.clusters.iter().flatten().cloned().collect();
            all.sort_unstable();
            vec![ProposedPath {
                id: uuid::Uuid::new_v4().to_string(),
                title: String::new(),
                file_ids: all,
                segments: Vec::new(),
                segment_bridge_file_ids: Vec::new(),
            }]
        }
        RefineMode::Split | RefineMode::Recluster => clustering
            .clusters
            .iter()
            .map(|cluster| ProposedPath {
                id: uuid::Uuid::new_v4().to_string(),
                title: String::new(),
                file_ids: cluster.clone(),
                segments: Vec::new(),
                segment_bridge_file_ids: Vec::new(),
            })
            .collect(),
        RefineMode::Segmented => {
            let mut all: Vec<String> =
                clustering.clusters.iter().flatten().cloned().collect();
            all.sort_unstable();
            vec![ProposedPath {
                id: uuid::Uuid::new_v4().to_string(),
                title: String::new(),
                file_ids: all,
                segments: clustering.clusters.clone(),
                segment_bridge_file_ids: bridges.iter().map(|b| b.file_id.clone()).collect(),
            }]
        }
    }
}
