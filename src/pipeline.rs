//! Per-material-set pipeline orchestration.
//!
//! Stage order per path: canonicalize → build docs → probe-select →
//! runtime-plan → evaluate variants. Every stage is idempotent and
//! restartable; a failed node build is recorded and skipped rather than
//! aborting the run. Node builds fan out under a bounded semaphore.

use arc_swap::ArcSwap;
use tokio::sync::Semaphore;

use std::collections::HashMap;
use std::sync::Arc;

use crate::canonical::{Canonicalizer, SemanticMatch};
use crate::config::{
    CanonicalConfig, CompactionConfig, DocBuildConfig, GroupingConfig, PipelineConfig,
    PlanConfig, ProbeConfig,
};
use crate::doc::{DocBuildRequest, DocBuilder, Threading};
use crate::error::Result;
use crate::llm::LlmClient;
use crate::plan::{PlanSource, RuntimePlanner};
use crate::probes::{ProbeSelectionRequest, ProbeSelector};
use crate::progress::ProgressReporter;
use crate::store::nodes::{NodeKind, PathNode};
use crate::store::ContentStore;
use crate::variants::VariantEvaluator;
use crate::vector::VectorIndex;

/// The full stage configuration bundle, hot-swappable at runtime.
#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub pipeline: PipelineConfig,
    pub doc: DocBuildConfig,
    pub probes: ProbeConfig,
    pub plan: PlanConfig,
    pub grouping: GroupingConfig,
    pub canonical: CanonicalConfig,
    pub compaction: CompactionConfig,
}

impl PipelineSettings {
    pub fn from_env() -> Self {
        Self {
            pipeline: PipelineConfig::from_env(),
            doc: DocBuildConfig::from_env(),
            probes: ProbeConfig::from_env(),
            plan: PlanConfig::from_env(),
            grouping: GroupingConfig::from_env(),
            canonical: CanonicalConfig::from_env(),
            compaction: CompactionConfig::from_env(),
        }
    }
}

/// Shared dependencies handed to every stage.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<ContentStore>,
    pub llm: Arc<dyn LlmClient>,
    pub vector: Arc<dyn VectorIndex>,
    pub settings: Arc<ArcSwap<PipelineSettings>>,
}

impl PipelineDeps {
    pub fn new(
        store: Arc<ContentStore>,
        llm: Arc<dyn LlmClient>,
        vector: Arc<dyn VectorIndex>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            llm,
            vector,
            settings: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    fn settings(&self) -> Arc<PipelineSettings> {
        self.settings.load_full()
    }
}

/// What one pipeline run did.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub concepts_resolved: usize,
    pub docs_built: usize,
    pub docs_failed: usize,
    /// Node IDs whose doc build failed, with the error text.
    pub failures: Vec<(String, String)>,
    pub probes_selected: usize,
    pub rate_limited: bool,
    pub plan_source: Option<PlanSource>,
    pub outcomes_evaluated: usize,
}

pub struct ContentPipeline {
    deps: PipelineDeps,
}

impl ContentPipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    /// Run the full stage sequence for one path and user.
    pub async fn run_for_path(
        &self,
        path_id: &str,
        user_id: &str,
        semantic_matches: &HashMap<String, SemanticMatch>,
        progress: &ProgressReporter,
    ) -> Result<PipelineReport> {
        let settings = self.deps.settings();
        let mut report = PipelineReport::default();
        let nodes = self.deps.store.nodes_in_path(path_id).await?;

        // Stage 1: canonicalize the path's concepts.
        progress.update(5, "canonicalizing concepts");
        let mut keys: Vec<String> = nodes
            .iter()
            .flat_map(|n| n.concept_keys())
            .map(|k| crate::canonical::normalize_key(&k))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        let path_concepts = self.deps.store.path_concepts_by_keys(&keys).await?;
        let canonicalizer =
            Canonicalizer::new(self.deps.store.clone(), settings.canonical.clone());
        let outcome = canonicalizer
            .canonicalize(&path_concepts, semantic_matches)
            .await?;
        report.concepts_resolved = outcome.resolved.len();

        // Stage 2: build docs, bounded fan-out, fail-open per node.
        let builder = Arc::new(DocBuilder::new(
            self.deps.store.clone(),
            self.deps.llm.clone(),
            self.deps.vector.clone(),
            settings.doc.clone(),
            settings.pipeline.vector_timeout_ms,
        ));
        let semaphore = Arc::new(Semaphore::new(settings.pipeline.node_build_concurrency));
        let mut tasks = tokio::task::JoinSet::new();
        for (index, node) in nodes.iter().enumerate() {
            let request = build_request(&nodes, index, user_id);
            let builder = Arc::clone(&builder);
            let semaphore = Arc::clone(&semaphore);
            let node_id = node.id.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = builder.build(&request).await;
                (node_id, result)
            });
        }
        let total = nodes.len();
        let mut done = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let (node_id, result) = joined
                .map_err(|e| crate::error::Error::Other(anyhow::anyhow!("build task: {e}")))?;
            done += 1;
            progress.update_range(done, total, 10, 60, "building node docs");
            match result {
                Ok(_) => report.docs_built += 1,
                Err(error) => {
                    tracing::warn!(%error, node_id, "node doc build failed");
                    report.docs_failed += 1;
                    report.failures.push((node_id, error.to_string()));
                }
            }
        }

        // Stage 3: probe selection.
        progress.update(70, "selecting probes");
        let selector = ProbeSelector::new(self.deps.store.clone(), settings.probes.clone());
        let probes = selector
            .select(&ProbeSelectionRequest {
                user_id: user_id.to_owned(),
                path_id: path_id.to_owned(),
                ..Default::default()
            })
            .await?;
        report.probes_selected = probes.probes_selected;
        report.rate_limited = probes.rate_limited;

        // Stage 4: runtime plan.
        progress.update(85, "deriving runtime plan");
        let planner = RuntimePlanner::new(
            self.deps.store.clone(),
            Some(self.deps.llm.clone()),
            settings.plan.clone(),
        );
        let plan = planner.plan_path(path_id, user_id).await?;
        report.plan_source = Some(plan.plan.source);

        // Stage 5: evaluate pending variant exposures.
        progress.update(95, "evaluating variant outcomes");
        let evaluator = VariantEvaluator::new(self.deps.store.clone());
        let sweep = evaluator.evaluate_pending().await?;
        report.outcomes_evaluated = sweep.evaluated;

        progress.update(99, "pipeline complete");
        tracing::info!(
            path_id,
            user_id,
            docs_built = report.docs_built,
            docs_failed = report.docs_failed,
            probes = report.probes_selected,
            "pipeline run complete"
        );
        Ok(report)
    }
}

/// Build request for one node, including threading titles from its
/// neighbors and parent module.
fn build_request(nodes: &[PathNode], index: usize, user_id: &str) -> DocBuildRequest {
    let node = &nodes[index];
    let sibling_title = |offset: i64| -> Option<String> {
        let target = index as i64 + offset;
        if target < 0 {
            return None;
        }
        nodes
            .get(target as usize)
            .filter(|n| n.kind != NodeKind::Module)
            .map(|n| n.title.clone())
    };
    let module_title = node
        .parent_id
        .as_ref()
        .and_then(|parent| nodes.iter().find(|n| &n.id == parent))
        .map(|n| n.title.clone());

    DocBuildRequest {
        node_id: node.id.clone(),
        user_id: Some(user_id.to_owned()),
        must_cite: Vec::new(),
        outline: Vec::new(),
        blueprint_objectives: node
            .metadata
            .get("objectives")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default(),
        threading: Threading {
            prev_title: sibling_title(-1),
            next_title: sibling_title(1),
            module_title,
        },
    }
}
