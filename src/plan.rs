//! Adaptive runtime planning: cadence policies derived from content metrics
//! and user progression, optionally LLM-refined, persisted into path and
//! node metadata.

pub mod heuristic;
pub mod metrics;
pub mod refine;

pub use heuristic::{
    clamp_plan, heuristic_plan, BreakPolicy, FlashcardPolicy, LessonPlan, ModulePlan,
    ObjectiveWeights, PlanSource, PolicyProfile, QuickCheckPolicy, RuntimePlan,
};
pub use metrics::{summarize_node, user_stats, NodeSummary, UserStats};

use serde_json::json;

use std::sync::Arc;

use crate::config::PlanConfig;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::store::nodes::NodeKind;
use crate::store::ContentStore;

/// Outcome of one planning run.
#[derive(Debug, Clone)]
pub struct RuntimePlanOutcome {
    pub plan: RuntimePlan,
    pub nodes_updated: usize,
}

/// Computes and persists the runtime plan for one path.
pub struct RuntimePlanner {
    store: Arc<ContentStore>,
    llm: Option<Arc<dyn LlmClient>>,
    config: PlanConfig,
}

impl RuntimePlanner {
    pub fn new(
        store: Arc<ContentStore>,
        llm: Option<Arc<dyn LlmClient>>,
        config: PlanConfig,
    ) -> Self {
        Self { store, llm, config }
    }

    /// Plan the path for one user and persist the result into path and node
    /// metadata in a single transaction.
    pub async fn plan_path(&self, path_id: &str, user_id: &str) -> Result<RuntimePlanOutcome> {
        let nodes = self.store.nodes_in_path(path_id).await?;

        let mut summaries = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let doc = match self.store.node_doc(&node.id).await? {
                Some(row) => serde_json::from_str(&row.doc).ok(),
                None => None,
            };
            summaries.push(summarize_node(node, doc.as_ref(), self.config.wpm));
        }

        let events = self
            .store
            .progression_events(user_id, self.config.event_history_limit)
            .await?;
        let stats = user_stats(&events);

        let mut plan = heuristic_plan(&summaries, &stats);
        if let (Some(llm), Some(model)) = (&self.llm, &self.config.model) {
            plan = refine::refine_plan(llm.as_ref(), model, &plan, &summaries, &stats).await;
        }

        // Persist: the full plan on the path, scoped entries on each node.
        let mut tx = self.store.begin().await?;
        ContentStore::merge_path_metadata_tx(
            &mut tx,
            path_id,
            &json!({ "runtime_plan": plan }),
        )
        .await?;

        let mut nodes_updated = 0;
        for node in &nodes {
            let patch = if node.kind == NodeKind::Module {
                plan.modules
                    .iter()
                    .find(|m| m.node_id == node.id)
                    .map(|entry| {
                        json!({
                            "runtime_plan": entry,
                            "runtime_plan_scope": "module",
                        })
                    })
            } else {
                plan.lessons
                    .iter()
                    .find(|l| l.node_id == node.id)
                    .map(|entry| {
                        json!({
                            "runtime_plan": entry,
                            "runtime_plan_scope": "lesson",
                        })
                    })
            };
            if let Some(patch) = patch {
                ContentStore::merge_node_metadata_tx(&mut tx, &node.id, &patch).await?;
                nodes_updated += 1;
            }
        }
        tx.commit().await?;

        tracing::info!(
            path_id,
            user_id,
            source = ?plan.source,
            target_minutes = plan.target_session_minutes,
            nodes_updated,
            "runtime plan persisted"
        );
        Ok(RuntimePlanOutcome { plan, nodes_updated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::nodes::{LearningPath, PathNode};
    use chrono::Utc;

    async fn seed(store: &ContentStore) {
        store
            .insert_path(&LearningPath {
                id: "p1".into(),
                set_id: "s1".into(),
                user_id: "u1".into(),
                title: "Circuits".into(),
                metadata: json!({}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let nodes = [
            ("m1", NodeKind::Module, json!({ "module_index": 0 })),
            ("l1", NodeKind::Lesson, json!({ "module_index": 0, "lesson_index": 0 })),
            ("l2", NodeKind::Lesson, json!({ "module_index": 0, "lesson_index": 1 })),
        ];
        for (index, (id, kind, metadata)) in nodes.into_iter().enumerate() {
            store
                .insert_node(&PathNode {
                    id: id.into(),
                    path_id: "p1".into(),
                    position: index as i64,
                    parent_id: if kind == NodeKind::Lesson { Some("m1".into()) } else { None },
                    kind,
                    title: id.to_uppercase(),
                    metadata,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn plan_covers_every_node_and_persists() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        seed(&store).await;

        let planner = RuntimePlanner::new(store.clone(), None, PlanConfig::default());
        let outcome = planner.plan_path("p1", "u1").await.expect("plan");

        // Every lesson has a lesson entry, every module a
        // module entry.
        assert_eq!(outcome.plan.modules.len(), 1);
        assert_eq!(outcome.plan.lessons.len(), 2);
        assert_eq!(outcome.nodes_updated, 3);
        assert_eq!(outcome.plan.source, PlanSource::Heuristic);

        let path = store.path("p1").await.unwrap().unwrap();
        assert!(path.metadata.get("runtime_plan").is_some());

        let module = store.node("m1").await.unwrap().unwrap();
        assert_eq!(
            module.metadata["runtime_plan_scope"].as_str(),
            Some("module"),
        );
        let lesson = store.node("l1").await.unwrap().unwrap();
        assert_eq!(
            lesson.metadata["runtime_plan_scope"].as_str(),
            Some("lesson"),
        );
        assert!(lesson.metadata["runtime_plan"]["break_policy"]["after_minutes"].is_i64());
    }

    #[tokio::test]
    async fn planning_is_idempotent() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        seed(&store).await;

        let planner = RuntimePlanner::new(store.clone(), None, PlanConfig::default());
        let first = planner.plan_path("p1", "u1").await.expect("plan");
        let second = planner.plan_path("p1", "u1").await.expect("plan");
        assert_eq!(first.plan, second.plan);
    }
}
