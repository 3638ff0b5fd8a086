//! LLM refinement of the heuristic runtime plan.

use serde_json::json;

use crate::llm::LlmClient;
use crate::plan::heuristic::{clamp_plan, ModulePlan, PlanSource, RuntimePlan};
use crate::plan::metrics::{NodeSummary, UserStats};
use crate::store::nodes::NodeKind;

/// Ask the model to refine the heuristic plan. Any failure (call error,
/// schema mismatch) falls back to the heuristic plan unchanged.
///
/// A refined plan is never trusted as-is: every field is re-clamped, missing
/// lesson entries are filled from the heuristic, and a missing module entry
/// whose children exist is synthesized from its first child lesson.
pub async fn refine_plan(
    llm: &dyn LlmClient,
    model: &str,
    heuristic: &RuntimePlan,
    summaries: &[NodeSummary],
    stats: &UserStats,
) -> RuntimePlan {
    let schema = plan_schema();
    let user = format!(
        "Refine this pacing plan for the learner. Keep the same JSON shape and node ids.\n\
         Content summary: {summaries}\nLearner stats: {stats}\nCurrent plan: {plan}",
        summaries = json!(summaries),
        stats = json!(stats),
        plan = json!(heuristic),
    );

    let value = match llm
        .generate_json(SYSTEM_PROMPT, &user, "runtime_plan_v1", &schema)
        .await
    {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(%error, "runtime plan refinement failed, using heuristic");
            return heuristic.clone();
        }
    };

    let mut refined: RuntimePlan = match serde_json::from_value(value) {
        Ok(plan) => plan,
        Err(error) => {
            tracing::warn!(%error, "runtime plan response did not parse, using heuristic");
            return heuristic.clone();
        }
    };

    clamp_plan(&mut refined);
    fill_missing_entries(&mut refined, heuristic, summaries);
    refined.source = PlanSource::Llm;
    refined.model = Some(model.to_owned());
    refined
}

/// Every heuristic lesson keeps an entry; a dropped module entry with
/// existing children is rebuilt from its first child lesson.
fn fill_missing_entries(
    refined: &mut RuntimePlan,
    heuristic: &RuntimePlan,
    summaries: &[NodeSummary],
) {
    for lesson in &heuristic.lessons {
        if !refined.lessons.iter().any(|l| l.node_id == lesson.node_id) {
            refined.lessons.push(lesson.clone());
        }
    }

    for module in summaries.iter().filter(|s| s.kind == NodeKind::Module) {
        if refined.modules.iter().any(|m| m.node_id == module.node_id) {
            continue;
        }
        let first_child = summaries.iter().find(|s| {
            s.kind != NodeKind::Module && s.module_index == module.module_index
        });
        if let Some(child) = first_child {
            let lesson_plan = refined
                .lessons
                .iter()
                .find(|l| l.node_id == child.node_id);
            let target = lesson_plan
                .map(|l| l.break_policy.after_minutes.max(l.estimated_minutes))
                .unwrap_or(child.estimated_minutes)
                .clamp(
                    crate::plan::heuristic::SESSION_MINUTES_RANGE.0,
                    crate::plan::heuristic::SESSION_MINUTES_RANGE.1,
                );
            refined.modules.push(ModulePlan {
                node_id: module.node_id.clone(),
                target_session_minutes: target,
            });
        }
    }
}

const SYSTEM_PROMPT: &str = "You tune pacing plans for a personalized learning runtime. \
Adjust session length, break cadence, and probe policies to the learner's observed behavior. \
Return the complete plan JSON.";

fn plan_schema() -> serde_json::Value {
    let schema = schemars::schema_for!(RuntimePlan);
    serde_json::to_value(schema.schema).unwrap_or_else(|_| json!({ "type": "object" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;
    use crate::plan::heuristic::heuristic_plan;
    use crate::plan::metrics::UserStats;

    fn summary(node_id: &str, kind: NodeKind, module_index: Option<i64>) -> NodeSummary {
        NodeSummary {
            node_id: node_id.into(),
            title: node_id.into(),
            kind,
            module_index,
            lesson_index: None,
            word_count: 1800,
            block_count: 10,
            quick_checks: 2,
            flashcards: 1,
            estimated_minutes: 12,
        }
    }

    fn fixtures() -> (Vec<NodeSummary>, UserStats) {
        let summaries = vec![
            summary("m1", NodeKind::Module, Some(0)),
            summary("l1", NodeKind::Lesson, Some(0)),
            summary("l2", NodeKind::Lesson, Some(0)),
        ];
        (summaries, UserStats::default())
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_heuristic() {
        let (summaries, stats) = fixtures();
        let heuristic = heuristic_plan(&summaries, &stats);
        let llm = ScriptedLlm::new(vec![Err(crate::error::Error::Generation("down".into()))]);

        let plan = refine_plan(&llm, "plan-model", &heuristic, &summaries, &stats).await;
        assert_eq!(plan.source, PlanSource::Heuristic);
        assert_eq!(plan, heuristic);
    }

    #[tokio::test]
    async fn refined_plan_is_clamped_and_completed() {
        let (summaries, stats) = fixtures();
        let heuristic = heuristic_plan(&summaries, &stats);

        // The model raises the target out of range, drops lesson l2, and
        // drops the module entry entirely.
        let mut mangled = heuristic.clone();
        mangled.target_session_minutes = 400;
        mangled.lessons.retain(|l| l.node_id != "l2");
        mangled.modules.clear();
        let llm = ScriptedLlm::new(vec![Ok(serde_json::to_value(&mangled).unwrap())]);

        let plan = refine_plan(&llm, "plan-model", &heuristic, &summaries, &stats).await;
        assert_eq!(plan.source, PlanSource::Llm);
        assert_eq!(plan.model.as_deref(), Some("plan-model"));
        assert!(plan.target_session_minutes <= 90);
        // l2 restored from the heuristic.
        assert!(plan.lessons.iter().any(|l| l.node_id == "l2"));
        // Module entry synthesized from its first child lesson.
        assert_eq!(plan.modules.len(), 1);
        assert_eq!(plan.modules[0].node_id, "m1");
    }

    #[tokio::test]
    async fn unparseable_response_falls_back() {
        let (summaries, stats) = fixtures();
        let heuristic = heuristic_plan(&summaries, &stats);
        let llm = ScriptedLlm::new(vec![Ok(json!({ "nonsense": true }))]);

        let plan = refine_plan(&llm, "plan-model", &heuristic, &summaries, &stats).await;
        assert_eq!(plan.source, PlanSource::Heuristic);
    }
}
