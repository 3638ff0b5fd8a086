//! Heuristic runtime-plan derivation and range clamps.
//!
//! The heuristic plan is always computed; LLM refinement starts from it and
//! every refined field is pushed back through the same clamps.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

use crate::plan::metrics::{NodeSummary, UserStats};
use crate::store::nodes::NodeKind;

/// Hard range for a session target, minutes.
pub const SESSION_MINUTES_RANGE: (i64, i64) = (8, 90);
/// Hard range for a minimum break, minutes.
pub const MIN_BREAK_RANGE: (i64, i64) = (1, 20);

/// Where a plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Heuristic,
    Llm,
}

/// Pacing profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PolicyProfile {
    Balanced,
    Gentle,
    Intensive,
    Review,
}

/// Break cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BreakPolicy {
    pub after_minutes: i64,
    pub min_break_minutes: i64,
    pub max_break_minutes: i64,
}

/// Quick-check surfacing cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QuickCheckPolicy {
    pub max_per_lesson: i64,
    pub min_spacing_blocks: i64,
    /// Consecutive failures that pause further checks.
    pub fail_streak_pause: i64,
}

/// Flashcard surfacing cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlashcardPolicy {
    pub max_per_lesson: i64,
    pub min_spacing_blocks: i64,
    pub fail_streak_pause: i64,
}

/// Objective blend. Always normalized to sum 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ObjectiveWeights {
    pub mastery: f64,
    pub retention: f64,
    pub pace: f64,
    pub fatigue: f64,
}

impl ObjectiveWeights {
    pub fn normalized(mut self) -> Self {
        let sum = self.mastery + self.retention + self.pace + self.fatigue;
        if sum > 0.0 {
            self.mastery /= sum;
            self.retention /= sum;
            self.pace /= sum;
            self.fatigue /= sum;
        } else {
            self = Self::default();
        }
        self
    }
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self { mastery: 0.35, retention: 0.25, pace: 0.25, fatigue: 0.15 }
    }
}

/// Per-module plan entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModulePlan {
    pub node_id: String,
    pub target_session_minutes: i64,
}

/// Per-lesson plan entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LessonPlan {
    pub node_id: String,
    pub estimated_minutes: i64,
    pub break_policy: BreakPolicy,
    pub quick_check_policy: QuickCheckPolicy,
    pub flashcard_policy: FlashcardPolicy,
}

/// The full runtime plan for one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RuntimePlan {
    pub target_session_minutes: i64,
    pub break_policy: BreakPolicy,
    pub quick_check_policy: QuickCheckPolicy,
    pub flashcard_policy: FlashcardPolicy,
    pub policy_profile: PolicyProfile,
    pub objective_weights: ObjectiveWeights,
    pub modules: Vec<ModulePlan>,
    pub lessons: Vec<LessonPlan>,
    pub source: PlanSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn clamp(value: i64, low: i64, high: i64) -> i64 {
    value.max(low).min(high)
}

/// Derive the heuristic plan from content summaries and user stats.
pub fn heuristic_plan(summaries: &[NodeSummary], stats: &UserStats) -> RuntimePlan {
    let lessons: Vec<&NodeSummary> =
        summaries.iter().filter(|s| s.kind != NodeKind::Module).collect();
    let avg_lesson_minutes = if lessons.is_empty() {
        10.0
    } else {
        lessons.iter().map(|s| s.estimated_minutes as f64).sum::<f64>() / lessons.len() as f64
    };
    let avg_block_count = if lessons.is_empty() {
        8.0
    } else {
        lessons.iter().map(|s| s.block_count as f64).sum::<f64>() / lessons.len() as f64
    };
    let avg_quick_checks = if lessons.is_empty() {
        2.0
    } else {
        lessons.iter().map(|s| s.quick_checks as f64).sum::<f64>() / lessons.len() as f64
    };
    let avg_flashcards = if lessons.is_empty() {
        1.0
    } else {
        lessons.iter().map(|s| s.flashcards as f64).sum::<f64>() / lessons.len() as f64
    };

    // Session target: double an average lesson, then scale by performance.
    let mut target = clamp((avg_lesson_minutes * 2.0).round() as i64, 10, 45) as f64;
    if stats.completion_rate < 0.5 {
        target *= 0.85;
    }
    if stats.avg_score > 0.85 && stats.completion_rate > 0.8 {
        target *= 1.10;
    }
    let target_session_minutes = clamp(
        target.round() as i64,
        SESSION_MINUTES_RANGE.0,
        SESSION_MINUTES_RANGE.1,
    );

    let break_policy = derive_break_policy(target_session_minutes);
    let fail_streak_pause = if stats.completion_rate < 0.55 { 1 } else { 2 };

    let quick_check_policy = QuickCheckPolicy {
        max_per_lesson: clamp(avg_quick_checks.ceil() as i64 + 1, 1, 6),
        min_spacing_blocks: clamp((avg_block_count / 4.0).round() as i64, 1, 8),
        fail_streak_pause,
    };
    let flashcard_policy = FlashcardPolicy {
        max_per_lesson: clamp(avg_flashcards.ceil() as i64 + 1, 1, 8),
        min_spacing_blocks: clamp((avg_block_count / 5.0).round() as i64, 1, 8),
        fail_streak_pause,
    };

    let policy_profile = derive_profile(summaries, stats);
    let objective_weights = derive_weights(stats);

    let modules = module_plans(summaries, target_session_minutes);
    let lessons = lesson_plans(
        summaries,
        &break_policy,
        &quick_check_policy,
        &flashcard_policy,
    );

    RuntimePlan {
        target_session_minutes,
        break_policy,
        quick_check_policy,
        flashcard_policy,
        policy_profile,
        objective_weights,
        modules,
        lessons,
        source: PlanSource::Heuristic,
        model: None,
    }
}

/// Break policy for a session target:
/// after = clamp(0.7·target, 8..target), min = clamp(0.12·target, 2..12),
/// max = clamp(min+6, min+2..20).
pub fn derive_break_policy(target_session_minutes: i64) -> BreakPolicy {
    let after_minutes = clamp(
        (target_session_minutes as f64 * 0.7).round() as i64,
        8,
        target_session_minutes,
    );
    let min_break_minutes = clamp((target_session_minutes as f64 * 0.12).round() as i64, 2, 12);
    let max_break_minutes = clamp(min_break_minutes + 6, min_break_minutes + 2, 20);
    BreakPolicy { after_minutes, min_break_minutes, max_break_minutes }
}

fn derive_profile(summaries: &[NodeSummary], stats: &UserStats) -> PolicyProfile {
    let review_nodes = summaries.iter().filter(|s| s.kind == NodeKind::Review).count();
    if !summaries.is_empty() && review_nodes * 2 > summaries.len() {
        return PolicyProfile::Review;
    }
    if stats.completion_rate < 0.5 {
        return PolicyProfile::Gentle;
    }
    if stats.avg_score > 0.85 && stats.completion_rate > 0.8 {
        return PolicyProfile::Intensive;
    }
    PolicyProfile::Balanced
}

/// Start from the default blend and shift by observed behavior, then
/// normalize back to sum 1.
fn derive_weights(stats: &UserStats) -> ObjectiveWeights {
    let mut weights = ObjectiveWeights::default();
    if stats.avg_score < 0.6 {
        weights.mastery += 0.10;
    }
    if stats.recent_30d_count < 5 {
        weights.retention += 0.05;
    }
    if stats.completion_rate > 0.8 {
        weights.pace += 0.05;
    }
    if stats.avg_dwell_seconds > 1200.0 || stats.avg_attempts > 2.5 {
        weights.fatigue += 0.10;
    }
    weights.normalized()
}

/// Per-module target: the base target capped by the module's total child
/// lesson minutes.
fn module_plans(summaries: &[NodeSummary], base_target: i64) -> Vec<ModulePlan> {
    let mut child_minutes: BTreeMap<i64, i64> = BTreeMap::new();
    for summary in summaries {
        if summary.kind == NodeKind::Module {
            continue;
        }
        if let Some(module_index) = summary.module_index {
            *child_minutes.entry(module_index).or_insert(0) += summary.estimated_minutes;
        }
    }
    summaries
        .iter()
        .filter(|s| s.kind == NodeKind::Module)
        .map(|module| {
            let total = module
                .module_index
                .and_then(|index| child_minutes.get(&index).copied())
                .unwrap_or(base_target);
            ModulePlan {
                node_id: module.node_id.clone(),
                target_session_minutes: clamp(
                    base_target.min(total.max(1)),
                    SESSION_MINUTES_RANGE.0,
                    SESSION_MINUTES_RANGE.1,
                ),
            }
        })
        .collect()
}

/// Per-lesson plan: policies copied from the path level, break trigger
/// stretched to at least the lesson's own estimated length.
fn lesson_plans(
    summaries: &[NodeSummary],
    break_policy: &BreakPolicy,
    quick_check_policy: &QuickCheckPolicy,
    flashcard_policy: &FlashcardPolicy,
) -> Vec<LessonPlan> {
    summaries
        .iter()
        .filter(|s| s.kind != NodeKind::Module)
        .map(|lesson| {
            let after = lesson
                .estimated_minutes
                .max((break_policy.after_minutes as f64 * 0.6).round() as i64);
            LessonPlan {
                node_id: lesson.node_id.clone(),
                estimated_minutes: lesson.estimated_minutes,
                break_policy: BreakPolicy { after_minutes: after, ..break_policy.clone() },
                quick_check_policy: quick_check_policy.clone(),
                flashcard_policy: flashcard_policy.clone(),
            }
        })
        .collect()
}

/// Push every numeric field of a plan back into its valid range. Applied to
/// LLM-refined plans before they are trusted.
pub fn clamp_plan(plan: &mut RuntimePlan) {
    plan.target_session_minutes = clamp(
        plan.target_session_minutes,
        SESSION_MINUTES_RANGE.0,
        SESSION_MINUTES_RANGE.1,
    );
    clamp_break(&mut plan.break_policy, plan.target_session_minutes);
    clamp_check_policy(&mut plan.quick_check_policy);
    clamp_flashcard_policy(&mut plan.flashcard_policy);
    plan.objective_weights = plan.objective_weights.clone().normalized();
    for module in &mut plan.modules {
        module.target_session_minutes = clamp(
            module.target_session_minutes,
            SESSION_MINUTES_RANGE.0,
            SESSION_MINUTES_RANGE.1,
        );
    }
    for lesson in &mut plan.lessons {
        lesson.estimated_minutes = lesson.estimated_minutes.max(1);
        clamp_break(&mut lesson.break_policy, SESSION_MINUTES_RANGE.1);
        clamp_check_policy(&mut lesson.quick_check_policy);
        clamp_flashcard_policy(&mut lesson.flashcard_policy);
    }
}

fn clamp_break(policy: &mut BreakPolicy, target: i64) {
    policy.after_minutes = clamp(policy.after_minutes, 1, target.max(1));
    policy.min_break_minutes = clamp(
        policy.min_break_minutes,
        MIN_BREAK_RANGE.0,
        MIN_BREAK_RANGE.1,
    );
    policy.max_break_minutes = clamp(
        policy.max_break_minutes,
        policy.min_break_minutes,
        20.max(policy.min_break_minutes),
    );
}

fn clamp_check_policy(policy: &mut QuickCheckPolicy) {
    policy.max_per_lesson = clamp(policy.max_per_lesson, 0, 10);
    policy.min_spacing_blocks = clamp(policy.min_spacing_blocks, 1, 12);
    policy.fail_streak_pause = clamp(policy.fail_streak_pause, 1, 5);
}

fn clamp_flashcard_policy(policy: &mut FlashcardPolicy) {
    policy.max_per_lesson = clamp(policy.max_per_lesson, 0, 12);
    policy.min_spacing_blocks = clamp(policy.min_spacing_blocks, 1, 12);
    policy.fail_streak_pause = clamp(policy.fail_streak_pause, 1, 5);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(node_id: &str, kind: NodeKind, minutes: i64, module_index: Option<i64>) -> NodeSummary {
        NodeSummary {
            node_id: node_id.into(),
            title: node_id.into(),
            kind,
            module_index,
            lesson_index: None,
            word_count: (minutes * 180) as usize,
            block_count: 10,
            quick_checks: 2,
            flashcards: 1,
            estimated_minutes: minutes,
        }
    }

    fn neutral_stats() -> UserStats {
        UserStats {
            avg_score: 0.7,
            avg_attempts: 1.0,
            avg_dwell_seconds: 300.0,
            completion_rate: 0.7,
            recent_30d_count: 10,
            last_event_at: None,
        }
    }

    #[test]
    fn every_lesson_and_module_gets_an_entry() {
        let summaries = vec![
            summary("m1", NodeKind::Module, 4, Some(0)),
            summary("l1", NodeKind::Lesson, 12, Some(0)),
            summary("l2", NodeKind::Lesson, 8, Some(0)),
        ];
        let plan = heuristic_plan(&summaries, &neutral_stats());
        assert_eq!(plan.modules.len(), 1);
        assert_eq!(plan.lessons.len(), 2);
        assert_eq!(plan.modules[0].node_id, "m1");
    }

    #[test]
    fn clamps_hold_for_extreme_inputs() {
        let summaries = vec![summary("l1", NodeKind::Lesson, 500, None)];
        let plan = heuristic_plan(&summaries, &neutral_stats());
        assert!(plan.target_session_minutes >= SESSION_MINUTES_RANGE.0);
        assert!(plan.target_session_minutes <= SESSION_MINUTES_RANGE.1);
        assert!(plan.break_policy.min_break_minutes >= MIN_BREAK_RANGE.0);
        assert!(plan.break_policy.min_break_minutes <= MIN_BREAK_RANGE.1);
        assert!(plan.break_policy.after_minutes <= plan.target_session_minutes);
    }

    #[test]
    fn low_completion_scales_target_down() {
        let summaries = vec![summary("l1", NodeKind::Lesson, 15, None)];
        let mut stats = neutral_stats();
        let base = heuristic_plan(&summaries, &stats).target_session_minutes;
        stats.completion_rate = 0.3;
        let scaled = heuristic_plan(&summaries, &stats).target_session_minutes;
        assert!(scaled < base);
    }

    #[test]
    fn strong_user_scales_target_up() {
        let summaries = vec![summary("l1", NodeKind::Lesson, 15, None)];
        let mut stats = neutral_stats();
        let base = heuristic_plan(&summaries, &stats).target_session_minutes;
        stats.avg_score = 0.92;
        stats.completion_rate = 0.9;
        let scaled = heuristic_plan(&summaries, &stats).target_session_minutes;
        assert!(scaled > base);
    }

    #[test]
    fn fail_streak_follows_completion_rate() {
        let summaries = vec![summary("l1", NodeKind::Lesson, 10, None)];
        let mut stats = neutral_stats();
        stats.completion_rate = 0.5;
        assert_eq!(heuristic_plan(&summaries, &stats).quick_check_policy.fail_streak_pause, 1);
        stats.completion_rate = 0.8;
        assert_eq!(heuristic_plan(&summaries, &stats).quick_check_policy.fail_streak_pause, 2);
    }

    #[test]
    fn objective_weights_sum_to_one() {
        for completion in [0.2, 0.6, 0.95] {
            let mut stats = neutral_stats();
            stats.completion_rate = completion;
            stats.avg_score = 0.5;
            stats.avg_dwell_seconds = 2000.0;
            let plan = heuristic_plan(&[summary("l1", NodeKind::Lesson, 10, None)], &stats);
            let w = &plan.objective_weights;
            let sum = w.mastery + w.retention + w.pace + w.fatigue;
            assert!((sum - 1.0).abs() < 1e-9, "weights must normalize, got {sum}");
        }
    }

    #[test]
    fn module_target_capped_by_child_minutes() {
        let summaries = vec![
            summary("m1", NodeKind::Module, 4, Some(0)),
            summary("l1", NodeKind::Lesson, 5, Some(0)),
            summary("l2", NodeKind::Lesson, 4, Some(0)),
        ];
        let plan = heuristic_plan(&summaries, &neutral_stats());
        // Children total 9 < base target → capped (then floored to range min).
        assert_eq!(plan.modules[0].target_session_minutes, 9.max(SESSION_MINUTES_RANGE.0));
    }

    #[test]
    fn lesson_break_stretches_to_lesson_length() {
        let summaries = vec![
            summary("l1", NodeKind::Lesson, 40, None),
            summary("l2", NodeKind::Lesson, 5, None),
        ];
        let plan = heuristic_plan(&summaries, &neutral_stats());
        let long = plan.lessons.iter().find(|l| l.node_id == "l1").unwrap();
        let short = plan.lessons.iter().find(|l| l.node_id == "l2").unwrap();
        assert_eq!(long.break_policy.after_minutes, 40);
        assert_eq!(
            short.break_policy.after_minutes,
            (plan.break_policy.after_minutes as f64 * 0.6).round() as i64,
        );
    }

    #[test]
    fn clamp_plan_repairs_out_of_range_llm_output() {
        let summaries = vec![summary("l1", NodeKind::Lesson, 10, None)];
        let mut plan = heuristic_plan(&summaries, &neutral_stats());
        plan.target_session_minutes = 500;
        plan.break_policy.min_break_minutes = -3;
        plan.objective_weights = ObjectiveWeights {
            mastery: 3.0,
            retention: 1.0,
            pace: 0.0,
            fatigue: 0.0,
        };
        clamp_plan(&mut plan);
        assert_eq!(plan.target_session_minutes, SESSION_MINUTES_RANGE.1);
        assert!(plan.break_policy.min_break_minutes >= 1);
        let w = &plan.objective_weights;
        assert!((w.mastery + w.retention + w.pace + w.fatigue - 1.0).abs() < 1e-9);
    }
}
