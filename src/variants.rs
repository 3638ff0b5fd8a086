//! Variant exposure/outcome evaluation.
//!
//! Joins each sufficiently old, unevaluated exposure with the user's current
//! concept state and node-run telemetry, and persists one outcome row of
//! effect metrics. Per-exposure failures are counted and skipped; the sweep
//! never aborts on a single bad row.

use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::store::variants::DocVariantExposure;
use crate::store::ContentStore;

/// Baseline concept-state snapshot stored on the exposure.
#[derive(Debug, Clone, Deserialize)]
struct BaselineConcept {
    #[serde(default)]
    mastery: f64,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    epistemic_uncertainty: f64,
    #[serde(default)]
    aleatoric_uncertainty: f64,
}

impl BaselineConcept {
    fn uncertainty(&self) -> f64 {
        self.epistemic_uncertainty.max(self.aleatoric_uncertainty)
    }
}

/// Outcome of one evaluation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationSweep {
    pub evaluated: usize,
    pub skipped: usize,
}

pub struct VariantEvaluator {
    store: Arc<ContentStore>,
    /// Exposures younger than this are left for a later sweep.
    pub min_age_minutes: i64,
    /// Exposures processed per sweep.
    pub batch_limit: usize,
}

impl VariantEvaluator {
    pub fn new(store: Arc<ContentStore>) -> Self {
        Self { store, min_age_minutes: 30, batch_limit: 200 }
    }

    /// Evaluate all pending exposures older than the minimum age.
    pub async fn evaluate_pending(&self) -> Result<EvaluationSweep> {
        let cutoff = Utc::now() - Duration::minutes(self.min_age_minutes);
        let exposures = self.store.pending_exposures(cutoff, self.batch_limit).await?;

        let mut sweep = EvaluationSweep::default();
        for exposure in exposures {
            match self.evaluate_one(&exposure).await {
                Ok(()) => sweep.evaluated += 1,
                Err(error) => {
                    tracing::warn!(%error, exposure_id = %exposure.id, "exposure evaluation skipped");
                    sweep.skipped += 1;
                }
            }
        }

        if sweep.evaluated > 0 || sweep.skipped > 0 {
            tracing::info!(
                evaluated = sweep.evaluated,
                skipped = sweep.skipped,
                "variant outcome sweep complete"
            );
        }
        Ok(sweep)
    }

    async fn evaluate_one(&self, exposure: &DocVariantExposure) -> Result<()> {
        let baseline: HashMap<String, BaselineConcept> =
            serde_json::from_str(&exposure.baseline)?;

        let concept_ids: Vec<String> = baseline.keys().cloned().collect();
        let current = self
            .store
            .concept_states(&exposure.user_id, &concept_ids)
            .await?;

        // Deltas over the paired subset: concepts present in both snapshots.
        let mut mastery_deltas = Vec::new();
        let mut confidence_deltas = Vec::new();
        let mut uncertainty_deltas = Vec::new();
        for (concept_id, before) in &baseline {
            let Some(now) = current.get(concept_id) else { continue };
            mastery_deltas.push(now.mastery - before.mastery);
            confidence_deltas.push(now.confidence - before.confidence);
            uncertainty_deltas.push(now.uncertainty() - before.uncertainty());
        }
        let mean = |values: &[f64]| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };

        let age_minutes = (Utc::now() - exposure.created_at).num_minutes();

        let node_run = self
            .store
            .node_run(&exposure.user_id, &exposure.node_id)
            .await?;
        let node_run_json = node_run.map(|run| {
            let time_to_complete_secs = match (run.started_at, run.completed_at) {
                (Some(started), Some(completed)) => {
                    Some((completed - started).num_seconds())
                }
                _ => None,
            };
            json!({
                "state": run.state,
                "completed": run.completed,
                "attempt_count": run.attempt_count,
                "last_score": run.last_score,
                "last_seen_at": run.last_seen_at,
                "time_to_complete_secs": time_to_complete_secs,
            })
        });

        let metrics = json!({
            "baseline_concepts": baseline.len(),
            "paired_concepts": mastery_deltas.len(),
            "mean_mastery_delta": mean(&mastery_deltas),
            "mean_confidence_delta": mean(&confidence_deltas),
            "mean_uncertainty_delta": mean(&uncertainty_deltas),
            "age_minutes": age_minutes,
            "content_hash": exposure.content_hash,
            "node_run": node_run_json,
        });

        self.store.save_outcome(&exposure.id, &metrics).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::states::{NodeRun, UserConceptState};
    use chrono::DateTime;

    fn exposure(id: &str, baseline: serde_json::Value, age_minutes: i64) -> DocVariantExposure {
        DocVariantExposure {
            id: id.into(),
            user_id: "u1".into(),
            node_id: "n1".into(),
            variant_id: None,
            baseline: baseline.to_string(),
            content_hash: "h1".into(),
            evaluated: false,
            created_at: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    fn state(concept_id: &str, mastery: f64) -> UserConceptState {
        UserConceptState {
            user_id: "u1".into(),
            concept_id: concept_id.into(),
            mastery,
            confidence: 0.8,
            epistemic_uncertainty: 0.1,
            aleatoric_uncertainty: 0.2,
            attempts: 4,
            correct: 3,
            last_seen_at: None,
            next_review_at: None,
        }
    }

    #[tokio::test]
    async fn young_exposures_wait() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        store
            .insert_exposure(&exposure("e1", json!({}), 5))
            .await
            .unwrap();

        let sweep = VariantEvaluator::new(store).evaluate_pending().await.unwrap();
        assert_eq!(sweep, EvaluationSweep { evaluated: 0, skipped: 0 });
    }

    #[tokio::test]
    async fn deltas_are_computed_over_the_paired_subset() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let baseline = json!({
            "c1": { "mastery": 0.3, "confidence": 0.5,
                    "epistemic_uncertainty": 0.4, "aleatoric_uncertainty": 0.1 },
            "c-gone": { "mastery": 0.2, "confidence": 0.2,
                        "epistemic_uncertainty": 0.5, "aleatoric_uncertainty": 0.5 },
        });
        store.insert_exposure(&exposure("e1", baseline, 90)).await.unwrap();
        store.upsert_concept_state(&state("c1", 0.7)).await.unwrap();
        store
            .upsert_node_run(&NodeRun {
                user_id: "u1".into(),
                node_id: "n1".into(),
                state: "completed".into(),
                completed: true,
                attempt_count: 2,
                last_score: Some(0.9),
                last_seen_at: None,
                started_at: DateTime::parse_from_rfc3339("2026-08-01T10:00:00Z")
                    .ok()
                    .map(|t| t.with_timezone(&Utc)),
                completed_at: DateTime::parse_from_rfc3339("2026-08-01T10:20:00Z")
                    .ok()
                    .map(|t| t.with_timezone(&Utc)),
            })
            .await
            .unwrap();

        let sweep = VariantEvaluator::new(store.clone()).evaluate_pending().await.unwrap();
        assert_eq!(sweep.evaluated, 1);

        let metrics = store.outcome_metrics("e1").await.unwrap().expect("outcome");
        assert_eq!(metrics["paired_concepts"], 1);
        assert_eq!(metrics["baseline_concepts"], 2);
        assert!((metrics["mean_mastery_delta"].as_f64().unwrap() - 0.4).abs() < 1e-9);
        // Uncertainty delta: max(0.1, 0.2)=0.2 now vs max(0.4, 0.1)=0.4 then.
        assert!((metrics["mean_uncertainty_delta"].as_f64().unwrap() + 0.2).abs() < 1e-9);
        assert_eq!(metrics["node_run"]["completed"], true);
        assert_eq!(metrics["node_run"]["time_to_complete_secs"], 1200);
        assert!(metrics["age_minutes"].as_i64().unwrap() >= 90);
    }

    #[tokio::test]
    async fn bad_baseline_counts_as_skipped_and_sweep_continues() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let mut broken = exposure("e-bad", json!({}), 90);
        broken.baseline = "not json".into();
        store.insert_exposure(&broken).await.unwrap();
        store
            .insert_exposure(&exposure("e-good", json!({ "c1": { "mastery": 0.5 } }), 90))
            .await
            .unwrap();

        let sweep = VariantEvaluator::new(store.clone()).evaluate_pending().await.unwrap();
        assert_eq!(sweep.evaluated, 1);
        assert_eq!(sweep.skipped, 1);
        assert!(store.outcome_metrics("e-good").await.unwrap().is_some());
        assert!(store.outcome_metrics("e-bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn evaluated_exposures_are_not_revisited() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        store
            .insert_exposure(&exposure("e1", json!({ "c1": { "mastery": 0.5 } }), 90))
            .await
            .unwrap();

        let evaluator = VariantEvaluator::new(store.clone());
        let first = evaluator.evaluate_pending().await.unwrap();
        assert_eq!(first.evaluated, 1);
        let second = evaluator.evaluate_pending().await.unwrap();
        assert_eq!(second.evaluated, 0);
    }
}
