//! Per-user adaptive state: concept mastery, misconceptions, testlets,
//! node runs, active nodes, and progression events.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use std::collections::{HashMap, HashSet};

use super::ContentStore;
use crate::error::Result;

/// Mastery state for one (user, concept) pair. Updated by external
/// assessment consumers; read-only inside this crate.
#[derive(Debug, Clone, FromRow)]
pub struct UserConceptState {
    pub user_id: String,
    pub concept_id: String,
    pub mastery: f64,
    pub confidence: f64,
    pub epistemic_uncertainty: f64,
    pub aleatoric_uncertainty: f64,
    pub attempts: i64,
    pub correct: i64,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub next_review_at: Option<DateTime<Utc>>,
}

impl UserConceptState {
    /// The larger of the two uncertainty components.
    pub fn uncertainty(&self) -> f64 {
        self.epistemic_uncertainty.max(self.aleatoric_uncertainty)
    }
}

/// Beta-distribution state for a testlet.
#[derive(Debug, Clone, FromRow)]
pub struct UserTestletState {
    pub user_id: String,
    pub testlet_id: String,
    pub alpha: f64,
    pub beta: f64,
}

/// Run telemetry for one (user, node) pair.
#[derive(Debug, Clone, FromRow)]
pub struct NodeRun {
    pub user_id: String,
    pub node_id: String,
    pub state: String,
    pub completed: bool,
    pub attempt_count: i64,
    pub last_score: Option<f64>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One user progression event (lesson completion, quiz attempt, ...).
#[derive(Debug, Clone, FromRow)]
pub struct ProgressionEvent {
    pub id: String,
    pub user_id: String,
    pub path_id: Option<String>,
    pub node_id: Option<String>,
    pub event_type: String,
    pub score: Option<f64>,
    pub attempts: Option<i64>,
    pub dwell_seconds: Option<f64>,
    pub completed: bool,
    pub occurred_at: DateTime<Utc>,
}

const STATE_COLUMNS: &str = "user_id, concept_id, mastery, confidence, epistemic_uncertainty, \
                             aleatoric_uncertainty, attempts, correct, last_seen_at, next_review_at";

impl ContentStore {
    /// Concept states for one user over a set of concept IDs, keyed by ID.
    pub async fn concept_states(
        &self,
        user_id: &str,
        concept_ids: &[String],
    ) -> Result<HashMap<String, UserConceptState>> {
        if concept_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; concept_ids.len()].join(", ");
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM user_concept_states
             WHERE user_id = ? AND concept_id IN ({placeholders})",
        );
        let mut query = sqlx::query_as::<_, UserConceptState>(&sql).bind(user_id);
        for id in concept_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(|s| (s.concept_id.clone(), s)).collect())
    }

    /// Concept IDs with at least one active misconception for this user.
    pub async fn active_misconception_concepts(
        &self,
        user_id: &str,
        concept_ids: &[String],
    ) -> Result<HashSet<String>> {
        if concept_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; concept_ids.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT concept_id FROM user_misconceptions
             WHERE user_id = ? AND active = 1 AND concept_id IN ({placeholders})",
        );
        let mut query = sqlx::query_as::<_, (String,)>(&sql).bind(user_id);
        for id in concept_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn testlet_state(
        &self,
        user_id: &str,
        testlet_id: &str,
    ) -> Result<Option<UserTestletState>> {
        let row = sqlx::query_as::<_, UserTestletState>(
            "SELECT user_id, testlet_id, alpha, beta FROM user_testlet_states
             WHERE user_id = ? AND testlet_id = ?",
        )
        .bind(user_id)
        .bind(testlet_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn node_run(&self, user_id: &str, node_id: &str) -> Result<Option<NodeRun>> {
        let row = sqlx::query_as::<_, NodeRun>(
            "SELECT user_id, node_id, state, completed, attempt_count, last_score,
                    last_seen_at, started_at, completed_at
             FROM node_runs WHERE user_id = ? AND node_id = ?",
        )
        .bind(user_id)
        .bind(node_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// The user's active node on a path, if any.
    pub async fn active_node(&self, user_id: &str, path_id: &str) -> Result<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT node_id FROM user_active_nodes WHERE user_id = ? AND path_id = ?",
        )
        .bind(user_id)
        .bind(path_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Recent progression events for a user, newest last, bounded.
    ///
    /// Ordered by (occurred_at, id) so ties are deterministic.
    pub async fn progression_events(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ProgressionEvent>> {
        let rows = sqlx::query_as::<_, ProgressionEvent>(
            "SELECT id, user_id, path_id, node_id, event_type, score, attempts,
                    dwell_seconds, completed, occurred_at
             FROM progression_events WHERE user_id = ?
             ORDER BY occurred_at DESC, id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        let mut events = rows;
        events.reverse();
        Ok(events)
    }

    // Seed helpers used by stage tests and pipeline fixtures.

    pub async fn upsert_concept_state(&self, state: &UserConceptState) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_concept_states
                (user_id, concept_id, mastery, confidence, epistemic_uncertainty,
                 aleatoric_uncertainty, attempts, correct, last_seen_at, next_review_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, concept_id) DO UPDATE SET
                mastery = excluded.mastery,
                confidence = excluded.confidence,
                epistemic_uncertainty = excluded.epistemic_uncertainty,
                aleatoric_uncertainty = excluded.aleatoric_uncertainty,
                attempts = excluded.attempts,
                correct = excluded.correct,
                last_seen_at = excluded.last_seen_at,
                next_review_at = excluded.next_review_at",
        )
        .bind(&state.user_id)
        .bind(&state.concept_id)
        .bind(state.mastery)
        .bind(state.confidence)
        .bind(state.epistemic_uncertainty)
        .bind(state.aleatoric_uncertainty)
        .bind(state.attempts)
        .bind(state.correct)
        .bind(state.last_seen_at)
        .bind(state.next_review_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn insert_progression_event(&self, event: &ProgressionEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO progression_events
                (id, user_id, path_id, node_id, event_type, score, attempts,
                 dwell_seconds, completed, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(&event.user_id)
        .bind(&event.path_id)
        .bind(&event.node_id)
        .bind(&event.event_type)
        .bind(event.score)
        .bind(event.attempts)
        .bind(event.dwell_seconds)
        .bind(event.completed)
        .bind(event.occurred_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn upsert_node_run(&self, run: &NodeRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_runs
                (user_id, node_id, state, completed, attempt_count, last_score,
                 last_seen_at, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, node_id) DO UPDATE SET
                state = excluded.state,
                completed = excluded.completed,
                attempt_count = excluded.attempt_count,
                last_score = excluded.last_score,
                last_seen_at = excluded.last_seen_at,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at",
        )
        .bind(&run.user_id)
        .bind(&run.node_id)
        .bind(&run.state)
        .bind(run.completed)
        .bind(run.attempt_count)
        .bind(run.last_score)
        .bind(run.last_seen_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn insert_misconception(
        &self,
        user_id: &str,
        concept_id: &str,
        description: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_misconceptions (id, user_id, concept_id, description, active, created_at)
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(concept_id)
        .bind(description)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_active_node(
        &self,
        user_id: &str,
        path_id: &str,
        node_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_active_nodes (user_id, path_id, node_id, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (user_id, path_id) DO UPDATE SET
                node_id = excluded.node_id,
                updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(path_id)
        .bind(node_id)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(user_id: &str, concept_id: &str, mastery: f64) -> UserConceptState {
        UserConceptState {
            user_id: user_id.into(),
            concept_id: concept_id.into(),
            mastery,
            confidence: 0.5,
            epistemic_uncertainty: 0.2,
            aleatoric_uncertainty: 0.4,
            attempts: 3,
            correct: 2,
            last_seen_at: None,
            next_review_at: None,
        }
    }

    #[test]
    fn uncertainty_takes_the_max_component() {
        let s = state("u", "c", 0.5);
        assert_eq!(s.uncertainty(), 0.4);
    }

    #[tokio::test]
    async fn progression_events_are_tie_ordered() {
        let store = ContentStore::connect_in_memory().await.expect("store");
        let at = Utc::now();
        for id in ["b", "a", "c"] {
            store
                .insert_progression_event(&ProgressionEvent {
                    id: id.into(),
                    user_id: "u1".into(),
                    path_id: None,
                    node_id: None,
                    event_type: "lesson_completed".into(),
                    score: Some(0.8),
                    attempts: Some(1),
                    dwell_seconds: Some(120.0),
                    completed: true,
                    occurred_at: at,
                })
                .await
                .expect("insert");
        }
        let events = store.progression_events("u1", 10).await.expect("events");
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        // Same timestamp: ordering falls back to id.
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
