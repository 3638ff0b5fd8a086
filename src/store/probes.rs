//! DocProbe persistence.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use std::collections::HashSet;

use super::ContentStore;
use crate::error::Result;

/// Probe lifecycle status. Advanced by the external runtime after planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Planned,
    Shown,
    Dismissed,
    Answered,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Shown => "shown",
            Self::Dismissed => "dismissed",
            Self::Answered => "answered",
        }
    }
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A selected probe: an embedded quick-check or flashcard chosen for
/// adaptive surfacing.
#[derive(Debug, Clone)]
pub struct DocProbe {
    pub id: String,
    pub user_id: String,
    pub node_id: String,
    pub block_id: String,
    pub block_type: String,
    pub concept_keys: Vec<String>,
    pub concept_ids: Vec<String>,
    pub info_gain: f64,
    pub score: f64,
    pub policy_version: String,
    pub status: ProbeStatus,
}

impl ContentStore {
    /// (node_id, block_id) pairs that already have a probe row for this user.
    pub async fn existing_probe_keys(
        &self,
        user_id: &str,
        node_ids: &[String],
    ) -> Result<HashSet<(String, String)>> {
        if node_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; node_ids.len()].join(", ");
        let sql = format!(
            "SELECT node_id, block_id FROM doc_probes
             WHERE user_id = ? AND node_id IN ({placeholders})",
        );
        let mut query = sqlx::query_as::<_, (String, String)>(&sql).bind(user_id);
        for id in node_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(self.pool()).await?;
        Ok(rows.into_iter().collect())
    }

    /// Probes created for this user within the trailing hour.
    pub async fn probes_created_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM doc_probes WHERE user_id = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0)
    }

    /// Convenience wrapper for the hourly rate-limit window.
    pub async fn probes_in_last_hour(&self, user_id: &str) -> Result<i64> {
        self.probes_created_since(user_id, Utc::now() - Duration::hours(1)).await
    }

    /// Planned or shown probes per node for this user. Cap enforcement input.
    pub async fn open_probe_count(&self, user_id: &str, node_id: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM doc_probes
             WHERE user_id = ? AND node_id = ? AND status IN ('planned', 'shown')",
        )
        .bind(user_id)
        .bind(node_id)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0)
    }

    /// Insert a probe inside an open transaction. Duplicate (user, node,
    /// block) rows are ignored, keeping re-runs idempotent.
    pub async fn insert_probe_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        probe: &DocProbe,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO doc_probes
                (id, user_id, node_id, block_id, block_type, concept_keys, concept_ids,
                 info_gain, score, policy_version, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, node_id, block_id) DO NOTHING",
        )
        .bind(&probe.id)
        .bind(&probe.user_id)
        .bind(&probe.node_id)
        .bind(&probe.block_id)
        .bind(&probe.block_type)
        .bind(serde_json::to_string(&probe.concept_keys)?)
        .bind(serde_json::to_string(&probe.concept_ids)?)
        .bind(probe.info_gain)
        .bind(probe.score)
        .bind(&probe.policy_version)
        .bind(probe.status.as_str())
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(user_id: &str, node_id: &str, block_id: &str) -> DocProbe {
        DocProbe {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            node_id: node_id.into(),
            block_id: block_id.into(),
            block_type: "quick_check".into(),
            concept_keys: vec!["resistance".into()],
            concept_ids: vec!["c1".into()],
            info_gain: 0.4,
            score: 0.6,
            policy_version: "v1".into(),
            status: ProbeStatus::Planned,
        }
    }

    #[tokio::test]
    async fn duplicate_probe_insert_is_ignored() {
        let store = ContentStore::connect_in_memory().await.expect("store");

        for _ in 0..2 {
            let mut tx = store.begin().await.expect("tx");
            ContentStore::insert_probe_tx(&mut tx, &probe("u1", "n1", "b1"))
                .await
                .expect("insert");
            tx.commit().await.expect("commit");
        }

        let count = store.probes_in_last_hour("u1").await.expect("count");
        assert_eq!(count, 1);

        let keys = store
            .existing_probe_keys("u1", &["n1".into()])
            .await
            .expect("keys");
        assert!(keys.contains(&("n1".into(), "b1".into())));
    }
}
