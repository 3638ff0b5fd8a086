//! Variant exposure and outcome rows.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::ContentStore;
use crate::error::Result;

/// A record that a specific variant doc was shown to a user, with the
/// concept-state snapshot taken at exposure time.
#[derive(Debug, Clone, FromRow)]
pub struct DocVariantExposure {
    pub id: String,
    pub user_id: String,
    pub node_id: String,
    pub variant_id: Option<String>,
    pub baseline: String,
    pub content_hash: String,
    pub evaluated: bool,
    pub created_at: DateTime<Utc>,
}

impl ContentStore {
    /// Unevaluated exposures created before the cutoff, oldest first.
    pub async fn pending_exposures(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DocVariantExposure>> {
        let rows = sqlx::query_as::<_, DocVariantExposure>(
            "SELECT id, user_id, node_id, variant_id, baseline, content_hash, evaluated, created_at
             FROM doc_variant_exposures
             WHERE evaluated = 0 AND created_at <= ?
             ORDER BY created_at, id LIMIT ?",
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn insert_exposure(&self, exposure: &DocVariantExposure) -> Result<()> {
        sqlx::query(
            "INSERT INTO doc_variant_exposures
                (id, user_id, node_id, variant_id, baseline, content_hash, evaluated, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&exposure.id)
        .bind(&exposure.user_id)
        .bind(&exposure.node_id)
        .bind(&exposure.variant_id)
        .bind(&exposure.baseline)
        .bind(&exposure.content_hash)
        .bind(exposure.evaluated)
        .bind(exposure.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Persist the outcome and flip the exposure's evaluated flag in one
    /// transaction so an exposure is never evaluated twice.
    pub async fn save_outcome(
        &self,
        exposure_id: &str,
        metrics: &serde_json::Value,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query(
            "INSERT INTO doc_variant_outcomes (id, exposure_id, metrics, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (exposure_id) DO NOTHING",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(exposure_id)
        .bind(metrics.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE doc_variant_exposures SET evaluated = 1 WHERE id = ?")
            .bind(exposure_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn outcome_metrics(&self, exposure_id: &str) -> Result<Option<serde_json::Value>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT metrics FROM doc_variant_outcomes WHERE exposure_id = ?",
        )
        .bind(exposure_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.and_then(|(raw,)| serde_json::from_str(&raw).ok()))
    }
}
