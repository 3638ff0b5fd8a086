//! Intake rows: proposed path structure awaiting refinement.

use chrono::{DateTime, Utc};

use super::ContentStore;
use crate::error::Result;

/// One intake: a material set with its proposed learning paths held in
/// metadata until grouping refinement confirms them.
#[derive(Debug, Clone)]
pub struct Intake {
    pub id: String,
    pub set_id: String,
    pub primary_path_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ContentStore {
    pub async fn intake(&self, intake_id: &str) -> Result<Option<Intake>> {
        let row: Option<(String, String, Option<String>, Option<String>, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT id, set_id, primary_path_id, metadata, created_at FROM intakes WHERE id = ?",
            )
            .bind(intake_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|(id, set_id, primary_path_id, metadata, created_at)| Intake {
            id,
            set_id,
            primary_path_id,
            metadata: metadata
                .as_deref()
                .and_then(|m| serde_json::from_str(m).ok())
                .unwrap_or_else(|| serde_json::json!({})),
            created_at,
        }))
    }

    pub async fn insert_intake(&self, intake: &Intake) -> Result<()> {
        sqlx::query(
            "INSERT INTO intakes (id, set_id, primary_path_id, metadata, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&intake.id)
        .bind(&intake.set_id)
        .bind(&intake.primary_path_id)
        .bind(intake.metadata.to_string())
        .bind(intake.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Replace intake metadata and primary path pointer atomically.
    pub async fn update_intake(
        &self,
        intake_id: &str,
        metadata: &serde_json::Value,
        primary_path_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE intakes SET metadata = ?, primary_path_id = ? WHERE id = ?")
            .bind(metadata.to_string())
            .bind(primary_path_id)
            .bind(intake_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
