//! Node docs, per-user variants, media rows, and generation runs.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::ContentStore;
use crate::error::Result;

/// Persisted lesson document for a node. `doc` is canonical JSON; the
/// content hash is the hash of exactly those bytes.
#[derive(Debug, Clone, FromRow)]
pub struct NodeDocRow {
    pub node_id: String,
    pub doc: String,
    pub content_hash: String,
    pub sources_hash: String,
    pub updated_at: DateTime<Utc>,
}

/// Per-user variant of a node doc.
#[derive(Debug, Clone, FromRow)]
pub struct NodeDocVariantRow {
    pub id: String,
    pub node_id: String,
    pub user_id: String,
    pub doc: String,
    pub content_hash: String,
    pub sources_hash: String,
    pub updated_at: DateTime<Utc>,
}

/// A stored media asset attached to a node.
#[derive(Debug, Clone, FromRow)]
pub struct NodeMediaRow {
    pub id: String,
    pub node_id: String,
    pub storage_key: String,
    pub file_name: Option<String>,
    pub url: String,
}

/// Outcome of one doc-generation attempt.
#[derive(Debug, Clone)]
pub struct GenerationRun {
    pub id: String,
    pub node_id: String,
    pub user_id: Option<String>,
    pub attempt: i64,
    pub status: String,
    pub errors: Vec<String>,
    pub metrics: serde_json::Value,
}

impl ContentStore {
    pub async fn node_doc(&self, node_id: &str) -> Result<Option<NodeDocRow>> {
        let row = sqlx::query_as::<_, NodeDocRow>(
            "SELECT node_id, doc, content_hash, sources_hash, updated_at
             FROM node_docs WHERE node_id = ?",
        )
        .bind(node_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn node_doc_variant(
        &self,
        node_id: &str,
        user_id: &str,
    ) -> Result<Option<NodeDocVariantRow>> {
        let row = sqlx::query_as::<_, NodeDocVariantRow>(
            "SELECT id, node_id, user_id, doc, content_hash, sources_hash, updated_at
             FROM node_doc_variants WHERE node_id = ? AND user_id = ?",
        )
        .bind(node_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Upsert the node doc inside an open transaction.
    pub async fn save_node_doc_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        node_id: &str,
        doc: &str,
        content_hash: &str,
        sources_hash: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_docs (node_id, doc, content_hash, sources_hash, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (node_id) DO UPDATE SET
                doc = excluded.doc,
                content_hash = excluded.content_hash,
                sources_hash = excluded.sources_hash,
                updated_at = excluded.updated_at",
        )
        .bind(node_id)
        .bind(doc)
        .bind(content_hash)
        .bind(sources_hash)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Upsert a per-user variant inside an open transaction.
    pub async fn save_node_doc_variant_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        node_id: &str,
        user_id: &str,
        doc: &str,
        content_hash: &str,
        sources_hash: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_doc_variants
                (id, node_id, user_id, doc, content_hash, sources_hash, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (node_id, user_id) DO UPDATE SET
                doc = excluded.doc,
                content_hash = excluded.content_hash,
                sources_hash = excluded.sources_hash,
                updated_at = excluded.updated_at",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(node_id)
        .bind(user_id)
        .bind(doc)
        .bind(content_hash)
        .bind(sources_hash)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Bump the per-user built-docs counter inside an open transaction.
    pub async fn bump_library_counter_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_library_counters (user_id, docs_built, updated_at)
             VALUES (?, 1, ?)
             ON CONFLICT (user_id) DO UPDATE SET
                docs_built = docs_built + 1,
                updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Record one generation attempt. Outside any transaction: attempt
    /// records must survive a rolled-back doc write.
    pub async fn record_generation_run(&self, run: &GenerationRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO generation_runs (id, node_id, user_id, attempt, status, errors, metrics, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.node_id)
        .bind(&run.user_id)
        .bind(run.attempt)
        .bind(&run.status)
        .bind(serde_json::to_string(&run.errors)?)
        .bind(run.metrics.to_string())
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn generation_runs_for_node(&self, node_id: &str) -> Result<Vec<(i64, String)>> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            "SELECT attempt, status FROM generation_runs WHERE node_id = ? ORDER BY created_at, attempt",
        )
        .bind(node_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Media assets for a node, ordered by creation.
    pub async fn node_figures(&self, node_id: &str) -> Result<Vec<NodeMediaRow>> {
        let rows = sqlx::query_as::<_, NodeMediaRow>(
            "SELECT id, node_id, storage_key, file_name, url FROM node_figures
             WHERE node_id = ? ORDER BY created_at, id",
        )
        .bind(node_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn node_videos(&self, node_id: &str) -> Result<Vec<NodeMediaRow>> {
        let rows = sqlx::query_as::<_, NodeMediaRow>(
            "SELECT id, node_id, storage_key, file_name, url FROM node_videos
             WHERE node_id = ? ORDER BY created_at, id",
        )
        .bind(node_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn insert_node_figure_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        media: &NodeMediaRow,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_figures (id, node_id, storage_key, file_name, url, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&media.id)
        .bind(&media.node_id)
        .bind(&media.storage_key)
        .bind(&media.file_name)
        .bind(&media.url)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn insert_node_video_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        media: &NodeMediaRow,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_videos (id, node_id, storage_key, file_name, url, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&media.id)
        .bind(&media.node_id)
        .bind(&media.storage_key)
        .bind(&media.file_name)
        .bind(&media.url)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
