//! Concept rows, mapping overrides, and representation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use std::collections::HashMap;

use super::{parse_json_column, ContentStore};
use crate::error::Result;

/// Concept scope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConceptScope {
    Path,
    Global,
}

impl ConceptScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Global => "global",
        }
    }

    /// Parse from a string, defaulting to Path.
    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "global" => Self::Global,
            _ => Self::Path,
        }
    }
}

impl std::fmt::Display for ConceptScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One concept row. `canonical_concept_id = None` means the row IS canonical;
/// `Some(id)` makes it an alias redirecting to `id` (one hop only).
#[derive(Debug, Clone)]
pub struct Concept {
    pub id: String,
    pub scope: ConceptScope,
    pub key: String,
    pub name: String,
    pub summary: Option<String>,
    pub key_points: Vec<String>,
    pub canonical_concept_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Concept {
    /// The canonical ID this row resolves to (self when canonical).
    pub fn resolved_canonical_id(&self) -> &str {
        self.canonical_concept_id.as_deref().unwrap_or(&self.id)
    }

    /// Aliases listed in metadata, lowercased.
    pub fn aliases(&self) -> Vec<String> {
        self.metadata
            .get("aliases")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(FromRow)]
struct ConceptRow {
    id: String,
    scope: String,
    key: String,
    name: String,
    summary: Option<String>,
    key_points: Option<String>,
    canonical_concept_id: Option<String>,
    metadata: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<ConceptRow> for Concept {
    fn from(row: ConceptRow) -> Self {
        Concept {
            id: row.id,
            scope: ConceptScope::from_str_lossy(&row.scope),
            key: row.key,
            name: row.name,
            summary: row.summary,
            key_points: parse_json_column(row.key_points.as_deref()),
            canonical_concept_id: row.canonical_concept_id,
            metadata: row
                .metadata
                .as_deref()
                .and_then(|m| serde_json::from_str(m).ok())
                .unwrap_or(serde_json::Value::Null),
            created_at: row.created_at,
        }
    }
}

/// How a path concept was mapped to its canonical concept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMethod {
    ExactKey,
    Alias,
    Semantic,
    Override,
    CreatedGlobal,
}

impl MappingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExactKey => "exact_key",
            Self::Alias => "alias",
            Self::Semantic => "semantic",
            Self::Override => "override",
            Self::CreatedGlobal => "created_global",
        }
    }
}

impl std::fmt::Display for MappingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved mapping for one path concept, persisted per canonicalizer run.
#[derive(Debug, Clone)]
pub struct ConceptRepresentation {
    pub path_concept_id: String,
    pub canonical_concept_id: String,
    pub aliases: Vec<String>,
    pub method: MappingMethod,
    pub confidence: f64,
}

const CONCEPT_COLUMNS: &str =
    "id, scope, key, name, summary, key_points, canonical_concept_id, metadata, created_at";

impl ContentStore {
    /// Global concept rows for the given normalized keys, keyed by key.
    pub async fn global_concepts_by_keys(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Concept>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
            "SELECT {CONCEPT_COLUMNS} FROM concepts WHERE scope = 'global' AND key IN ({placeholders})",
        );
        let mut query = sqlx::query_as::<_, ConceptRow>(&sql);
        for key in keys {
            query = query.bind(key);
        }
        let rows = query.fetch_all(self.pool()).await?;
        Ok(rows
            .into_iter()
            .map(Concept::from)
            .map(|concept| (concept.key.clone(), concept))
            .collect())
    }

    /// Path-scoped concept rows for the given normalized keys.
    pub async fn path_concepts_by_keys(&self, keys: &[String]) -> Result<Vec<Concept>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
            "SELECT {CONCEPT_COLUMNS} FROM concepts WHERE scope = 'path' AND key IN ({placeholders}) ORDER BY key",
        );
        let mut query = sqlx::query_as::<_, ConceptRow>(&sql);
        for key in keys {
            query = query.bind(key);
        }
        let rows = query.fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn concept_by_id(&self, id: &str) -> Result<Option<Concept>> {
        let sql = format!("SELECT {CONCEPT_COLUMNS} FROM concepts WHERE id = ?");
        let row = sqlx::query_as::<_, ConceptRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(Into::into))
    }

    /// Insert a concept; concurrent duplicates on (scope, key) are silently
    /// ignored so racing canonicalizer runs converge by reloading.
    pub async fn insert_concept_if_absent(&self, concept: &Concept) -> Result<()> {
        sqlx::query(
            "INSERT INTO concepts
                (id, scope, key, name, summary, key_points, canonical_concept_id, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (scope, key) DO NOTHING",
        )
        .bind(&concept.id)
        .bind(concept.scope.as_str())
        .bind(&concept.key)
        .bind(&concept.name)
        .bind(&concept.summary)
        .bind(serde_json::to_string(&concept.key_points)?)
        .bind(&concept.canonical_concept_id)
        .bind(concept.metadata.to_string())
        .bind(concept.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Point a concept row at a canonical target (or clear the pointer).
    pub async fn set_canonical_pointer(
        &self,
        concept_id: &str,
        canonical_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE concepts SET canonical_concept_id = ? WHERE id = ?")
            .bind(canonical_id)
            .bind(concept_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Manual override table: path concept → pinned canonical concept.
    pub async fn mapping_overrides(
        &self,
        path_concept_ids: &[String],
    ) -> Result<HashMap<String, String>> {
        if path_concept_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; path_concept_ids.len()].join(", ");
        let sql = format!(
            "SELECT path_concept_id, canonical_concept_id
             FROM concept_mapping_overrides WHERE path_concept_id IN ({placeholders})",
        );
        let mut query = sqlx::query_as::<_, (String, String)>(&sql);
        for id in path_concept_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(self.pool()).await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn insert_mapping_override(
        &self,
        path_concept_id: &str,
        canonical_concept_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO concept_mapping_overrides (path_concept_id, canonical_concept_id, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT (path_concept_id) DO UPDATE SET
                canonical_concept_id = excluded.canonical_concept_id",
        )
        .bind(path_concept_id)
        .bind(canonical_concept_id)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Upsert a representation record (one per path concept).
    pub async fn save_representation(&self, repr: &ConceptRepresentation) -> Result<()> {
        sqlx::query(
            "INSERT INTO concept_representations
                (path_concept_id, canonical_concept_id, aliases, method, confidence, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (path_concept_id) DO UPDATE SET
                canonical_concept_id = excluded.canonical_concept_id,
                aliases = excluded.aliases,
                method = excluded.method,
                confidence = excluded.confidence,
                updated_at = excluded.updated_at",
        )
        .bind(&repr.path_concept_id)
        .bind(&repr.canonical_concept_id)
        .bind(serde_json::to_string(&repr.aliases)?)
        .bind(repr.method.as_str())
        .bind(repr.confidence)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn representation(
        &self,
        path_concept_id: &str,
    ) -> Result<Option<(String, String, f64)>> {
        let row = sqlx::query_as::<_, (String, String, f64)>(
            "SELECT canonical_concept_id, method, confidence
             FROM concept_representations WHERE path_concept_id = ?",
        )
        .bind(path_concept_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Resolved canonical IDs for a set of path-concept keys, via the
    /// representation table. Used by the probe selector.
    pub async fn canonical_ids_for_keys(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, String>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
            "SELECT c.key, r.canonical_concept_id
             FROM concepts c
             JOIN concept_representations r ON r.path_concept_id = c.id
             WHERE c.scope = 'path' AND c.key IN ({placeholders})",
        );
        let mut query = sqlx::query_as::<_, (String, String)>(&sql);
        for key in keys {
            query = query.bind(key);
        }
        let rows = query.fetch_all(self.pool()).await?;
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concept(id: &str, scope: ConceptScope, key: &str) -> Concept {
        Concept {
            id: id.into(),
            scope,
            key: key.into(),
            name: key.into(),
            summary: None,
            key_points: Vec::new(),
            canonical_concept_id: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn resolved_canonical_follows_one_hop() {
        let mut c = concept("a", ConceptScope::Global, "ohms-law");
        assert_eq!(c.resolved_canonical_id(), "a");
        c.canonical_concept_id = Some("b".into());
        assert_eq!(c.resolved_canonical_id(), "b");
    }

    #[test]
    fn aliases_are_normalized() {
        let mut c = concept("a", ConceptScope::Path, "ohms-law");
        c.metadata = serde_json::json!({ "aliases": [" Ohm's Law ", "", "V=IR"] });
        assert_eq!(c.aliases(), vec!["ohm's law".to_owned(), "v=ir".to_owned()]);
    }

    #[tokio::test]
    async fn conflicting_insert_is_ignored() {
        let store = ContentStore::connect_in_memory().await.expect("store");
        let first = concept("id-1", ConceptScope::Global, "voltage");
        let second = concept("id-2", ConceptScope::Global, "voltage");

        store.insert_concept_if_absent(&first).await.expect("first");
        store.insert_concept_if_absent(&second).await.expect("second");

        let loaded = store
            .global_concepts_by_keys(&["voltage".into()])
            .await
            .expect("load");
        // The first writer wins; the second insert is a no-op.
        assert_eq!(loaded["voltage"].id, "id-1");
    }
}
