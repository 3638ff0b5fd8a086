//! Learning paths and path nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::ContentStore;
use crate::error::Result;

/// Node kind within a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Module,
    Lesson,
    Capstone,
    Review,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Module => "module",
            Self::Lesson => "lesson",
            Self::Capstone => "capstone",
            Self::Review => "review",
        }
    }

    /// Parse from a string, defaulting to Lesson.
    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "module" => Self::Module,
            "capstone" => Self::Capstone,
            "review" => Self::Review,
            _ => Self::Lesson,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A learning path over one material set.
#[derive(Debug, Clone)]
pub struct LearningPath {
    pub id: String,
    pub set_id: String,
    pub user_id: String,
    pub title: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One node (module or lesson) in a path. `position` is the monotonic index
/// within the path; lessons reference their module through `parent_id`.
#[derive(Debug, Clone)]
pub struct PathNode {
    pub id: String,
    pub path_id: String,
    pub position: i64,
    pub parent_id: Option<String>,
    pub kind: NodeKind,
    pub title: String,
    pub metadata: serde_json::Value,
}

impl PathNode {
    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    fn meta_string_list(&self, key: &str) -> Vec<String> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn goal(&self) -> Option<&str> {
        self.meta_str("goal")
    }

    pub fn concept_keys(&self) -> Vec<String> {
        self.meta_string_list("concept_keys")
    }

    pub fn prereq_keys(&self) -> Vec<String> {
        self.meta_string_list("prereq_keys")
    }

    pub fn module_index(&self) -> Option<i64> {
        self.metadata.get("module_index").and_then(|v| v.as_i64())
    }

    pub fn lesson_index(&self) -> Option<i64> {
        self.metadata.get("lesson_index").and_then(|v| v.as_i64())
    }

    pub fn doc_template(&self) -> Option<&str> {
        self.meta_str("doc_template")
    }
}

#[derive(FromRow)]
struct NodeRow {
    id: String,
    path_id: String,
    position: i64,
    parent_id: Option<String>,
    kind: String,
    title: String,
    metadata: Option<String>,
}

impl From<NodeRow> for PathNode {
    fn from(row: NodeRow) -> Self {
        PathNode {
            id: row.id,
            path_id: row.path_id,
            position: row.position,
            parent_id: row.parent_id,
            kind: NodeKind::from_str_lossy(&row.kind),
            title: row.title,
            metadata: row
                .metadata
                .as_deref()
                .and_then(|m| serde_json::from_str(m).ok())
                .unwrap_or_else(|| serde_json::json!({})),
        }
    }
}

impl ContentStore {
    pub async fn path(&self, path_id: &str) -> Result<Option<LearningPath>> {
        let row = sqlx::query_as::<_, (String, String, String, String, Option<String>, DateTime<Utc>)>(
            "SELECT id, set_id, user_id, title, metadata, created_at FROM paths WHERE id = ?",
        )
        .bind(path_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(id, set_id, user_id, title, metadata, created_at)| LearningPath {
            id,
            set_id,
            user_id,
            title,
            metadata: metadata
                .as_deref()
                .and_then(|m| serde_json::from_str(m).ok())
                .unwrap_or_else(|| serde_json::json!({})),
            created_at,
        }))
    }

    pub async fn insert_path(&self, path: &LearningPath) -> Result<()> {
        sqlx::query(
            "INSERT INTO paths (id, set_id, user_id, title, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&path.id)
        .bind(&path.set_id)
        .bind(&path.user_id)
        .bind(&path.title)
        .bind(path.metadata.to_string())
        .bind(path.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// All nodes of a path in position order.
    pub async fn nodes_in_path(&self, path_id: &str) -> Result<Vec<PathNode>> {
        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT id, path_id, position, parent_id, kind, title, metadata
             FROM path_nodes WHERE path_id = ? ORDER BY position",
        )
        .bind(path_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn node(&self, node_id: &str) -> Result<Option<PathNode>> {
        let row = sqlx::query_as::<_, NodeRow>(
            "SELECT id, path_id, position, parent_id, kind, title, metadata
             FROM path_nodes WHERE id = ?",
        )
        .bind(node_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn insert_node(&self, node: &PathNode) -> Result<()> {
        sqlx::query(
            "INSERT INTO path_nodes (id, path_id, position, parent_id, kind, title, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&node.id)
        .bind(&node.path_id)
        .bind(node.position)
        .bind(&node.parent_id)
        .bind(node.kind.as_str())
        .bind(&node.title)
        .bind(node.metadata.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Merge keys into a node's metadata JSON inside the given transaction.
    pub async fn merge_node_metadata_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        node_id: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let existing: Option<(Option<String>,)> =
            sqlx::query_as("SELECT metadata FROM path_nodes WHERE id = ?")
                .bind(node_id)
                .fetch_optional(&mut **tx)
                .await?;
        let mut metadata: serde_json::Value = existing
            .and_then(|(m,)| m)
            .as_deref()
            .and_then(|m| serde_json::from_str(m).ok())
            .unwrap_or_else(|| serde_json::json!({}));
        if let (Some(target), Some(source)) = (metadata.as_object_mut(), patch.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        sqlx::query("UPDATE path_nodes SET metadata = ? WHERE id = ?")
            .bind(metadata.to_string())
            .bind(node_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Merge keys into a path's metadata JSON inside the given transaction.
    pub async fn merge_path_metadata_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        path_id: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let existing: Option<(Option<String>,)> =
            sqlx::query_as("SELECT metadata FROM paths WHERE id = ?")
                .bind(path_id)
                .fetch_optional(&mut **tx)
                .await?;
        let mut metadata: serde_json::Value = existing
            .and_then(|(m,)| m)
            .as_deref()
            .and_then(|m| serde_json::from_str(m).ok())
            .unwrap_or_else(|| serde_json::json!({}));
        if let (Some(target), Some(source)) = (metadata.as_object_mut(), patch.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        sqlx::query("UPDATE paths SET metadata = ? WHERE id = ?")
            .bind(metadata.to_string())
            .bind(path_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, path_id: &str, position: i64, kind: NodeKind) -> PathNode {
        PathNode {
            id: id.into(),
            path_id: path_id.into(),
            position,
            parent_id: None,
            kind,
            title: format!("Node {id}"),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn metadata_accessors_tolerate_missing_keys() {
        let n = node("n1", "p1", 0, NodeKind::Lesson);
        assert!(n.goal().is_none());
        assert!(n.concept_keys().is_empty());
        assert!(n.module_index().is_none());
    }

    #[test]
    fn metadata_accessors_read_values() {
        let mut n = node("n1", "p1", 0, NodeKind::Lesson);
        n.metadata = serde_json::json!({
            "goal": "understand resistors",
            "concept_keys": ["resistance", "ohms-law"],
            "module_index": 2,
        });
        assert_eq!(n.goal(), Some("understand resistors"));
        assert_eq!(n.concept_keys().len(), 2);
        assert_eq!(n.module_index(), Some(2));
    }

    #[tokio::test]
    async fn metadata_merge_preserves_existing_keys() {
        let store = ContentStore::connect_in_memory().await.expect("store");
        let path = LearningPath {
            id: "p1".into(),
            set_id: "s1".into(),
            user_id: "u1".into(),
            title: "Circuits".into(),
            metadata: serde_json::json!({ "origin": "intake" }),
            created_at: Utc::now(),
        };
        store.insert_path(&path).await.expect("path");

        let mut tx = store.begin().await.expect("tx");
        ContentStore::merge_path_metadata_tx(
            &mut tx,
            "p1",
            &serde_json::json!({ "runtime_plan": { "target_session_minutes": 25 } }),
        )
        .await
        .expect("merge");
        tx.commit().await.expect("commit");

        let loaded = store.path("p1").await.expect("load").expect("exists");
        assert_eq!(loaded.metadata["origin"], "intake");
        assert_eq!(loaded.metadata["runtime_plan"]["target_session_minutes"], 25);
    }
}
