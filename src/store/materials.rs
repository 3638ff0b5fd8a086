//! Material sets, files, and chunks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use std::collections::HashMap;

use super::{parse_json_column, ContentStore};
use crate::error::Result;

/// A user's uploaded material set. Derived sets reference their source set
/// and share its retrieval namespace.
#[derive(Debug, Clone, FromRow)]
pub struct MaterialSet {
    pub id: String,
    pub user_id: String,
    pub source_set_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MaterialSet {
    /// The set ID whose chunk namespace this set retrieves against.
    pub fn retrieval_set_id(&self) -> &str {
        self.source_set_id.as_deref().unwrap_or(&self.id)
    }
}

/// Signature tokens extracted from a material file at ingest time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSignatures {
    pub topics: Vec<String>,
    pub domains: Vec<String>,
    pub concepts: Vec<String>,
    pub outline: Vec<String>,
}

/// A single uploaded file with its similarity signatures.
#[derive(Debug, Clone)]
pub struct MaterialFile {
    pub id: String,
    pub set_id: String,
    pub name: String,
    pub summary_embedding: Vec<f32>,
    pub signatures: FileSignatures,
    pub difficulty: Option<String>,
}

/// An extracted chunk of material text.
#[derive(Debug, Clone)]
pub struct MaterialChunk {
    pub id: String,
    pub file_id: String,
    pub text: String,
    pub page: Option<i64>,
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Value,
    pub extractable: bool,
}

#[derive(FromRow)]
struct FileRow {
    id: String,
    set_id: String,
    name: String,
    summary_embedding: Option<String>,
    topic_tokens: Option<String>,
    domain_tokens: Option<String>,
    concept_tokens: Option<String>,
    outline_tokens: Option<String>,
    difficulty: Option<String>,
}

impl From<FileRow> for MaterialFile {
    fn from(row: FileRow) -> Self {
        MaterialFile {
            id: row.id,
            set_id: row.set_id,
            name: row.name,
            summary_embedding: parse_json_column(row.summary_embedding.as_deref()),
            signatures: FileSignatures {
                topics: parse_json_column(row.topic_tokens.as_deref()),
                domains: parse_json_column(row.domain_tokens.as_deref()),
                concepts: parse_json_column(row.concept_tokens.as_deref()),
                outline: parse_json_column(row.outline_tokens.as_deref()),
            },
            difficulty: row.difficulty,
        }
    }
}

#[derive(FromRow)]
struct ChunkRow {
    id: String,
    file_id: String,
    text: String,
    page: Option<i64>,
    embedding: Option<String>,
    metadata: Option<String>,
    extractable: bool,
}

impl From<ChunkRow> for MaterialChunk {
    fn from(row: ChunkRow) -> Self {
        MaterialChunk {
            id: row.id,
            file_id: row.file_id,
            text: row.text,
            page: row.page,
            embedding: parse_json_column(row.embedding.as_deref()),
            metadata: row
                .metadata
                .as_deref()
                .and_then(|m| serde_json::from_str(m).ok())
                .unwrap_or(serde_json::Value::Null),
            extractable: row.extractable,
        }
    }
}

impl ContentStore {
    pub async fn material_set(&self, set_id: &str) -> Result<Option<MaterialSet>> {
        let row = sqlx::query_as::<_, MaterialSet>(
            "SELECT id, user_id, source_set_id, created_at FROM material_sets WHERE id = ?",
        )
        .bind(set_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// All files in a set, ordered by name for deterministic iteration.
    pub async fn files_in_set(&self, set_id: &str) -> Result<Vec<MaterialFile>> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT id, set_id, name, summary_embedding, topic_tokens, domain_tokens,
                    concept_tokens, outline_tokens, difficulty
             FROM material_files WHERE set_id = ? ORDER BY name, id",
        )
        .bind(set_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Extractable chunks for the given files, keyed by chunk ID.
    ///
    /// Unextractable chunks are excluded here and therefore from every
    /// retrieval and doc-building path.
    pub async fn chunks_by_files(
        &self,
        file_ids: &[String],
    ) -> Result<HashMap<String, MaterialChunk>> {
        if file_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; file_ids.len()].join(", ");
        let sql = format!(
            "SELECT id, file_id, text, page, embedding, metadata, extractable
             FROM material_chunks
             WHERE extractable = 1 AND file_id IN ({placeholders})
             ORDER BY id",
        );
        let mut query = sqlx::query_as::<_, ChunkRow>(&sql);
        for file_id in file_ids {
            query = query.bind(file_id);
        }
        let rows = query.fetch_all(self.pool()).await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let chunk: MaterialChunk = row.into();
            map.insert(chunk.id.clone(), chunk);
        }
        Ok(map)
    }

    /// Lexical top-K over the full-text index, restricted to the allowed files.
    pub async fn lexical_chunk_ids(
        &self,
        query_text: &str,
        allowed_file_ids: &[String],
        k: usize,
    ) -> Result<Vec<String>> {
        let fts_query = fts_match_query(query_text);
        if fts_query.is_empty() || allowed_file_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; allowed_file_ids.len()].join(", ");
        let sql = format!(
            "SELECT f.chunk_id FROM chunk_fts f
             JOIN material_chunks c ON c.id = f.chunk_id
             WHERE chunk_fts MATCH ? AND c.extractable = 1 AND c.file_id IN ({placeholders})
             ORDER BY rank LIMIT ?",
        );
        let mut query = sqlx::query_as::<_, (String,)>(&sql).bind(&fts_query);
        for file_id in allowed_file_ids {
            query = query.bind(file_id);
        }
        let rows = query.bind(k as i64).fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Insert a chunk and its full-text row. Ingest-side helper used by
    /// pipeline seeding and tests.
    pub async fn insert_chunk(&self, chunk: &MaterialChunk) -> Result<()> {
        sqlx::query(
            "INSERT INTO material_chunks (id, file_id, text, page, embedding, metadata, extractable)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.file_id)
        .bind(&chunk.text)
        .bind(chunk.page)
        .bind(serde_json::to_string(&chunk.embedding)?)
        .bind(chunk.metadata.to_string())
        .bind(chunk.extractable)
        .execute(self.pool())
        .await?;

        if chunk.extractable {
            sqlx::query("INSERT INTO chunk_fts (chunk_id, content) VALUES (?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.text)
                .execute(self.pool())
                .await?;
        }
        Ok(())
    }

    pub async fn insert_material_set(&self, set: &MaterialSet) -> Result<()> {
        sqlx::query(
            "INSERT INTO material_sets (id, user_id, source_set_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&set.id)
        .bind(&set.user_id)
        .bind(&set.source_set_id)
        .bind(set.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn insert_material_file(&self, file: &MaterialFile) -> Result<()> {
        sqlx::query(
            "INSERT INTO material_files
                (id, set_id, name, summary_embedding, topic_tokens, domain_tokens,
                 concept_tokens, outline_tokens, difficulty)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&file.id)
        .bind(&file.set_id)
        .bind(&file.name)
        .bind(serde_json::to_string(&file.summary_embedding)?)
        .bind(serde_json::to_string(&file.signatures.topics)?)
        .bind(serde_json::to_string(&file.signatures.domains)?)
        .bind(serde_json::to_string(&file.signatures.concepts)?)
        .bind(serde_json::to_string(&file.signatures.outline)?)
        .bind(&file.difficulty)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

/// Build an FTS5 MATCH expression from free text: alphanumeric tokens,
/// quoted, OR-joined. Quoting keeps FTS syntax characters in user text from
/// being interpreted as operators.
fn fts_match_query(text: &str) -> String {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() >= 2)
        .take(12)
        .map(|token| format!("\"{}\"", token.to_lowercase()))
        .collect();
    tokens.join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieval_set_id_prefers_source() {
        let set = MaterialSet {
            id: "derived".into(),
            user_id: "u".into(),
            source_set_id: Some("origin".into()),
            created_at: Utc::now(),
        };
        assert_eq!(set.retrieval_set_id(), "origin");

        let set = MaterialSet { source_set_id: None, ..set };
        assert_eq!(set.retrieval_set_id(), "derived");
    }

    #[test]
    fn fts_query_quotes_and_joins_tokens() {
        let query = fts_match_query("Ohm's law: V=IR (basics)");
        assert!(query.contains("\"ohm\""));
        assert!(query.contains(" OR "));
        // Single characters are dropped.
        assert!(!query.contains("\"s\""));
    }

    #[test]
    fn fts_query_empty_for_symbol_soup() {
        assert_eq!(fts_match_query("!!! ??"), "");
    }

    #[tokio::test]
    async fn unextractable_chunks_are_invisible() {
        let store = ContentStore::connect_in_memory().await.expect("store");
        seed_set(&store, "s1", "u1").await;

        let good = chunk("c1", "f1", "voltage divider basics", true);
        let bad = chunk("c2", "f1", "ocr noise", false);
        store.insert_chunk(&good).await.expect("insert");
        store.insert_chunk(&bad).await.expect("insert");

        let map = store.chunks_by_files(&["f1".into()]).await.expect("query");
        assert!(map.contains_key("c1"));
        assert!(!map.contains_key("c2"));

        let hits = store
            .lexical_chunk_ids("ocr noise", &["f1".into()], 10)
            .await
            .expect("lexical");
        assert!(hits.is_empty(), "unextractable chunk leaked into FTS results");
    }

    async fn seed_set(store: &ContentStore, set_id: &str, user_id: &str) {
        store
            .insert_material_set(&MaterialSet {
                id: set_id.into(),
                user_id: user_id.into(),
                source_set_id: None,
                created_at: Utc::now(),
            })
            .await
            .expect("set");
        store
            .insert_material_file(&MaterialFile {
                id: "f1".into(),
                set_id: set_id.into(),
                name: "notes.pdf".into(),
                summary_embedding: vec![0.1, 0.2],
                signatures: FileSignatures::default(),
                difficulty: None,
            })
            .await
            .expect("file");
    }

    fn chunk(id: &str, file_id: &str, text: &str, extractable: bool) -> MaterialChunk {
        MaterialChunk {
            id: id.into(),
            file_id: file_id.into(),
            text: text.into(),
            page: Some(1),
            embedding: vec![0.5, 0.5],
            metadata: serde_json::Value::Null,
            extractable,
        }
    }
}
