//! Read-only signal views over material sets: per-file coverage, compound
//! weights, and cross-set relevance.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::doc::model::NodeDoc;
use crate::error::Result;
use crate::grouping::similarity::jaccard;
use crate::store::ContentStore;
use crate::vector::cosine;

/// How much of one file's material a path's docs actually cite.
#[derive(Debug, Clone, PartialEq)]
pub struct FileCoverage {
    pub file_id: String,
    pub name: String,
    pub total_chunks: usize,
    pub extractable_chunks: usize,
    pub cited_chunks: usize,
    /// cited / extractable, 0 when the file has no extractable chunks.
    pub coverage: f64,
}

/// Read-only signal queries. Nothing here writes.
pub struct SignalStore {
    store: Arc<ContentStore>,
}

impl SignalStore {
    pub fn new(store: Arc<ContentStore>) -> Self {
        Self { store }
    }

    /// Per-file chunk coverage of a set by one path's rendered docs.
    pub async fn coverage(&self, set_id: &str, path_id: &str) -> Result<Vec<FileCoverage>> {
        let files = self.store.files_in_set(set_id).await?;

        // Chunk counts per file, including unextractable rows.
        let counts: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT file_id, COUNT(*), SUM(extractable)
             FROM material_chunks
             WHERE file_id IN (SELECT id FROM material_files WHERE set_id = ?)
             GROUP BY file_id",
        )
        .bind(set_id)
        .fetch_all(self.store.pool())
        .await?;
        let counts: HashMap<String, (i64, i64)> = counts
            .into_iter()
            .map(|(file_id, total, extractable)| (file_id, (total, extractable)))
            .collect();

        // Every chunk ID cited anywhere in the path's docs.
        let mut cited: HashSet<String> = HashSet::new();
        for node in self.store.nodes_in_path(path_id).await? {
            if let Some(row) = self.store.node_doc(&node.id).await? {
                if let Ok(doc) = serde_json::from_str::<NodeDoc>(&row.doc) {
                    cited.extend(doc.all_cited_chunk_ids());
                }
            }
        }

        // Map cited chunks back to their files.
        let mut cited_per_file: HashMap<String, usize> = HashMap::new();
        if !cited.is_empty() {
            let ids: Vec<String> = cited.iter().cloned().collect();
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql = format!(
                "SELECT id, file_id FROM material_chunks WHERE id IN ({placeholders})",
            );
            let mut query = sqlx::query_as::<_, (String, String)>(&sql);
            for id in &ids {
                query = query.bind(id);
            }
            for (_, file_id) in query.fetch_all(self.store.pool()).await? {
                *cited_per_file.entry(file_id).or_insert(0) += 1;
            }
        }

        Ok(files
            .into_iter()
            .map(|file| {
                let (total, extractable) = counts.get(&file.id).copied().unwrap_or((0, 0));
                let cited_chunks = cited_per_file.get(&file.id).copied().unwrap_or(0);
                let coverage = if extractable > 0 {
                    cited_chunks as f64 / extractable as f64
                } else {
                    0.0
                };
                FileCoverage {
                    file_id: file.id,
                    name: file.name,
                    total_chunks: total as usize,
                    extractable_chunks: extractable as usize,
                    cited_chunks,
                    coverage,
                }
            })
            .collect())
    }

    /// Per-file compound weight: each file's share of the set's extractable
    /// chunks, normalized to sum 1. An empty set yields an empty map.
    pub async fn compound_weights(&self, set_id: &str) -> Result<HashMap<String, f64>> {
        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT file_id, COUNT(*)
             FROM material_chunks
             WHERE extractable = 1
               AND file_id IN (SELECT id FROM material_files WHERE set_id = ?)
             GROUP BY file_id",
        )
        .bind(set_id)
        .fetch_all(self.store.pool())
        .await?;

        let total: i64 = counts.iter().map(|(_, count)| count).sum();
        if total == 0 {
            return Ok(HashMap::new());
        }
        Ok(counts
            .into_iter()
            .map(|(file_id, count)| (file_id, count as f64 / total as f64))
            .collect())
    }

    /// Relevance of one set to another: blended mean-embedding cosine and
    /// concept-token overlap, in [0, 1].
    pub async fn cross_set_relevance(&self, set_id: &str, other_set_id: &str) -> Result<f64> {
        let files_a = self.store.files_in_set(set_id).await?;
        let files_b = self.store.files_in_set(other_set_id).await?;
        if files_a.is_empty() || files_b.is_empty() {
            return Ok(0.0);
        }

        let mean_embedding = |files: &[crate::store::materials::MaterialFile]| -> Vec<f32> {
            let dims = files
                .iter()
                .map(|f| f.summary_embedding.len())
                .max()
                .unwrap_or(0);
            let mut mean = vec![0.0f32; dims];
            let mut counted = 0usize;
            for file in files {
                if file.summary_embedding.is_empty() {
                    continue;
                }
                for (slot, value) in mean.iter_mut().zip(&file.summary_embedding) {
                    *slot += value;
                }
                counted += 1;
            }
            if counted > 0 {
                for slot in &mut mean {
                    *slot /= counted as f32;
                }
            }
            mean
        };

        let concepts = |files: &[crate::store::materials::MaterialFile]| -> Vec<String> {
            files
                .iter()
                .flat_map(|f| f.signatures.concepts.iter().cloned())
                .collect()
        };

        let emb = cosine(&mean_embedding(&files_a), &mean_embedding(&files_b)) as f64;
        let tokens = jaccard(&concepts(&files_a), &concepts(&files_b));
        Ok((0.6 * emb.max(0.0) + 0.4 * tokens).clamp(0.0, 1.0))
    }
}
