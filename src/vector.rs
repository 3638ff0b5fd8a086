//! Vector index contract and namespace helpers.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// A single similarity hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub id: String,
    pub score: f32,
}

/// One record to upsert. IDs are deterministic (`concept:<uuid>`,
/// `chunk:<uuid>`) so repeated upserts are idempotent.
#[derive(Debug, Clone)]
pub struct UpsertRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: Option<Value>,
}

/// Metadata filter passed to queries. Interpretation is index-specific; this
/// crate only ever filters on an allowed-file-ID list.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub allowed_file_ids: Vec<String>,
}

/// Client seam for the vector index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Top-K matches with scores.
    async fn query_matches(
        &self,
        namespace: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<Match>>;

    /// Top-K IDs only.
    async fn query_ids(
        &self,
        namespace: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<String>>;

    /// Idempotent upsert.
    async fn upsert(&self, namespace: &str, records: &[UpsertRecord]) -> Result<()>;
}

/// Namespace for a material set's chunks. Derived sets share their source
/// set's namespace so retrieval spans both.
pub fn chunk_namespace(retrieval_set_id: &str) -> String {
    format!("chunks:{retrieval_set_id}")
}

/// Namespace for concepts of a given scope (`path` or `global`).
pub fn concept_namespace(scope: &str) -> String {
    format!("concepts:{scope}")
}

/// Namespace for teaching patterns.
pub const TEACHING_PATTERNS_NAMESPACE: &str = "teaching_patterns";

/// Cosine similarity between two vectors. Zero when either norm is zero.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory index for stage tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Brute-force cosine index over in-memory records.
    #[derive(Default)]
    pub struct MemoryIndex {
        records: Mutex<HashMap<String, Vec<(String, Vec<f32>)>>>,
    }

    impl MemoryIndex {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, namespace: &str, id: &str, values: Vec<f32>) {
            self.records
                .lock()
                .unwrap()
                .entry(namespace.to_owned())
                .or_default()
                .push((id.to_owned(), values));
        }

        fn ranked(&self, namespace: &str, vector: &[f32], k: usize) -> Vec<Match> {
            let records = self.records.lock().unwrap();
            let mut hits: Vec<Match> = records
                .get(namespace)
                .map(|rows| {
                    rows.iter()
                        .map(|(id, values)| Match {
                            id: id.clone(),
                            score: cosine(vector, values),
                        })
                        .collect()
                })
                .unwrap_or_default();
            hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
            hits.truncate(k);
            hits
        }
    }

    #[async_trait]
    impl VectorIndex for MemoryIndex {
        async fn query_matches(
            &self,
            namespace: &str,
            vector: &[f32],
            k: usize,
            _filter: Option<&QueryFilter>,
        ) -> Result<Vec<Match>> {
            Ok(self.ranked(namespace, vector, k))
        }

        async fn query_ids(
            &self,
            namespace: &str,
            vector: &[f32],
            k: usize,
            _filter: Option<&QueryFilter>,
        ) -> Result<Vec<String>> {
            Ok(self.ranked(namespace, vector, k).into_iter().map(|m| m.id).collect())
        }

        async fn upsert(&self, namespace: &str, records: &[UpsertRecord]) -> Result<()> {
            let mut map = self.records.lock().unwrap();
            let rows = map.entry(namespace.to_owned()).or_default();
            for record in records {
                rows.retain(|(id, _)| id != &record.id);
                rows.push((record.id.clone(), record.values.clone()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = [0.3_f32, 0.4, 0.5];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_with_zero_vector_is_zero() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn namespaces_are_stable() {
        assert_eq!(chunk_namespace("set-1"), "chunks:set-1");
        assert_eq!(concept_namespace("global"), "concepts:global");
    }
}
