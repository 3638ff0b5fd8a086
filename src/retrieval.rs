//! Retrieval mixer: semantic, lexical, and cosine-fallback hits combined
//! into one deterministic top-K chunk list.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;
use crate::store::materials::MaterialChunk;
use crate::store::ContentStore;
use crate::vector::{cosine, QueryFilter, VectorIndex};

/// Inputs for one retrieval call.
pub struct RetrievalQuery<'a> {
    /// Chunk namespace (the material set's retrieval namespace).
    pub namespace: &'a str,
    pub text: &'a str,
    pub embedding: &'a [f32],
    pub allowed_file_ids: &'a [String],
    /// Extractable chunks for the allowed files, by ID. Hits outside this
    /// map are dropped.
    pub chunks: &'a HashMap<String, MaterialChunk>,
    pub k: usize,
    pub timeout_ms: u64,
}

/// Ordered, deduplicated top-K chunk IDs for the query.
///
/// Semantic hits lead, lexical hits union in first-seen order, and a local
/// cosine pass over the deterministically sorted chunk set backfills any
/// remaining slots. Index or FTS failures degrade that source to empty
/// rather than failing the call.
pub async fn retrieve_chunk_ids(
    vector: &dyn VectorIndex,
    store: &ContentStore,
    query: &RetrievalQuery<'_>,
) -> Result<Vec<String>> {
    let mut ordered: Vec<String> = Vec::new();
    let mut push = |id: String, ordered: &mut Vec<String>| {
        if query.chunks.contains_key(&id) && !ordered.contains(&id) {
            ordered.push(id);
        }
    };

    // Semantic top-K, bounded by the per-call timeout.
    let filter = QueryFilter { allowed_file_ids: query.allowed_file_ids.to_vec() };
    let semantic = tokio::time::timeout(
        Duration::from_millis(query.timeout_ms),
        vector.query_ids(query.namespace, query.embedding, query.k, Some(&filter)),
    )
    .await;
    match semantic {
        Ok(Ok(ids)) => {
            for id in ids {
                push(id, &mut ordered);
            }
        }
        Ok(Err(error)) => {
            tracing::warn!(%error, "semantic retrieval failed, continuing without it");
        }
        Err(_) => {
            tracing::warn!(timeout_ms = query.timeout_ms, "semantic retrieval timed out");
        }
    }

    // Lexical top-K from the full-text index.
    match store
        .lexical_chunk_ids(query.text, query.allowed_file_ids, query.k)
        .await
    {
        Ok(ids) => {
            for id in ids {
                push(id, &mut ordered);
            }
        }
        Err(error) => {
            tracing::warn!(%error, "lexical retrieval failed, continuing without it");
        }
    }

    // Cosine fallback over the local embedding set, deterministically sorted.
    if ordered.len() < query.k && !query.embedding.is_empty() {
        let mut scored: Vec<(&String, f32)> = query
            .chunks
            .iter()
            .filter(|(_, chunk)| !chunk.embedding.is_empty())
            .map(|(id, chunk)| (id, cosine(query.embedding, &chunk.embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        for (id, _) in scored {
            if ordered.len() >= query.k {
                break;
            }
            push(id.clone(), &mut ordered);
        }
    }

    ordered.truncate(query.k);
    Ok(ordered)
}
