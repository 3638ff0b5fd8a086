//! Concept canonicalization: mapping path-local concepts into the global
//! canonical concept namespace.
//!
//! Resolution precedence: manual override > exact key match > alias
//! redirect > semantic match (score-gated) > newly created global concept.
//! Concurrent runs converge through conflict-free inserts followed by a
//! reload-and-repair pass.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::config::CanonicalConfig;
use crate::error::Result;
use crate::store::concepts::{Concept, ConceptRepresentation, ConceptScope, MappingMethod};
use crate::store::ContentStore;

/// A precomputed semantic match for one normalized concept key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticMatch {
    /// Target canonical concept ID.
    pub canonical_id: String,
    /// `alias` matches always redirect; `semantic` matches redirect only
    /// when the score clears the configured soft minimum.
    pub kind: SemanticMatchKind,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticMatchKind {
    Alias,
    Semantic,
}

/// Resolution for one path concept.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConcept {
    pub path_concept_id: String,
    pub canonical_id: String,
    pub method: MappingMethod,
    pub confidence: f64,
}

/// Outcome of one canonicalization run.
#[derive(Debug, Clone, Default)]
pub struct CanonicalizationOutcome {
    /// Path concept ID → resolution.
    pub resolved: HashMap<String, ResolvedConcept>,
    pub created_global: usize,
    pub repaired_pointers: usize,
}

/// Canonicalizes a batch of path concepts against the global namespace.
pub struct Canonicalizer {
    store: Arc<ContentStore>,
    config: CanonicalConfig,
}

impl Canonicalizer {
    pub fn new(store: Arc<ContentStore>, config: CanonicalConfig) -> Self {
        Self { store, config }
    }

    /// Canonicalize `path_concepts`, using `semantic_matches` (key →
    /// match) where provided. Idempotent: a second run with the same inputs
    /// produces the same resolutions and writes no new rows.
    pub async fn canonicalize(
        &self,
        path_concepts: &[Concept],
        semantic_matches: &HashMap<String, SemanticMatch>,
    ) -> Result<CanonicalizationOutcome> {
        let mut outcome = CanonicalizationOutcome::default();

        // 1. Unique normalized keys, empty keys skipped.
        let keys: BTreeSet<String> = path_concepts
            .iter()
            .map(|c| normalize_key(&c.key))
            .filter(|k| !k.is_empty())
            .collect();
        let keys: Vec<String> = keys.into_iter().collect();
        if keys.is_empty() {
            return Ok(outcome);
        }

        // 2. Existing global rows.
        let mut globals = self.store.global_concepts_by_keys(&keys).await?;

        // 3. Create rows for missing keys. A semantic match decides whether
        // the new row redirects or stands as its own canonical.
        let mut requested_redirects: HashMap<String, String> = HashMap::new();
        let mut created_methods: HashMap<String, (MappingMethod, f64)> = HashMap::new();
        for key in &keys {
            if globals.contains_key(key) {
                continue;
            }
            let source = path_concepts
                .iter()
                .find(|c| normalize_key(&c.key) == *key)
                .expect("key derived from path_concepts");

            let (pointer, method, confidence) = match semantic_matches.get(key) {
                Some(m) if m.kind == SemanticMatchKind::Alias => {
                    requested_redirects.insert(key.clone(), m.canonical_id.clone());
                    (Some(m.canonical_id.clone()), MappingMethod::Alias, m.score.max(0.9))
                }
                Some(m)
                    if m.kind == SemanticMatchKind::Semantic
                        && m.score >= self.config.semantic_soft_min =>
                {
                    requested_redirects.insert(key.clone(), m.canonical_id.clone());
                    (Some(m.canonical_id.clone()), MappingMethod::Semantic, m.score)
                }
                _ => (None, MappingMethod::CreatedGlobal, 1.0),
            };
            created_methods.insert(key.clone(), (method, confidence));

            let row = Concept {
                id: uuid::Uuid::new_v4().to_string(),
                scope: ConceptScope::Global,
                key: key.clone(),
                name: source.name.clone(),
                summary: source.summary.clone(),
                key_points: source.key_points.clone(),
                canonical_concept_id: pointer,
                metadata: source.metadata.clone(),
                created_at: Utc::now(),
            };
            self.store.insert_concept_if_absent(&row).await?;
            outcome.created_global += 1;
        }

        // 4. Reload: a concurrent run may have won some inserts.
        globals = self.store.global_concepts_by_keys(&keys).await?;

        // 5. Repair redirects lost to a concurrent self-canonical insert.
        for (key, target) in &requested_redirects {
            if let Some(row) = globals.get(key) {
                if row.canonical_concept_id.is_none() && row.id != *target {
                    self.store.set_canonical_pointer(&row.id, Some(target)).await?;
                    outcome.repaired_pointers += 1;
                }
            }
        }
        if outcome.repaired_pointers > 0 {
            globals = self.store.global_concepts_by_keys(&keys).await?;
        }

        // Resolve each key to its final canonical ID, collapsing any
        // two-hop alias chains found on read.
        let mut resolved_by_key: HashMap<String, (String, MappingMethod, f64)> = HashMap::new();
        for key in &keys {
            let Some(row) = globals.get(key) else { continue };
            let canonical_id = self.resolve_one_hop(row, &mut outcome).await?;
            let (method, confidence) = match created_methods.get(key) {
                Some((method, confidence)) => (*method, *confidence),
                None => {
                    if row.canonical_concept_id.is_some() {
                        (MappingMethod::Alias, 0.9)
                    } else {
                        (MappingMethod::ExactKey, 1.0)
                    }
                }
            };
            resolved_by_key.insert(key.clone(), (canonical_id, method, confidence));
        }

        // 6–7. Backfill path concept pointers and write representations.
        // Explicit overrides win over every automatic decision.
        let path_ids: Vec<String> = path_concepts.iter().map(|c| c.id.clone()).collect();
        let overrides = self.store.mapping_overrides(&path_ids).await?;

        for concept in path_concepts {
            let key = normalize_key(&concept.key);
            let automatic = resolved_by_key.get(&key);

            let (canonical_id, method, confidence) = match overrides.get(&concept.id) {
                Some(target) => (target.clone(), MappingMethod::Override, 1.0),
                None => match automatic {
                    Some((id, method, confidence)) => (id.clone(), *method, *confidence),
                    None => continue, // empty key
                },
            };

            let needs_backfill = match &concept.canonical_concept_id {
                None => true,
                Some(current) => {
                    current != &canonical_id
                        || self
                            .store
                            .concept_by_id(current)
                            .await?
                            .map(|row| row.canonical_concept_id.is_some())
                            .unwrap_or(true)
                }
            };
            if needs_backfill {
                self.store
                    .set_canonical_pointer(&concept.id, Some(&canonical_id))
                    .await?;
            }

            self.store
                .save_representation(&ConceptRepresentation {
                    path_concept_id: concept.id.clone(),
                    canonical_concept_id: canonical_id.clone(),
                    aliases: concept.aliases(),
                    method,
                    confidence,
                })
                .await?;

            outcome.resolved.insert(
                concept.id.clone(),
                ResolvedConcept {
                    path_concept_id: concept.id.clone(),
                    canonical_id,
                    method,
                    confidence,
                },
            );
        }

        tracing::debug!(
            concepts = path_concepts.len(),
            created = outcome.created_global,
            repaired = outcome.repaired_pointers,
            "canonicalization complete"
        );
        Ok(outcome)
    }

    /// Resolve a row to its canonical ID, following at most one hop. A
    /// two-hop chain is repaired in place so the invariant holds on read.
    async fn resolve_one_hop(
        &self,
        row: &Concept,
        outcome: &mut CanonicalizationOutcome,
    ) -> Result<String> {
        let Some(target_id) = &row.canonical_concept_id else {
            return Ok(row.id.clone());
        };
        let Some(target) = self.store.concept_by_id(target_id).await? else {
            return Ok(target_id.clone());
        };
        match &target.canonical_concept_id {
            None => Ok(target.id),
            Some(final_id) => {
                // Collapse the chain: the alias now points at the true root.
                self.store.set_canonical_pointer(&row.id, Some(final_id)).await?;
                outcome.repaired_pointers += 1;
                Ok(final_id.clone())
            }
        }
    }
}

/// Lowercased, trimmed concept key.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::concepts::ConceptScope;

    fn path_concept(id: &str, key: &str) -> Concept {
        Concept {
            id: id.into(),
            scope: ConceptScope::Path,
            key: key.into(),
            name: key.into(),
            summary: Some(format!("about {key}")),
            key_points: Vec::new(),
            canonical_concept_id: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    async fn insert_path_concept(store: &ContentStore, concept: &Concept) {
        store.insert_concept_if_absent(concept).await.expect("insert path concept");
    }

    fn canonicalizer(store: Arc<ContentStore>) -> Canonicalizer {
        Canonicalizer::new(store, CanonicalConfig::default())
    }

    #[tokio::test]
    async fn new_keys_create_canonical_globals() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let concept = path_concept("pc1", "Ohms Law ");
        insert_path_concept(&store, &concept).await;

        let outcome = canonicalizer(store.clone())
            .canonicalize(&[concept], &HashMap::new())
            .await
            .expect("run");

        assert_eq!(outcome.created_global, 1);
        let resolution = &outcome.resolved["pc1"];
        assert_eq!(resolution.method, MappingMethod::CreatedGlobal);
        assert_eq!(resolution.confidence, 1.0);

        // The resolved row is itself canonical, never an alias.
        let row = store.concept_by_id(&resolution.canonical_id).await.unwrap().unwrap();
        assert!(row.canonical_concept_id.is_none());
        assert_eq!(row.key, "ohms law");
    }

    #[tokio::test]
    async fn exact_key_match_resolves_with_full_confidence() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let mut global = path_concept("g1", "voltage");
        global.scope = ConceptScope::Global;
        store.insert_concept_if_absent(&global).await.unwrap();

        let concept = path_concept("pc1", "Voltage");
        insert_path_concept(&store, &concept).await;

        let outcome = canonicalizer(store.clone())
            .canonicalize(&[concept], &HashMap::new())
            .await
            .expect("run");

        let resolution = &outcome.resolved["pc1"];
        assert_eq!(resolution.canonical_id, "g1");
        assert_eq!(resolution.method, MappingMethod::ExactKey);
        assert_eq!(resolution.confidence, 1.0);
        assert_eq!(outcome.created_global, 0);
    }

    #[tokio::test]
    async fn alias_global_row_resolves_to_its_target() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let mut target = path_concept("g-root", "electric potential");
        target.scope = ConceptScope::Global;
        store.insert_concept_if_absent(&target).await.unwrap();

        let mut alias = path_concept("g-alias", "voltage");
        alias.scope = ConceptScope::Global;
        alias.canonical_concept_id = Some("g-root".into());
        store.insert_concept_if_absent(&alias).await.unwrap();

        let concept = path_concept("pc1", "voltage");
        insert_path_concept(&store, &concept).await;

        let outcome = canonicalizer(store.clone())
            .canonicalize(&[concept], &HashMap::new())
            .await
            .expect("run");

        let resolution = &outcome.resolved["pc1"];
        assert_eq!(resolution.canonical_id, "g-root");
        assert_eq!(resolution.method, MappingMethod::Alias);
        assert!(resolution.confidence >= 0.9);
    }

    #[tokio::test]
    async fn semantic_match_below_soft_min_creates_own_canonical() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let mut target = path_concept("g1", "resistance");
        target.scope = ConceptScope::Global;
        store.insert_concept_if_absent(&target).await.unwrap();

        let concept = path_concept("pc1", "impedance");
        insert_path_concept(&store, &concept).await;

        let mut matches = HashMap::new();
        matches.insert(
            "impedance".to_owned(),
            SemanticMatch {
                canonical_id: "g1".into(),
                kind: SemanticMatchKind::Semantic,
                score: 0.55,
            },
        );

        let outcome = canonicalizer(store.clone())
            .canonicalize(&[concept], &matches)
            .await
            .expect("run");

        let resolution = &outcome.resolved["pc1"];
        assert_ne!(resolution.canonical_id, "g1");
        assert_eq!(resolution.method, MappingMethod::CreatedGlobal);
    }

    #[tokio::test]
    async fn semantic_match_above_soft_min_redirects() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let mut target = path_concept("g1", "resistance");
        target.scope = ConceptScope::Global;
        store.insert_concept_if_absent(&target).await.unwrap();

        let concept = path_concept("pc1", "impedance");
        insert_path_concept(&store, &concept).await;

        let mut matches = HashMap::new();
        matches.insert(
            "impedance".to_owned(),
            SemanticMatch {
                canonical_id: "g1".into(),
                kind: SemanticMatchKind::Semantic,
                score: 0.82,
            },
        );

        let outcome = canonicalizer(store.clone())
            .canonicalize(&[concept], &matches)
            .await
            .expect("run");

        let resolution = &outcome.resolved["pc1"];
        assert_eq!(resolution.canonical_id, "g1");
        assert_eq!(resolution.method, MappingMethod::Semantic);
        assert!((resolution.confidence - 0.82).abs() < 1e-9);
    }

    #[tokio::test]
    async fn override_wins_over_semantic_match() {
        // Auto-semantic match points at A, but a manual override pins B.
        let store = ContentStore::connect_in_memory().await.unwrap();
        for (id, key) in [("concept-a", "target a"), ("concept-b", "target b")] {
            let mut global = path_concept(id, key);
            global.scope = ConceptScope::Global;
            store.insert_concept_if_absent(&global).await.unwrap();
        }
        let concept = path_concept("pc-x", "mystery");
        insert_path_concept(&store, &concept).await;
        store.insert_mapping_override("pc-x", "concept-b").await.unwrap();

        let mut matches = HashMap::new();
        matches.insert(
            "mystery".to_owned(),
            SemanticMatch {
                canonical_id: "concept-a".into(),
                kind: SemanticMatchKind::Semantic,
                score: 0.95,
            },
        );

        let outcome = canonicalizer(store.clone())
            .canonicalize(&[concept], &matches)
            .await
            .expect("run");

        let resolution = &outcome.resolved["pc-x"];
        assert_eq!(resolution.canonical_id, "concept-b");
        assert_eq!(resolution.method, MappingMethod::Override);
        assert_eq!(resolution.confidence, 1.0);
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let concept = path_concept("pc1", "charge");
        insert_path_concept(&store, &concept).await;

        let runner = canonicalizer(store.clone());
        let first = runner.canonicalize(&[concept.clone()], &HashMap::new()).await.unwrap();
        let second = runner.canonicalize(&[concept], &HashMap::new()).await.unwrap();

        assert_eq!(first.resolved["pc1"].canonical_id, second.resolved["pc1"].canonical_id);
        assert_eq!(second.created_global, 0, "second run must not create rows");

        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM concepts WHERE scope = 'global'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn two_hop_alias_chain_is_collapsed_on_read() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        // root <- mid <- leaf: leaf's key is what the path concept uses.
        for (id, key, ptr) in [
            ("g-root", "root", None),
            ("g-mid", "mid", Some("g-root")),
            ("g-leaf", "charge", Some("g-mid")),
        ] {
            let mut global = path_concept(id, key);
            global.scope = ConceptScope::Global;
            global.canonical_concept_id = ptr.map(str::to_owned);
            store.insert_concept_if_absent(&global).await.unwrap();
        }
        let concept = path_concept("pc1", "charge");
        insert_path_concept(&store, &concept).await;

        let outcome = canonicalizer(store.clone())
            .canonicalize(&[concept], &HashMap::new())
            .await
            .expect("run");

        // Resolution lands on the true root and the chain is repaired.
        assert_eq!(outcome.resolved["pc1"].canonical_id, "g-root");
        let leaf = store.concept_by_id("g-leaf").await.unwrap().unwrap();
        assert_eq!(leaf.canonical_concept_id.as_deref(), Some("g-root"));
    }
}
