//! Multi-signal file-pair similarity.

use std::collections::HashSet;

use crate::store::materials::MaterialFile;
use crate::vector::cosine;

const WEIGHT_EMBEDDING: f64 = 0.65;
const WEIGHT_CONTENT_TOKENS: f64 = 0.2;
const WEIGHT_DOMAINS: f64 = 0.1;
const WEIGHT_OUTLINE: f64 = 0.05;

/// Penalty per difficulty distance: same, adjacent, further apart.
const DIFFICULTY_PENALTY_ADJACENT: f64 = 0.07;
const DIFFICULTY_PENALTY_FAR: f64 = 0.15;

/// Boost for pairs that agree on both domain and topic signals.
const DOMAIN_TOPIC_BOOST: f64 = 0.08;
/// Shrink factor when domains are disjoint and text similarity is low.
const DISJOINT_SHRINK: f64 = 0.7;
const LOW_TEXT_SIMILARITY: f64 = 0.4;

/// Jaccard similarity between two token lists (case-insensitive).
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let set_a: HashSet<String> = a.iter().map(|t| t.to_lowercase()).collect();
    let set_b: HashSet<String> = b.iter().map(|t| t.to_lowercase()).collect();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    set_a.intersection(&set_b).count() as f64 / union as f64
}

/// Ordered difficulty ladder for penalty distance.
fn difficulty_rank(difficulty: &str) -> Option<usize> {
    match difficulty.to_lowercase().as_str() {
        "intro" | "beginner" => Some(0),
        "intermediate" => Some(1),
        "advanced" => Some(2),
        "expert" => Some(3),
        _ => None,
    }
}

fn difficulty_penalty(a: Option<&str>, b: Option<&str>) -> f64 {
    match (a.and_then(difficulty_rank), b.and_then(difficulty_rank)) {
        (Some(ra), Some(rb)) => match ra.abs_diff(rb) {
            0 => 0.0,
            1 => DIFFICULTY_PENALTY_ADJACENT,
            _ => DIFFICULTY_PENALTY_FAR,
        },
        _ => 0.0,
    }
}

/// Base similarity score for one file pair, clamped to [0, 1].
pub fn pair_score(a: &MaterialFile, b: &MaterialFile) -> f64 {
    let emb = cosine(&a.summary_embedding, &b.summary_embedding) as f64;

    let content_a: Vec<String> = a
        .signatures
        .topics
        .iter()
        .chain(&a.signatures.domains)
        .chain(&a.signatures.concepts)
        .cloned()
        .collect();
    let content_b: Vec<String> = b
        .signatures
        .topics
        .iter()
        .chain(&b.signatures.domains)
        .chain(&b.signatures.concepts)
        .cloned()
        .collect();

    let content_jaccard = jaccard(&content_a, &content_b);
    let domain_jaccard = jaccard(&a.signatures.domains, &b.signatures.domains);
    let topic_jaccard = jaccard(&a.signatures.topics, &b.signatures.topics);
    let outline_jaccard = jaccard(&a.signatures.outline, &b.signatures.outline);

    let mut score = WEIGHT_EMBEDDING * emb
        + WEIGHT_CONTENT_TOKENS * content_jaccard
        + WEIGHT_DOMAINS * domain_jaccard
        + WEIGHT_OUTLINE * outline_jaccard
        - difficulty_penalty(a.difficulty.as_deref(), b.difficulty.as_deref());

    if domain_jaccard >= 0.6 && topic_jaccard >= 0.3 {
        score += DOMAIN_TOPIC_BOOST;
    }
    let domains_disjoint = domain_jaccard == 0.0
        && !(a.signatures.domains.is_empty() && b.signatures.domains.is_empty());
    if domains_disjoint && emb < LOW_TEXT_SIMILARITY {
        score *= DISJOINT_SHRINK;
    }

    score.clamp(0.0, 1.0)
}

/// Blend a base score with a cross-encoder score, 60/40.
pub fn blend_with_cross_encoder(base: f64, cross: f64) -> f64 {
    (0.6 * base + 0.4 * cross).clamp(0.0, 1.0)
}

/// Difficulty label for a file set: the single shared difficulty, or
/// "mixed" whenever two or more distinct difficulties appear.
pub fn difficulty_summary(files: &[&MaterialFile]) -> String {
    let distinct: HashSet<String> = files
        .iter()
        .filter_map(|f| f.difficulty.as_ref())
        .map(|d| d.to_lowercase())
        .collect();
    match distinct.len() {
        0 => "unknown".to_owned(),
        1 => distinct.into_iter().next().expect("len checked"),
        _ => "mixed".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::materials::FileSignatures;

    fn file(
        id: &str,
        embedding: Vec<f32>,
        topics: &[&str],
        domains: &[&str],
        difficulty: Option<&str>,
    ) -> MaterialFile {
        MaterialFile {
            id: id.into(),
            set_id: "s1".into(),
            name: format!("{id}.pdf"),
            summary_embedding: embedding,
            signatures: FileSignatures {
                topics: topics.iter().map(|s| s.to_string()).collect(),
                domains: domains.iter().map(|s| s.to_string()).collect(),
                concepts: Vec::new(),
                outline: Vec::new(),
            },
            difficulty: difficulty.map(str::to_owned),
        }
    }

    #[test]
    fn identical_files_score_near_one() {
        let a = file("a", vec![1.0, 0.0], &["circuits"], &["electronics"], Some("beginner"));
        let b = file("b", vec![1.0, 0.0], &["circuits"], &["electronics"], Some("beginner"));
        let score = pair_score(&a, &b);
        assert!(score > 0.9, "got {score}");
    }

    #[test]
    fn shared_topics_boost_applies() {
        let a = file("a", vec![0.6, 0.4], &["circuits"], &["electronics"], None);
        let b = file("b", vec![0.6, 0.4], &["circuits"], &["electronics"], None);
        let c = file("c", vec![0.6, 0.4], &["poetry"], &["literature"], None);
        assert!(pair_score(&a, &b) > pair_score(&a, &c));
    }

    #[test]
    fn difficulty_gap_penalizes() {
        let base = |diff| file("x", vec![1.0, 0.0], &["t"], &["d"], Some(diff));
        let same = pair_score(&base("beginner"), &base("beginner"));
        let adjacent = pair_score(&base("beginner"), &base("intermediate"));
        let far = pair_score(&base("beginner"), &base("advanced"));
        assert!(same > adjacent);
        assert!(adjacent > far);
        assert!((same - adjacent - DIFFICULTY_PENALTY_ADJACENT).abs() < 1e-9);
    }

    #[test]
    fn disjoint_domains_with_low_text_similarity_shrink() {
        let a = file("a", vec![1.0, 0.0, 0.0], &["t1"], &["physics"], None);
        let b = file("b", vec![0.0, 1.0, 0.0], &["t2"], &["cooking"], None);
        // emb cosine 0 and disjoint domains: the already-low score shrinks.
        let score = pair_score(&a, &b);
        assert!(score < 0.1, "got {score}");
    }

    #[test]
    fn scores_are_clamped_to_unit_interval() {
        let a = file("a", vec![1.0], &["t"], &["d"], None);
        let b = file("b", vec![1.0], &["t"], &["d"], None);
        let score = pair_score(&a, &b);
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn cross_encoder_blend_is_60_40() {
        assert!((blend_with_cross_encoder(1.0, 0.0) - 0.6).abs() < 1e-9);
        assert!((blend_with_cross_encoder(0.0, 1.0) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn difficulty_summary_mixed_at_two_distinct() {
        let a = file("a", vec![], &[], &[], Some("beginner"));
        let b = file("b", vec![], &[], &[], Some("advanced"));
        let c = file("c", vec![], &[], &[], Some("beginner"));
        assert_eq!(difficulty_summary(&[&a, &c]), "beginner");
        assert_eq!(difficulty_summary(&[&a, &b]), "mixed");
        assert_eq!(difficulty_summary(&[&a, &b, &c]), "mixed");
        assert_eq!(difficulty_summary(&[]), "unknown");
    }
}
