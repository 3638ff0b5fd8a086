//! Probe candidate scoring.

use std::collections::{HashMap, HashSet};

use crate::config::ProbeConfig;
use crate::doc::model::{BlockKind, NodeDoc};
use crate::store::states::{UserConceptState, UserTestletState};

/// Mean expected information gain over the candidate's concepts.
///
/// Per concept: `(1 - mastery) * (0.5 + 0.5 * max(uncertainty, 1 - confidence))`.
/// A concept with no state contributes 0.5; an empty concept list scores 0.1.
pub fn info_gain(
    concept_ids: &[String],
    states: &HashMap<String, UserConceptState>,
) -> f64 {
    if concept_ids.is_empty() {
        return 0.1;
    }
    let total: f64 = concept_ids
        .iter()
        .map(|id| match states.get(id) {
            Some(state) => {
                let spread = state.uncertainty().max(1.0 - state.confidence);
                (1.0 - state.mastery) * (0.5 + 0.5 * spread)
            }
            None => 0.5,
        })
        .sum();
    total / concept_ids.len() as f64
}

/// Testlet uncertainty: Beta(a, b) variance normalized by its 0.25 maximum.
/// Non-positive parameters fall back to 1.
pub fn testlet_uncertainty(state: Option<&UserTestletState>) -> f64 {
    let (a, b) = match state {
        Some(s) => (
            if s.alpha <= 0.0 { 1.0 } else { s.alpha },
            if s.beta <= 0.0 { 1.0 } else { s.beta },
        ),
        None => (1.0, 1.0),
    };
    let sum = a + b;
    let variance = (a * b) / (sum * sum * (sum + 1.0));
    (variance / 0.25).clamp(0.0, 1.0)
}

/// Whether a prerequisite concept counts as unresolved for this user:
/// low mastery, high uncertainty, an active misconception, or no state.
pub fn is_unresolved_prereq(
    concept_id: &str,
    states: &HashMap<String, UserConceptState>,
    misconceptions: &HashSet<String>,
    min_ready_mastery: f64,
) -> bool {
    if misconceptions.contains(concept_id) {
        return true;
    }
    match states.get(concept_id) {
        Some(state) => state.mastery < min_ready_mastery || state.uncertainty() > 0.6,
        None => true,
    }
}

/// Composite candidate score.
pub fn score(
    config: &ProbeConfig,
    info_gain: f64,
    testlet_uncertainty: f64,
    has_misconception: bool,
    is_prereq_target: bool,
) -> f64 {
    let mut total = info_gain + config.testlet_weight * testlet_uncertainty;
    if has_misconception {
        total += config.misconception_boost;
    }
    if is_prereq_target {
        total += config.prereq_boost;
    }
    total
}

/// Infer trigger blocks for a candidate at `index`: explicit metadata wins;
/// otherwise earlier teaching blocks sharing a citation (up to three,
/// nearest first); otherwise the nearest prior teaching block.
pub fn infer_trigger_blocks(doc: &NodeDoc, index: usize) -> Vec<String> {
    let candidate = &doc.blocks[index];
    let explicit = candidate.string_list("trigger_after_block_ids");
    if !explicit.is_empty() {
        return explicit;
    }

    let cited: HashSet<String> = candidate.cited_chunk_ids().into_iter().collect();
    let mut shared = Vec::new();
    for block in doc.blocks[..index].iter().rev() {
        if !block.kind.is_teaching() {
            continue;
        }
        let Some(id) = block.id.clone() else { continue };
        if block
            .cited_chunk_ids()
            .iter()
            .any(|chunk| cited.contains(chunk))
        {
            shared.push(id);
            if shared.len() == 3 {
                break;
            }
        }
    }
    if !shared.is_empty() {
        return shared;
    }

    doc.blocks[..index]
        .iter()
        .rev()
        .find(|block| block.kind.is_teaching() && block.id.is_some())
        .and_then(|block| block.id.clone())
        .map(|id| vec![id])
        .unwrap_or_default()
}

/// Candidate block kinds for probing.
pub fn is_probe_block(kind: &BlockKind) -> bool {
    kind.is_probe_candidate()
}
