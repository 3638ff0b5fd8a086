//! Doc validation against template minima and cross-block invariants.
//!
//! Validation runs after the auto-fix cascade. Errors feed the LLM retry
//! loop verbatim, so messages name the violated rule and the offending
//! block where possible.

use std::collections::HashSet;

use crate::doc::autofix::Threading;
use crate::doc::citations::is_valid_uuid;
use crate::doc::model::{BlockKind, NodeDoc};
use crate::doc::template::TemplateRequirements;

/// Inputs the validators check against.
pub struct ValidationContext<'a> {
    pub allowed_chunks: &'a HashSet<String>,
    pub requirements: &'a TemplateRequirements,
    /// Outline headings that must appear in order (subsequence match).
    pub outline: &'a [String],
    pub must_cite: &'a [String],
    pub threading: &'a Threading,
}

/// Outcome of validating one doc.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn new() -> Self {
        Self { valid: true, errors: Vec::new() }
    }

    fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.valid = false;
    }
}

/// Validate a doc. All checks run; the result carries every violation.
pub fn validate(doc: &NodeDoc, ctx: &ValidationContext<'_>) -> ValidationResult {
    let mut result = ValidationResult::new();

    check_citations(doc, ctx, &mut result);
    check_template_minima(doc, ctx.requirements, &mut result);
    check_outline_order(doc, ctx.outline, &mut result);
    check_teach_before_test(doc, &mut result);
    check_must_cite(doc, ctx, &mut result);
    check_threading(doc, ctx.threading, &mut result);

    result
}

fn check_citations(doc: &NodeDoc, ctx: &ValidationContext<'_>, result: &mut ValidationResult) {
    for block in &doc.blocks {
        let block_id = block.id.as_deref().unwrap_or("<no id>");
        for citation in &block.citations {
            if !is_valid_uuid(&citation.chunk_id) {
                result.add_error(format!(
                    "block {block_id}: citation chunk_id {:?} is not a UUID",
                    citation.chunk_id
                ));
            } else if !ctx.allowed_chunks.contains(&citation.chunk_id) {
                result.add_error(format!(
                    "block {block_id}: citation chunk_id {} is not in the allowed set",
                    citation.chunk_id
                ));
            }
        }
        if block.citations.is_empty() && block.kind.requires_citations() {
            result.add_error(format!(
                "block {block_id}: {} blocks require at least one citation",
                block.kind
            ));
        }
    }
}

fn check_template_minima(
    doc: &NodeDoc,
    reqs: &TemplateRequirements,
    result: &mut ValidationResult,
) {
    let checks: &[(&str, usize, usize)] = &[
        ("word_count", doc.word_count(), reqs.min_word_count),
        ("headings", doc.count_kind(&BlockKind::Heading), reqs.min_headings),
        ("paragraphs", doc.count_kind(&BlockKind::Paragraph), reqs.min_paragraphs),
        ("callouts", doc.count_kind(&BlockKind::Callout), reqs.min_callouts),
        ("quick_checks", doc.count_kind(&BlockKind::QuickCheck), reqs.min_quick_checks),
        ("flashcards", doc.count_kind(&BlockKind::Flashcard), reqs.min_flashcards),
        ("diagrams", doc.count_kind(&BlockKind::Diagram), reqs.min_diagrams),
        ("steps", doc.count_kind(&BlockKind::Steps), reqs.min_steps),
        ("checklist", doc.count_kind(&BlockKind::Checklist), reqs.min_checklist),
        ("connections", doc.count_kind(&BlockKind::Connections), reqs.min_connections),
        ("pitfalls", doc.count_kind(&BlockKind::CommonMistakes), reqs.min_pitfalls),
        (
            "why_it_matters",
            doc.count_kind(&BlockKind::WhyItMatters),
            reqs.min_why_it_matters,
        ),
        ("intuition", doc.count_kind(&BlockKind::Intuition), reqs.min_intuition),
        (
            "mental_models",
            doc.count_kind(&BlockKind::MentalModel),
            reqs.min_mental_models,
        ),
        ("tables", doc.count_kind(&BlockKind::Table), reqs.min_tables),
    ];
    for (name, actual, minimum) in checks {
        if actual < minimum {
            result.add_error(format!("{name}: have {actual}, template requires {minimum}"));
        }
    }

    if reqs.require_example {
        let has_example = doc.blocks.iter().any(|b| {
            b.kind == BlockKind::Callout && b.str_field("title") == Some("Worked example")
        });
        if !has_example {
            result.add_error("template requires a \"Worked example\" callout");
        }
    }
    if reqs.require_media {
        let has_media = doc
            .blocks
            .iter()
            .any(|b| matches!(b.kind, BlockKind::Figure | BlockKind::Video));
        if !has_media {
            result.add_error("template requires at least one figure or video");
        }
    }
}

/// Every outline heading must appear in the doc's heading sequence, in
/// order (subsequence match; extra doc headings are fine).
fn check_outline_order(doc: &NodeDoc, outline: &[String], result: &mut ValidationResult) {
    if outline.is_empty() {
        return;
    }
    let doc_headings: Vec<String> = doc
        .blocks
        .iter()
        .filter(|b| b.kind == BlockKind::Heading)
        .filter_map(|b| b.text())
        .map(|t| t.trim().to_lowercase())
        .collect();

    let mut cursor = 0;
    for heading in outline {
        let wanted = heading.trim().to_lowercase();
        match doc_headings[cursor..].iter().position(|h| h.contains(&wanted)) {
            Some(offset) => cursor += offset + 1,
            None => {
                result.add_error(format!(
                    "outline heading {heading:?} missing or out of order"
                ));
            }
        }
    }
}

fn check_teach_before_test(doc: &NodeDoc, result: &mut ValidationResult) {
    let mut taught: HashSet<String> = HashSet::new();
    for block in &doc.blocks {
        if block.kind == BlockKind::QuickCheck {
            for id in block.cited_chunk_ids() {
                if !taught.contains(&id) {
                    result.add_error(format!(
                        "quick_check {} cites chunk {} before any teaching block does",
                        block.id.as_deref().unwrap_or("<no id>"),
                        id
                    ));
                }
            }
        }
        if block.kind.is_teaching() {
            for id in block.cited_chunk_ids() {
                taught.insert(id);
            }
        }
    }
}

fn check_must_cite(doc: &NodeDoc, ctx: &ValidationContext<'_>, result: &mut ValidationResult) {
    if ctx.must_cite.is_empty() {
        return;
    }
    let cited = doc.all_cited_chunk_ids();
    for id in ctx.must_cite {
        if ctx.allowed_chunks.contains(id) && !cited.contains(id) {
            result.add_error(format!("must-cite chunk {id} is never cited"));
        }
    }
}

fn check_threading(doc: &NodeDoc, threading: &Threading, result: &mut ValidationResult) {
    for (label, title) in [
        ("previous lesson", &threading.prev_title),
        ("next lesson", &threading.next_title),
        ("module", &threading.module_title),
    ] {
        if let Some(title) = title {
            if !doc.mentions(title) {
                result.add_error(format!("doc never references the {label} {title:?}"));
            }
        }
    }
}
