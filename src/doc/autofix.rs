//! Deterministic auto-fix cascade for generated docs.
//!
//! Passes run in a fixed order; every pass is idempotent and leaves the doc
//! strictly more valid. The cascade never consults the LLM — the optional
//! LLM-assisted meta scrub lives in the builder and falls back to the
//! deterministic pass here.

use regex::Regex;
use serde_json::{json, Value};

use std::collections::HashSet;
use std::sync::LazyLock;

use crate::doc::citations::{fallback_citation, normalize_citation};
use crate::doc::model::{Block, BlockKind, Citation, NodeDoc};
use crate::doc::sanitize::{sanitize_mermaid, sanitize_svg};
use crate::doc::template::TemplateRequirements;

/// Titles of neighboring content used by the threading pass.
#[derive(Debug, Clone, Default)]
pub struct Threading {
    pub prev_title: Option<String>,
    pub next_title: Option<String>,
    pub module_title: Option<String>,
}

/// A media asset available for figure/video URL fill and dedup.
#[derive(Debug, Clone)]
pub struct MediaAsset {
    pub storage_key: String,
    pub file_name: Option<String>,
    pub url: String,
}

/// Inputs to one cascade run.
pub struct AutofixContext<'a> {
    /// Normalized chunk UUIDs the doc may cite.
    pub allowed_chunks: &'a HashSet<String>,
    /// Fallback chunk IDs, most-preferred first.
    pub preferred_fallback: &'a [String],
    /// Chunk IDs the doc must cite somewhere.
    pub must_cite: &'a [String],
    pub requirements: &'a TemplateRequirements,
    /// Objectives from the node blueprint.
    pub blueprint_objectives: &'a [String],
    pub threading: &'a Threading,
    /// Figure assets available to this node.
    pub figures: &'a [MediaAsset],
    /// Video assets available to this node.
    pub videos: &'a [MediaAsset],
    /// Asset keys already used by other docs. Updated in place.
    pub used_media: &'a mut HashSet<String>,
    /// Concept keys for the auto-diagram labels.
    pub concept_keys: &'a [String],
}

/// Counters describing what the cascade changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutofixReport {
    pub ids_assigned: usize,
    pub meta_scrubbed: usize,
    pub diagrams_sanitized: usize,
    pub citations_dropped: usize,
    pub citations_backfilled: usize,
    pub media_filled: usize,
    pub media_deduped: usize,
    pub media_dropped: usize,
    pub interactive_added: usize,
    pub objectives_added: usize,
    pub quick_checks_moved: usize,
    pub excerpts_inserted: usize,
    pub must_cite_injected: usize,
    pub padding_added: usize,
    pub diagrams_synthesized: usize,
    pub threading_inserted: usize,
}

/// Run the full cascade.
pub fn autofix(doc: &mut NodeDoc, ctx: &mut AutofixContext<'_>) -> AutofixReport {
    let mut report = AutofixReport::default();
    assign_block_ids(doc, &mut report);
    scrub_meta(doc, &mut report);
    sanitize_diagrams(doc, &mut report);
    sanitize_citations(doc, ctx, &mut report);
    dedup_media(doc, ctx, &mut report);
    ensure_interactive_minima(doc, ctx, &mut report);
    sync_objectives(doc, ctx, &mut report);
    enforce_teach_before_test(doc, &mut report);
    inject_must_cite(doc, ctx, &mut report);
    pad_to_minima(doc, ctx, &mut report);
    synthesize_diagram(doc, ctx, &mut report);
    insert_threading(doc, ctx, &mut report);
    report
}

// ---------------------------------------------------------------------------
// Pass 1: block-ID assignment
// ---------------------------------------------------------------------------

/// Give every block a stable ID. New IDs continue past the largest existing
/// `b<N>` so re-running never renames anything.
fn assign_block_ids(doc: &mut NodeDoc, report: &mut AutofixReport) {
    let mut next = next_block_number(doc);
    for block in &mut doc.blocks {
        if block.id.as_deref().map(str::is_empty).unwrap_or(true) {
            block.id = Some(format!("b{next}"));
            next += 1;
            report.ids_assigned += 1;
        }
    }
}

fn next_block_number(doc: &NodeDoc) -> u64 {
    doc.blocks
        .iter()
        .filter_map(|b| b.id.as_deref())
        .filter_map(|id| id.strip_prefix('b'))
        .filter_map(|n| n.parse::<u64>().ok())
        .max()
        .map(|n| n + 1)
        .unwrap_or(1)
}

fn fresh_block_id(doc: &NodeDoc) -> String {
    format!("b{}", next_block_number(doc))
}

// ---------------------------------------------------------------------------
// Pass 2: meta scrub (deterministic fallback)
// ---------------------------------------------------------------------------

static META_SENTENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(as an ai\b|language model|i cannot\b|i'm unable to\b|per the template\b|the template requires\b)")
        .expect("hardcoded regex")
});

static PLACEHOLDER_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{[^}]*\}\}|\[(insert|add|todo)[^\]]*\]").expect("hardcoded regex")
});

/// Remove templating/meta phrasing from prose fields. Block types and IDs
/// are never touched; a block whose text would vanish entirely keeps it.
fn scrub_meta(doc: &mut NodeDoc, report: &mut AutofixReport) {
    for block in &mut doc.blocks {
        let Some(text) = block.text().map(str::to_owned) else { continue };
        let scrubbed = scrub_text(&text);
        if scrubbed != text && !scrubbed.trim().is_empty() {
            block.set_text(scrubbed);
            report.meta_scrubbed += 1;
        }
    }
}

fn scrub_text(text: &str) -> String {
    let without_placeholders = PLACEHOLDER_TOKEN.replace_all(text, "");
    let kept: Vec<&str> = split_sentences(&without_placeholders)
        .into_iter()
        .filter(|sentence| !META_SENTENCE.is_match(sentence))
        .collect();
    let joined = kept.join(" ");
    collapse_spaces(&joined)
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    for (index, byte) in bytes.iter().enumerate() {
        if matches!(byte, b'.' | b'!' | b'?')
            && bytes.get(index + 1).map(|b| *b == b' ').unwrap_or(true)
        {
            let sentence = text[start..=index].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = index + 1;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn collapse_spaces(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = false;
    for c in text.trim().chars() {
        if c == ' ' {
            if !last_space {
                out.push(c);
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Pass 3: diagram sanitization
// ---------------------------------------------------------------------------

fn sanitize_diagrams(doc: &mut NodeDoc, report: &mut AutofixReport) {
    for block in &mut doc.blocks {
        if block.kind != BlockKind::Diagram {
            continue;
        }
        let mut changed = false;

        // Infer a missing kind from the payload.
        if block.str_field("kind").is_none() {
            let inferred = if block.str_field("svg").is_some()
                || block.text().map(|t| t.contains("<svg")).unwrap_or(false)
            {
                "svg"
            } else {
                "mermaid"
            };
            block.extra.insert("kind".into(), Value::String(inferred.into()));
            changed = true;
        }

        match block.str_field("kind") {
            Some("svg") => {
                if let Some(svg) = block.str_field("svg").map(str::to_owned) {
                    let clean = sanitize_svg(&svg);
                    if clean != svg {
                        block.extra.insert("svg".into(), Value::String(clean));
                        changed = true;
                    }
                }
            }
            Some("mermaid") => {
                if let Some(source) = block.str_field("mermaid").map(str::to_owned) {
                    let cleaned = sanitize_mermaid(&source);
                    if cleaned.source != source {
                        block
                            .extra
                            .insert("mermaid".into(), Value::String(cleaned.source.clone()));
                        changed = true;
                    }
                    if !cleaned.caption_lines.is_empty() {
                        let mut caption =
                            block.str_field("caption").unwrap_or("").trim().to_owned();
                        for line in &cleaned.caption_lines {
                            if !caption.contains(line.as_str()) {
                                if !caption.is_empty() {
                                    caption.push(' ');
                                }
                                caption.push_str(line);
                                changed = true;
                            }
                        }
                        block.extra.insert("caption".into(), Value::String(caption));
                    }
                }
            }
            _ => {}
        }

        if changed {
            report.diagrams_sanitized += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 4: citation sanitization
// ---------------------------------------------------------------------------

fn sanitize_citations(
    doc: &mut NodeDoc,
    ctx: &AutofixContext<'_>,
    report: &mut AutofixReport,
) {
    for block in &mut doc.blocks {
        let before = block.citations.len();
        block
            .citations
            .retain_mut(|citation| normalize_citation(citation, ctx.allowed_chunks));
        report.citations_dropped += before - block.citations.len();

        if block.citations.is_empty() && block.kind.requires_citations() {
            if let Some(citation) = fallback_citation(ctx.preferred_fallback, ctx.allowed_chunks) {
                block.citations.push(citation);
                report.citations_backfilled += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 5: media dedup and URL fill
// ---------------------------------------------------------------------------

fn media_key(block: &Block) -> Option<String> {
    block
        .str_field("storage_key")
        .or_else(|| block.str_field("file_name"))
        .or_else(|| block.str_field("url"))
        .map(str::to_owned)
}

fn asset_key(asset: &MediaAsset) -> String {
    if !asset.storage_key.is_empty() {
        asset.storage_key.clone()
    } else {
        asset.file_name.clone().unwrap_or_else(|| asset.url.clone())
    }
}

fn apply_asset(block: &mut Block, asset: &MediaAsset) {
    block
        .extra
        .insert("storage_key".into(), Value::String(asset.storage_key.clone()));
    if let Some(name) = &asset.file_name {
        block.extra.insert("file_name".into(), Value::String(name.clone()));
    }
    block.extra.insert("url".into(), Value::String(asset.url.clone()));
}

fn dedup_media(doc: &mut NodeDoc, ctx: &mut AutofixContext<'_>, report: &mut AutofixReport) {
    let mut kept = Vec::with_capacity(doc.blocks.len());
    for mut block in std::mem::take(&mut doc.blocks) {
        if !matches!(block.kind, BlockKind::Figure | BlockKind::Video) {
            kept.push(block);
            continue;
        }
        let assets: &[MediaAsset] =
            if block.kind == BlockKind::Figure { ctx.figures } else { ctx.videos };

        // Fill a missing URL from the matching asset.
        if block.str_field("url").is_none() {
            let matching = assets.iter().find(|asset| {
                block.str_field("storage_key") == Some(asset.storage_key.as_str())
                    || (block.str_field("file_name").is_some()
                        && block.str_field("file_name") == asset.file_name.as_deref())
            });
            if let Some(asset) = matching {
                apply_asset(&mut block, asset);
                report.media_filled += 1;
            }
        }

        let Some(key) = media_key(&block) else {
            // No identity and no asset to fill from: the block renders nothing.
            report.media_dropped += 1;
            continue;
        };

        if ctx.used_media.contains(&key) {
            // Duplicate. Replace with the first unused asset, else drop.
            let replacement = assets
                .iter()
                .find(|asset| !ctx.used_media.contains(&asset_key(asset)))
                .cloned();
            match replacement {
                Some(asset) => {
                    apply_asset(&mut block, &asset);
                    ctx.used_media.insert(asset_key(&asset));
                    report.media_deduped += 1;
                    kept.push(block);
                }
                None => {
                    report.media_dropped += 1;
                }
            }
        } else {
            ctx.used_media.insert(key);
            kept.push(block);
        }
    }
    doc.blocks = kept;
}

// ---------------------------------------------------------------------------
// Pass 6: interactive minima
// ---------------------------------------------------------------------------

fn ensure_interactive_minima(
    doc: &mut NodeDoc,
    ctx: &AutofixContext<'_>,
    report: &mut AutofixReport,
) {
    let Some(citation) = fallback_citation(ctx.preferred_fallback, ctx.allowed_chunks) else {
        return;
    };
    let topic = doc
        .concept_keys
        .first()
        .cloned()
        .unwrap_or_else(|| doc.title.clone());

    while doc.count_kind(&BlockKind::QuickCheck) < ctx.requirements.min_quick_checks {
        let id = fresh_block_id(doc);
        let block = Block::new(BlockKind::QuickCheck)
            .with_id(id)
            .with_field(
                "question",
                json!(format!("In your own words, what is the key idea behind {topic}?")),
            )
            .with_field("answer", json!("Summarize the cited excerpt in one or two sentences."));
        let mut block = block;
        block.citations.push(citation.clone());
        doc.blocks.push(block);
        report.interactive_added += 1;
    }

    while doc.count_kind(&BlockKind::Flashcard) < ctx.requirements.min_flashcards {
        let id = fresh_block_id(doc);
        let mut block = Block::new(BlockKind::Flashcard)
            .with_id(id)
            .with_field("front", json!(format!("Define: {topic}")))
            .with_field("back", json!("See the cited source excerpt."));
        block.citations.push(citation.clone());
        doc.blocks.push(block);
        report.interactive_added += 1;
    }
}

// ---------------------------------------------------------------------------
// Pass 7: objectives sync
// ---------------------------------------------------------------------------

fn sync_objectives(doc: &mut NodeDoc, ctx: &AutofixContext<'_>, report: &mut AutofixReport) {
    if ctx.blueprint_objectives.is_empty() {
        return;
    }
    let missing: Vec<String> = ctx
        .blueprint_objectives
        .iter()
        .filter(|objective| !objective_covered(doc, objective))
        .cloned()
        .collect();
    if missing.is_empty() {
        return;
    }

    if let Some(block) = doc.blocks.iter_mut().find(|b| b.kind == BlockKind::Objectives) {
        let mut items = block.string_list("items");
        for objective in &missing {
            if !items.iter().any(|item| item.eq_ignore_ascii_case(objective)) {
                items.push(objective.clone());
                report.objectives_added += 1;
            }
        }
        block.set_string_list("items", &items);
    } else {
        let id = fresh_block_id(doc);
        let mut block = Block::new(BlockKind::Objectives).with_id(id);
        block.set_string_list("items", &missing);
        if let Some(citation) = fallback_citation(ctx.preferred_fallback, ctx.allowed_chunks) {
            block.citations.push(citation);
        }
        report.objectives_added += missing.len();
        // Objectives lead the doc, after a leading heading when present.
        let insert_at = usize::from(
            doc.blocks.first().map(|b| b.kind == BlockKind::Heading).unwrap_or(false),
        );
        doc.blocks.insert(insert_at, block);
    }
}

fn objective_covered(doc: &NodeDoc, objective: &str) -> bool {
    if doc
        .blocks
        .iter()
        .filter(|b| b.kind == BlockKind::Objectives)
        .any(|b| {
            b.string_list("items")
                .iter()
                .any(|item| item.eq_ignore_ascii_case(objective))
        })
    {
        return true;
    }
    doc.mentions(objective)
}

// ---------------------------------------------------------------------------
// Pass 8: quick-check-after-teaching
// ---------------------------------------------------------------------------

fn enforce_teach_before_test(doc: &mut NodeDoc, report: &mut AutofixReport) {
    let mut taught: HashSet<String> = HashSet::new();
    let mut index = 0;
    // Each iteration either advances or strictly reduces the untaught set for
    // the block at `index`, so the loop terminates.
    while index < doc.blocks.len() {
        let block = &doc.blocks[index];
        if block.kind == BlockKind::QuickCheck {
            let cited: Vec<String> = block.cited_chunk_ids();
            let missing: Vec<String> = cited
                .iter()
                .filter(|id| !taught.contains(*id))
                .cloned()
                .collect();
            if !missing.is_empty() {
                if let Some(target) = covering_position(doc, index, &taught, &cited) {
                    let moved = doc.blocks.remove(index);
                    doc.blocks.insert(target, moved);
                    report.quick_checks_moved += 1;
                    // Re-examine the block now occupying `index`.
                    continue;
                }
                // No later teaching block covers the gap: teach it here.
                let excerpt = excerpt_paragraph(doc, &missing);
                doc.blocks.insert(index, excerpt);
                report.excerpts_inserted += 1;
                continue;
            }
        }
        if doc.blocks[index].kind.is_teaching() {
            for id in doc.blocks[index].cited_chunk_ids() {
                taught.insert(id);
            }
        }
        index += 1;
    }
}

/// The position the quick-check at `index` should move to so every cited
/// chunk is taught by an earlier block, if such a position exists.
fn covering_position(
    doc: &NodeDoc,
    index: usize,
    taught: &HashSet<String>,
    cited: &[String],
) -> Option<usize> {
    let mut future = taught.clone();
    for j in (index + 1)..doc.blocks.len() {
        let block = &doc.blocks[j];
        if block.kind.is_teaching() {
            for id in block.cited_chunk_ids() {
                future.insert(id);
            }
        }
        if cited.iter().all(|id| future.contains(id)) {
            // After removing `index`, block j sits at j-1; inserting at j
            // places the quick-check immediately after it.
            return Some(j);
        }
    }
    None
}

fn excerpt_paragraph(doc: &NodeDoc, missing: &[String]) -> Block {
    let mut ordered: Vec<String> = missing.to_vec();
    ordered.sort_unstable();
    let id = fresh_block_id(doc);
    let mut block = Block::new(BlockKind::Paragraph)
        .with_id(id)
        .with_text("Relevant excerpt: review the cited source material before the next check.");
    block.citations = ordered.into_iter().map(Citation::new).collect();
    block
}

// ---------------------------------------------------------------------------
// Pass 9: must-cite injection
// ---------------------------------------------------------------------------

fn inject_must_cite(doc: &mut NodeDoc, ctx: &AutofixContext<'_>, report: &mut AutofixReport) {
    if ctx.must_cite.is_empty() {
        return;
    }
    let cited = doc.all_cited_chunk_ids();
    let mut missing: Vec<&String> = ctx
        .must_cite
        .iter()
        .filter(|id| !cited.contains(*id) && ctx.allowed_chunks.contains(*id))
        .collect();
    if missing.is_empty() {
        return;
    }
    missing.sort_unstable();

    if let Some(block) = doc
        .blocks
        .iter_mut()
        .find(|b| b.kind.accepts_injected_citations())
    {
        for id in missing {
            block.citations.push(Citation::new(id.clone()));
            report.must_cite_injected += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 10: minima padding
// ---------------------------------------------------------------------------

/// Rotating template sentences for padding paragraphs.
const PADDING_SENTENCES: &[&str] = &[
    "Take a moment to restate the idea above in your own words.",
    "Work through the cited excerpt slowly and note any term you cannot define.",
    "Connect this point back to the lesson goal before moving on.",
    "Sketch a quick example of your own that exercises this idea.",
    "Compare this explanation with the source material and note any difference.",
];

fn pad_to_minima(doc: &mut NodeDoc, ctx: &AutofixContext<'_>, report: &mut AutofixReport) {
    let citation = fallback_citation(ctx.preferred_fallback, ctx.allowed_chunks);
    let reqs = ctx.requirements;

    let structural: &[(BlockKind, usize)] = &[
        (BlockKind::Heading, reqs.min_headings),
        (BlockKind::Paragraph, reqs.min_paragraphs),
        (BlockKind::Callout, reqs.min_callouts),
        (BlockKind::WhyItMatters, reqs.min_why_it_matters),
        (BlockKind::Intuition, reqs.min_intuition),
        (BlockKind::MentalModel, reqs.min_mental_models),
        (BlockKind::CommonMistakes, reqs.min_pitfalls),
        (BlockKind::Steps, reqs.min_steps),
        (BlockKind::Checklist, reqs.min_checklist),
        (BlockKind::Connections, reqs.min_connections),
        (BlockKind::Table, reqs.min_tables),
    ];

    for (kind, minimum) in structural {
        let mut padding_index = 0;
        while doc.count_kind(kind) < *minimum {
            let block = padding_block(doc, kind.clone(), padding_index, citation.as_ref());
            doc.blocks.push(block);
            report.padding_added += 1;
            padding_index += 1;
        }
    }

    // Worked example callout.
    if reqs.require_example && !has_worked_example(doc) {
        let id = fresh_block_id(doc);
        let mut block = Block::new(BlockKind::Callout)
            .with_id(id)
            .with_field("title", json!("Worked example"))
            .with_field("variant", json!("tip"))
            .with_text("Apply the idea above to a concrete case, step by step, using the cited source.");
        if let Some(citation) = &citation {
            block.citations.push(citation.clone());
        }
        doc.blocks.push(block);
        report.padding_added += 1;
    }

    // Media requirement: satisfied with an available figure asset.
    if reqs.require_media && !has_media(doc) {
        if let Some(asset) = ctx.figures.first() {
            let id = fresh_block_id(doc);
            let mut block = Block::new(BlockKind::Figure)
                .with_id(id)
                .with_field("caption", json!(doc.title.clone()));
            apply_asset(&mut block, asset);
            if let Some(citation) = &citation {
                block.citations.push(citation.clone());
            }
            doc.blocks.push(block);
            report.padding_added += 1;
        }
    }

    // Word-count padding paragraphs, rotating through the template set.
    let mut sentence_index = 0;
    while doc.word_count() < reqs.min_word_count {
        let id = fresh_block_id(doc);
        let sentence = PADDING_SENTENCES[sentence_index % PADDING_SENTENCES.len()];
        let mut block = Block::new(BlockKind::Paragraph).with_id(id).with_text(sentence);
        if let Some(citation) = &citation {
            block.citations.push(citation.clone());
        }
        doc.blocks.push(block);
        report.padding_added += 1;
        sentence_index += 1;
    }
}

fn padding_block(
    doc: &NodeDoc,
    kind: BlockKind,
    padding_index: usize,
    citation: Option<&Citation>,
) -> Block {
    let id = fresh_block_id(doc);
    let sentence = PADDING_SENTENCES[padding_index % PADDING_SENTENCES.len()];
    let mut block = match kind {
        BlockKind::Heading => Block::new(BlockKind::Heading)
            .with_id(id)
            .with_text(doc.title.clone())
            .with_field("level", json!(2)),
        BlockKind::Steps => {
            let mut b = Block::new(BlockKind::Steps).with_id(id);
            b.set_string_list(
                "items",
                &[
                    "Read the cited excerpt.".to_owned(),
                    "Restate the key idea.".to_owned(),
                    "Apply it to an example.".to_owned(),
                ],
            );
            b
        }
        BlockKind::Checklist => {
            let mut b = Block::new(BlockKind::Checklist).with_id(id);
            b.set_string_list(
                "items",
                &[
                    "I can explain this idea without notes.".to_owned(),
                    "I can point to where the source covers it.".to_owned(),
                ],
            );
            b
        }
        BlockKind::Table => Block::new(BlockKind::Table)
            .with_id(id)
            .with_field("columns", json!(["Term", "Meaning"]))
            .with_field("rows", json!([["(see source)", "(see source)"]]))
            .with_field("caption", json!("Key terms")),
        other => Block::new(other).with_id(id).with_text(sentence),
    };
    if block.kind.requires_citations() {
        if let Some(citation) = citation {
            block.citations.push(citation.clone());
        }
    }
    block
}

fn has_worked_example(doc: &NodeDoc) -> bool {
    doc.blocks.iter().any(|b| {
        b.kind == BlockKind::Callout && b.str_field("title") == Some("Worked example")
    })
}

fn has_media(doc: &NodeDoc) -> bool {
    doc.blocks
        .iter()
        .any(|b| matches!(b.kind, BlockKind::Figure | BlockKind::Video))
}

// ---------------------------------------------------------------------------
// Pass 11: auto-diagram
// ---------------------------------------------------------------------------

fn synthesize_diagram(doc: &mut NodeDoc, ctx: &AutofixContext<'_>, report: &mut AutofixReport) {
    if ctx.requirements.min_diagrams == 0 || doc.count_kind(&BlockKind::Diagram) > 0 {
        return;
    }
    let labels: Vec<String> = if ctx.concept_keys.is_empty() {
        doc.title.split_whitespace().take(4).map(str::to_owned).collect()
    } else {
        ctx.concept_keys.iter().take(4).cloned().collect()
    };
    let svg = flow_svg(&labels);
    let id = fresh_block_id(doc);
    let mut block = Block::new(BlockKind::Diagram)
        .with_id(id)
        .with_field("kind", json!("svg"))
        .with_field("svg", json!(svg))
        .with_field("caption", json!(format!("Overview: {}", doc.title)));
    if let Some(citation) = fallback_citation(ctx.preferred_fallback, ctx.allowed_chunks) {
        block.citations.push(citation);
    }
    doc.blocks.push(block);
    report.diagrams_synthesized += 1;
}

/// A simple left-to-right flow of up to four labeled boxes.
fn flow_svg(labels: &[String]) -> String {
    let count = labels.len().clamp(1, 4);
    let width = count * 150;
    let mut svg = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {width} 80" width="{width}" height="80">"#
    );
    for (index, label) in labels.iter().take(4).enumerate() {
        let x = index * 150 + 10;
        let escaped = label
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;");
        svg.push_str(&format!(
            r#"<rect x="{x}" y="20" width="120" height="40" rx="6" fill="none" stroke="currentColor"/><text x="{tx}" y="44" text-anchor="middle" font-size="12">{escaped}</text>"#,
            tx = x + 60,
        ));
        if index + 1 < count {
            let ax = x + 120;
            svg.push_str(&format!(
                r#"<line x1="{ax}" y1="40" x2="{lx}" y2="40" stroke="currentColor" marker-end="none"/>"#,
                lx = ax + 30,
            ));
        }
    }
    svg.push_str("</svg>");
    svg
}

// ---------------------------------------------------------------------------
// Pass 12: threading references
// ---------------------------------------------------------------------------

fn insert_threading(doc: &mut NodeDoc, ctx: &AutofixContext<'_>, report: &mut AutofixReport) {
    let mut mentions = Vec::new();
    if let Some(prev) = &ctx.threading.prev_title {
        if !doc.mentions(prev) {
            mentions.push(format!("This builds on \"{prev}\"."));
        }
    }
    if let Some(module) = &ctx.threading.module_title {
        if !doc.mentions(module) {
            mentions.push(format!("You are working through the \"{module}\" module."));
        }
    }
    if let Some(next) = &ctx.threading.next_title {
        if !doc.mentions(next) {
            mentions.push(format!("Up next: \"{next}\"."));
        }
    }
    if mentions.is_empty() {
        return;
    }
    let id = fresh_block_id(doc);
    let mut block = Block::new(BlockKind::Paragraph)
        .with_id(id)
        .with_text(mentions.join(" "));
    if let Some(citation) = fallback_citation(ctx.preferred_fallback, ctx.allowed_chunks) {
        block.citations.push(citation);
    }
    doc.blocks.push(block);
    report.threading_inserted += 1;
}
