//! Grounding excerpt rendering for generation prompts.

use std::collections::HashMap;

use crate::doc::citations::truncate_utf8;
use crate::store::materials::MaterialChunk;

/// Render the excerpts block: one `[chunk_id=…] <text>` line per chunk, in
/// retrieval order, each truncated to `max_chars`, capped at `max_lines`.
pub fn render_excerpts(
    chunk_ids: &[String],
    chunks: &HashMap<String, MaterialChunk>,
    max_chars: usize,
    max_lines: usize,
) -> String {
    let mut lines = Vec::new();
    for id in chunk_ids {
        if lines.len() >= max_lines {
            break;
        }
        let Some(chunk) = chunks.get(id) else { continue };
        let flattened = chunk.text.split_whitespace().collect::<Vec<_>>().join(" ");
        let truncated = truncate_utf8(&flattened, max_chars);
        lines.push(format!("[chunk_id={id}] {truncated}"));
    }
    lines.join("\n")
}
