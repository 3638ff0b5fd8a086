//! Citation normalization rules.

use std::collections::HashSet;

use crate::doc::model::{Citation, CitationLoc};

/// Maximum stored quote length in bytes (UTF-8 safe truncation).
pub const MAX_QUOTE_BYTES: usize = 240;

/// Whether a chunk ID parses as a UUID.
pub fn is_valid_uuid(id: &str) -> bool {
    uuid::Uuid::parse_str(id).is_ok()
}

/// Canonical hyphenated lowercase form of a chunk UUID.
pub fn normalize_chunk_id(id: &str) -> Option<String> {
    uuid::Uuid::parse_str(id).ok().map(|u| u.to_string())
}

/// Truncate to at most `max_bytes` without splitting a UTF-8 sequence.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Normalize a single citation in place against the allowed chunk set.
///
/// Returns false when the citation must be dropped (invalid or disallowed
/// chunk ID). Otherwise: the ID is canonicalized, the quote truncated, and
/// loc fields repaired (negatives clamped to 0, inverted ranges coerced to
/// 0/0).
pub fn normalize_citation(citation: &mut Citation, allowed: &HashSet<String>) -> bool {
    let normalized = match normalize_chunk_id(&citation.chunk_id) {
        Some(id) => id,
        None => return false,
    };
    if !allowed.contains(&normalized) {
        return false;
    }
    citation.chunk_id = normalized;

    if let Some(quote) = &citation.quote {
        if quote.len() > MAX_QUOTE_BYTES {
            citation.quote = Some(truncate_utf8(quote, MAX_QUOTE_BYTES).to_owned());
        }
    }

    if let Some(loc) = &mut citation.loc {
        repair_loc(loc);
    }
    true
}

fn repair_loc(loc: &mut CitationLoc) {
    if let Some(page) = loc.page {
        if page < 0 {
            loc.page = Some(0);
        }
    }
    if let Some(start) = loc.start {
        if start < 0 {
            loc.start = Some(0);
        }
    }
    if let Some(end) = loc.end {
        if end < 0 {
            loc.end = Some(0);
        }
    }
    if let (Some(start), Some(end)) = (loc.start, loc.end) {
        if start > end {
            loc.start = Some(0);
            loc.end = Some(0);
        }
    }
}

/// Pick the backfill citation for a block left with no citations: the first
/// preferred chunk that is in the allowed set, else the smallest allowed ID.
pub fn fallback_citation(
    preferred: &[String],
    allowed: &HashSet<String>,
) -> Option<Citation> {
    for id in preferred {
        if let Some(normalized) = normalize_chunk_id(id) {
            if allowed.contains(&normalized) {
                return Some(Citation::new(normalized));
            }
        }
    }
    let mut sorted: Vec<&String> = allowed.iter().collect();
    sorted.sort_unstable();
    sorted.first().map(|id| Citation::new((*id).clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK_A: &str = "11111111-1111-4111-8111-111111111111";
    const CHUNK_B: &str = "22222222-2222-4222-8222-222222222222";

    fn allowed() -> HashSet<String> {
        [CHUNK_A, CHUNK_B].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn invalid_uuid_is_dropped() {
        let mut citation = Citation::new("not-a-uuid");
        assert!(!normalize_citation(&mut citation, &allowed()));
    }

    #[test]
    fn disallowed_chunk_is_dropped() {
        let mut citation = Citation::new("33333333-3333-4333-8333-333333333333");
        assert!(!normalize_citation(&mut citation, &allowed()));
    }

    #[test]
    fn uppercase_id_is_canonicalized() {
        let mut citation = Citation::new(CHUNK_A.to_uppercase());
        assert!(normalize_citation(&mut citation, &allowed()));
        assert_eq!(citation.chunk_id, CHUNK_A);
    }

    #[test]
    fn quote_truncation_is_utf8_safe() {
        // Multibyte character straddles the 240-byte boundary.
        let quote = format!("{}é", "a".repeat(239));
        let mut citation = Citation::new(CHUNK_A);
        citation.quote = Some(quote);
        assert!(normalize_citation(&mut citation, &allowed()));
        let stored = citation.quote.unwrap();
        assert!(stored.len() <= MAX_QUOTE_BYTES);
        assert_eq!(stored, "a".repeat(239));
    }

    #[test]
    fn negative_loc_fields_are_zeroed() {
        let mut citation = Citation::new(CHUNK_A);
        citation.loc = Some(CitationLoc { page: Some(-3), start: Some(-1), end: Some(10) });
        assert!(normalize_citation(&mut citation, &allowed()));
        let loc = citation.loc.unwrap();
        assert_eq!(loc.page, Some(0));
        assert_eq!(loc.start, Some(0));
        assert_eq!(loc.end, Some(10));
    }

    #[test]
    fn inverted_range_is_coerced_to_zero() {
        let mut citation = Citation::new(CHUNK_A);
        citation.loc = Some(CitationLoc { page: None, start: Some(80), end: Some(20) });
        assert!(normalize_citation(&mut citation, &allowed()));
        let loc = citation.loc.unwrap();
        assert_eq!((loc.start, loc.end), (Some(0), Some(0)));
    }

    #[test]
    fn fallback_prefers_the_preferred_list() {
        let citation = fallback_citation(&[CHUNK_B.to_owned()], &allowed()).expect("some");
        assert_eq!(citation.chunk_id, CHUNK_B);
    }

    #[test]
    fn fallback_uses_smallest_allowed_when_no_preference_matches() {
        let citation = fallback_citation(&["junk".to_owned()], &allowed()).expect("some");
        assert_eq!(citation.chunk_id, CHUNK_A);
    }

    #[test]
    fn fallback_empty_allowed_is_none() {
        assert!(fallback_citation(&[], &HashSet::new()).is_none());
    }
}
