//! Deterministic markup sanitizers for diagram and equation content.

use regex::Regex;
use std::sync::LazyLock;

static SCRIPT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("hardcoded regex")
});

static UNCLOSED_SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*$").expect("hardcoded regex"));

static EVENT_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    // on*="..." / on*='...' / bare on*=value, inside a tag.
    Regex::new(r#"(?i)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).expect("hardcoded regex")
});

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*```[a-zA-Z]*\s*$").expect("hardcoded regex")
});

/// TeX commands with filesystem or shell reach. Equations never need them.
static TEX_COMMANDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\(input|include|write|openout|read|immediate|csname|catcode)\b")
        .expect("hardcoded regex")
});

/// Strip `<script>` elements and `on*` event attributes from SVG markup.
pub fn sanitize_svg(svg: &str) -> String {
    let without_scripts = SCRIPT_TAG.replace_all(svg, "");
    let without_scripts = UNCLOSED_SCRIPT.replace_all(&without_scripts, "");
    EVENT_ATTR.replace_all(&without_scripts, "").into_owned()
}

/// Result of cleaning a Mermaid source: the cleaned diagram text plus any
/// trailing prose lines that belong in a caption instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MermaidCleanup {
    pub source: String,
    pub caption_lines: Vec<String>,
}

/// Remove wrapping code fences and peel trailing prose off a Mermaid block.
///
/// Generators often append an explanatory sentence after the diagram; a
/// trailing line with no Mermaid syntax markers is moved to the caption.
pub fn sanitize_mermaid(raw: &str) -> MermaidCleanup {
    let unfenced = CODE_FENCE.replace_all(raw, "");
    let mut lines: Vec<&str> = unfenced.lines().collect();

    // Trim blank edges.
    while lines.first().is_some_and(|l| l.trim().is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    let mut caption_lines = Vec::new();
    while lines.len() > 1 {
        let last = lines.last().expect("non-empty").trim();
        if last.is_empty() {
            lines.pop();
            continue;
        }
        if has_mermaid_syntax(last) {
            break;
        }
        caption_lines.push(last.to_owned());
        lines.pop();
    }
    caption_lines.reverse();

    MermaidCleanup {
        source: lines.join("\n"),
        caption_lines,
    }
}

/// Heuristic for "this line is diagram syntax, not prose".
fn has_mermaid_syntax(line: &str) -> bool {
    const KEYWORDS: &[&str] = &[
        "graph",
        "flowchart",
        "sequenceDiagram",
        "classDiagram",
        "stateDiagram",
        "erDiagram",
        "gantt",
        "pie",
        "mindmap",
        "subgraph",
        "end",
        "participant",
        "note",
        "loop",
        "alt",
        "else",
        "opt",
    ];
    let trimmed = line.trim();
    let first_word = trimmed.split_whitespace().next().unwrap_or("");
    if KEYWORDS.contains(&first_word) {
        return true;
    }
    trimmed.contains("-->")
        || trimmed.contains("->>")
        || trimmed.contains("---")
        || trimmed.contains("-.-")
        || trimmed.contains("==>")
        || trimmed.contains("::")
        || (trimmed.contains('[') && trimmed.contains(']'))
        || (trimmed.contains('{') && trimmed.contains('}'))
        || trimmed.contains("|")
}

/// Strip TeX commands that reach outside math mode. The equation body is
/// preserved; only the dangerous command token is removed.
pub fn sanitize_latex(tex: &str) -> String {
    TEX_COMMANDS.replace_all(tex, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn svg_scripts_are_removed() {
        let dirty = r#"<svg><script>alert(1)</script><rect width="4"/></svg>"#;
        let clean = sanitize_svg(dirty);
        assert!(!clean.contains("script"));
        assert!(clean.contains("<rect"));
    }

    #[test]
    fn svg_unclosed_script_is_removed() {
        let dirty = r#"<svg><rect/><script>while(true){}"#;
        let clean = sanitize_svg(dirty);
        assert!(!clean.contains("script"));
        assert!(clean.contains("<rect/>"));
    }

    #[test]
    fn svg_event_attrs_are_removed() {
        let dirty = r#"<svg onload="evil()"><circle onclick='x()' r="3"/></svg>"#;
        let clean = sanitize_svg(dirty);
        assert!(!clean.to_lowercase().contains("onload"));
        assert!(!clean.to_lowercase().contains("onclick"));
        assert!(clean.contains(r#"r="3""#));
    }

    #[test]
    fn svg_sanitization_is_idempotent() {
        let dirty = r#"<svg onload="evil()"><script>x</script><rect/></svg>"#;
        let once = sanitize_svg(dirty);
        assert_eq!(sanitize_svg(&once), once);
    }

    #[test]
    fn mermaid_fences_are_stripped() {
        let raw = "```mermaid\ngraph TD\nA[Start] --> B[End]\n```";
        let cleaned = sanitize_mermaid(raw);
        assert_eq!(cleaned.source, "graph TD\nA[Start] --> B[End]");
        assert!(cleaned.caption_lines.is_empty());
    }

    #[test]
    fn mermaid_trailing_prose_becomes_caption() {
        let raw = "graph TD\nA[Load] --> B[Validate]\nThis shows the validation flow.";
        let cleaned = sanitize_mermaid(raw);
        assert_eq!(cleaned.source, "graph TD\nA[Load] --> B[Validate]");
        assert_eq!(cleaned.caption_lines, vec!["This shows the validation flow.".to_owned()]);
    }

    #[test]
    fn mermaid_syntax_lines_stay_in_source() {
        let raw = "graph TD\nA --> B";
        let cleaned = sanitize_mermaid(raw);
        assert_eq!(cleaned.source, raw);
    }

    #[test]
    fn latex_dangerous_commands_are_stripped() {
        let tex = r"E = mc^2 \input{/etc/passwd}";
        let clean = sanitize_latex(tex);
        assert!(!clean.contains("input"));
        assert!(clean.contains("E = mc^2"));
    }
}
