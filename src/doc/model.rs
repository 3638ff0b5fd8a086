//! Lesson document AST.
//!
//! Docs arrive as LLM JSON and leave as canonical JSON, so the model keeps
//! a typed spine (ids, kinds, citations) and preserves everything else in a
//! flattened map. Unknown block kinds round-trip untouched through
//! [`BlockKind::Other`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current document schema version emitted by the builder.
pub const SCHEMA_VERSION: i64 = 1;

/// Block kind discriminator. Known kinds get variants; anything else is
/// carried verbatim so future kinds survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Heading,
    Paragraph,
    Callout,
    Diagram,
    Table,
    Figure,
    Video,
    Code,
    Divider,
    QuickCheck,
    Flashcard,
    Objectives,
    Prerequisites,
    KeyTakeaways,
    Steps,
    Checklist,
    Connections,
    Glossary,
    Faq,
    WhyItMatters,
    Intuition,
    MentalModel,
    CommonMistakes,
    Misconceptions,
    EdgeCases,
    Heuristics,
    Other(String),
}

impl BlockKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Heading => "heading",
            Self::Paragraph => "paragraph",
            Self::Callout => "callout",
            Self::Diagram => "diagram",
            Self::Table => "table",
            Self::Figure => "figure",
            Self::Video => "video",
            Self::Code => "code",
            Self::Divider => "divider",
            Self::QuickCheck => "quick_check",
            Self::Flashcard => "flashcard",
            Self::Objectives => "objectives",
            Self::Prerequisites => "prerequisites",
            Self::KeyTakeaways => "key_takeaways",
            Self::Steps => "steps",
            Self::Checklist => "checklist",
            Self::Connections => "connections",
            Self::Glossary => "glossary",
            Self::Faq => "faq",
            Self::WhyItMatters => "why_it_matters",
            Self::Intuition => "intuition",
            Self::MentalModel => "mental_model",
            Self::CommonMistakes => "common_mistakes",
            Self::Misconceptions => "misconceptions",
            Self::EdgeCases => "edge_cases",
            Self::Heuristics => "heuristics",
            Self::Other(name) => name,
        }
    }

    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "heading" => Self::Heading,
            "paragraph" => Self::Paragraph,
            "callout" => Self::Callout,
            "diagram" => Self::Diagram,
            "table" => Self::Table,
            "figure" => Self::Figure,
            "video" => Self::Video,
            "code" => Self::Code,
            "divider" => Self::Divider,
            "quick_check" => Self::QuickCheck,
            "flashcard" => Self::Flashcard,
            "objectives" => Self::Objectives,
            "prerequisites" => Self::Prerequisites,
            "key_takeaways" => Self::KeyTakeaways,
            "steps" => Self::Steps,
            "checklist" => Self::Checklist,
            "connections" => Self::Connections,
            "glossary" => Self::Glossary,
            "faq" => Self::Faq,
            "why_it_matters" => Self::WhyItMatters,
            "intuition" => Self::Intuition,
            "mental_model" => Self::MentalModel,
            "common_mistakes" => Self::CommonMistakes,
            "misconceptions" => Self::Misconceptions,
            "edge_cases" => Self::EdgeCases,
            "heuristics" => Self::Heuristics,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Blocks of these kinds must carry at least one citation.
    pub fn requires_citations(&self) -> bool {
        !matches!(
            self,
            Self::Heading | Self::Code | Self::Video | Self::Divider | Self::Other(_)
        )
    }

    /// A teaching block introduces content; quick-checks may only test
    /// material an earlier teaching block has cited.
    pub fn is_teaching(&self) -> bool {
        !matches!(
            self,
            Self::QuickCheck
                | Self::Flashcard
                | Self::Heading
                | Self::Divider
                | Self::Video
                | Self::Code
                | Self::Objectives
                | Self::Prerequisites
                | Self::KeyTakeaways
        )
    }

    /// Eligible to receive must-cite backfill citations.
    pub fn accepts_injected_citations(&self) -> bool {
        matches!(
            self,
            Self::Paragraph | Self::Callout | Self::Figure | Self::Diagram | Self::Table
        )
    }

    pub fn is_probe_candidate(&self) -> bool {
        matches!(self, Self::QuickCheck | Self::Flashcard)
    }
}

impl Serialize for BlockKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BlockKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_str_lossy(&raw))
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source location of a citation quote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CitationLoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

/// A grounding citation pointing at a material chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<CitationLoc>,
}

impl Citation {
    pub fn new(chunk_id: impl Into<String>) -> Self {
        Self { chunk_id: chunk_id.into(), quote: None, loc: None }
    }
}

/// One document block. Kind-specific fields live in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: BlockKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Keys whose string content never counts toward the word budget.
const NON_PROSE_KEYS: &[&str] = &[
    "svg",
    "mermaid",
    "url",
    "storage_key",
    "file_name",
    "kind",
    "language",
    "trigger_after_block_ids",
    "concept_keys",
    "concept_ids",
];

impl Block {
    pub fn new(kind: BlockKind) -> Self {
        Self { id: None, kind, citations: Vec::new(), extra: Map::new() }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.extra.insert("text".to_owned(), Value::String(text.into()));
        self
    }

    pub fn with_citation(mut self, chunk_id: impl Into<String>) -> Self {
        self.citations.push(Citation::new(chunk_id));
        self
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_owned(), value);
        self
    }

    /// Primary prose of this block, wherever the generator put it.
    pub fn text(&self) -> Option<&str> {
        for key in ["text", "body", "content"] {
            if let Some(value) = self.extra.get(key).and_then(|v| v.as_str()) {
                return Some(value);
            }
        }
        None
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        let key = ["text", "body", "content"]
            .iter()
            .find(|k| self.extra.contains_key(**k))
            .copied()
            .unwrap_or("text");
        self.extra.insert(key.to_owned(), Value::String(text.into()));
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    pub fn string_list(&self, key: &str) -> Vec<String> {
        self.extra
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_string_list(&mut self, key: &str, values: &[String]) {
        self.extra.insert(
            key.to_owned(),
            Value::Array(values.iter().cloned().map(Value::String).collect()),
        );
    }

    pub fn bool_field(&self, key: &str) -> bool {
        self.extra.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Chunk IDs cited by this block, in order, without duplicates.
    pub fn cited_chunk_ids(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.citations
            .iter()
            .filter(|c| seen.insert(c.chunk_id.clone()))
            .map(|c| c.chunk_id.clone())
            .collect()
    }

    /// Approximate prose word count across the block's textual fields.
    pub fn word_count(&self) -> usize {
        fn count_value(key: Option<&str>, value: &Value) -> usize {
            if let Some(key) = key {
                if NON_PROSE_KEYS.contains(&key) {
                    return 0;
                }
            }
            match value {
                Value::String(text) => text.split_whitespace().count(),
                Value::Array(items) => items.iter().map(|v| count_value(None, v)).sum(),
                Value::Object(map) => map
                    .iter()
                    .map(|(k, v)| count_value(Some(k.as_str()), v))
                    .sum(),
                _ => 0,
            }
        }
        self.extra
            .iter()
            .map(|(key, value)| count_value(Some(key.as_str()), value))
            .sum()
    }
}

/// A complete lesson document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDoc {
    pub schema_version: i64,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concept_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<i64>,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

impl NodeDoc {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            title: title.into(),
            summary: String::new(),
            concept_keys: Vec::new(),
            estimated_minutes: None,
            blocks: Vec::new(),
        }
    }

    /// Total prose word count: title, summary, and every block.
    pub fn word_count(&self) -> usize {
        self.title.split_whitespace().count()
            + self.summary.split_whitespace().count()
            + self.blocks.iter().map(Block::word_count).sum::<usize>()
    }

    pub fn count_kind(&self, kind: &BlockKind) -> usize {
        self.blocks.iter().filter(|b| &b.kind == kind).count()
    }

    /// Index of a block by its stable ID.
    pub fn index_of(&self, block_id: &str) -> Option<usize> {
        self.blocks
            .iter()
            .position(|b| b.id.as_deref() == Some(block_id))
    }

    /// All chunk IDs cited anywhere in the doc.
    pub fn all_cited_chunk_ids(&self) -> std::collections::HashSet<String> {
        self.blocks
            .iter()
            .flat_map(|b| b.citations.iter().map(|c| c.chunk_id.clone()))
            .collect()
    }

    /// Whether a text fragment appears anywhere in the doc's prose.
    pub fn mentions(&self, needle: &str) -> bool {
        if needle.is_empty() {
            return true;
        }
        let needle = needle.to_lowercase();
        if self.title.to_lowercase().contains(&needle)
            || self.summary.to_lowercase().contains(&needle)
        {
            return true;
        }
        self.blocks.iter().any(|block| {
            block
                .text()
                .map(|t| t.to_lowercase().contains(&needle))
                .unwrap_or(false)
                || block
                    .str_field("title")
                    .map(|t| t.to_lowercase().contains(&needle))
                    .unwrap_or(false)
        })
    }
}
