//! Per-template structural minima for generated docs.

use serde::{Deserialize, Serialize};

use crate::store::nodes::NodeKind;

/// Named doc templates. The template is chosen upstream (node metadata);
/// unrecognized names fall back to Narrative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocTemplate {
    Narrative,
    Workshop,
    Reference,
}

impl DocTemplate {
    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "workshop" => Self::Workshop,
            "reference" => Self::Reference,
            _ => Self::Narrative,
        }
    }
}

impl std::fmt::Display for DocTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Narrative => f.write_str("narrative"),
            Self::Workshop => f.write_str("workshop"),
            Self::Reference => f.write_str("reference"),
        }
    }
}

/// Structural minima a finished doc must satisfy. Fixed per
/// (node kind × template); premium mode raises several of them.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateRequirements {
    pub min_word_count: usize,
    pub min_headings: usize,
    pub min_paragraphs: usize,
    pub min_callouts: usize,
    pub min_quick_checks: usize,
    pub min_flashcards: usize,
    pub min_diagrams: usize,
    pub min_steps: usize,
    pub min_checklist: usize,
    pub min_connections: usize,
    pub min_pitfalls: usize,
    pub min_why_it_matters: usize,
    pub min_intuition: usize,
    pub min_mental_models: usize,
    pub min_tables: usize,
    pub require_example: bool,
    pub require_media: bool,
}

impl TemplateRequirements {
    /// Minima for a (node kind, template) pair.
    pub fn for_node(kind: NodeKind, template: DocTemplate) -> Self {
        let base = match (kind, template) {
            (NodeKind::Lesson, DocTemplate::Narrative) => Self {
                min_word_count: 550,
                min_headings: 2,
                min_paragraphs: 5,
                min_callouts: 1,
                min_quick_checks: 2,
                min_flashcards: 1,
                min_diagrams: 0,
                min_steps: 0,
                min_checklist: 0,
                min_connections: 1,
                min_pitfalls: 1,
                min_why_it_matters: 1,
                min_intuition: 1,
                min_mental_models: 0,
                min_tables: 0,
                require_example: true,
                require_media: false,
            },
            (NodeKind::Lesson, DocTemplate::Workshop) => Self {
                min_word_count: 450,
                min_headings: 2,
                min_paragraphs: 3,
                min_callouts: 1,
                min_quick_checks: 2,
                min_flashcards: 1,
                min_diagrams: 0,
                min_steps: 1,
                min_checklist: 1,
                min_connections: 0,
                min_pitfalls: 1,
                min_why_it_matters: 0,
                min_intuition: 0,
                min_mental_models: 0,
                min_tables: 0,
                require_example: true,
                require_media: false,
            },
            (NodeKind::Lesson, DocTemplate::Reference) => Self {
                min_word_count: 400,
                min_headings: 3,
                min_paragraphs: 3,
                min_callouts: 0,
                min_quick_checks: 1,
                min_flashcards: 2,
                min_diagrams: 0,
                min_steps: 0,
                min_checklist: 0,
                min_connections: 0,
                min_pitfalls: 0,
                min_why_it_matters: 0,
                min_intuition: 0,
                min_mental_models: 0,
                min_tables: 1,
                require_example: false,
                require_media: false,
            },
            (NodeKind::Module, _) => Self {
                min_word_count: 200,
                min_headings: 1,
                min_paragraphs: 2,
                min_callouts: 0,
                min_quick_checks: 0,
                min_flashcards: 0,
                min_diagrams: 0,
                min_steps: 0,
                min_checklist: 0,
                min_connections: 1,
                min_pitfalls: 0,
                min_why_it_matters: 1,
                min_intuition: 0,
                min_mental_models: 0,
                min_tables: 0,
                require_example: false,
                require_media: false,
            },
            (NodeKind::Capstone, _) => Self {
                min_word_count: 500,
                min_headings: 2,
                min_paragraphs: 3,
                min_callouts: 1,
                min_quick_checks: 1,
                min_flashcards: 0,
                min_diagrams: 0,
                min_steps: 2,
                min_checklist: 1,
                min_connections: 1,
                min_pitfalls: 1,
                min_why_it_matters: 0,
                min_intuition: 0,
                min_mental_models: 0,
                min_tables: 0,
                require_example: true,
                require_media: false,
            },
            (NodeKind::Review, _) => Self {
                min_word_count: 300,
                min_headings: 1,
                min_paragraphs: 2,
                min_callouts: 0,
                min_quick_checks: 3,
                min_flashcards: 3,
                min_diagrams: 0,
                min_steps: 0,
                min_checklist: 0,
                min_connections: 0,
                min_pitfalls: 0,
                min_why_it_matters: 0,
                min_intuition: 0,
                min_mental_models: 0,
                min_tables: 0,
                require_example: false,
                require_media: false,
            },
        };
        base
    }

    /// Premium quality mode: ~1.35× words, extra paragraphs and callouts,
    /// and at least one diagram on narrative lessons.
    pub fn premium(mut self, kind: NodeKind, template: DocTemplate) -> Self {
        self.min_word_count = (self.min_word_count as f64 * 1.35).round() as usize;
        self.min_paragraphs += 1;
        self.min_callouts += 1;
        if kind == NodeKind::Lesson && template == DocTemplate::Narrative {
            self.min_diagrams = self.min_diagrams.max(1);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_template_falls_back_to_narrative() {
        assert_eq!(DocTemplate::from_str_lossy("surprise"), DocTemplate::Narrative);
    }

    #[test]
    fn premium_raises_word_count_and_forces_diagram() {
        let base = TemplateRequirements::for_node(NodeKind::Lesson, DocTemplate::Narrative);
        let premium = base.clone().premium(NodeKind::Lesson, DocTemplate::Narrative);
        assert_eq!(premium.min_word_count, (base.min_word_count as f64 * 1.35).round() as usize);
        assert_eq!(premium.min_paragraphs, base.min_paragraphs + 1);
        assert!(premium.min_diagrams >= 1);
    }

    #[test]
    fn premium_leaves_workshop_diagrams_alone() {
        let premium = TemplateRequirements::for_node(NodeKind::Lesson, DocTemplate::Workshop)
            .premium(NodeKind::Lesson, DocTemplate::Workshop);
        assert_eq!(premium.min_diagrams, 0);
    }

    #[test]
    fn review_nodes_lean_on_probes() {
        let reqs = TemplateRequirements::for_node(NodeKind::Review, DocTemplate::Narrative);
        assert!(reqs.min_quick_checks >= 3);
        assert!(reqs.min_flashcards >= 3);
    }
}
