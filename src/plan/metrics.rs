//! Content metrics and user progression statistics for runtime planning.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::doc::model::{BlockKind, NodeDoc};
use crate::store::nodes::{NodeKind, PathNode};
use crate::store::states::ProgressionEvent;

/// Floor for any estimated lesson duration.
const MIN_ESTIMATED_MINUTES: i64 = 4;

/// Per-node content summary used by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub title: String,
    pub kind: NodeKind,
    pub module_index: Option<i64>,
    pub lesson_index: Option<i64>,
    pub word_count: usize,
    pub block_count: usize,
    pub quick_checks: usize,
    pub flashcards: usize,
    pub estimated_minutes: i64,
}

/// Summarize one node's rendered doc.
///
/// `estimated_minutes = ceil(words / wpm) + ceil(0.6·quick_checks +
/// 0.3·flashcards)`, floored at 4. Nodes without a doc get the floor.
pub fn summarize_node(node: &PathNode, doc: Option<&NodeDoc>, wpm: usize) -> NodeSummary {
    let (word_count, block_count, quick_checks, flashcards) = match doc {
        Some(doc) => (
            doc.word_count(),
            doc.blocks.len(),
            doc.count_kind(&BlockKind::QuickCheck),
            doc.count_kind(&BlockKind::Flashcard),
        ),
        None => (0, 0, 0, 0),
    };

    let reading = (word_count as f64 / wpm.max(1) as f64).ceil() as i64;
    let interactive = (0.6 * quick_checks as f64 + 0.3 * flashcards as f64).ceil() as i64;
    let estimated_minutes = (reading + interactive).max(MIN_ESTIMATED_MINUTES);

    NodeSummary {
        node_id: node.id.clone(),
        title: node.title.clone(),
        kind: node.kind,
        module_index: node.module_index(),
        lesson_index: node.lesson_index(),
        word_count,
        block_count,
        quick_checks,
        flashcards,
        estimated_minutes,
    }
}

/// Aggregated user progression statistics over a bounded event history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserStats {
    pub avg_score: f64,
    pub avg_attempts: f64,
    pub avg_dwell_seconds: f64,
    pub completion_rate: f64,
    pub recent_30d_count: usize,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Derive stats from progression events (oldest first). Empty history gives
/// neutral defaults: 0.7 score, full completion assumed.
pub fn user_stats(events: &[ProgressionEvent]) -> UserStats {
    if events.is_empty() {
        return UserStats {
            avg_score: 0.7,
            avg_attempts: 1.0,
            avg_dwell_seconds: 0.0,
            completion_rate: 1.0,
            recent_30d_count: 0,
            last_event_at: None,
        };
    }

    let mean = |values: Vec<f64>| -> f64 {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    };

    let scores: Vec<f64> = events.iter().filter_map(|e| e.score).collect();
    let attempts: Vec<f64> = events.iter().filter_map(|e| e.attempts.map(|a| a as f64)).collect();
    let dwell: Vec<f64> = events.iter().filter_map(|e| e.dwell_seconds).collect();
    let completed = events.iter().filter(|e| e.completed).count();
    let cutoff = Utc::now() - Duration::days(30);

    UserStats {
        avg_score: if scores.is_empty() { 0.7 } else { mean(scores) },
        avg_attempts: if attempts.is_empty() { 1.0 } else { mean(attempts) },
        avg_dwell_seconds: mean(dwell),
        completion_rate: completed as f64 / events.len() as f64,
        recent_30d_count: events.iter().filter(|e| e.occurred_at >= cutoff).count(),
        last_event_at: events.iter().map(|e| e.occurred_at).max(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::model::Block;

    fn node() -> PathNode {
        PathNode {
            id: "n1".into(),
            path_id: "p1".into(),
            position: 0,
            parent_id: None,
            kind: NodeKind::Lesson,
            title: "L".into(),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn estimated_minutes_floor_is_four() {
        let summary = summarize_node(&node(), None, 180);
        assert_eq!(summary.estimated_minutes, 4);
    }

    #[test]
    fn estimated_minutes_formula() {
        let mut doc = NodeDoc::new("L");
        // 360 words → ceil(360/180) = 2 reading minutes.
        let words = vec!["word"; 360].join(" ");
        doc.blocks.push(Block::new(BlockKind::Paragraph).with_id("b1").with_text(words));
        // 3 quick_checks + 2 flashcards → ceil(1.8 + 0.6) = 3.
        for index in 0..3 {
            doc.blocks.push(Block::new(BlockKind::QuickCheck).with_id(format!("q{index}")));
        }
        for index in 0..2 {
            doc.blocks.push(Block::new(BlockKind::Flashcard).with_id(format!("f{index}")));
        }

        let summary = summarize_node(&node(), Some(&doc), 180);
        assert_eq!(summary.word_count, 361); // block words + title
        assert_eq!(summary.quick_checks, 3);
        assert_eq!(summary.flashcards, 2);
        // ceil(361/180)=3 + ceil(2.4)=3 → 6.
        assert_eq!(summary.estimated_minutes, 6);
    }

    #[test]
    fn empty_history_gives_neutral_stats() {
        let stats = user_stats(&[]);
        assert_eq!(stats.avg_score, 0.7);
        assert_eq!(stats.completion_rate, 1.0);
        assert!(stats.last_event_at.is_none());
    }

    #[test]
    fn stats_aggregate_events() {
        let at = Utc::now();
        let event = |score: f64, completed: bool| ProgressionEvent {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: "u1".into(),
            path_id: None,
            node_id: None,
            event_type: "lesson".into(),
            score: Some(score),
            attempts: Some(2),
            dwell_seconds: Some(300.0),
            completed,
            occurred_at: at,
        };
        let stats = user_stats(&[event(0.8, true), event(0.6, false)]);
        assert!((stats.avg_score - 0.7).abs() < 1e-9);
        assert!((stats.completion_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.recent_30d_count, 2);
        assert_eq!(stats.last_event_at, Some(at));
    }
}
