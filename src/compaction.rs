//! Age-based compaction of oversized decision-trace JSON.
//!
//! Old trace rows carry large `candidates` payloads that are rarely read
//! again. The compactor truncates arrays to a few kept items plus a
//! sentinel describing what was dropped; anything still over budget is
//! replaced by the sentinel alone. Paging is cursor-based on
//! (occurred_at, id) with a per-invocation time and row budget.

use chrono::{Duration, Utc};
use serde_json::{json, Value};

use std::sync::Arc;
use std::time::Instant;

use crate::config::CompactionConfig;
use crate::error::Result;
use crate::store::ContentStore;

/// Tables swept when the caller does not name any.
pub const DEFAULT_TRACE_TABLES: &[&str] = &["structural_decision_trace", "decision_trace"];

/// Page size for the row cursor.
const PAGE_SIZE: usize = 100;

/// Statistics from one compaction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub scanned: usize,
    pub compacted: usize,
    pub skipped: usize,
    /// True when the time or row budget stopped the pass early.
    pub budget_exhausted: bool,
}

pub struct TraceCompactor {
    store: Arc<ContentStore>,
    config: CompactionConfig,
}

impl TraceCompactor {
    pub fn new(store: Arc<ContentStore>, config: CompactionConfig) -> Self {
        Self { store, config }
    }

    /// Compact the default tables.
    pub async fn run(&self) -> Result<CompactionReport> {
        self.run_tables(DEFAULT_TRACE_TABLES).await
    }

    /// Compact the named tables, oldest rows first, within budget.
    pub async fn run_tables(&self, tables: &[&str]) -> Result<CompactionReport> {
        let started = Instant::now();
        let cutoff = Utc::now() - Duration::days(self.config.min_age_days);
        let mut report = CompactionReport::default();

        'tables: for table in tables {
            let mut cursor = None;
            loop {
                if report.scanned >= self.config.max_rows
                    || started.elapsed().as_millis() as u64 >= self.config.max_millis
                {
                    report.budget_exhausted = true;
                    break 'tables;
                }
                let page = self
                    .store
                    .trace_page(table, cutoff, cursor.clone(), PAGE_SIZE)
                    .await?;
                if page.is_empty() {
                    break;
                }
                cursor = page.last().map(|row| (row.occurred_at, row.id.clone()));

                for row in page {
                    report.scanned += 1;
                    let Some(candidates) = &row.candidates else {
                        report.skipped += 1;
                        continue;
                    };
                    if candidates.len() <= self.config.max_bytes {
                        report.skipped += 1;
                        continue;
                    }
                    match compact_candidates(candidates, self.config.max_bytes, self.config.max_items)
                    {
                        Some(compacted) => {
                            if let Err(error) = self
                                .store
                                .update_trace_candidates(table, &row.id, &compacted)
                                .await
                            {
                                tracing::warn!(%error, table, row_id = %row.id, "trace compaction write failed");
                                report.skipped += 1;
                            } else {
                                report.compacted += 1;
                            }
                        }
                        None => {
                            report.skipped += 1;
                        }
                    }
                    if report.scanned >= self.config.max_rows {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            scanned = report.scanned,
            compacted = report.compacted,
            skipped = report.skipped,
            budget_exhausted = report.budget_exhausted,
            "trace compaction pass complete"
        );
        Ok(report)
    }
}

/// Compact one candidates payload. Returns `None` when the payload does not
/// parse (left untouched and counted as skipped).
fn compact_candidates(raw: &str, max_bytes: usize, max_items: usize) -> Option<String> {
    let original_bytes = raw.len();
    let value: Value = serde_json::from_str(raw).ok()?;

    let compacted = match value {
        Value::Array(items) => {
            let original_count = items.len();
            let kept: Vec<Value> = items.into_iter().take(max_items).collect();
            let kept_count = kept.len();
            let mut with_sentinel: Vec<Value> = kept;
            with_sentinel.push(sentinel(original_count, original_bytes, kept_count));
            let rendered = Value::Array(with_sentinel);
            if rendered.to_string().len() > max_bytes {
                // Still over budget: drop the kept items entirely.
                Value::Array(vec![sentinel(original_count, original_bytes, 0)])
            } else {
                rendered
            }
        }
        Value::Object(map) => json!({
            "_compacted": true,
            "original_bytes": original_bytes,
            "original_keys": map.len(),
            "original_type": "object",
        }),
        other => json!({
            "_compacted": true,
            "original_bytes": original_bytes,
            "original_type": json_type_name(&other),
        }),
    };
    Some(compacted.to_string())
}

fn sentinel(original_count: usize, original_bytes: usize, kept: usize) -> Value {
    json!({
        "_compacted": true,
        "original_count": original_count,
        "original_bytes": original_bytes,
        "kept": kept,
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big_array(items: usize, item_bytes: usize) -> String {
        let payload = "x".repeat(item_bytes);
        let items: Vec<Value> = (0..items).map(|i| json!({ "i": i, "payload": payload })).collect();
        Value::Array(items).to_string()
    }

    fn compactor(store: Arc<ContentStore>, config: CompactionConfig) -> TraceCompactor {
        TraceCompactor::new(store, config)
    }

    fn small_config() -> CompactionConfig {
        CompactionConfig {
            min_age_days: 14,
            max_bytes: 512,
            max_items: 3,
            max_rows: 100,
            max_millis: 10_000,
        }
    }

    #[tokio::test]
    async fn oversized_old_arrays_are_truncated_with_sentinel() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let old = Utc::now() - Duration::days(30);
        store
            .insert_trace("decision_trace", "t1", &big_array(20, 40), old)
            .await
            .unwrap();

        let report = compactor(store.clone(), small_config()).run().await.unwrap();
        assert_eq!(report.compacted, 1);

        let page = store
            .trace_page("decision_trace", Utc::now(), None, 10)
            .await
            .unwrap();
        let value: Value = serde_json::from_str(page[0].candidates.as_deref().unwrap()).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 4, "3 kept + sentinel");
        let sentinel = items.last().unwrap();
        assert_eq!(sentinel["_compacted"], true);
        assert_eq!(sentinel["original_count"], 20);
        assert_eq!(sentinel["kept"], 3);
    }

    #[tokio::test]
    async fn still_oversized_payload_keeps_only_the_sentinel() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let old = Utc::now() - Duration::days(30);
        // Each kept item alone exceeds the byte budget.
        store
            .insert_trace("decision_trace", "t1", &big_array(5, 2000), old)
            .await
            .unwrap();

        let report = compactor(store.clone(), small_config()).run().await.unwrap();
        assert_eq!(report.compacted, 1);

        let page = store
            .trace_page("decision_trace", Utc::now(), None, 10)
            .await
            .unwrap();
        let value: Value = serde_json::from_str(page[0].candidates.as_deref().unwrap()).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 1, "sentinel only");
        assert_eq!(items[0]["kept"], 0);
    }

    #[tokio::test]
    async fn young_and_small_rows_are_untouched() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let young = Utc::now() - Duration::days(2);
        let old = Utc::now() - Duration::days(30);
        store
            .insert_trace("decision_trace", "young", &big_array(20, 40), young)
            .await
            .unwrap();
        store
            .insert_trace("decision_trace", "small", &json!([1, 2]).to_string(), old)
            .await
            .unwrap();

        let report = compactor(store.clone(), small_config()).run().await.unwrap();
        assert_eq!(report.compacted, 0);
        // Only the old-but-small row is scanned; the young one is filtered
        // out by the age cutoff.
        assert_eq!(report.scanned, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn object_payload_gets_object_sentinel() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let old = Utc::now() - Duration::days(30);
        let big_object = json!({
            "a": "x".repeat(600),
            "b": "y".repeat(600),
        });
        store
            .insert_trace("structural_decision_trace", "t1", &big_object.to_string(), old)
            .await
            .unwrap();

        let report = compactor(store.clone(), small_config()).run().await.unwrap();
        assert_eq!(report.compacted, 1);

        let page = store
            .trace_page("structural_decision_trace", Utc::now(), None, 10)
            .await
            .unwrap();
        let value: Value = serde_json::from_str(page[0].candidates.as_deref().unwrap()).unwrap();
        assert_eq!(value["_compacted"], true);
        assert_eq!(value["original_keys"], 2);
        assert_eq!(value["original_type"], "object");
    }

    #[tokio::test]
    async fn row_budget_stops_the_pass() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let old = Utc::now() - Duration::days(30);
        for index in 0..5 {
            store
                .insert_trace("decision_trace", &format!("t{index}"), &big_array(20, 40), old)
                .await
                .unwrap();
        }

        let config = CompactionConfig { max_rows: 2, ..small_config() };
        let report = compactor(store.clone(), config).run().await.unwrap();
        assert!(report.budget_exhausted);
        assert!(report.scanned <= 2);
    }

    #[tokio::test]
    async fn compaction_is_idempotent() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let old = Utc::now() - Duration::days(30);
        store
            .insert_trace("decision_trace", "t1", &big_array(20, 40), old)
            .await
            .unwrap();

        let runner = compactor(store.clone(), small_config());
        runner.run().await.unwrap();
        let after_first = store
            .trace_page("decision_trace", Utc::now(), None, 10)
            .await
            .unwrap()[0]
            .candidates
            .clone();

        let report = runner.run().await.unwrap();
        assert_eq!(report.compacted, 0, "already-compacted rows are under budget");
        let after_second = store
            .trace_page("decision_trace", Utc::now(), None, 10)
            .await
            .unwrap()[0]
            .candidates
            .clone();
        assert_eq!(after_first, after_second);
    }
}
