//! Decision-trace rows targeted by the compactor.
//!
//! Table names are dynamic (the compactor sweeps a configured list), so the
//! queries interpolate a validated identifier rather than binding it.

use chrono::{DateTime, Utc};

use super::ContentStore;
use crate::error::{Error, Result};

/// One trace row's compaction-relevant columns.
#[derive(Debug, Clone)]
pub struct TraceRow {
    pub id: String,
    pub candidates: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Reject table names that are not plain identifiers. The compactor's table
/// list comes from config, not user input, but the queries are interpolated
/// and this keeps that path closed.
fn validate_table_name(table: &str) -> Result<()> {
    let ok = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::MissingInput(format!("invalid trace table name: {table}")))
    }
}

impl ContentStore {
    /// Page of trace rows older than `cutoff`, strictly after the cursor
    /// (occurred_at, id), oldest first.
    pub async fn trace_page(
        &self,
        table: &str,
        cutoff: DateTime<Utc>,
        after: Option<(DateTime<Utc>, String)>,
        limit: usize,
    ) -> Result<Vec<TraceRow>> {
        validate_table_name(table)?;
        let rows: Vec<(String, Option<String>, DateTime<Utc>)> = match after {
            Some((time, id)) => {
                let sql = format!(
                    "SELECT id, candidates, occurred_at FROM {table}
                     WHERE occurred_at <= ? AND (occurred_at > ? OR (occurred_at = ? AND id > ?))
                     ORDER BY occurred_at, id LIMIT ?",
                );
                sqlx::query_as(&sql)
                    .bind(cutoff)
                    .bind(time)
                    .bind(time)
                    .bind(id)
                    .bind(limit as i64)
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT id, candidates, occurred_at FROM {table}
                     WHERE occurred_at <= ? ORDER BY occurred_at, id LIMIT ?",
                );
                sqlx::query_as(&sql)
                    .bind(cutoff)
                    .bind(limit as i64)
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(rows
            .into_iter()
            .map(|(id, candidates, occurred_at)| TraceRow { id, candidates, occurred_at })
            .collect())
    }

    pub async fn update_trace_candidates(
        &self,
        table: &str,
        id: &str,
        candidates: &str,
    ) -> Result<()> {
        validate_table_name(table)?;
        let sql = format!("UPDATE {table} SET candidates = ? WHERE id = ?");
        sqlx::query(&sql)
            .bind(candidates)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn insert_trace(
        &self,
        table: &str,
        id: &str,
        candidates: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<()> {
        validate_table_name(table)?;
        let sql = format!(
            "INSERT INTO {table} (id, stage, candidates, occurred_at) VALUES (?, NULL, ?, ?)",
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(candidates)
            .bind(occurred_at)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
