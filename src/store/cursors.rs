//! Per-consumer event cursors for tie-safe incremental consumption.

use chrono::{DateTime, Utc};

use super::ContentStore;
use crate::error::Result;

/// The last observed (event time, event ID) for a (user, consumer) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCursor {
    pub last_event_time: DateTime<Utc>,
    pub last_event_id: String,
}

impl EventCursor {
    /// Whether an event at (time, id) is strictly after this cursor.
    /// Ties on time fall back to the event ID.
    pub fn is_after(&self, time: DateTime<Utc>, id: &str) -> bool {
        time > self.last_event_time
            || (time == self.last_event_time && id > self.last_event_id.as_str())
    }
}

impl ContentStore {
    pub async fn event_cursor(
        &self,
        user_id: &str,
        consumer: &str,
    ) -> Result<Option<EventCursor>> {
        let row: Option<(DateTime<Utc>, String)> = sqlx::query_as(
            "SELECT last_event_time, last_event_id FROM user_event_cursors
             WHERE user_id = ? AND consumer = ?",
        )
        .bind(user_id)
        .bind(consumer)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(last_event_time, last_event_id)| EventCursor {
            last_event_time,
            last_event_id,
        }))
    }

    /// Advance the cursor inside the same transaction as the consumer's side
    /// effects. Only moves forward; a stale write is a no-op.
    pub async fn advance_event_cursor_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: &str,
        consumer: &str,
        event_time: DateTime<Utc>,
        event_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_event_cursors (user_id, consumer, last_event_time, last_event_id)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (user_id, consumer) DO UPDATE SET
                last_event_time = excluded.last_event_time,
                last_event_id = excluded.last_event_id
             WHERE excluded.last_event_time > user_event_cursors.last_event_time
                OR (excluded.last_event_time = user_event_cursors.last_event_time
                    AND excluded.last_event_id > user_event_cursors.last_event_id)",
        )
        .bind(user_id)
        .bind(consumer)
        .bind(event_time)
        .bind(event_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_tie_breaks_on_event_id() {
        let at = Utc::now();
        let cursor = EventCursor { last_event_time: at, last_event_id: "b".into() };
        assert!(!cursor.is_after(at, "a"));
        assert!(!cursor.is_after(at, "b"));
        assert!(cursor.is_after(at, "c"));
        assert!(cursor.is_after(at + chrono::Duration::seconds(1), "a"));
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let store = ContentStore::connect_in_memory().await.expect("store");
        let at = Utc::now();

        let mut tx = store.begin().await.expect("tx");
        ContentStore::advance_event_cursor_tx(&mut tx, "u1", "planner", at, "e5")
            .await
            .expect("advance");
        tx.commit().await.expect("commit");

        // A stale write (same time, smaller id) must not win.
        let mut tx = store.begin().await.expect("tx");
        ContentStore::advance_event_cursor_tx(&mut tx, "u1", "planner", at, "e3")
            .await
            .expect("advance");
        tx.commit().await.expect("commit");

        let cursor = store.event_cursor("u1", "planner").await.expect("load").expect("exists");
        assert_eq!(cursor.last_event_id, "e5");
    }
}
