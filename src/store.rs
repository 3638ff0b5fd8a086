//! ContentStore: CRUD operations against the content database.

pub mod concepts;
pub mod cursors;
pub mod docs;
pub mod intakes;
pub mod materials;
pub mod nodes;
pub mod probes;
pub mod states;
pub mod traces;
pub mod variants;

use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

/// Wraps the content database pool. One instance is shared by every stage;
/// all queries go through methods grouped by area in the submodules.
pub struct ContentStore {
    pool: SqlitePool,
}

impl ContentStore {
    /// Connect to (or create) the content database at the given path.
    pub async fn connect(path: &Path) -> Result<Arc<Self>> {
        let pool = crate::db::connect(path).await?;
        Ok(Arc::new(Self { pool }))
    }

    /// In-memory store with the full schema. Used by tests.
    pub async fn connect_in_memory() -> Result<Arc<Self>> {
        let pool = crate::db::connect_in_memory().await?;
        Ok(Arc::new(Self { pool }))
    }

    /// Expose the pool for sub-modules and transactional call sites.
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction. Stage code keeps all writes for one node inside
    /// a single transaction so partial artifacts are never visible.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore").finish_non_exhaustive()
    }
}

/// Parse a JSON TEXT column into `T`, defaulting on NULL or malformed JSON.
///
/// Malformed stored JSON is a data bug, not a request error; readers degrade
/// to the default and the writer path is the place to fix it.
pub(crate) fn parse_json_column<T: serde::de::DeserializeOwned + Default>(
    raw: Option<&str>,
) -> T {
    match raw {
        Some(text) => serde_json::from_str(text).unwrap_or_default(),
        None => T::default(),
    }
}
