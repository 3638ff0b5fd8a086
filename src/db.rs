//! Database connection management and embedded migrations.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;

/// Connect to (or create) the content database at the given path.
///
/// Runs embedded migrations, enables WAL mode, and configures a small pool.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    let url = format!("sqlite:{}?mode=rwc", path.display());
    let options = SqliteConnectOptions::from_str(&url)
        .map_err(sqlx::Error::from)?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Connect to an in-memory database. Used by tests; the schema is identical.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Run the embedded schema. Uses raw SQL rather than sqlx::migrate! so the
/// crate carries its schema as a single reviewable constant set.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_CONTENT).execute(pool).await?;
    sqlx::raw_sql(SCHEMA_USER_STATE).execute(pool).await?;
    sqlx::raw_sql(SCHEMA_TELEMETRY).execute(pool).await?;
    Ok(())
}

/// Material sets, files, chunks, concepts, paths, and node documents.
///
/// All tables use `IF NOT EXISTS` so re-running is safe. UUIDs are TEXT;
/// timestamps are RFC 3339 TEXT bound from chrono at the call site.
const SCHEMA_CONTENT: &str = r#"
CREATE TABLE IF NOT EXISTS material_sets (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    source_set_id TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS material_files (
    id TEXT PRIMARY KEY,
    set_id TEXT NOT NULL,
    name TEXT NOT NULL,
    summary_embedding TEXT,
    topic_tokens TEXT,
    domain_tokens TEXT,
    concept_tokens TEXT,
    outline_tokens TEXT,
    difficulty TEXT,
    FOREIGN KEY (set_id) REFERENCES material_sets(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_material_files_set ON material_files(set_id);

CREATE TABLE IF NOT EXISTS material_chunks (
    id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL,
    text TEXT NOT NULL,
    page INTEGER,
    embedding TEXT,
    metadata TEXT,
    extractable INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY (file_id) REFERENCES material_files(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_material_chunks_file ON material_chunks(file_id);

-- Full-text companion for lexical retrieval. Rows are written alongside
-- material_chunks inserts; unextractable chunks are never indexed.
CREATE VIRTUAL TABLE IF NOT EXISTS chunk_fts USING fts5(chunk_id UNINDEXED, content);

CREATE TABLE IF NOT EXISTS concepts (
    id TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    key TEXT NOT NULL,
    name TEXT NOT NULL,
    summary TEXT,
    key_points TEXT,
    canonical_concept_id TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (scope, key)
);
CREATE INDEX IF NOT EXISTS idx_concepts_canonical ON concepts(canonical_concept_id);

CREATE TABLE IF NOT EXISTS concept_mapping_overrides (
    path_concept_id TEXT PRIMARY KEY,
    canonical_concept_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS concept_representations (
    path_concept_id TEXT PRIMARY KEY,
    canonical_concept_id TEXT NOT NULL,
    aliases TEXT NOT NULL,
    method TEXT NOT NULL,
    confidence REAL NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS paths (
    id TEXT PRIMARY KEY,
    set_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    metadata TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_paths_set ON paths(set_id);

CREATE TABLE IF NOT EXISTS path_nodes (
    id TEXT PRIMARY KEY,
    path_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    parent_id TEXT,
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    metadata TEXT,
    FOREIGN KEY (path_id) REFERENCES paths(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_path_nodes_path ON path_nodes(path_id, position);

CREATE TABLE IF NOT EXISTS node_docs (
    node_id TEXT PRIMARY KEY,
    doc TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    sources_hash TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS node_doc_variants (
    id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    doc TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    sources_hash TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (node_id, user_id)
);

CREATE TABLE IF NOT EXISTS node_figures (
    id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    storage_key TEXT NOT NULL,
    file_name TEXT,
    url TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_node_figures_node ON node_figures(node_id);

CREATE TABLE IF NOT EXISTS node_videos (
    id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    storage_key TEXT NOT NULL,
    file_name TEXT,
    url TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_node_videos_node ON node_videos(node_id);

CREATE TABLE IF NOT EXISTS intakes (
    id TEXT PRIMARY KEY,
    set_id TEXT NOT NULL,
    primary_path_id TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS generation_runs (
    id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    user_id TEXT,
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    errors TEXT,
    metrics TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_generation_runs_node ON generation_runs(node_id, created_at);

CREATE TABLE IF NOT EXISTS user_library_counters (
    user_id TEXT PRIMARY KEY,
    docs_built INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
"#;

/// Per-user adaptive state: probes, concept mastery, misconceptions,
/// testlets, exposures, cursors, progression telemetry.
const SCHEMA_USER_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS doc_probes (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    block_id TEXT NOT NULL,
    block_type TEXT NOT NULL,
    concept_keys TEXT NOT NULL,
    concept_ids TEXT NOT NULL,
    info_gain REAL NOT NULL,
    score REAL NOT NULL,
    policy_version TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (user_id, node_id, block_id)
);
CREATE INDEX IF NOT EXISTS idx_doc_probes_user ON doc_probes(user_id, created_at);

CREATE TABLE IF NOT EXISTS user_concept_states (
    user_id TEXT NOT NULL,
    concept_id TEXT NOT NULL,
    mastery REAL NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0,
    epistemic_uncertainty REAL NOT NULL DEFAULT 0,
    aleatoric_uncertainty REAL NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    correct INTEGER NOT NULL DEFAULT 0,
    last_seen_at TEXT,
    next_review_at TEXT,
    PRIMARY KEY (user_id, concept_id)
);

CREATE TABLE IF NOT EXISTS user_misconceptions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    concept_id TEXT NOT NULL,
    description TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_user_misconceptions_user
    ON user_misconceptions(user_id, concept_id, active);

CREATE TABLE IF NOT EXISTS user_testlet_states (
    user_id TEXT NOT NULL,
    testlet_id TEXT NOT NULL,
    alpha REAL NOT NULL DEFAULT 1,
    beta REAL NOT NULL DEFAULT 1,
    PRIMARY KEY (user_id, testlet_id)
);

CREATE TABLE IF NOT EXISTS doc_variant_exposures (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    variant_id TEXT,
    baseline TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    evaluated INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_exposures_pending ON doc_variant_exposures(evaluated, created_at);

CREATE TABLE IF NOT EXISTS doc_variant_outcomes (
    id TEXT PRIMARY KEY,
    exposure_id TEXT NOT NULL UNIQUE,
    metrics TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_event_cursors (
    user_id TEXT NOT NULL,
    consumer TEXT NOT NULL,
    last_event_time TEXT NOT NULL,
    last_event_id TEXT NOT NULL,
    PRIMARY KEY (user_id, consumer)
);

CREATE TABLE IF NOT EXISTS progression_events (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    path_id TEXT,
    node_id TEXT,
    event_type TEXT NOT NULL,
    score REAL,
    attempts INTEGER,
    dwell_seconds REAL,
    completed INTEGER NOT NULL DEFAULT 0,
    occurred_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_progression_user ON progression_events(user_id, occurred_at, id);

CREATE TABLE IF NOT EXISTS node_runs (
    user_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    state TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_score REAL,
    last_seen_at TEXT,
    started_at TEXT,
    completed_at TEXT,
    PRIMARY KEY (user_id, node_id)
);

CREATE TABLE IF NOT EXISTS user_active_nodes (
    user_id TEXT NOT NULL,
    path_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, path_id)
);
"#;

/// Decision traces targeted by the compactor.
const SCHEMA_TELEMETRY: &str = r#"
CREATE TABLE IF NOT EXISTS structural_decision_trace (
    id TEXT PRIMARY KEY,
    stage TEXT,
    candidates TEXT,
    occurred_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_structural_trace_time ON structural_decision_trace(occurred_at, id);

CREATE TABLE IF NOT EXISTS decision_trace (
    id TEXT PRIMARY KEY,
    stage TEXT,
    candidates TEXT,
    occurred_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_decision_trace_time ON decision_trace(occurred_at, id);
"#;
