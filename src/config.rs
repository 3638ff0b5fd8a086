//! Environment-driven stage configuration.
//!
//! Every toggle is read through a safe parser: malformed or missing values
//! fall back to the documented default, never panic. Stage code reads these
//! at call sites; the pipeline holds a hot-swappable snapshot.

use std::env;

/// Read an env var as f64, falling back to `default` when unset or malformed.
pub fn env_f64(key: &str, default: f64) -> f64 {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, raw, "malformed float env var, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Read an env var as usize, falling back to `default` when unset or malformed.
pub fn env_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, raw, "malformed integer env var, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Read an env var as i64, falling back to `default` when unset or malformed.
pub fn env_i64(key: &str, default: i64) -> i64 {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, raw, "malformed integer env var, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Read an env var as bool. Accepts 1/0, true/false, yes/no (case-insensitive);
/// anything else falls back to `default`.
pub fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => {
                tracing::warn!(key, raw, "malformed bool env var, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Read a plain string env var, trimmed, `None` when unset or empty.
pub fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Stage config structs
// ---------------------------------------------------------------------------

/// Canonicalizer knobs.
#[derive(Debug, Clone)]
pub struct CanonicalConfig {
    /// Minimum semantic-match score for an automatic redirect.
    pub semantic_soft_min: f64,
}

impl CanonicalConfig {
    pub fn from_env() -> Self {
        Self {
            semantic_soft_min: env_f64("CANONICAL_CONCEPT_SEMANTIC_MIN", 0.70).clamp(0.0, 1.0),
        }
    }
}

impl Default for CanonicalConfig {
    fn default() -> Self {
        Self { semantic_soft_min: 0.70 }
    }
}

/// Grouping refiner thresholds. All in [0, 1].
#[derive(Debug, Clone)]
pub struct GroupingConfig {
    pub merge_threshold: f64,
    pub split_threshold: f64,
    pub strong_bridge: f64,
    pub weak_bridge: f64,
    /// Top-K pairs per file handed to the cross-encoder, 0 disables it.
    pub cross_encoder_top_k: usize,
    /// Block waiting for the user when confidence is insufficient.
    pub wait_for_user: bool,
}

impl GroupingConfig {
    pub fn from_env() -> Self {
        Self {
            merge_threshold: env_f64("PATH_GROUPING_MERGE_THRESHOLD", 0.62).clamp(0.0, 1.0),
            split_threshold: env_f64("PATH_GROUPING_SPLIT_THRESHOLD", 0.38).clamp(0.0, 1.0),
            strong_bridge: env_f64("CONCEPT_BRIDGE_STRONG", 0.55).clamp(0.0, 1.0),
            weak_bridge: env_f64("CONCEPT_BRIDGE_WEAK", 0.42).clamp(0.0, 1.0),
            cross_encoder_top_k: env_usize("PATH_GROUPING_CROSS_ENCODER_TOP_K", 0),
            wait_for_user: env_bool("PATH_GROUPING_WAIT_FOR_USER", false),
        }
    }
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.62,
            split_threshold: 0.38,
            strong_bridge: 0.55,
            weak_bridge: 0.42,
            cross_encoder_top_k: 0,
            wait_for_user: false,
        }
    }
}

/// Trace compactor knobs.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Rows younger than this are never touched.
    pub min_age_days: i64,
    /// Candidates JSON above this byte size is compacted.
    pub max_bytes: usize,
    /// Array items kept before the sentinel.
    pub max_items: usize,
    /// Row budget per invocation.
    pub max_rows: usize,
    /// Wall-clock budget per invocation, milliseconds.
    pub max_millis: u64,
}

impl CompactionConfig {
    pub fn from_env() -> Self {
        Self {
            min_age_days: env_i64("TRACE_COMPACTION_MIN_AGE_DAYS", 14).max(0),
            max_bytes: env_usize("TRACE_COMPACTION_MAX_BYTES", 32 * 1024),
            max_items: env_usize("TRACE_COMPACTION_MAX_ITEMS", 8),
            max_rows: env_usize("TRACE_COMPACTION_MAX_ROWS", 500),
            max_millis: env_i64("TRACE_COMPACTION_MAX_MILLIS", 30_000).max(0) as u64,
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            min_age_days: 14,
            max_bytes: 32 * 1024,
            max_items: 8,
            max_rows: 500,
            max_millis: 30_000,
        }
    }
}

/// Probe selector knobs.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub max_per_node: usize,
    pub max_per_lookahead: usize,
    pub rate_per_hour: usize,
    pub min_info_gain: f64,
    pub testlet_weight: f64,
    pub misconception_boost: f64,
    pub prereq_boost: f64,
    /// Mastery below which a prerequisite counts as unresolved.
    pub min_ready_mastery: f64,
    pub policy_version: String,
}

impl ProbeConfig {
    pub fn from_env() -> Self {
        Self {
            max_per_node: env_usize("ACTIVE_CONCEPT_MAX_PROBES_PER_NODE", 2),
            max_per_lookahead: env_usize("ACTIVE_CONCEPT_MAX_PROBES_PER_LOOKAHEAD", 6),
            rate_per_hour: env_usize("ACTIVE_CONCEPT_PROBE_RATE_PER_HOUR", 12),
            min_info_gain: env_f64("ACTIVE_CONCEPT_MIN_INFO_GAIN", 0.15).clamp(0.0, 1.0),
            testlet_weight: env_f64("ACTIVE_CONCEPT_TESTLET_WEIGHT", 0.5).max(0.0),
            misconception_boost: env_f64("ACTIVE_CONCEPT_MISCONCEPTION_BOOST", 0.2).max(0.0),
            prereq_boost: env_f64("ACTIVE_CONCEPT_PREREQ_BOOST", 0.15).max(0.0),
            min_ready_mastery: env_f64("ACTIVE_CONCEPT_MIN_READY_MASTERY", 0.6).clamp(0.0, 1.0),
            policy_version: env_string("ACTIVE_CONCEPT_PROBE_POLICY_VERSION")
                .unwrap_or_else(|| "v1".to_owned()),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_per_node: 2,
            max_per_lookahead: 6,
            rate_per_hour: 12,
            min_info_gain: 0.15,
            testlet_weight: 0.5,
            misconception_boost: 0.2,
            prereq_boost: 0.15,
            min_ready_mastery: 0.6,
            policy_version: "v1".to_owned(),
        }
    }
}

/// Doc builder knobs.
#[derive(Debug, Clone)]
pub struct DocBuildConfig {
    /// LLM generation attempts before recording a failed run.
    pub max_attempts: usize,
    /// Grounding chunks retrieved per node.
    pub retrieval_k: usize,
    /// Per-chunk excerpt character cap.
    pub excerpt_max_chars: usize,
    /// Excerpt line cap.
    pub excerpt_max_lines: usize,
    /// LLM-assisted meta scrub toggle.
    pub polish_enabled: bool,
    /// Premium quality mode raises template minima.
    pub premium: bool,
    pub prompt_version: String,
}

impl DocBuildConfig {
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_usize("NODE_DOC_MAX_ATTEMPTS", 3).max(1),
            retrieval_k: env_usize("NODE_DOC_RETRIEVAL_K", 12).max(1),
            excerpt_max_chars: env_usize("NODE_DOC_EXCERPT_MAX_CHARS", 700),
            excerpt_max_lines: env_usize("NODE_DOC_EXCERPT_MAX_LINES", 40),
            polish_enabled: env_bool("NODE_DOC_POLISH_ENABLED", false),
            premium: env_bool("NODE_DOC_PREMIUM_QUALITY", false),
            prompt_version: env_string("NODE_DOC_PROMPT_VERSION")
                .unwrap_or_else(|| "node_doc_v1".to_owned()),
        }
    }
}

impl Default for DocBuildConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retrieval_k: 12,
            excerpt_max_chars: 700,
            excerpt_max_lines: 40,
            polish_enabled: false,
            premium: false,
            prompt_version: "node_doc_v1".to_owned(),
        }
    }
}

/// Runtime planner knobs.
#[derive(Debug, Clone)]
pub struct PlanConfig {
    /// Model for LLM refinement; `None` disables refinement.
    pub model: Option<String>,
    /// Words-per-minute assumption for estimated reading time.
    pub wpm: usize,
    /// Progression events considered when deriving user stats.
    pub event_history_limit: usize,
}

impl PlanConfig {
    pub fn from_env() -> Self {
        Self {
            model: env_string("RUNTIME_PLAN_MODEL"),
            wpm: env_usize("RUNTIME_PLAN_WPM", 180).max(60),
            event_history_limit: env_usize("RUNTIME_PLAN_EVENT_LIMIT", 500).max(1),
        }
    }
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self { model: None, wpm: 180, event_history_limit: 500 }
    }
}

/// Pipeline-level knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Concurrent node builds per material set.
    pub node_build_concurrency: usize,
    /// Per-call vector query timeout, milliseconds.
    pub vector_timeout_ms: u64,
    /// Media render limit per path (figures and videos).
    pub render_limit: usize,
    pub image_model: Option<String>,
    pub video_model: Option<String>,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            node_build_concurrency: env_usize("NODE_VIDEOS_PLAN_CONCURRENCY", 4).max(1),
            vector_timeout_ms: env_i64("VECTOR_QUERY_TIMEOUT_MS", 2500).max(100) as u64,
            render_limit: env_usize("NODE_VIDEOS_RENDER_LIMIT", 4),
            image_model: env_string("OPENAI_IMAGE_MODEL"),
            video_model: env_string("OPENAI_VIDEO_MODEL"),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            node_build_concurrency: 4,
            vector_timeout_ms: 2500,
            render_limit: 4,
            image_model: None,
            video_model: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; each test uses a unique key so they
    // can run in parallel.

    #[test]
    fn malformed_float_falls_back_to_default() {
        std::env::set_var("PATHFORGE_TEST_F64", "not-a-number");
        assert_eq!(env_f64("PATHFORGE_TEST_F64", 0.7), 0.7);
        std::env::remove_var("PATHFORGE_TEST_F64");
    }

    #[test]
    fn unset_float_falls_back_to_default() {
        assert_eq!(env_f64("PATHFORGE_TEST_UNSET_F64", 0.42), 0.42);
    }

    #[test]
    fn valid_float_is_parsed() {
        std::env::set_var("PATHFORGE_TEST_F64_OK", "0.85");
        assert_eq!(env_f64("PATHFORGE_TEST_F64_OK", 0.7), 0.85);
        std::env::remove_var("PATHFORGE_TEST_F64_OK");
    }

    #[test]
    fn bool_accepts_common_spellings() {
        std::env::set_var("PATHFORGE_TEST_BOOL", "YES");
        assert!(env_bool("PATHFORGE_TEST_BOOL", false));
        std::env::set_var("PATHFORGE_TEST_BOOL", "0");
        assert!(!env_bool("PATHFORGE_TEST_BOOL", true));
        std::env::set_var("PATHFORGE_TEST_BOOL", "maybe");
        assert!(env_bool("PATHFORGE_TEST_BOOL", true));
        std::env::remove_var("PATHFORGE_TEST_BOOL");
    }

    #[test]
    fn empty_string_env_is_none() {
        std::env::set_var("PATHFORGE_TEST_STR", "   ");
        assert_eq!(env_string("PATHFORGE_TEST_STR"), None);
        std::env::remove_var("PATHFORGE_TEST_STR");
    }

    #[test]
    fn defaults_are_in_documented_ranges() {
        let probe = ProbeConfig::default();
        assert!(probe.max_per_node <= probe.max_per_lookahead);
        assert!((0.0..=1.0).contains(&probe.min_info_gain));

        let grouping = GroupingConfig::default();
        assert!(grouping.split_threshold < grouping.merge_threshold);
        assert!(grouping.weak_bridge < grouping.strong_bridge);
    }
}
