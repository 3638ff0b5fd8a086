//! Path grouping refinement: cluster material files by multi-signal
//! similarity and revise an intake's proposed path structure.

pub mod cluster;
pub mod refiner;
pub mod similarity;

pub use cluster::{cluster, detect_bridges, BridgeFile, BridgeStrength, Clustering, ScoredPair};
pub use refiner::{
    grouping_equivalent, CrossEncoder, GroupingOutcome, GroupingRefiner, ProposedPath,
    RefineMode, RefineStatus, ThreadNotifier,
};
pub use similarity::{difficulty_summary, jaccard, pair_score};
