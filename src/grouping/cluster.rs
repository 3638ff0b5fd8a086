//! Union-find clustering over scored file pairs and bridge detection.

use std::collections::{BTreeMap, HashMap};

/// One scored, unordered file pair.
#[derive(Debug, Clone)]
pub struct ScoredPair {
    pub a: String,
    pub b: String,
    pub score: f64,
}

/// Clustering result: clusters as sorted file-ID lists plus cohesion stats.
#[derive(Debug, Clone)]
pub struct Clustering {
    /// Each cluster's file IDs, sorted; clusters ordered by smallest member.
    pub clusters: Vec<Vec<String>>,
    /// Mean score over within-cluster pairs. 1.0 when no such pair exists.
    pub intra_avg: f64,
    /// Mean score over cross-cluster pairs. 0.0 when no such pair exists.
    pub inter_avg: f64,
}

impl Clustering {
    pub fn cluster_of(&self, file_id: &str) -> Option<usize> {
        self.clusters
            .iter()
            .position(|cluster| cluster.iter().any(|id| id == file_id))
    }
}

struct UnionFind {
    parent: HashMap<String, String>,
}

impl UnionFind {
    fn new(ids: &[String]) -> Self {
        Self {
            parent: ids.iter().map(|id| (id.clone(), id.clone())).collect(),
        }
    }

    fn find(&mut self, id: &str) -> String {
        let parent = self.parent.get(id).cloned().unwrap_or_else(|| id.to_owned());
        if parent == id {
            return parent;
        }
        let root = self.find(&parent);
        self.parent.insert(id.to_owned(), root.clone());
        root
    }

    fn union(&mut self, a: &str, b: &str) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            // Deterministic: the lexically smaller root wins.
            if root_a < root_b {
                self.parent.insert(root_b, root_a);
            } else {
                self.parent.insert(root_a, root_b);
            }
        }
    }
}

/// Cluster files by union-find over pairs scoring at or above the merge
/// threshold.
pub fn cluster(file_ids: &[String], pairs: &[ScoredPair], merge_threshold: f64) -> Clustering {
    let mut uf = UnionFind::new(file_ids);
    for pair in pairs {
        if pair.score >= merge_threshold {
            uf.union(&pair.a, &pair.b);
        }
    }

    let mut by_root: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for id in file_ids {
        by_root.entry(uf.find(id)).or_default().push(id.clone());
    }
    let mut clusters: Vec<Vec<String>> = by_root.into_values().collect();
    for cluster in &mut clusters {
        cluster.sort_unstable();
    }
    clusters.sort();

    let clustering_stub = Clustering { clusters, intra_avg: 1.0, inter_avg: 0.0 };

    let mut intra = Vec::new();
    let mut inter = Vec::new();
    for pair in pairs {
        let same = clustering_stub.cluster_of(&pair.a) == clustering_stub.cluster_of(&pair.b);
        if same {
            intra.push(pair.score);
        } else {
            inter.push(pair.score);
        }
    }
    let mean = |values: &[f64], default: f64| {
        if values.is_empty() {
            default
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    };

    Clustering {
        intra_avg: mean(&intra, 1.0),
        inter_avg: mean(&inter, 0.0),
        ..clustering_stub
    }
}

/// Bridge strength classification for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStrength {
    Strong,
    Medium,
}

/// A file with high similarity to two or more clusters at once.
#[derive(Debug, Clone)]
pub struct BridgeFile {
    pub file_id: String,
    pub strength: BridgeStrength,
    /// The two best per-cluster similarity averages, descending.
    pub top_scores: (f64, f64),
}

/// Detect bridge files: per file, average its pair scores per cluster and
/// classify by the two best cluster averages.
pub fn detect_bridges(
    clustering: &Clustering,
    pairs: &[ScoredPair],
    strong_threshold: f64,
    weak_threshold: f64,
) -> Vec<BridgeFile> {
    if clustering.clusters.len() < 2 {
        return Vec::new();
    }

    // (file, cluster) → scores of pairs touching that cluster.
    let mut per_cluster: HashMap<(String, usize), Vec<f64>> = HashMap::new();
    for pair in pairs {
        if let Some(cluster_b) = clustering.cluster_of(&pair.b) {
            per_cluster
                .entry((pair.a.clone(), cluster_b))
                .or_default()
                .push(pair.score);
        }
        if let Some(cluster_a) = clustering.cluster_of(&pair.a) {
            per_cluster
                .entry((pair.b.clone(), cluster_a))
                .or_default()
                .push(pair.score);
        }
    }

    let mut bridges = Vec::new();
    let mut file_ids: Vec<&String> = clustering.clusters.iter().flatten().collect();
    file_ids.sort_unstable();
    for file_id in file_ids {
        let mut averages: Vec<f64> = (0..clustering.clusters.len())
            .filter_map(|cluster_index| {
                per_cluster
                    .get(&(file_id.clone(), cluster_index))
                    .map(|scores| scores.iter().sum::<f64>() / scores.len() as f64)
            })
            .collect();
        if averages.len() < 2 {
            continue;
        }
        averages.sort_by(|a, b| b.total_cmp(a));
        let (top, second) = (averages[0], averages[1]);

        let strength = if top >= strong_threshold && second >= strong_threshold {
            Some(BridgeStrength::Strong)
        } else if (top >= strong_threshold && second >= weak_threshold)
            || (top >= weak_threshold && second >= weak_threshold)
        {
            Some(BridgeStrength::Medium)
        } else {
            None
        };
        if let Some(strength) = strength {
            bridges.push(BridgeFile {
                file_id: file_id.clone(),
                strength,
                top_scores: (top, second),
            });
        }
    }
    bridges
}
