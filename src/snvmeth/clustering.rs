use crate::snvmeth::distance::DistanceMatrix;
use crate::snvmeth::tree::{MergeRecord, Tree};
use crate::utils::Result;
use clap::ValueEnum;

/// Linkage rule for the distance between two clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Linkage {
    /// Mean pairwise distance (assumes a molecular clock)
    #[value(alias = "average")]
    Upgma,
    /// Minimum variance increase
    Ward,
    /// Nearest-neighbor distance
    #[value(alias = "min")]
    Single,
    /// Farthest-neighbor distance
    #[value(alias = "max")]
    Complete,
}

impl Linkage {
    pub fn name(self) -> &'static str {
        match self {
            Linkage::Upgma => "UPGMA",
            Linkage::Ward => "WARD",
            Linkage::Single => "SINGLE",
            Linkage::Complete => "COMPLETE",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClusteringConfig {
    pub method: Linkage,
    /// Floor on parent-child height gaps; keeps merge heights strictly
    /// increasing even under tied distances.
    pub min_branch_length: f64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        ClusteringConfig {
            method: Linkage::Upgma,
            min_branch_length: 1e-6,
        }
    }
}

/// Agglomerative clusterer over a precomputed distance matrix.
///
/// O(N^3) time and O(N^2) memory; regions cap N well below the point where
/// that matters.
pub struct HierarchicalClustering {
    config: ClusteringConfig,
}

impl HierarchicalClustering {
    pub fn new(method: Linkage) -> Self {
        HierarchicalClustering {
            config: ClusteringConfig {
                method,
                ..ClusteringConfig::default()
            },
        }
    }

    pub fn with_config(config: ClusteringConfig) -> Self {
        HierarchicalClustering { config }
    }

    pub fn build_tree(&self, dist: &DistanceMatrix, labels: &[String]) -> Result<Tree> {
        let n = dist.size();
        let values: Vec<f64> = (0..n)
            .flat_map(|i| (0..n).map(move |j| dist.get(i, j)))
            .collect();
        self.build_from_values(&values, n, labels)
    }

    /// Builds the tree from a row-major symmetric n x n distance matrix.
    pub fn build_from_values(&self, values: &[f64], n: usize, labels: &[String]) -> Result<Tree> {
        if values.len() != n * n {
            return Err("Distance matrix must be square".to_string());
        }
        if labels.len() != n {
            return Err("Number of labels must match matrix dimension".to_string());
        }

        let mut tree = Tree::new();
        if n == 0 {
            return Ok(tree);
        }
        if n == 1 {
            let leaf = tree.add_leaf(0, &labels[0]);
            tree.set_root(leaf);
            return Ok(tree);
        }

        // Cluster state grows as merges append entries; leaves occupy the
        // first n slots so cluster ids line up with tree node ids.
        let mut node_of: Vec<usize> = Vec::with_capacity(2 * n - 1);
        let mut members: Vec<Vec<usize>> = Vec::with_capacity(2 * n - 1);
        let mut active: Vec<bool> = Vec::with_capacity(2 * n - 1);

        for (i, label) in labels.iter().enumerate() {
            node_of.push(tree.add_leaf(i, label));
            members.push(vec![i]);
            active.push(true);
        }

        let mut merge_records = Vec::with_capacity(n - 1);
        let mut active_count = n;

        while active_count > 1 {
            let mut min_dist = f64::MAX;
            let mut min_pair: Option<(usize, usize)> = None;

            // Ties resolve to the lowest (i, j) because only a strictly
            // smaller distance replaces the current minimum.
            for i in 0..members.len() {
                if !active[i] {
                    continue;
                }
                for j in (i + 1)..members.len() {
                    if !active[j] {
                        continue;
                    }
                    let d = cluster_distance(
                        self.config.method,
                        values,
                        n,
                        &members[i],
                        &members[j],
                    );
                    if d < min_dist {
                        min_dist = d;
                        min_pair = Some((i, j));
                    }
                }
            }

            let (a, b) = match min_pair {
                Some(pair) => pair,
                // Every remaining distance is NaN; leave a forest and let the
                // last created cluster act as root.
                None => break,
            };

            let mut merge_height = distance_to_height(self.config.method, min_dist);
            let max_child_height = tree
                .node(node_of[a])
                .height
                .max(tree.node(node_of[b]).height);
            if merge_height < max_child_height + self.config.min_branch_length {
                merge_height = max_child_height + self.config.min_branch_length;
            }

            let new_node = tree.add_internal(node_of[a], node_of[b], merge_height);
            let new_cluster_id = members.len();
            merge_records.push(MergeRecord {
                cluster_i: a,
                cluster_j: b,
                distance: min_dist,
                new_cluster_id,
                size: members[a].len() + members[b].len(),
            });

            let mut merged = members[a].clone();
            merged.extend_from_slice(&members[b]);
            active[a] = false;
            active[b] = false;
            node_of.push(new_node);
            members.push(merged);
            active.push(true);
            active_count -= 1;
        }

        let root = (0..members.len())
            .rev()
            .find(|&i| active[i])
            .map(|i| node_of[i]);
        if let Some(root) = root {
            tree.set_root(root);
        }
        tree.set_merge_records(merge_records);
        Ok(tree)
    }
}

#[inline]
fn matrix_value(values: &[f64], n: usize, i: usize, j: usize) -> f64 {
    values[i * n + j]
}

fn cluster_distance(
    method: Linkage,
    values: &[f64],
    n: usize,
    cluster_a: &[usize],
    cluster_b: &[usize],
) -> f64 {
    match method {
        Linkage::Upgma => {
            let mut sum = 0.0;
            for &i in cluster_a {
                for &j in cluster_b {
                    sum += matrix_value(values, n, i, j);
                }
            }
            sum / (cluster_a.len() * cluster_b.len()) as f64
        }
        Linkage::Single => {
            let mut min = f64::MAX;
            for &i in cluster_a {
                for &j in cluster_b {
                    min = min.min(matrix_value(values, n, i, j));
                }
            }
            min
        }
        Linkage::Complete => {
            let mut max = 0.0f64;
            for &i in cluster_a {
                for &j in cluster_b {
                    max = max.max(matrix_value(values, n, i, j));
                }
            }
            max
        }
        Linkage::Ward => {
            let mut sum_sq = 0.0;
            for &i in cluster_a {
                for &j in cluster_b {
                    let d = matrix_value(values, n, i, j);
                    sum_sq += d * d;
                }
            }
            let mean_sq = sum_sq / (cluster_a.len() * cluster_b.len()) as f64;
            let size_a = cluster_a.len() as f64;
            let size_b = cluster_b.len() as f64;
            (size_a * size_b / (size_a + size_b)) * mean_sq
        }
    }
}

fn distance_to_height(method: Linkage, distance: f64) -> f64 {
    match method {
        Linkage::Upgma | Linkage::Single | Linkage::Complete => distance / 2.0,
        Linkage::Ward => distance.sqrt() / 2.0,
    }
}
