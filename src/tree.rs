//! Least-squares regression tree shared by the tree ensembles

use ndarray::{ArrayView1, ArrayView2};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Growth limits for a single tree
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    /// Maximum depth (unbounded when `None`)
    pub max_depth: Option<usize>,
    /// Minimum rows needed to try a split
    pub min_samples_split: usize,
    /// Minimum rows on each side of a split
    pub min_samples_leaf: usize,
    /// Features drawn per split (all when `None`)
    pub max_features: Option<usize>,
    /// L2 penalty on leaf values; 0 gives plain means
    pub leaf_l2: f64,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            leaf_l2: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// A fitted tree stored as a flat node arena, root at index 0
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    left: Vec<usize>,
    right: Vec<usize>,
}

struct Grower<'x, 'y, 'r, R> {
    x: ArrayView2<'x, f64>,
    y: ArrayView1<'y, f64>,
    params: TreeParams,
    rng: &'r mut R,
    nodes: Vec<Node>,
}

impl RegressionTree {
    /// Grow a tree on the rows listed in `rows` (repeats allowed, for bootstrap samples)
    pub fn fit<R: Rng>(
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        rows: Vec<usize>,
        params: TreeParams,
        rng: &mut R,
    ) -> Self {
        let mut grower = Grower {
            x,
            y,
            params,
            rng,
            nodes: Vec::new(),
        };
        grower.grow(rows, 0);
        Self {
            nodes: grower.nodes,
        }
    }

    /// Prediction for a single feature row
    pub fn predict_row(&self, row: ArrayView1<'_, f64>) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        if self.nodes.is_empty() {
            0
        } else {
            walk(&self.nodes, 0)
        }
    }
}

impl<R: Rng> Grower<'_, '_, '_, R> {
    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let idx = self.nodes.len();
        let (sum, _) = self.sums(&rows);
        self.nodes.push(Node::Leaf {
            value: self.leaf_value(sum, rows.len()),
        });

        let depth_exhausted = self.params.max_depth.is_some_and(|max| depth >= max);
        if depth_exhausted || rows.len() < self.params.min_samples_split.max(2) {
            return idx;
        }

        if let Some(split) = self.best_split(&rows, sum) {
            let left = self.grow(split.left, depth + 1);
            let right = self.grow(split.right, depth + 1);
            self.nodes[idx] = Node::Split {
                feature: split.feature,
                threshold: split.threshold,
                left,
                right,
            };
        }
        idx
    }

    fn sums(&self, rows: &[usize]) -> (f64, usize) {
        (rows.iter().map(|&r| self.y[r]).sum(), rows.len())
    }

    fn leaf_value(&self, sum: f64, count: usize) -> f64 {
        let denom = count as f64 + self.params.leaf_l2;
        if denom > 0.0 { sum / denom } else { 0.0 }
    }

    fn gain_term(&self, sum: f64, count: usize) -> f64 {
        let denom = count as f64 + self.params.leaf_l2;
        if denom > 0.0 { sum * sum / denom } else { 0.0 }
    }

    fn candidate_features(&mut self) -> Vec<usize> {
        let n_features = self.x.ncols();
        let mut features: Vec<usize> = (0..n_features).collect();
        if let Some(k) = self.params.max_features {
            if k < n_features {
                features.shuffle(&mut *self.rng);
                features.truncate(k.max(1));
                features.sort_unstable();
            }
        }
        features
    }

    fn best_split(&mut self, rows: &[usize], total_sum: f64) -> Option<SplitCandidate> {
        let n = rows.len();
        let min_leaf = self.params.min_samples_leaf.max(1);
        if n < 2 * min_leaf {
            return None;
        }
        let parent = self.gain_term(total_sum, n);
        let mut best: Option<(usize, f64, f64)> = None;

        for feature in self.candidate_features() {
            let mut sorted = rows.to_vec();
            // stable sort keeps tie order deterministic
            sorted.sort_by(|&a, &b| self.x[[a, feature]].total_cmp(&self.x[[b, feature]]));

            let mut left_sum = 0.0;
            for i in 1..n {
                left_sum += self.y[sorted[i - 1]];
                let lo = self.x[[sorted[i - 1], feature]];
                let hi = self.x[[sorted[i], feature]];
                if i < min_leaf || n - i < min_leaf || lo >= hi {
                    continue;
                }
                let score = self.gain_term(left_sum, i)
                    + self.gain_term(total_sum - left_sum, n - i)
                    - parent;
                if score > 1e-12 && best.as_ref().map_or(true, |b| score > b.2) {
                    let mid = lo + (hi - lo) / 2.0;
                    best = Some((feature, if mid < hi { mid } else { lo }, score));
                }
            }
        }

        best.map(|(feature, threshold, _)| {
            let (left, right): (Vec<usize>, Vec<usize>) = rows
                .iter()
                .copied()
                .partition(|&r| self.x[[r, feature]] <= threshold);
            SplitCandidate {
                feature,
                threshold,
                left,
                right,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array1};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_step_function_is_learned() {
        let x = array![[1.0], [2.0], [3.0], [10.0], [11.0], [12.0]];
        let y = array![5.0, 5.0, 5.0, 50.0, 50.0, 50.0];
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let tree = RegressionTree::fit(x.view(), y.view(), (0..6).collect(), TreeParams::default(), &mut rng);

        assert_eq!(tree.n_leaves(), 2);
        assert_relative_eq!(tree.predict_row(array![2.5].view()), 5.0);
        assert_relative_eq!(tree.predict_row(array![20.0].view()), 50.0);
    }

    /// Residual-style fit: targets and rng live shorter than the records
    fn fit_on_residuals(records: ArrayView2<'_, f64>, offset: f64) -> RegressionTree {
        let residuals: Array1<f64> = records.column(0).mapv(|v| v - offset);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        RegressionTree::fit(records, residuals.view(), (0..records.nrows()).collect(), TreeParams::default(), &mut rng)
    }

    #[test]
    fn test_fit_with_borrowed_records_and_local_targets() {
        let x = array![[1.0], [2.0], [8.0], [9.0]];
        let tree = fit_on_residuals(x.view(), 1.0);

        assert_relative_eq!(tree.predict_row(array![1.0].view()), 0.0);
        assert_relative_eq!(tree.predict_row(array![9.0].view()), 8.0);
    }

    #[test]
    fn test_constant_target_is_a_single_leaf() {
        let x = array![[1.0, 0.0], [2.0, 1.0], [3.0, 0.0]];
        let y: Array1<f64> = Array1::from_elem(3, 7.0);
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let tree = RegressionTree::fit(x.view(), y.view(), vec![0, 1, 2], TreeParams::default(), &mut rng);

        assert_eq!(tree.n_leaves(), 1);
        assert_eq!(tree.depth(), 0);
        assert_relative_eq!(tree.predict_row(array![9.0, 9.0].view()), 7.0);
    }

    #[test]
    fn test_max_depth_is_respected() {
        let x = Array1::linspace(0.0, 9.0, 10).insert_axis(ndarray::Axis(1));
        let y = Array1::linspace(0.0, 90.0, 10);
        let params = TreeParams {
            max_depth: Some(2),
            ..TreeParams::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let tree = RegressionTree::fit(x.view(), y.view(), (0..10).collect(), params, &mut rng);
        assert!(tree.depth() <= 2);
        assert!(tree.n_leaves() <= 4);
    }

    #[test]
    fn test_leaf_l2_shrinks_values() {
        let x = array![[1.0], [1.0]];
        let y = array![4.0, 4.0];
        let params = TreeParams {
            leaf_l2: 2.0,
            ..TreeParams::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let tree = RegressionTree::fit(x.view(), y.view(), vec![0, 1], params, &mut rng);
        assert_relative_eq!(tree.predict_row(array![1.0].view()), 2.0);
    }
}
