//! Built-in regressors: a linear baseline and two tree ensembles

use crate::error::ClvError;
use crate::model::{FittedModel, ModelHandle, Regressor};
use crate::tree::{RegressionTree, TreeParams};
use linfa::Dataset;
use linfa_linear::{FittedLinearRegression, LinearRegression};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

fn check_inputs(
    model: &str,
    records: &ArrayView2<'_, f64>,
    targets: &ArrayView1<'_, f64>,
) -> crate::Result<()> {
    if records.nrows() != targets.len() {
        return Err(ClvError::ShapeMismatch {
            expected: format!("{} targets", records.nrows()),
            actual: format!("{} targets", targets.len()),
        });
    }
    if records.nrows() == 0 {
        return Err(ClvError::Fit {
            model: model.to_string(),
            reason: "no training rows".to_string(),
        });
    }
    if records.iter().chain(targets.iter()).any(|v| !v.is_finite()) {
        return Err(ClvError::Fit {
            model: model.to_string(),
            reason: "non-finite value in training data".to_string(),
        });
    }
    Ok(())
}

// ─── Linear baseline ──────────────────────────────────────────────────────────

/// Least squares on standardized features, solved by `linfa-linear`.
///
/// A small ridge term is added as `p` pseudo-rows so the collinear one-hot
/// country columns and constant columns still have a unique solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearBaseline {
    name: String,
    /// Ridge penalty relative to the number of rows
    pub ridge: f64,
}

impl Default for LinearBaseline {
    fn default() -> Self {
        Self {
            name: "linear_regression".to_string(),
            ridge: 1e-6,
        }
    }
}

/// Fitted linear model
#[derive(Debug, Clone)]
pub struct LinearModel {
    means: Array1<f64>,
    scales: Array1<f64>,
    y_mean: f64,
    fitted: FittedLinearRegression<f64>,
}

impl FittedModel for LinearModel {
    fn predict(&self, records: ArrayView2<'_, f64>) -> Array1<f64> {
        use linfa::traits::Predict;

        let scaled = (&records - &self.means) / &self.scales;
        self.fitted.predict(&scaled) + self.y_mean
    }
}

impl Regressor for LinearBaseline {
    fn name(&self) -> &str {
        &self.name
    }

    fn fit(
        &self,
        records: ArrayView2<'_, f64>,
        targets: ArrayView1<'_, f64>,
    ) -> crate::Result<ModelHandle> {
        use linfa::traits::Fit;

        check_inputs(&self.name, &records, &targets)?;
        let (n, p) = records.dim();

        let means = records.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(p));
        let scales = records
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 1e-12 { s } else { 1.0 });
        let z = (&records - &means) / &scales;
        let y_mean = targets.sum() / n as f64;

        let penalty = (self.ridge.max(0.0) * n as f64).max(1e-12).sqrt();
        let ridge_rows = Array2::<f64>::eye(p) * penalty;
        let augmented = ndarray::concatenate(Axis(0), &[z.view(), ridge_rows.view()]).map_err(|e| {
            ClvError::Fit {
                model: self.name.clone(),
                reason: e.to_string(),
            }
        })?;
        let mut y = Array1::zeros(n + p);
        y.slice_mut(s![..n]).assign(&targets.mapv(|v| v - y_mean));

        let fitted = LinearRegression::new()
            .with_intercept(false)
            .fit(&Dataset::new(augmented, y))
            .map_err(|e| ClvError::Fit {
                model: self.name.clone(),
                reason: e.to_string(),
            })?;
        debug!(model = %self.name, intercept = y_mean, params = ?fitted.params(), "Linear fit");

        Ok(Arc::new(LinearModel {
            means,
            scales,
            y_mean,
            fitted,
        }))
    }
}

// ─── Random forest ────────────────────────────────────────────────────────────

/// Bagged regression trees grown in parallel from per-tree seeds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForestRegressor {
    name: String,
    pub n_estimators: usize,
    pub tree: TreeParams,
    pub seed: u64,
}

impl Default for RandomForestRegressor {
    fn default() -> Self {
        Self::new(100, 42)
    }
}

impl RandomForestRegressor {
    pub fn new(n_estimators: usize, seed: u64) -> Self {
        Self {
            name: "random_forest".to_string(),
            n_estimators,
            tree: TreeParams::default(),
            seed,
        }
    }

    pub fn with_tree_params(mut self, tree: TreeParams) -> Self {
        self.tree = tree;
        self
    }
}

/// Fitted forest; predicts the mean over trees
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestModel {
    trees: Vec<RegressionTree>,
}

impl FittedModel for ForestModel {
    fn predict(&self, records: ArrayView2<'_, f64>) -> Array1<f64> {
        let n_trees = self.trees.len().max(1) as f64;
        records
            .outer_iter()
            .map(|row| self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / n_trees)
            .collect()
    }
}

impl Regressor for RandomForestRegressor {
    fn name(&self) -> &str {
        &self.name
    }

    fn fit(
        &self,
        records: ArrayView2<'_, f64>,
        targets: ArrayView1<'_, f64>,
    ) -> crate::Result<ModelHandle> {
        check_inputs(&self.name, &records, &targets)?;
        let n_samples = records.nrows();

        let trees: Vec<RegressionTree> = (0..self.n_estimators.max(1))
            .into_par_iter()
            .map(|tree_idx| {
                let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(tree_idx as u64));
                let sample: Vec<usize> = (0..n_samples)
                    .map(|_| rng.gen_range(0..n_samples))
                    .collect();
                RegressionTree::fit(records, targets, sample, self.tree, &mut rng)
            })
            .collect();

        Ok(Arc::new(ForestModel { trees }))
    }
}

// ─── Gradient boosting ────────────────────────────────────────────────────────

/// Gradient boosting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostingConfig {
    /// Number of boosting rounds
    pub n_estimators: usize,
    /// Shrinkage applied to each tree
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Row fraction sampled per round
    pub subsample: f64,
    /// L2 penalty on leaf values
    pub reg_lambda: f64,
    pub seed: u64,
}

impl Default for GradientBoostingConfig {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.1,
            max_depth: 6,
            min_samples_leaf: 1,
            subsample: 1.0,
            reg_lambda: 1.0,
            seed: 42,
        }
    }
}

/// Squared-error gradient boosting over regression trees
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostingRegressor {
    name: String,
    pub config: GradientBoostingConfig,
}

impl Default for GradientBoostingRegressor {
    fn default() -> Self {
        Self::new(GradientBoostingConfig::default())
    }
}

impl GradientBoostingRegressor {
    pub fn new(config: GradientBoostingConfig) -> Self {
        Self {
            name: "gradient_boosting".to_string(),
            config,
        }
    }
}

/// Fitted boosted ensemble
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostedModel {
    base_score: f64,
    learning_rate: f64,
    trees: Vec<RegressionTree>,
}

impl FittedModel for BoostedModel {
    fn predict(&self, records: ArrayView2<'_, f64>) -> Array1<f64> {
        records
            .outer_iter()
            .map(|row| {
                self.base_score
                    + self.learning_rate * self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
            })
            .collect()
    }
}

impl Regressor for GradientBoostingRegressor {
    fn name(&self) -> &str {
        &self.name
    }

    fn fit(
        &self,
        records: ArrayView2<'_, f64>,
        targets: ArrayView1<'_, f64>,
    ) -> crate::Result<ModelHandle> {
        check_inputs(&self.name, &records, &targets)?;
        let cfg = &self.config;
        if !(cfg.subsample > 0.0 && cfg.subsample <= 1.0) {
            return Err(ClvError::Fit {
                model: self.name.clone(),
                reason: format!("subsample must be in (0, 1], got {}", cfg.subsample),
            });
        }

        let n_samples = records.nrows();
        let base_score = targets.sum() / n_samples as f64;
        let mut current = Array1::from_elem(n_samples, base_score);
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let params = TreeParams {
            max_depth: Some(cfg.max_depth),
            min_samples_leaf: cfg.min_samples_leaf,
            leaf_l2: cfg.reg_lambda.max(0.0),
            ..TreeParams::default()
        };

        let mut trees = Vec::with_capacity(cfg.n_estimators);
        for _ in 0..cfg.n_estimators {
            let residuals = &targets - &current;
            let rows: Vec<usize> = if cfg.subsample < 1.0 {
                let rows: Vec<usize> = (0..n_samples)
                    .filter(|_| rng.gen_bool(cfg.subsample))
                    .collect();
                if rows.is_empty() { (0..n_samples).collect() } else { rows }
            } else {
                (0..n_samples).collect()
            };

            let tree = RegressionTree::fit(records, residuals.view(), rows, params, &mut rng);
            for (i, row) in records.outer_iter().enumerate() {
                current[i] += cfg.learning_rate * tree.predict_row(row);
            }
            trees.push(tree);
        }

        Ok(Arc::new(BoostedModel {
            base_score,
            learning_rate: cfg.learning_rate,
            trees,
        }))
    }
}
