//! Model ensemble training on a chronological train/test split

use crate::dataset::DesignMatrix;
use crate::error::ClvError;
use linfa::prelude::SingleTargetRegression;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A fitted model, opaque to the pipeline beyond `predict`
pub trait FittedModel: Send + Sync + fmt::Debug {
    /// Raw predictions, one per row of `records`
    fn predict(&self, records: ArrayView2<'_, f64>) -> Array1<f64>;
}

/// Shared handle to a fitted model
pub type ModelHandle = Arc<dyn FittedModel>;

/// Anything that can be fitted on a feature matrix and a target vector
pub trait Regressor: Send + Sync + fmt::Debug {
    /// Display name, unique within an ensemble
    fn name(&self) -> &str;

    /// Fit on `records` (one row per customer) against `targets`
    fn fit(
        &self,
        records: ArrayView2<'_, f64>,
        targets: ArrayView1<'_, f64>,
    ) -> crate::Result<ModelHandle>;
}

/// CLV predictions with negatives clipped to zero
pub fn predict_non_negative(model: &dyn FittedModel, records: ArrayView2<'_, f64>) -> Array1<f64> {
    model.predict(records).mapv(|v| v.max(0.0))
}

/// Training prefix and test suffix sizes; rows are never reordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChronologicalSplit {
    pub train_len: usize,
    pub test_len: usize,
}

impl ChronologicalSplit {
    /// `test_len = ceil(n * test_ratio)`, the rest trains
    pub fn new(n_rows: usize, test_ratio: f64) -> crate::Result<Self> {
        if !(test_ratio > 0.0 && test_ratio < 1.0) {
            return Err(ClvError::InvalidConfig(format!(
                "test_ratio must be in (0, 1), got {test_ratio}"
            )));
        }
        let test_len = ((n_rows as f64) * test_ratio).ceil() as usize;
        let test_len = test_len.min(n_rows);
        let train_len = n_rows - test_len;
        if train_len == 0 {
            return Err(ClvError::EmptyTrainingSet);
        }
        Ok(Self {
            train_len,
            test_len,
        })
    }

    pub fn train_rows(&self) -> std::ops::Range<usize> {
        0..self.train_len
    }

    pub fn test_rows(&self) -> std::ops::Range<usize> {
        self.train_len..self.train_len + self.test_len
    }
}

/// Hold-out error metrics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub rmse: f64,
    pub mae: f64,
    pub r2: f64,
}

impl RegressionMetrics {
    /// Compare `predictions` against ground truth.
    ///
    /// R² on a constant ground truth is 1 for a perfect fit and 0 otherwise.
    pub fn compute(predictions: &Array1<f64>, truth: &Array1<f64>) -> Result<Self, linfa::Error> {
        let mse = predictions.mean_squared_error(truth)?;
        let mae = predictions.mean_absolute_error(truth)?;
        Ok(Self {
            rmse: mse.sqrt(),
            mae,
            r2: r_squared(predictions, truth),
        })
    }
}

fn r_squared(predictions: &Array1<f64>, truth: &Array1<f64>) -> f64 {
    let mean = truth.mean().unwrap_or(0.0);
    let ss_res: f64 = predictions
        .iter()
        .zip(truth.iter())
        .map(|(p, t)| (t - p).powi(2))
        .sum();
    let ss_tot: f64 = truth.iter().map(|t| (t - mean).powi(2)).sum();
    if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res == 0.0 {
        1.0
    } else {
        0.0
    }
}

/// Why a single model produced no result
#[derive(Debug, Clone, PartialEq)]
pub enum ModelFailure {
    Fit(String),
    NonFinitePredictions,
    Metrics(String),
    TimedOut(Duration),
    Panicked(String),
}

impl fmt::Display for ModelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fit(reason) => write!(f, "fit failed: {reason}"),
            Self::NonFinitePredictions => write!(f, "predictions contain NaN or infinity"),
            Self::Metrics(reason) => write!(f, "metrics failed: {reason}"),
            Self::TimedOut(limit) => write!(f, "exceeded time limit of {limit:?}"),
            Self::Panicked(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

/// A model that fitted and was scored on the test suffix
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub handle: ModelHandle,
    /// Clipped predictions for every test row, in row order
    pub predictions: Array1<f64>,
    pub metrics: RegressionMetrics,
    pub fit_seconds: f64,
}

/// One slot of the ensemble
#[derive(Debug, Clone)]
pub struct ModelOutcome {
    pub name: String,
    pub result: Result<TrainedModel, ModelFailure>,
}

/// Everything the trainer produced
#[derive(Debug, Clone)]
pub struct EnsembleReport {
    pub split: ChronologicalSplit,
    pub feature_names: Vec<String>,
    pub test_customer_ids: Vec<i64>,
    pub test_targets: Array1<f64>,
    pub outcomes: Vec<ModelOutcome>,
}

impl EnsembleReport {
    /// Models that fitted successfully, in ensemble order
    pub fn successes(&self) -> impl Iterator<Item = (&str, &TrainedModel)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|m| (o.name.as_str(), m)))
    }

    pub fn get(&self, name: &str) -> Option<&TrainedModel> {
        self.successes().find(|(n, _)| *n == name).map(|(_, m)| m)
    }

    /// Successful model with the lowest hold-out RMSE (first wins on ties)
    pub fn best_by_rmse(&self) -> Option<(&str, &TrainedModel)> {
        self.successes().fold(None, |best, candidate| match best {
            Some((_, b)) if b.metrics.rmse <= candidate.1.metrics.rmse => best,
            _ => Some(candidate),
        })
    }
}

#[derive(Debug)]
struct TrainTest {
    x_train: Array2<f64>,
    y_train: Array1<f64>,
    x_test: Array2<f64>,
    y_test: Array1<f64>,
}

/// Fits every regressor independently on the same training prefix.
///
/// A failing, panicking or slow model only loses its own slot.
#[derive(Debug, Clone)]
pub struct ModelEnsembleTrainer {
    regressors: Vec<Arc<dyn Regressor>>,
    test_ratio: f64,
    timeout: Option<Duration>,
}

impl ModelEnsembleTrainer {
    pub fn new(test_ratio: f64) -> Self {
        Self {
            regressors: Vec::new(),
            test_ratio,
            timeout: None,
        }
    }

    /// Add a model to the ensemble
    pub fn with_regressor(mut self, regressor: impl Regressor + 'static) -> Self {
        self.regressors.push(Arc::new(regressor));
        self
    }

    /// Bound each model's fit and predict
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Split `matrix` chronologically, fit all models and score the test suffix
    pub fn train(&self, matrix: &DesignMatrix) -> crate::Result<EnsembleReport> {
        let n = matrix.nrows();
        if matrix.targets.len() != n {
            return Err(ClvError::ShapeMismatch {
                expected: format!("{n} targets"),
                actual: format!("{} targets", matrix.targets.len()),
            });
        }
        let split = ChronologicalSplit::new(n, self.test_ratio)?;
        let data = Arc::new(TrainTest {
            x_train: matrix.records.slice(s![..split.train_len, ..]).to_owned(),
            y_train: matrix.targets.slice(s![..split.train_len]).to_owned(),
            x_test: matrix.records.slice(s![split.train_len.., ..]).to_owned(),
            y_test: matrix.targets.slice(s![split.train_len..]).to_owned(),
        });

        info!(
            train = split.train_len,
            test = split.test_len,
            models = self.regressors.len(),
            "Training model ensemble"
        );

        let results = match self.timeout {
            None => self
                .regressors
                .par_iter()
                .map(|r| fit_and_evaluate(r.as_ref(), &data))
                .collect::<Vec<_>>(),
            Some(limit) => self.run_with_timeout(&data, limit),
        };

        let outcomes: Vec<ModelOutcome> = self
            .regressors
            .iter()
            .zip(results)
            .map(|(regressor, result)| {
                match &result {
                    Ok(model) => info!(
                        model = regressor.name(),
                        rmse = model.metrics.rmse,
                        mae = model.metrics.mae,
                        r2 = model.metrics.r2,
                        seconds = model.fit_seconds,
                        "Model evaluated"
                    ),
                    Err(failure) => {
                        warn!(model = regressor.name(), %failure, "Model failed")
                    }
                }
                ModelOutcome {
                    name: regressor.name().to_string(),
                    result,
                }
            })
            .collect();

        Ok(EnsembleReport {
            split,
            feature_names: matrix.feature_names.clone(),
            test_customer_ids: matrix.customer_ids[split.train_len..].to_vec(),
            test_targets: data.y_test.clone(),
            outcomes,
        })
    }

    /// One thread per model; slots still running at the deadline time out.
    /// Timed-out threads are detached and their late results discarded.
    fn run_with_timeout(
        &self,
        data: &Arc<TrainTest>,
        limit: Duration,
    ) -> Vec<Result<TrainedModel, ModelFailure>> {
        let deadline = Instant::now() + limit;
        let receivers: Vec<_> = self
            .regressors
            .iter()
            .map(|regressor| {
                let (tx, rx) = mpsc::channel();
                let regressor = Arc::clone(regressor);
                let data = Arc::clone(data);
                let spawned = std::thread::Builder::new()
                    .name(format!("fit-{}", regressor.name()))
                    .spawn(move || {
                        let _ = tx.send(fit_and_evaluate(regressor.as_ref(), &data));
                    });
                spawned.map(|_| rx).map_err(|e| e.to_string())
            })
            .collect();

        receivers
            .into_iter()
            .map(|rx| {
                let rx = rx.map_err(|e| ModelFailure::Fit(format!("could not start: {e}")))?;
                let remaining = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(remaining) {
                    Ok(result) => result,
                    Err(mpsc::RecvTimeoutError::Timeout) => Err(ModelFailure::TimedOut(limit)),
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        Err(ModelFailure::Panicked("worker exited without a result".to_string()))
                    }
                }
            })
            .collect()
    }
}

fn fit_and_evaluate(
    regressor: &dyn Regressor,
    data: &TrainTest,
) -> Result<TrainedModel, ModelFailure> {
    let start = Instant::now();
    let attempt = catch_unwind(AssertUnwindSafe(|| {
        let handle = regressor.fit(data.x_train.view(), data.y_train.view())?;
        let raw = handle.predict(data.x_test.view());
        Ok::<_, ClvError>((handle, raw))
    }));

    let (handle, raw) = match attempt {
        Ok(Ok(fitted)) => fitted,
        Ok(Err(e)) => return Err(ModelFailure::Fit(e.to_string())),
        Err(payload) => return Err(ModelFailure::Panicked(panic_message(payload.as_ref()))),
    };
    if raw.len() != data.y_test.len() || raw.iter().any(|v| !v.is_finite()) {
        return Err(ModelFailure::NonFinitePredictions);
    }

    let predictions = raw.mapv(|v| v.max(0.0));
    let metrics = RegressionMetrics::compute(&predictions, &data.y_test)
        .map_err(|e| ModelFailure::Metrics(e.to_string()))?;

    Ok(TrainedModel {
        handle,
        predictions,
        metrics,
        fit_seconds: start.elapsed().as_secs_f64(),
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
