//! End-to-end orchestration: ingest, split, features, targets, models, segments

use crate::config::PipelineConfig;
use crate::data;
use crate::dataset::{AssembledDataset, DatasetAssembler, DatasetSummary};
use crate::error::ClvError;
use crate::features::{CountryVocabulary, CustomerFeatureVector, FeatureEngine};
use crate::ingest::{IngestReport, TransactionIngestor};
use crate::model::{
    predict_non_negative, ChronologicalSplit, EnsembleReport, FittedModel,
    ModelEnsembleTrainer,
};
use crate::regressors::{
    GradientBoostingConfig, GradientBoostingRegressor, LinearBaseline, RandomForestRegressor,
};
use crate::segment::{
    DecileProfile, RfmBinners, RiskSummary, RoiSummary, ScoredCustomer, ValueSegmenter,
};
use crate::split::TemporalSplitter;
use chrono::NaiveDateTime;
use polars::prelude::DataFrame;
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// Everything a pipeline run produced
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub ingest: IngestReport,
    pub date_max: NaiveDateTime,
    pub snapshot_date: NaiveDateTime,
    pub dataset: DatasetSummary,
    /// Feature vectors of the assembled dataset, ascending customer id
    pub features: Vec<CustomerFeatureVector>,
    /// Fitted on the training prefix, frozen afterwards
    pub vocabulary: CountryVocabulary,
    pub ensemble: EnsembleReport,
    /// Model whose predictions drive segmentation
    pub segmentation_model: String,
    /// Held-out customers with deciles and RFM scores
    pub scored: Vec<ScoredCustomer>,
    pub decile_profile: Vec<DecileProfile>,
    pub roi: RoiSummary,
    pub risk: RiskSummary,
}

/// Runs every stage in order with one configuration
#[derive(Debug, Clone)]
pub struct ClvPipeline {
    config: PipelineConfig,
}

impl ClvPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Load a CSV export and run the pipeline on it
    pub fn run_file(&self, path: impl AsRef<Path>) -> crate::Result<PipelineReport> {
        let raw = data::load_transactions(path)?;
        self.run(raw)
    }

    /// Run all stages on a raw text table (see [`data::load_transactions`]).
    ///
    /// Re-running on the same rows with the same configuration gives the same
    /// features, metrics and deciles.
    pub fn run(&self, raw: DataFrame) -> crate::Result<PipelineReport> {
        self.config.validate()?;
        let started = Instant::now();

        let ingested = TransactionIngestor::new().ingest(raw)?;
        let split = TemporalSplitter::new(self.config.horizon_months).split(&ingested.transactions)?;
        let features = FeatureEngine::new().from_split(&split)?;
        let dataset = DatasetAssembler::new().from_split(&features, &split)?;

        let chrono_split = ChronologicalSplit::new(dataset.len(), self.config.test_ratio)?;
        let vocabulary = CountryVocabulary::fit(
            dataset.countries(chrono_split.train_rows()),
            self.config.top_k_countries,
        )?;
        let matrix = dataset.design_matrix(&vocabulary);

        let ensemble = self.trainer().train(&matrix)?;

        let (model_name, predictions) = self.segmentation_predictions(&ensemble)?;
        let segmenter = ValueSegmenter::new();

        let train_customers = to_scored(&dataset, chrono_split.train_rows(), None);
        let test_customers = to_scored(&dataset, chrono_split.test_rows(), Some(&predictions));

        let with_deciles = segmenter.assign_deciles(&test_customers);
        let binners = RfmBinners::fit(&train_customers);
        let scored = segmenter.rfm_segments_with(&binners, &with_deciles);

        let decile_profile = segmenter.decile_profile(&scored);
        let roi = segmenter.simulate_roi(&scored, self.config.cost_per_customer, self.config.lift);
        let risk = segmenter.risk_summary(&scored);

        info!(
            model = %model_name,
            targeted = roi.targeted_count,
            profit = roi.profit,
            roi_pct = roi.roi_pct,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline finished"
        );

        Ok(PipelineReport {
            ingest: ingested.report,
            date_max: split.date_max,
            snapshot_date: split.snapshot_date,
            dataset: dataset.summary(),
            features: dataset.examples().iter().map(|e| e.features.clone()).collect(),
            vocabulary,
            ensemble,
            segmentation_model: model_name,
            scored,
            decile_profile,
            roi,
            risk,
        })
    }

    fn trainer(&self) -> ModelEnsembleTrainer {
        let boosting = GradientBoostingConfig {
            n_estimators: self.config.n_estimators,
            learning_rate: self.config.learning_rate,
            max_depth: self.config.max_depth,
            seed: self.config.seed,
            ..GradientBoostingConfig::default()
        };
        ModelEnsembleTrainer::new(self.config.test_ratio)
            .with_regressor(LinearBaseline::default())
            .with_regressor(RandomForestRegressor::new(
                self.config.n_estimators,
                self.config.seed,
            ))
            .with_regressor(GradientBoostingRegressor::new(boosting))
            .with_timeout(self.config.model_timeout())
    }

    fn segmentation_predictions(
        &self,
        ensemble: &EnsembleReport,
    ) -> crate::Result<(String, Vec<f64>)> {
        let chosen = match &self.config.segmentation_model {
            Some(name) => ensemble.get(name).map(|m| (name.as_str(), m)).ok_or_else(|| {
                ClvError::Fit {
                    model: name.clone(),
                    reason: "model is unknown or failed; cannot segment with it".to_string(),
                }
            })?,
            None => ensemble.best_by_rmse().ok_or_else(|| ClvError::Fit {
                model: "ensemble".to_string(),
                reason: "every model failed".to_string(),
            })?,
        };
        Ok((chosen.0.to_string(), chosen.1.predictions.to_vec()))
    }
}

/// Predict with a fitted model on a dataset encoded by a frozen vocabulary
pub fn score_dataset(
    model: &dyn FittedModel,
    dataset: &AssembledDataset,
    vocabulary: &CountryVocabulary,
) -> Vec<ScoredCustomer> {
    let matrix = dataset.design_matrix(vocabulary);
    let predictions = predict_non_negative(model, matrix.records.view()).to_vec();
    to_scored(dataset, 0..dataset.len(), Some(&predictions))
}

fn to_scored(
    dataset: &AssembledDataset,
    rows: std::ops::Range<usize>,
    predictions: Option<&[f64]>,
) -> Vec<ScoredCustomer> {
    dataset.examples()[rows]
        .iter()
        .enumerate()
        .map(|(i, e)| {
            let predicted = predictions.and_then(|p| p.get(i).copied()).unwrap_or(0.0);
            ScoredCustomer::new(e.features.customer_id, predicted)
                .with_actual(e.target_12m_value)
                .with_rfm_features(
                    e.features.recency as f64,
                    e.features.frequency as f64,
                    e.features.monetary,
                )
        })
        .collect()
}
