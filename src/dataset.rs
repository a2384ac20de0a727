//! Joins the future-value target onto the feature table

use crate::error::ClvError;
use crate::features::{
    feature_vectors, finite_or, CountryVocabulary, CustomerFeatureVector, NUMERIC_FEATURES,
};
use crate::ingest::{CUSTOMER_ID, LINE_TOTAL};
use crate::split::TemporalSplit;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, info};

/// A feature vector with its realised target-window value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub features: CustomerFeatureVector,
    /// Spend in the target window; 0 when the customer did not come back
    pub target_12m_value: f64,
}

/// Headline counts of an assembled dataset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub customers: usize,
    /// Customers with a positive target
    pub repeat_customers: usize,
    /// Customers with a zero target
    pub inactive_customers: usize,
    pub total_target_value: f64,
}

/// Numeric model input with the columns needed to trace predictions back.
///
/// `records` never contains the customer id or the target.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    pub feature_names: Vec<String>,
    pub records: Array2<f64>,
    pub targets: Array1<f64>,
    pub customer_ids: Vec<i64>,
}

impl DesignMatrix {
    pub fn nrows(&self) -> usize {
        self.records.nrows()
    }

    /// Column index of a named feature
    pub fn column(&self, name: &str) -> Option<usize> {
        self.feature_names.iter().position(|n| n == name)
    }
}

/// Training examples in a fixed order (ascending customer id)
#[derive(Debug, Clone)]
pub struct AssembledDataset {
    examples: Vec<TrainingExample>,
}

impl AssembledDataset {
    pub fn examples(&self) -> &[TrainingExample] {
        &self.examples
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn customer_ids(&self) -> Vec<i64> {
        self.examples.iter().map(|e| e.features.customer_id).collect()
    }

    pub fn targets(&self) -> Array1<f64> {
        self.examples.iter().map(|e| e.target_12m_value).collect()
    }

    /// Raw countries of a row range, for fitting a vocabulary on training rows only
    pub fn countries(&self, rows: Range<usize>) -> impl Iterator<Item = &str> {
        self.examples[rows]
            .iter()
            .map(|e| e.features.country.as_str())
    }

    pub fn summary(&self) -> DatasetSummary {
        let repeat_customers = self
            .examples
            .iter()
            .filter(|e| e.target_12m_value > 0.0)
            .count();
        DatasetSummary {
            customers: self.examples.len(),
            repeat_customers,
            inactive_customers: self.examples.len() - repeat_customers,
            total_target_value: self.examples.iter().map(|e| e.target_12m_value).sum(),
        }
    }

    /// Encode every row with a frozen vocabulary
    pub fn design_matrix(&self, vocabulary: &CountryVocabulary) -> DesignMatrix {
        let mut feature_names: Vec<String> =
            NUMERIC_FEATURES.iter().map(|n| n.to_string()).collect();
        feature_names.extend(vocabulary.column_names());

        let n_cols = feature_names.len();
        let mut records = Array2::zeros((self.examples.len(), n_cols));
        for (i, example) in self.examples.iter().enumerate() {
            let numeric = example.features.numeric_values();
            let one_hot = vocabulary.encode(&example.features.country);
            for (j, value) in numeric.into_iter().chain(one_hot).enumerate() {
                records[[i, j]] = finite_or_zero(value);
            }
        }

        DesignMatrix {
            feature_names,
            records,
            targets: self.targets(),
            customer_ids: self.customer_ids(),
        }
    }
}

/// Column holding the realised target-window value
pub const TARGET: &str = "target_12m_value";

const FLOAT_FEATURES: [&str; 5] = [
    "monetary",
    "avg_basket",
    "peak_season_prop",
    "purchase_regularity_std",
    "spending_trend_ratio",
];

/// Computes the target and joins it onto the feature table
#[derive(Debug, Default, Clone, Copy)]
pub struct DatasetAssembler;

impl DatasetAssembler {
    pub fn new() -> Self {
        Self
    }

    /// Assemble against the windows of a temporal split
    pub fn from_split(
        &self,
        features: &DataFrame,
        split: &TemporalSplit,
    ) -> crate::Result<AssembledDataset> {
        self.assemble(features, &split.eligible_customers, &split.target)
    }

    /// Sum target-window spend per customer, left-join it onto the eligible
    /// universe, then inner-join with the feature table.
    ///
    /// Customers absent from the target window get a target of 0. Customers
    /// present only in the target window never appear.
    pub fn assemble(
        &self,
        features: &DataFrame,
        eligible_customers: &[i64],
        target_window: &DataFrame,
    ) -> crate::Result<AssembledDataset> {
        let spend = target_window
            .clone()
            .lazy()
            .group_by([col(CUSTOMER_ID)])
            .agg([col(LINE_TOTAL).sum().alias(TARGET)]);

        let universe = DataFrame::new(vec![Column::new(
            CUSTOMER_ID.into(),
            eligible_customers,
        )])?;

        let targets = universe
            .lazy()
            .left_join(spend, col(CUSTOMER_ID), col(CUSTOMER_ID))
            // net refunds count as no value
            .with_columns([finite_or(col(TARGET).fill_null(lit(0.0)), 0.0)])
            .with_columns([when(col(TARGET).lt(lit(0.0)))
                .then(lit(0.0))
                .otherwise(col(TARGET))
                .alias(TARGET)]);

        let sanitized: Vec<Expr> = FLOAT_FEATURES
            .iter()
            .map(|name| finite_or(col(*name), 0.0).alias(*name))
            .collect();

        let joined = features
            .clone()
            .lazy()
            .inner_join(targets, col(CUSTOMER_ID), col(CUSTOMER_ID))
            .with_columns(sanitized)
            .sort_by_exprs([col(CUSTOMER_ID)], SortMultipleOptions::default())
            .collect()?;

        if joined.height() == 0 {
            return Err(ClvError::EmptyCustomerUniverse);
        }

        let targets = joined.column(TARGET)?.f64()?;
        let examples: Vec<TrainingExample> = feature_vectors(&joined)?
            .into_iter()
            .zip(targets.into_iter())
            .map(|(features, target)| TrainingExample {
                features,
                target_12m_value: target.unwrap_or(0.0),
            })
            .collect();

        let dataset = AssembledDataset { examples };
        let summary = dataset.summary();
        debug!(target_rows = target_window.height(), "Aggregated target window");
        info!(
            customers = summary.customers,
            repeat = summary.repeat_customers,
            inactive = summary.inactive_customers,
            total_target = summary.total_target_value,
            "Assembled training dataset"
        );
        Ok(dataset)
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::testing::transactions;
    use crate::ingest::COUNTRY;
    use approx::assert_relative_eq;

    fn features(rows: &[(i64, &str)]) -> DataFrame {
        let n = rows.len();
        let mut columns = vec![Column::new(
            CUSTOMER_ID.into(),
            rows.iter().map(|r| r.0).collect::<Vec<i64>>(),
        )];
        for name in NUMERIC_FEATURES {
            columns.push(if FLOAT_FEATURES.contains(&name) {
                Column::new(name.into(), vec![1.5f64; n])
            } else {
                Column::new(name.into(), vec![3i64; n])
            });
        }
        columns.push(Column::new(
            COUNTRY.into(),
            rows.iter().map(|r| r.1).collect::<Vec<&str>>(),
        ));
        DataFrame::new(columns).unwrap()
    }

    fn spend(lines: &[(&str, &str)]) -> DataFrame {
        let lines: Vec<_> = lines
            .iter()
            .map(|&(customer, total)| (customer, "T", "2011-06-01 00:00:00", "P", "1", total, "UK"))
            .collect();
        transactions(&lines)
    }

    #[test]
    fn test_missing_target_activity_is_zero() {
        let dataset = DatasetAssembler::new()
            .assemble(
                &features(&[(2, "UK"), (1, "France")]),
                &[1, 2],
                &spend(&[("1", "10.0"), ("1", "5.0")]),
            )
            .unwrap();

        assert_eq!(dataset.customer_ids(), vec![1, 2]);
        assert_relative_eq!(dataset.targets()[0], 15.0);
        assert_relative_eq!(dataset.targets()[1], 0.0);
        assert_eq!(dataset.examples()[0].features.country, "France");

        let summary = dataset.summary();
        assert_eq!(summary.repeat_customers, 1);
        assert_eq!(summary.inactive_customers, 1);
    }

    #[test]
    fn test_net_refunds_clamp_to_zero() {
        let dataset = DatasetAssembler::new()
            .assemble(
                &features(&[(1, "UK")]),
                &[1],
                &spend(&[("1", "10.0"), ("1", "-25.0")]),
            )
            .unwrap();
        assert_relative_eq!(dataset.targets()[0], 0.0);
    }

    #[test]
    fn test_target_only_customers_are_excluded() {
        let dataset = DatasetAssembler::new()
            .assemble(&features(&[(1, "UK")]), &[1], &spend(&[("99", "500.0")]))
            .unwrap();
        assert_eq!(dataset.customer_ids(), vec![1]);
        assert_relative_eq!(dataset.targets()[0], 0.0);
    }

    #[test]
    fn test_infinite_features_become_zero() {
        let mut broken = features(&[(1, "UK")]);
        broken
            .with_column(Column::new("spending_trend_ratio".into(), vec![f64::INFINITY]))
            .unwrap();
        broken
            .with_column(Column::new("avg_basket".into(), vec![f64::NEG_INFINITY]))
            .unwrap();
        broken
            .with_column(Column::new("peak_season_prop".into(), vec![f64::NAN]))
            .unwrap();

        let dataset = DatasetAssembler::new()
            .assemble(&broken, &[1], &spend(&[]))
            .unwrap();
        let vocab = CountryVocabulary::fit(dataset.countries(0..1), 3).unwrap();
        let matrix = dataset.design_matrix(&vocab);

        assert!(matrix.records.iter().all(|v| v.is_finite()));
        let trend = matrix.column("spending_trend_ratio").unwrap();
        assert_relative_eq!(matrix.records[[0, trend]], 0.0);
    }

    #[test]
    fn test_design_matrix_excludes_id_and_target() {
        let dataset = DatasetAssembler::new()
            .assemble(
                &features(&[(1, "UK"), (2, "Spain")]),
                &[1, 2],
                &spend(&[("2", "7.0")]),
            )
            .unwrap();
        let vocab = CountryVocabulary::fit(dataset.countries(0..2), 1).unwrap();
        let matrix = dataset.design_matrix(&vocab);

        assert!(matrix.column("customer_id").is_none());
        assert!(matrix.column(TARGET).is_none());
        assert_eq!(matrix.records.ncols(), NUMERIC_FEATURES.len() + 2);
        assert_eq!(matrix.customer_ids, vec![1, 2]);
        assert_relative_eq!(matrix.targets[1], 7.0);
    }

    #[test]
    fn test_no_overlap_is_fatal() {
        let result = DatasetAssembler::new().assemble(&features(&[(1, "UK")]), &[2], &spend(&[]));
        assert!(matches!(result, Err(ClvError::EmptyCustomerUniverse)));
    }
}
