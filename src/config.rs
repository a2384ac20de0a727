//! Pipeline configuration

use crate::error::ClvError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for a full pipeline run.
///
/// Every field has a default, so a JSON file only needs the keys it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Calendar months between the snapshot date and the last transaction
    pub horizon_months: u32,
    /// Number of most frequent countries kept as their own category
    pub top_k_countries: usize,
    /// Fraction of assembled rows held out as the test suffix
    pub test_ratio: f64,
    /// Seed shared by every stochastic regressor
    pub seed: u64,
    /// Trees per ensemble
    pub n_estimators: usize,
    /// Shrinkage applied to each boosting round
    pub learning_rate: f64,
    /// Depth of each boosted tree
    pub max_depth: usize,
    /// Upper bound on a single model's fit and predict
    pub model_timeout_secs: Option<u64>,
    /// Campaign cost per targeted customer
    pub cost_per_customer: f64,
    /// Incremental conversion lift applied to the targeted value
    pub lift: f64,
    /// Model whose predictions feed segmentation (lowest RMSE when unset)
    pub segmentation_model: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            horizon_months: 12,
            top_k_countries: 3,
            test_ratio: 0.2,
            seed: 42,
            n_estimators: 100,
            learning_rate: 0.1,
            max_depth: 6,
            model_timeout_secs: None,
            cost_per_customer: 2.0,
            lift: 0.15,
            segmentation_model: None,
        }
    }
}

impl PipelineConfig {
    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Per-model time bound, if any
    pub fn model_timeout(&self) -> Option<Duration> {
        self.model_timeout_secs.map(Duration::from_secs)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.horizon_months == 0 {
            return Err(ClvError::InvalidConfig(
                "horizon_months must be at least 1".to_string(),
            ));
        }
        if !(self.test_ratio > 0.0 && self.test_ratio < 1.0) {
            return Err(ClvError::InvalidConfig(format!(
                "test_ratio must be in (0, 1), got {}",
                self.test_ratio
            )));
        }
        if self.n_estimators == 0 {
            return Err(ClvError::InvalidConfig(
                "n_estimators must be at least 1".to_string(),
            ));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(ClvError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.max_depth == 0 {
            return Err(ClvError::InvalidConfig(
                "max_depth must be at least 1".to_string(),
            ));
        }
        if !(self.cost_per_customer >= 0.0 && self.cost_per_customer.is_finite()) {
            return Err(ClvError::InvalidConfig(format!(
                "cost_per_customer must be non-negative, got {}",
                self.cost_per_customer
            )));
        }
        if !(self.lift >= 0.0 && self.lift.is_finite()) {
            return Err(ClvError::InvalidConfig(format!(
                "lift must be non-negative, got {}",
                self.lift
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.top_k_countries, 3);
        assert_eq!(config.horizon_months, 12);
        assert!(config.model_timeout().is_none());
    }

    #[rstest]
    #[case(0.0)]
    #[case(1.0)]
    #[case(-0.2)]
    #[case(f64::NAN)]
    fn test_rejects_bad_test_ratio(#[case] ratio: f64) {
        let config = PipelineConfig {
            test_ratio: ratio,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ClvError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"top_k_countries": 5, "model_timeout_secs": 30}}"#).unwrap();

        let config = PipelineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.top_k_countries, 5);
        assert_eq!(config.model_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.seed, 42);
    }
}
