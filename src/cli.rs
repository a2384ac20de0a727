//! Command-line interface definitions and argument parsing

use crate::config::PipelineConfig;
use clap::Parser;
use std::path::PathBuf;

/// Customer lifetime value pipeline: features, model ensemble and value segments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the transaction CSV file
    #[arg(short, long, default_value = "data.csv")]
    pub input: PathBuf,

    /// Optional JSON configuration file; flags below override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory receiving features.csv, scored_customers.csv and decile_profile.csv
    #[arg(short, long, default_value = "clv_output")]
    pub output_dir: PathBuf,

    /// Number of most frequent countries kept as their own category
    #[arg(short = 'k', long)]
    pub top_k: Option<usize>,

    /// Fraction of customers held out for evaluation
    #[arg(long)]
    pub test_ratio: Option<f64>,

    /// Seed for the stochastic models
    #[arg(long)]
    pub seed: Option<u64>,

    /// Per-model time limit in seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Campaign cost per targeted customer
    #[arg(long)]
    pub cost: Option<f64>,

    /// Expected incremental conversion lift of the campaign
    #[arg(long)]
    pub lift: Option<f64>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Build the pipeline configuration: file (or defaults), then flag overrides
    pub fn to_config(&self) -> crate::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(k) = self.top_k {
            config.top_k_countries = k;
        }
        if let Some(ratio) = self.test_ratio {
            config.test_ratio = ratio;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(secs) = self.timeout_secs {
            config.model_timeout_secs = Some(secs);
        }
        if let Some(cost) = self.cost {
            config.cost_per_customer = cost;
        }
        if let Some(lift) = self.lift {
            config.lift = lift;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_without_flags() {
        let args = Args::parse_from(["clvforge"]);
        assert_eq!(args.to_config().unwrap(), PipelineConfig::default());
        assert_eq!(args.input, PathBuf::from("data.csv"));
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"seed": 7, "lift": 0.3}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = Args::parse_from(["clvforge", "--config", &path, "--seed", "11", "-k", "5"]);
        let config = args.to_config().unwrap();

        assert_eq!(config.seed, 11);
        assert_eq!(config.top_k_countries, 5);
        assert_eq!(config.lift, 0.3);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let args = Args::parse_from(["clvforge", "--test-ratio", "0"]);
        assert!(args.to_config().is_err());
    }
}
