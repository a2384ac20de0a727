//! ClvForge: customer lifetime value prediction and value segmentation
//!
//! This library turns a raw retail transaction log into leakage-safe customer
//! features, trains an ensemble of regressors on the next twelve months of
//! spend, and segments customers by predicted value (deciles) and by
//! recency/frequency/monetary quintiles.

pub mod cli;
pub mod config;
pub mod data;
pub mod dataset;
pub mod error;
pub mod features;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod regressors;
pub mod segment;
pub mod split;
pub mod tree;

// Re-export public items for easier access
pub use cli::Args;
pub use config::PipelineConfig;
pub use data::{load_transactions, write_decile_profile, write_feature_table, write_scored_customers};
pub use dataset::{AssembledDataset, DatasetAssembler, DesignMatrix, TrainingExample};
pub use error::ClvError;
pub use features::{CountryVocabulary, CustomerFeatureVector, FeatureEngine};
pub use ingest::{IngestOutput, IngestReport, TransactionIngestor};
pub use model::{EnsembleReport, FittedModel, ModelEnsembleTrainer, ModelHandle, Regressor};
pub use pipeline::{ClvPipeline, PipelineReport};
pub use segment::{ScoredCustomer, ValueSegmenter};
pub use split::{TemporalSplit, TemporalSplitter};

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, ClvError>;
