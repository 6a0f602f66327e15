//! Forecast modelling
//!
//! Provides:
//! - Ensemble combination of model outputs with an uncertainty band
//! - Z-score anomaly flagging and daily pattern summaries
//! - The pluggable model interface and built-in stand-in models

pub mod anomaly;
pub mod ensemble;
pub mod models;

pub use anomaly::{AnomalyConfig, AnomalyDetector, AnomalyFlag, PatternSummary, Severity, TrendDirection};
pub use ensemble::{
    ConfidenceInterval, EnsembleCombiner, EnsembleConfig, EnsembleResult, ModelContribution,
    ModelPrediction,
};
pub use models::{default_models, DiurnalModel, PersistenceModel, PollutantModel, PredictionModel};
