//! airq: ensemble air-quality forecasting with optimistic sync
//!
//! Modules:
//! - `ml`: ensemble combiner, anomaly/pattern scoring, prediction models
//! - `forecast`: multi-hour forecasts over the registered models
//! - `store`: typed access to the remote document store
//! - `sync`: optimistic update ledger, conflict resolution, sync engine
//! - `config`: TOML configuration

pub mod config;
pub mod error;
pub mod forecast;
pub mod ml;
pub mod store;
pub mod sync;
pub mod types;

pub use config::AppConfig;
pub use error::{AirqError, Result};
pub use forecast::{ForecastConfig, ForecastOrchestrator};
pub use ml::{AnomalyDetector, EnsembleCombiner, EnsembleResult, ModelPrediction, PredictionModel};
pub use store::{HttpStore, MemoryStore, RemoteStore};
pub use sync::{OptimisticLedger, ResolutionStrategy, SyncEngine, UpdateDraft, UpdateOutcome};
pub use types::{PollutantLevels, PredictionInput, WeatherConditions};
