//! Multi-hour forecast orchestration
//!
//! For each hour of the horizon every registered model is asked for a
//! prediction, the answers are combined by the ensemble, and the result is
//! optionally persisted. A model that errors, stalls, or returns garbage
//! never sinks the forecast: it is replaced by a low-confidence
//! persistence guess under its own id.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{AirqError, Result};
use crate::ml::{EnsembleCombiner, EnsembleResult, ModelPrediction, PredictionModel};
use crate::store::{ForecastRecord, Mutation, RemoteStore};
use crate::types::PredictionInput;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Longest horizon accepted (default: 72h)
    pub max_horizon_hours: u32,
    /// Per-model, per-hour deadline (default: 5s)
    pub model_timeout_ms: u64,
    /// Store each hourly result when a store is attached
    pub persist: bool,
    pub fallback_confidence: f64,
    pub fallback_uncertainty: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            max_horizon_hours: 72,
            model_timeout_ms: 5_000,
            persist: true,
            fallback_confidence: 0.5,
            fallback_uncertainty: 25.0,
        }
    }
}

impl ForecastConfig {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }
}

pub struct ForecastOrchestrator {
    combiner: EnsembleCombiner,
    models: Vec<Arc<dyn PredictionModel>>,
    store: Option<Arc<dyn RemoteStore>>,
    config: ForecastConfig,
}

impl ForecastOrchestrator {
    /// An invalid fallback confidence or uncertainty is replaced by the
    /// default, since every failed model would otherwise fail the forecast.
    pub fn new(combiner: EnsembleCombiner, mut config: ForecastConfig) -> Self {
        let defaults = ForecastConfig::default();
        if !(0.0..=1.0).contains(&config.fallback_confidence) {
            warn!(
                "[Forecast] fallback_confidence {} outside [0, 1], using {}",
                config.fallback_confidence, defaults.fallback_confidence
            );
            config.fallback_confidence = defaults.fallback_confidence;
        }
        if !config.fallback_uncertainty.is_finite() || config.fallback_uncertainty < 0.0 {
            warn!(
                "[Forecast] fallback_uncertainty {} is not a finite non-negative value, using {}",
                config.fallback_uncertainty, defaults.fallback_uncertainty
            );
            config.fallback_uncertainty = defaults.fallback_uncertainty;
        }
        Self {
            combiner,
            models: Vec::new(),
            store: None,
            config,
        }
    }

    pub fn with_models(mut self, models: Vec<Arc<dyn PredictionModel>>) -> Self {
        self.models = models;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn register_model(&mut self, model: Arc<dyn PredictionModel>) {
        info!("[Forecast] Registered model {}", model.id());
        self.models.push(model);
    }

    pub fn model_ids(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.id()).collect()
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    /// Forecast hours `1..=horizon_hours` after `input`, in order.
    pub async fn forecast(&self, input: &PredictionInput, horizon_hours: u32) -> Result<Vec<EnsembleResult>> {
        if horizon_hours == 0 {
            return Ok(Vec::new());
        }
        if horizon_hours > self.config.max_horizon_hours {
            return Err(AirqError::InvalidInput(format!(
                "horizon {}h exceeds the {}h maximum",
                horizon_hours, self.config.max_horizon_hours
            )));
        }
        if self.models.is_empty() {
            return Err(AirqError::InvalidInput("no prediction models registered".to_string()));
        }

        info!(
            "[Forecast] Zone {}: {}h horizon from AQI {:.1} with {} models",
            input.zone_id(),
            horizon_hours,
            input.current_aqi(),
            self.models.len()
        );

        let mut results = Vec::with_capacity(horizon_hours as usize);
        for offset in 1..=horizon_hours {
            let hour_input = input.shifted(offset);
            let predictions = self.predict_hour(&hour_input).await;
            let result = self.combiner.combine(&predictions)?;
            debug!(
                "[Forecast] +{}h: {:.1} [{:.1}, {:.1}] conf={:.2}",
                offset, result.predicted, result.interval.lower, result.interval.upper, result.confidence
            );

            if self.config.persist {
                self.persist(&hour_input, offset, &result).await;
            }
            results.push(result);
        }

        Ok(results)
    }

    async fn predict_hour(&self, input: &PredictionInput) -> Vec<ModelPrediction> {
        join_all(self.models.iter().map(|model| self.run_model(model.as_ref(), input))).await
    }

    async fn run_model(&self, model: &dyn PredictionModel, input: &PredictionInput) -> ModelPrediction {
        match timeout(self.config.model_timeout(), model.predict(input)).await {
            Ok(Ok(prediction)) if is_usable(&prediction) => prediction,
            Ok(Ok(prediction)) => {
                warn!(
                    "[Forecast] Model {} returned unusable output (value={}, conf={}, unc={}), using fallback",
                    model.id(),
                    prediction.prediction,
                    prediction.confidence,
                    prediction.uncertainty
                );
                self.fallback(model.id(), input)
            }
            Ok(Err(e)) => {
                warn!("[Forecast] Model {} failed: {}, using fallback", model.id(), e);
                self.fallback(model.id(), input)
            }
            Err(_) => {
                warn!(
                    "[Forecast] Model {} timed out after {}ms, using fallback",
                    model.id(),
                    self.config.model_timeout_ms
                );
                self.fallback(model.id(), input)
            }
        }
    }

    fn fallback(&self, model_id: &str, input: &PredictionInput) -> ModelPrediction {
        ModelPrediction::new(
            model_id,
            input.current_aqi(),
            self.config.fallback_confidence,
            self.config.fallback_uncertainty,
        )
    }

    async fn persist(&self, input: &PredictionInput, offset: u32, result: &EnsembleResult) {
        let Some(store) = &self.store else {
            return;
        };
        let record = ForecastRecord {
            zone_id: input.zone_id().to_string(),
            hour_offset: offset,
            target_time: input.observed_at(),
            result: result.clone(),
        };
        if let Err(failure) = store.mutate(Mutation::StoreForecast(record)).await {
            warn!(
                "[Forecast] Failed to persist +{}h for zone {}: {}",
                offset,
                input.zone_id(),
                failure
            );
        }
    }
}

fn is_usable(p: &ModelPrediction) -> bool {
    p.prediction.is_finite()
        && p.uncertainty.is_finite()
        && p.uncertainty >= 0.0
        && (0.0..=1.0).contains(&p.confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::default_models;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct FixedModel {
        id: &'static str,
        prediction: ModelPrediction,
    }

    impl FixedModel {
        fn arc(id: &'static str, value: f64, confidence: f64, uncertainty: f64) -> Arc<dyn PredictionModel> {
            Arc::new(Self {
                id,
                prediction: ModelPrediction::new(id, value, confidence, uncertainty),
            })
        }
    }

    #[async_trait]
    impl PredictionModel for FixedModel {
        fn id(&self) -> &str {
            self.id
        }

        async fn predict(&self, _input: &PredictionInput) -> Result<ModelPrediction> {
            Ok(self.prediction.clone())
        }
    }

    struct BrokenModel;

    #[async_trait]
    impl PredictionModel for BrokenModel {
        fn id(&self) -> &str {
            "broken"
        }

        async fn predict(&self, _input: &PredictionInput) -> Result<ModelPrediction> {
            Err(AirqError::Store("inference backend unreachable".to_string()))
        }
    }

    struct StalledModel;

    #[async_trait]
    impl PredictionModel for StalledModel {
        fn id(&self) -> &str {
            "stalled"
        }

        async fn predict(&self, input: &PredictionInput) -> Result<ModelPrediction> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(ModelPrediction::new("stalled", input.current_aqi(), 0.9, 1.0))
        }
    }

    fn input() -> PredictionInput {
        PredictionInput::new("zone-7", 80.0, 22, 5).unwrap()
    }

    fn orchestrator(models: Vec<Arc<dyn PredictionModel>>) -> ForecastOrchestrator {
        ForecastOrchestrator::new(EnsembleCombiner::with_defaults(), ForecastConfig::default()).with_models(models)
    }

    fn contribution(result: &EnsembleResult, model_id: &str) -> f64 {
        result
            .contributions
            .iter()
            .find(|c| c.model_id == model_id)
            .map(|c| c.prediction)
            .unwrap()
    }

    #[test]
    fn test_config_default() {
        let config = ForecastConfig::default();
        assert_eq!(config.max_horizon_hours, 72);
        assert_eq!(config.model_timeout(), Duration::from_secs(5));
        assert!(config.persist);
    }

    #[tokio::test]
    async fn test_zero_horizon_is_empty() {
        let results = orchestrator(default_models()).forecast(&input(), 0).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_horizon_limit() {
        let err = orchestrator(default_models()).forecast(&input(), 73).await.unwrap_err();
        assert!(matches!(err, AirqError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_no_models() {
        let err = orchestrator(Vec::new()).forecast(&input(), 3).await.unwrap_err();
        assert!(matches!(err, AirqError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_default_models_full_day() {
        let orch = orchestrator(default_models());
        assert_eq!(orch.model_ids(), vec!["lstm", "transformer", "cnn"]);

        let results = orch.forecast(&input(), 24).await.unwrap();
        assert_eq!(results.len(), 24);
        for r in &results {
            assert_eq!(r.model_count, 3);
            assert!(r.interval.contains(r.predicted));
            assert!(r.confidence >= 0.1 && r.confidence <= 0.95);
        }
    }

    #[tokio::test]
    async fn test_failing_model_replaced_by_fallback() {
        let orch = orchestrator(vec![
            FixedModel::arc("steady", 100.0, 0.9, 0.0),
            Arc::new(BrokenModel),
        ]);

        let results = orch.forecast(&input(), 2).await.unwrap();
        assert_eq!(results.len(), 2);
        for r in &results {
            assert_eq!(r.model_count, 2);
            assert!((contribution(r, "broken") - 80.0).abs() < 1e-9);
            // weights 1 and 1/1.5
            assert!((r.predicted - 92.0).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_invalid_fallback_settings_are_replaced() {
        let config = ForecastConfig {
            fallback_confidence: f64::NAN,
            fallback_uncertainty: -1.0,
            ..Default::default()
        };
        let orch = ForecastOrchestrator::new(EnsembleCombiner::with_defaults(), config).with_models(vec![
            FixedModel::arc("steady", 100.0, 0.9, 0.0),
            Arc::new(BrokenModel),
        ]);
        assert_eq!(orch.config().fallback_confidence, 0.5);
        assert_eq!(orch.config().fallback_uncertainty, 25.0);

        let results = orch.forecast(&input(), 3).await.unwrap();
        assert_eq!(results.len(), 3);
        for r in &results {
            assert!((contribution(r, "broken") - 80.0).abs() < 1e-9);
        }

        let infinite = ForecastConfig {
            fallback_uncertainty: f64::INFINITY,
            ..Default::default()
        };
        let orch = ForecastOrchestrator::new(EnsembleCombiner::with_defaults(), infinite);
        assert_eq!(orch.config().fallback_uncertainty, 25.0);
    }

    #[tokio::test]
    async fn test_unusable_output_replaced_by_fallback() {
        let orch = orchestrator(vec![
            FixedModel::arc("nan", f64::NAN, 0.9, 1.0),
            FixedModel::arc("overconfident", 120.0, 1.5, 1.0),
            FixedModel::arc("negative", 120.0, 0.5, -3.0),
        ]);

        let results = orch.forecast(&input(), 1).await.unwrap();
        let r = &results[0];
        for id in ["nan", "overconfident", "negative"] {
            assert!((contribution(r, id) - 80.0).abs() < 1e-9);
        }
        assert!((r.predicted - 80.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_model_times_out() {
        let orch = orchestrator(vec![FixedModel::arc("steady", 100.0, 0.9, 5.0), Arc::new(StalledModel)]);

        let results = orch.forecast(&input(), 1).await.unwrap();
        assert!((contribution(&results[0], "stalled") - 80.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_results_are_persisted_in_order() {
        let store = Arc::new(MemoryStore::new());
        let orch = orchestrator(default_models()).with_store(store.clone());
        let input = input();

        let results = orch.forecast(&input, 6).await.unwrap();
        let records = store.forecasts().await;
        assert_eq!(records.len(), 6);
        for (i, record) in records.iter().enumerate() {
            let offset = i as u32 + 1;
            assert_eq!(record.zone_id, "zone-7");
            assert_eq!(record.hour_offset, offset);
            assert_eq!(record.target_time, input.observed_at() + chrono::Duration::hours(offset as i64));
            assert_eq!(record.result, results[i]);
        }
    }

    #[tokio::test]
    async fn test_persistence_can_be_disabled() {
        let store = Arc::new(MemoryStore::new());
        let config = ForecastConfig {
            persist: false,
            ..Default::default()
        };
        let orch = ForecastOrchestrator::new(EnsembleCombiner::with_defaults(), config)
            .with_models(default_models())
            .with_store(store.clone());

        orch.forecast(&input(), 3).await.unwrap();
        assert!(store.forecasts().await.is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_results() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(2);
        let orch = orchestrator(default_models()).with_store(store.clone());

        let results = orch.forecast(&input(), 3).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(store.forecasts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_register_model() {
        let mut orch = orchestrator(Vec::new());
        orch.register_model(FixedModel::arc("steady", 60.0, 0.8, 2.0));

        let results = orch.forecast(&input(), 1).await.unwrap();
        assert!((results[0].predicted - 60.0).abs() < 1e-9);
        assert!((results[0].confidence - 0.95).abs() < 1e-9);
    }
}
