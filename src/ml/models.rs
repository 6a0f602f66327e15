//! Prediction model interface
//!
//! The orchestrator only sees [`PredictionModel`]; a real inference service
//! plugs in by implementing it. The models here are deterministic
//! heuristics standing in for the dashboard's LSTM / Transformer / CNN
//! slots so forecasts are reproducible.

use std::f64::consts::PI;
use std::sync::Arc;

use async_trait::async_trait;

use super::ensemble::ModelPrediction;
use crate::error::Result;
use crate::types::PredictionInput;

#[async_trait]
pub trait PredictionModel: Send + Sync {
    /// Stable identifier, used as `ModelPrediction::model_id`
    fn id(&self) -> &str;

    async fn predict(&self, input: &PredictionInput) -> Result<ModelPrediction>;
}

/// All built-in models, in registration order
pub fn default_models() -> Vec<Arc<dyn PredictionModel>> {
    vec![
        Arc::new(PersistenceModel::default()),
        Arc::new(DiurnalModel::default()),
        Arc::new(PollutantModel::default()),
    ]
}

/// Blends the latest reading with the recent history mean.
///
/// Occupies the "lstm" slot.
#[derive(Debug, Clone)]
pub struct PersistenceModel {
    id: String,
    /// Weight of the current reading vs. the history mean
    pub persistence: f64,
    /// Number of trailing history points considered
    pub lookback: usize,
}

impl Default for PersistenceModel {
    fn default() -> Self {
        Self {
            id: "lstm".to_string(),
            persistence: 0.7,
            lookback: 24,
        }
    }
}

#[async_trait]
impl PredictionModel for PersistenceModel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn predict(&self, input: &PredictionInput) -> Result<ModelPrediction> {
        let current = input.current_aqi();
        let recent: Vec<f64> = input
            .history()
            .map(|h| h.iter().rev().take(self.lookback).copied().collect())
            .unwrap_or_default();

        if recent.is_empty() {
            return Ok(ModelPrediction::new(&self.id, current, 0.6, 15.0));
        }

        let n = recent.len() as f64;
        let mean = recent.iter().sum::<f64>() / n;
        let std_dev = (recent.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();

        let prediction = self.persistence * current + (1.0 - self.persistence) * mean;
        Ok(ModelPrediction::new(&self.id, prediction, 0.75, 8.0 + 0.5 * std_dev))
    }
}

/// Scales the current reading by a traffic-driven daily cycle.
///
/// Occupies the "transformer" slot.
#[derive(Debug, Clone)]
pub struct DiurnalModel {
    id: String,
    /// Peak-to-mean swing of the daily cycle (0.2 = +-20%)
    pub amplitude: f64,
    /// Multiplier applied on Saturday/Sunday
    pub weekend_factor: f64,
}

impl Default for DiurnalModel {
    fn default() -> Self {
        Self {
            id: "transformer".to_string(),
            amplitude: 0.2,
            weekend_factor: 0.9,
        }
    }
}

impl DiurnalModel {
    /// Double-peaked cycle: highs around 08:00 and 20:00, lows around 02:00 and 14:00
    fn cycle_factor(&self, hour: u32) -> f64 {
        1.0 + self.amplitude * ((hour as f64 - 8.0) * PI / 6.0).cos()
    }
}

#[async_trait]
impl PredictionModel for DiurnalModel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn predict(&self, input: &PredictionInput) -> Result<ModelPrediction> {
        let mut factor = self.cycle_factor(input.hour_of_day());
        if input.day_of_week() == 0 || input.day_of_week() == 6 {
            factor *= self.weekend_factor;
        }

        let prediction = input.current_aqi() * factor;
        Ok(ModelPrediction::new(&self.id, prediction, 0.7, 20.0))
    }
}

/// Derives AQI from the PM2.5 concentration, adjusted for wind dispersal
/// and humidity.
///
/// Occupies the "cnn" slot.
#[derive(Debug, Clone)]
pub struct PollutantModel {
    id: String,
    /// Fractional AQI reduction per m/s of wind, capped at 10 m/s
    pub dispersal_per_ms: f64,
}

impl Default for PollutantModel {
    fn default() -> Self {
        Self {
            id: "cnn".to_string(),
            dispersal_per_ms: 0.02,
        }
    }
}

/// EPA PM2.5 breakpoints: (conc_lo, conc_hi, aqi_lo, aqi_hi)
const PM25_BREAKPOINTS: [(f64, f64, f64, f64); 6] = [
    (0.0, 12.0, 0.0, 50.0),
    (12.1, 35.4, 51.0, 100.0),
    (35.5, 55.4, 101.0, 150.0),
    (55.5, 150.4, 151.0, 200.0),
    (150.5, 250.4, 201.0, 300.0),
    (250.5, 500.4, 301.0, 500.0),
];

/// Sub-index for a PM2.5 concentration (µg/m³), linear within each band
pub fn pm25_to_aqi(concentration: f64) -> f64 {
    let c = concentration.max(0.0);
    for &(c_lo, c_hi, a_lo, a_hi) in &PM25_BREAKPOINTS {
        if c <= c_hi {
            let c = c.max(c_lo);
            return a_lo + (a_hi - a_lo) * (c - c_lo) / (c_hi - c_lo);
        }
    }
    500.0
}

#[async_trait]
impl PredictionModel for PollutantModel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn predict(&self, input: &PredictionInput) -> Result<ModelPrediction> {
        let pm25 = input.pollutants().pm25;
        let weather = input.weather();

        // No particulate reading: nothing better than the current value
        let base = if pm25 > 0.0 {
            0.5 * input.current_aqi() + 0.5 * pm25_to_aqi(pm25)
        } else {
            input.current_aqi()
        };

        let dispersal = 1.0 - self.dispersal_per_ms * weather.wind_speed_ms.clamp(0.0, 10.0);
        // Humid air holds particulates
        let humidity = 1.0 + 0.001 * (weather.humidity_pct - 50.0).max(0.0);

        let prediction = (base * dispersal * humidity).max(0.0);
        Ok(ModelPrediction::new(&self.id, prediction, 0.8, 12.0))
    }
}
