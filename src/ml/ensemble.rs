//! Ensemble prediction module
//!
//! Combines multiple model outputs into one estimate:
//! - Uncertainty-weighted averaging (noisy models are downweighted, never dropped)
//! - Population spread of the models around the ensemble mean
//! - Agreement-adjusted confidence
//! - Two-sided confidence interval floored at the domain minimum

use serde::{Deserialize, Serialize};

use crate::error::{AirqError, Result};

/// Configuration for the ensemble combiner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Uncertainty at which a model's weight halves
    pub uncertainty_scale: f64,
    /// Deviation from the mean at which agreement reaches zero
    pub deviation_scale: f64,
    /// Ensemble uncertainty at which confidence reaches zero
    pub uncertainty_penalty_scale: f64,
    /// z-value of the confidence interval (1.96 = 95%)
    pub interval_z: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
    /// Smallest meaningful value of the predicted quantity
    pub domain_floor: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            uncertainty_scale: 50.0,
            deviation_scale: 100.0,
            uncertainty_penalty_scale: 100.0,
            interval_z: 1.96,
            min_confidence: 0.1,
            max_confidence: 0.95,
            domain_floor: 0.0, // AQI is never negative
        }
    }
}

/// Single model prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrediction {
    /// Unique model identifier
    pub model_id: String,
    /// Predicted value (AQI)
    pub prediction: f64,
    /// Model's confidence in its prediction (0-1)
    pub confidence: f64,
    /// Model's reported uncertainty (non-negative)
    pub uncertainty: f64,
}

impl ModelPrediction {
    pub fn new(model_id: impl Into<String>, prediction: f64, confidence: f64, uncertainty: f64) -> Self {
        Self {
            model_id: model_id.into(),
            prediction,
            confidence,
            uncertainty,
        }
    }
}

/// Ensemble prediction result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    /// Combined estimate
    pub predicted: f64,
    /// Confidence (adjusted for model agreement and spread)
    pub confidence: f64,
    /// Population standard deviation of model predictions around `predicted`
    pub uncertainty: f64,
    /// Closed confidence interval, `lower <= predicted <= upper`
    pub interval: ConfidenceInterval,
    /// Number of models contributing
    pub model_count: usize,
    /// Individual model contributions
    pub contributions: Vec<ModelContribution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Contribution of a single model to the ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelContribution {
    pub model_id: String,
    pub prediction: f64,
    /// Normalized weight (contributions sum to 1)
    pub weight: f64,
}

/// Stateless combiner; a pure function of its config and input list
#[derive(Debug, Clone, Default)]
pub struct EnsembleCombiner {
    config: EnsembleConfig,
}

impl EnsembleCombiner {
    pub fn new(config: EnsembleConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(EnsembleConfig::default())
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Combine multiple model predictions
    pub fn combine(&self, predictions: &[ModelPrediction]) -> Result<EnsembleResult> {
        if predictions.is_empty() {
            return Err(AirqError::InvalidInput(
                "cannot combine an empty prediction list".to_string(),
            ));
        }
        for p in predictions {
            if !p.prediction.is_finite() {
                return Err(AirqError::InvalidInput(format!(
                    "model {} produced a non-finite prediction",
                    p.model_id
                )));
            }
            if !p.uncertainty.is_finite() || p.uncertainty < 0.0 {
                return Err(AirqError::InvalidInput(format!(
                    "model {} reported invalid uncertainty {}",
                    p.model_id, p.uncertainty
                )));
            }
        }

        let weights: Vec<f64> = predictions.iter().map(|p| self.model_weight(p)).collect();
        let total_weight: f64 = weights.iter().sum();

        let weighted_sum: f64 = predictions
            .iter()
            .zip(&weights)
            .map(|(p, w)| p.prediction * w)
            .sum();
        let mean = weighted_sum / total_weight;

        let uncertainty = population_std(predictions, mean);
        let confidence = self.calculate_confidence(predictions, mean, uncertainty);

        // Floor the estimate too so the interval always brackets it
        let predicted = mean.max(self.config.domain_floor);
        let half_width = self.config.interval_z * uncertainty;
        let interval = ConfidenceInterval {
            lower: (mean - half_width).max(self.config.domain_floor),
            upper: (mean + half_width).max(predicted),
        };

        let contributions = predictions
            .iter()
            .zip(&weights)
            .map(|(p, w)| ModelContribution {
                model_id: p.model_id.clone(),
                prediction: p.prediction,
                weight: w / total_weight,
            })
            .collect();

        Ok(EnsembleResult {
            predicted,
            confidence,
            uncertainty,
            interval,
            model_count: predictions.len(),
            contributions,
        })
    }

    /// Inverse-uncertainty weight: 1 at zero uncertainty, 0.5 at `uncertainty_scale`
    fn model_weight(&self, prediction: &ModelPrediction) -> f64 {
        1.0 / (1.0 + prediction.uncertainty / self.config.uncertainty_scale)
    }

    fn calculate_confidence(&self, predictions: &[ModelPrediction], mean: f64, uncertainty: f64) -> f64 {
        let max_deviation = predictions
            .iter()
            .map(|p| (p.prediction - mean).abs())
            .fold(0.0, f64::max);
        let agreement = (1.0 - max_deviation / self.config.deviation_scale).max(0.0);

        let raw = agreement * (1.0 - uncertainty / self.config.uncertainty_penalty_scale);
        raw.clamp(self.config.min_confidence, self.config.max_confidence)
    }
}

fn population_std(predictions: &[ModelPrediction], mean: f64) -> f64 {
    let n = predictions.len() as f64;
    let variance = predictions
        .iter()
        .map(|p| (p.prediction - mean).powi(2))
        .sum::<f64>()
        / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_prediction(model_id: &str, value: f64, uncertainty: f64) -> ModelPrediction {
        ModelPrediction::new(model_id, value, 0.8, uncertainty)
    }

    #[test]
    fn test_empty_input_rejected() {
        let combiner = EnsembleCombiner::with_defaults();
        let result = combiner.combine(&[]);
        assert!(matches!(result, Err(AirqError::InvalidInput(_))));
    }

    #[test]
    fn test_uncertainty_weighting_favors_precise_model() {
        let combiner = EnsembleCombiner::with_defaults();
        let predictions = vec![
            make_prediction("lstm", 100.0, 10.0),
            make_prediction("transformer", 110.0, 20.0),
            make_prediction("cnn", 90.0, 5.0),
        ];

        let result = combiner.combine(&predictions).unwrap();
        assert!(result.predicted > 90.0 && result.predicted < 110.0);
        // Naive average is 100; cnn's low uncertainty pulls it down
        assert!(result.predicted < 100.0);
        assert!((result.predicted - 99.2070).abs() < 0.001);

        let cnn = result.contributions.iter().find(|c| c.model_id == "cnn").unwrap();
        let transformer = result
            .contributions
            .iter()
            .find(|c| c.model_id == "transformer")
            .unwrap();
        assert!(cnn.weight > transformer.weight);
    }

    #[test]
    fn test_identical_predictions() {
        let combiner = EnsembleCombiner::with_defaults();
        let predictions = vec![
            make_prediction("m1", 75.0, 12.0),
            make_prediction("m2", 75.0, 12.0),
            make_prediction("m3", 75.0, 12.0),
        ];

        let result = combiner.combine(&predictions).unwrap();
        assert!(result.uncertainty < 1e-9);
        assert_eq!(result.confidence, 0.95);
        assert!((result.predicted - 75.0).abs() < 1e-9);
        assert!(result.interval.width() < 1e-8);
    }

    #[test]
    fn test_population_uncertainty() {
        let combiner = EnsembleCombiner::with_defaults();
        // Equal weights, mean 100, deviations +-10 -> population std 10
        let predictions = vec![
            make_prediction("m1", 90.0, 0.0),
            make_prediction("m2", 110.0, 0.0),
        ];

        let result = combiner.combine(&predictions).unwrap();
        assert!((result.predicted - 100.0).abs() < 1e-9);
        assert!((result.uncertainty - 10.0).abs() < 1e-9);
        // agreement 0.9, spread penalty 0.9
        assert!((result.confidence - 0.81).abs() < 1e-9);
        assert!((result.interval.lower - 80.4).abs() < 1e-9);
        assert!((result.interval.upper - 119.6).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_floor_on_disagreement() {
        let combiner = EnsembleCombiner::with_defaults();
        let predictions = vec![
            make_prediction("m1", 10.0, 5.0),
            make_prediction("m2", 400.0, 5.0),
        ];

        let result = combiner.combine(&predictions).unwrap();
        assert_eq!(result.confidence, 0.1);
    }

    #[test]
    fn test_interval_floored_at_domain_minimum() {
        let combiner = EnsembleCombiner::with_defaults();
        let predictions = vec![
            make_prediction("m1", 2.0, 1.0),
            make_prediction("m2", 30.0, 1.0),
        ];

        let result = combiner.combine(&predictions).unwrap();
        assert_eq!(result.interval.lower, 0.0);
        assert!(result.interval.contains(result.predicted));
    }

    #[test]
    fn test_bounds_hold_across_inputs() {
        let combiner = EnsembleCombiner::with_defaults();
        let cases: Vec<Vec<ModelPrediction>> = vec![
            vec![make_prediction("a", 0.0, 0.0)],
            vec![make_prediction("a", 500.0, 100.0), make_prediction("b", 0.0, 0.0)],
            vec![
                make_prediction("a", 42.0, 3.0),
                make_prediction("b", 47.5, 30.0),
                make_prediction("c", 39.1, 9.0),
                make_prediction("d", 61.0, 80.0),
            ],
            vec![make_prediction("a", -20.0, 5.0), make_prediction("b", 5.0, 5.0)],
        ];

        for predictions in cases {
            let r = combiner.combine(&predictions).unwrap();
            assert!(r.interval.lower <= r.predicted, "{:?}", r);
            assert!(r.predicted <= r.interval.upper, "{:?}", r);
            assert!((0.1..=0.95).contains(&r.confidence), "{:?}", r);
            assert!(r.uncertainty >= 0.0);
        }
    }

    #[test]
    fn test_contributions_sum() {
        let combiner = EnsembleCombiner::with_defaults();
        let predictions = vec![
            make_prediction("m1", 60.0, 8.0),
            make_prediction("m2", 70.0, 25.0),
            make_prediction("m3", 65.0, 50.0),
        ];

        let result = combiner.combine(&predictions).unwrap();
        let weight_sum: f64 = result.contributions.iter().map(|c| c.weight).sum();
        assert!((weight_sum - 1.0).abs() < 1e-9);
        assert_eq!(result.model_count, 3);
    }

    #[test]
    fn test_invalid_uncertainty_rejected() {
        let combiner = EnsembleCombiner::with_defaults();
        let bad = vec![make_prediction("m1", 60.0, -1.0)];
        assert!(matches!(combiner.combine(&bad), Err(AirqError::InvalidInput(_))));

        let nan = vec![make_prediction("m1", f64::NAN, 1.0)];
        assert!(matches!(combiner.combine(&nan), Err(AirqError::InvalidInput(_))));
    }
}
