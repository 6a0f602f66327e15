//! Anomaly and pattern scoring over historical AQI series
//!
//! Anomalies are flagged by z-score against the population mean and
//! standard deviation of the whole series. A series with zero spread has
//! no anomalies: every point sits exactly on the mean.

use serde::{Deserialize, Serialize};

use crate::error::{AirqError, Result};

/// Configuration for anomaly detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Minimum series length before mean/std are considered meaningful
    pub min_points: usize,
    /// z-score threshold at sensitivity 0; sensitivity is subtracted from it
    pub base_threshold: f64,
    /// z-score above which an anomaly is high severity
    pub high_severity_z: f64,
    /// Absolute slope (AQI per step) below which a trend counts as stable
    pub stable_slope: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            min_points: 24, // one day of hourly readings
            base_threshold: 3.0,
            high_severity_z: 4.0,
            stable_slope: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

/// Score for one point of the input series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFlag {
    /// Position in the input series
    pub index: usize,
    pub value: f64,
    pub z_score: f64,
    pub is_anomaly: bool,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Rising,
    Falling,
    Stable,
}

/// Shape of a series: linear trend plus daily cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSummary {
    pub mean: f64,
    pub std_dev: f64,
    /// Least-squares slope, AQI per step
    pub trend_slope: f64,
    pub trend: TrendDirection,
    /// Hour of day with the highest average reading
    pub peak_hour: u32,
    /// Hour of day with the lowest average reading
    pub trough_hour: u32,
}

#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(AnomalyConfig::default())
    }

    /// Flag every point of `series` whose z-score exceeds `base_threshold - sensitivity`.
    ///
    /// Returns one flag per input point, in input order. Higher sensitivity
    /// lowers the bar. Fails with `InsufficientData` below `min_points`.
    pub fn detect_anomalies(&self, series: &[f64], sensitivity: f64) -> Result<Vec<AnomalyFlag>> {
        if !sensitivity.is_finite() || !(0.0..=1.0).contains(&sensitivity) {
            return Err(AirqError::InvalidInput(format!(
                "sensitivity must be in [0, 1], got {}",
                sensitivity
            )));
        }
        let (mean, std_dev) = self.series_stats(series)?;
        let threshold = self.config.base_threshold - sensitivity;

        let flags = series
            .iter()
            .enumerate()
            .map(|(index, &value)| {
                let z_score = if std_dev > 0.0 {
                    (value - mean).abs() / std_dev
                } else {
                    0.0
                };
                let is_anomaly = z_score > threshold;
                let severity = if !is_anomaly {
                    Severity::Low
                } else if z_score > self.config.high_severity_z {
                    Severity::High
                } else {
                    Severity::Medium
                };
                AnomalyFlag {
                    index,
                    value,
                    z_score,
                    is_anomaly,
                    severity,
                }
            })
            .collect();

        Ok(flags)
    }

    /// Summarize trend and daily cycle of an hourly series whose first
    /// reading was taken at `start_hour`.
    pub fn detect_patterns(&self, series: &[f64], start_hour: u32) -> Result<PatternSummary> {
        if start_hour > 23 {
            return Err(AirqError::InvalidInput(format!(
                "start hour must be in [0, 23], got {}",
                start_hour
            )));
        }
        let (mean, std_dev) = self.series_stats(series)?;

        let trend_slope = linear_slope(series);
        let trend = if trend_slope.abs() < self.config.stable_slope {
            TrendDirection::Stable
        } else if trend_slope > 0.0 {
            TrendDirection::Rising
        } else {
            TrendDirection::Falling
        };

        let mut sums = [0.0f64; 24];
        let mut counts = [0usize; 24];
        for (i, &value) in series.iter().enumerate() {
            let hour = (start_hour as usize + i) % 24;
            sums[hour] += value;
            counts[hour] += 1;
        }
        let averages: Vec<(u32, f64)> = (0..24)
            .filter(|&h| counts[h] > 0)
            .map(|h| (h as u32, sums[h] / counts[h] as f64))
            .collect();

        let (peak_hour, _) = averages
            .iter()
            .copied()
            .fold((start_hour, f64::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        let (trough_hour, _) = averages
            .iter()
            .copied()
            .fold((start_hour, f64::MAX), |best, cur| if cur.1 < best.1 { cur } else { best });

        Ok(PatternSummary {
            mean,
            std_dev,
            trend_slope,
            trend,
            peak_hour,
            trough_hour,
        })
    }

    fn series_stats(&self, series: &[f64]) -> Result<(f64, f64)> {
        if series.len() < self.config.min_points {
            return Err(AirqError::InsufficientData {
                required: self.config.min_points,
                actual: series.len(),
            });
        }
        if series.iter().any(|v| !v.is_finite()) {
            return Err(AirqError::InvalidInput(
                "series contains non-finite values".to_string(),
            ));
        }

        let n = series.len() as f64;
        let mean = series.iter().sum::<f64>() / n;
        let variance = series.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Ok((mean, variance.sqrt()))
    }
}

fn linear_slope(series: &[f64]) -> f64 {
    let n = series.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = series.iter().sum::<f64>() / n;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, &y) in series.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }

    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 23 readings alternating 49/51 followed by `last`
    fn day_with_last(last: f64) -> Vec<f64> {
        let mut series: Vec<f64> = (0..23).map(|i| if i % 2 == 0 { 49.0 } else { 51.0 }).collect();
        series.push(last);
        series
    }

    #[test]
    fn test_insufficient_data() {
        let detector = AnomalyDetector::with_defaults();
        let result = detector.detect_anomalies(&[50.0; 23], 0.5);
        assert!(matches!(
            result,
            Err(AirqError::InsufficientData { required: 24, actual: 23 })
        ));
    }

    #[test]
    fn test_min_points_configurable() {
        let detector = AnomalyDetector::new(AnomalyConfig {
            min_points: 5,
            ..Default::default()
        });
        assert!(detector.detect_anomalies(&[1.0, 2.0, 3.0, 4.0, 5.0], 0.5).is_ok());
    }

    #[test]
    fn test_constant_series_has_no_anomalies() {
        let detector = AnomalyDetector::with_defaults();
        for sensitivity in [0.0, 0.5, 1.0] {
            let flags = detector.detect_anomalies(&[42.0; 24], sensitivity).unwrap();
            assert_eq!(flags.len(), 24);
            assert!(flags.iter().all(|f| !f.is_anomaly && f.severity == Severity::Low));
            assert!(flags.iter().all(|f| f.z_score == 0.0));
        }
    }

    #[test]
    fn test_extreme_outlier_is_high_severity() {
        let detector = AnomalyDetector::with_defaults();
        // ~11.5 standard deviations out
        let mut series: Vec<f64> = (0..199).map(|i| if i % 2 == 0 { 49.0 } else { 51.0 }).collect();
        series.insert(100, 70.0);

        let flags = detector.detect_anomalies(&series, 0.8).unwrap();
        let outlier = &flags[100];
        assert_eq!(outlier.value, 70.0);
        assert!(outlier.z_score > 10.0);
        assert!(outlier.is_anomaly);
        assert_eq!(outlier.severity, Severity::High);
        assert_eq!(flags.iter().filter(|f| f.is_anomaly).count(), 1);
    }

    #[test]
    fn test_moderate_outlier_is_medium_severity() {
        let detector = AnomalyDetector::with_defaults();
        // z ~ 3.44
        let flags = detector.detect_anomalies(&day_with_last(55.0), 0.0).unwrap();
        let last = flags.last().unwrap();
        assert!(last.is_anomaly);
        assert_eq!(last.severity, Severity::Medium);
    }

    #[test]
    fn test_sensitivity_lowers_threshold() {
        let detector = AnomalyDetector::with_defaults();
        // z ~ 2.53: above 3 - 1.0, below 3 - 0.0
        let series = day_with_last(53.0);

        let strict = detector.detect_anomalies(&series, 0.0).unwrap();
        assert!(!strict.last().unwrap().is_anomaly);

        let sensitive = detector.detect_anomalies(&series, 1.0).unwrap();
        assert!(sensitive.last().unwrap().is_anomaly);
        assert_eq!(sensitive.last().unwrap().severity, Severity::Medium);
    }

    #[test]
    fn test_sensitivity_out_of_range() {
        let detector = AnomalyDetector::with_defaults();
        assert!(matches!(
            detector.detect_anomalies(&[1.0; 24], 1.5),
            Err(AirqError::InvalidInput(_))
        ));
        assert!(matches!(
            detector.detect_anomalies(&[1.0; 24], -0.1),
            Err(AirqError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_patterns_rising_trend() {
        let detector = AnomalyDetector::with_defaults();
        let series: Vec<f64> = (0..48).map(|i| 20.0 + i as f64 * 2.0).collect();

        let summary = detector.detect_patterns(&series, 0).unwrap();
        assert_eq!(summary.trend, TrendDirection::Rising);
        assert!((summary.trend_slope - 2.0).abs() < 1e-9);
        // Second day dominates every hour, so the last hour is the peak
        assert_eq!(summary.peak_hour, 23);
        assert_eq!(summary.trough_hour, 0);
    }

    #[test]
    fn test_patterns_daily_cycle() {
        let detector = AnomalyDetector::with_defaults();
        // Flat except a rush-hour spike at 08:00 each day, starting at 06:00
        let series: Vec<f64> = (0..72)
            .map(|i| if (6 + i) % 24 == 8 { 120.0 } else { 40.0 })
            .collect();

        let summary = detector.detect_patterns(&series, 6).unwrap();
        assert_eq!(summary.peak_hour, 8);
        assert_eq!(summary.trend, TrendDirection::Stable);
    }

    #[test]
    fn test_patterns_require_min_points() {
        let detector = AnomalyDetector::with_defaults();
        assert!(matches!(
            detector.detect_patterns(&[1.0; 10], 0),
            Err(AirqError::InsufficientData { .. })
        ));
    }
}
