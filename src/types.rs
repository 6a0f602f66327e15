//! Core domain types shared by the forecasting modules

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AirqError, Result};

/// Pollutant concentrations feeding a zone's AQI
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PollutantLevels {
    /// Fine particulate matter (µg/m³)
    pub pm25: f64,
    /// Coarse particulate matter (µg/m³)
    pub pm10: f64,
    /// Ozone (ppb)
    pub o3: f64,
    /// Nitrogen dioxide (ppb)
    pub no2: f64,
    /// Sulfur dioxide (ppb)
    pub so2: f64,
    /// Carbon monoxide (ppm)
    pub co: f64,
}

/// Environmental covariates at observation time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherConditions {
    pub temperature_c: f64,
    /// Relative humidity (0-100)
    pub humidity_pct: f64,
    pub wind_speed_ms: f64,
    /// Meteorological direction the wind blows from (0-360)
    pub wind_direction_deg: f64,
}

impl Default for WeatherConditions {
    fn default() -> Self {
        Self {
            temperature_c: 20.0,
            humidity_pct: 50.0,
            wind_speed_ms: 3.0,
            wind_direction_deg: 0.0,
        }
    }
}

/// Everything a model sees for one forecast step.
///
/// Constructed once through [`PredictionInput::new`] and never mutated;
/// the orchestrator derives per-hour copies with [`PredictionInput::shifted`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionInput {
    zone_id: String,
    observed_at: DateTime<Utc>,
    current_aqi: f64,
    pollutants: PollutantLevels,
    weather: WeatherConditions,
    hour_of_day: u32,
    day_of_week: u32,
    history: Option<Vec<f64>>,
}

impl PredictionInput {
    pub fn new(
        zone_id: impl Into<String>,
        current_aqi: f64,
        hour_of_day: u32,
        day_of_week: u32,
    ) -> Result<Self> {
        if !current_aqi.is_finite() || current_aqi < 0.0 {
            return Err(AirqError::InvalidInput(format!(
                "current AQI must be a non-negative number, got {}",
                current_aqi
            )));
        }
        if hour_of_day > 23 {
            return Err(AirqError::InvalidInput(format!(
                "hour of day must be in [0, 23], got {}",
                hour_of_day
            )));
        }
        if day_of_week > 6 {
            return Err(AirqError::InvalidInput(format!(
                "day of week must be in [0, 6], got {}",
                day_of_week
            )));
        }

        Ok(Self {
            zone_id: zone_id.into(),
            observed_at: Utc::now(),
            current_aqi,
            pollutants: PollutantLevels::default(),
            weather: WeatherConditions::default(),
            hour_of_day,
            day_of_week,
            history: None,
        })
    }

    pub fn with_pollutants(mut self, pollutants: PollutantLevels) -> Self {
        self.pollutants = pollutants;
        self
    }

    pub fn with_weather(mut self, weather: WeatherConditions) -> Self {
        self.weather = weather;
        self
    }

    /// Attach past AQI readings, oldest first
    pub fn with_history(mut self, history: Vec<f64>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_observed_at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = observed_at;
        self
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn current_aqi(&self) -> f64 {
        self.current_aqi
    }

    pub fn pollutants(&self) -> &PollutantLevels {
        &self.pollutants
    }

    pub fn weather(&self) -> &WeatherConditions {
        &self.weather
    }

    pub fn hour_of_day(&self) -> u32 {
        self.hour_of_day
    }

    pub fn day_of_week(&self) -> u32 {
        self.day_of_week
    }

    pub fn history(&self) -> Option<&[f64]> {
        self.history.as_deref()
    }

    /// Copy of this input advanced by `hours` of wall-clock time.
    ///
    /// Hour wraps mod 24; day of week advances once per wrapped day.
    pub fn shifted(&self, hours: u32) -> Self {
        let total = u64::from(self.hour_of_day) + u64::from(hours);
        let days = (u64::from(self.day_of_week) + total / 24) % 7;
        // Saturates at the end of representable time
        let observed_at = self
            .observed_at
            .checked_add_signed(Duration::hours(i64::from(hours)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            hour_of_day: (total % 24) as u32,
            day_of_week: days as u32,
            observed_at,
            ..self.clone()
        }
    }
}
