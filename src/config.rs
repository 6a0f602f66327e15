//! Application configuration
//!
//! One TOML file, every section optional. Store credentials can come from
//! the environment (`AIRQ_STORE_URL`, `AIRQ_STORE_TOKEN`) so they stay out
//! of checked-in config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AirqError, Result};
use crate::forecast::ForecastConfig;
use crate::ml::{AnomalyConfig, EnsembleConfig};
use crate::sync::SyncConfig;

pub const ENV_STORE_URL: &str = "AIRQ_STORE_URL";
pub const ENV_STORE_TOKEN: &str = "AIRQ_STORE_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ensemble: EnsembleConfig,
    pub anomaly: AnomalyConfig,
    pub forecast: ForecastConfig,
    pub sync: SyncConfig,
    pub store: StoreConfig,
}

/// Remote store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Deployment URL; unset means no remote store
    pub url: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            request_timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AppConfig {
    /// Read `path`, apply env overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        info!("[Config] Loaded {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_STORE_URL).filter(|v| !v.is_empty()) {
            self.store.url = Some(url);
        }
        if let Some(token) = lookup(ENV_STORE_TOKEN).filter(|v| !v.is_empty()) {
            self.store.token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let e = &self.ensemble;
        if e.uncertainty_scale <= 0.0 || e.deviation_scale <= 0.0 || e.uncertainty_penalty_scale <= 0.0 {
            return Err(invalid("ensemble scales must be positive"));
        }
        if e.interval_z <= 0.0 {
            return Err(invalid("ensemble.interval_z must be positive"));
        }
        if !(0.0..=1.0).contains(&e.min_confidence)
            || !(0.0..=1.0).contains(&e.max_confidence)
            || e.min_confidence > e.max_confidence
        {
            return Err(invalid("ensemble confidence bounds must satisfy 0 <= min <= max <= 1"));
        }

        let a = &self.anomaly;
        if a.min_points < 2 {
            return Err(invalid("anomaly.min_points must be at least 2"));
        }
        if a.base_threshold <= 0.0 {
            return Err(invalid("anomaly.base_threshold must be positive"));
        }

        let f = &self.forecast;
        if f.max_horizon_hours == 0 {
            return Err(invalid("forecast.max_horizon_hours must be at least 1"));
        }
        if f.model_timeout_ms == 0 {
            return Err(invalid("forecast.model_timeout_ms must be positive"));
        }
        if !(0.0..=1.0).contains(&f.fallback_confidence)
            || !f.fallback_uncertainty.is_finite()
            || f.fallback_uncertainty < 0.0
        {
            return Err(invalid("forecast fallback must have confidence in [0, 1] and uncertainty >= 0"));
        }

        let s = &self.sync;
        if s.max_pending == 0 {
            return Err(invalid("sync.max_pending must be at least 1"));
        }
        if s.mutation_timeout_ms == 0 {
            return Err(invalid("sync.mutation_timeout_ms must be positive"));
        }

        if let Some(url) = &self.store.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid(&format!("store.url must be http(s), got {}", url)));
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> AirqError {
    AirqError::Config(message.to_string())
}
