//! Error types for the forecasting and sync core

use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum AirqError {
    /// Input rejected before any computation (empty prediction list,
    /// out-of-range hour, non-finite value, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Series too short for a meaningful mean/std
    #[error("Insufficient data: need at least {required} points, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    /// Ledger already holds the configured maximum of outstanding updates
    #[error("Ledger full: {0} updates already pending")]
    LedgerFull(usize),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, AirqError>;
