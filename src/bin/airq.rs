//! airq CLI
//!
//! Commands:
//! - forecast: Multi-hour ensemble forecast for one zone
//! - anomalies: Flag outliers in a JSON series of AQI readings
//! - patterns: Trend and daily cycle of a JSON series
//! - sync-demo: Optimistic update + conflict round trip against an in-memory store

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use airq::config::AppConfig;
use airq::forecast::ForecastOrchestrator;
use airq::ml::{default_models, AnomalyDetector, EnsembleCombiner};
use airq::store::{HttpStore, MemoryStore, Query, RemoteStore};
use airq::sync::{ResolutionStrategy, SyncEngine, UpdateDraft, UpdateOutcome};
use airq::types::{PollutantLevels, PredictionInput, WeatherConditions};

#[derive(Parser)]
#[command(name = "airq")]
#[command(about = "Ensemble air quality forecasting and sync toolkit")]
struct Cli {
    /// TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forecast AQI for the coming hours
    Forecast {
        /// Current AQI reading
        #[arg(long)]
        aqi: f64,
        /// Hour of day of the reading (0-23)
        #[arg(long)]
        hour: u32,
        /// Day of week of the reading (0 = Sunday)
        #[arg(long)]
        day: u32,
        /// Hours to forecast
        #[arg(long, default_value = "24")]
        horizon: u32,
        #[arg(long, default_value = "default")]
        zone: String,
        /// JSON array of recent hourly AQI readings
        #[arg(long)]
        history: Option<PathBuf>,
        /// PM2.5 concentration (µg/m³)
        #[arg(long)]
        pm25: Option<f64>,
        /// Wind speed (m/s)
        #[arg(long)]
        wind: Option<f64>,
    },
    /// Flag anomalous readings in a series
    Anomalies {
        /// JSON array of AQI readings
        #[arg(short, long)]
        file: PathBuf,
        /// 0 = least sensitive, 1 = most
        #[arg(short, long, default_value = "0.5")]
        sensitivity: f64,
    },
    /// Summarise trend and daily cycle of a series
    Patterns {
        /// JSON array of hourly AQI readings
        #[arg(short, long)]
        file: PathBuf,
        /// Hour of day of the first reading
        #[arg(long, default_value = "0")]
        start_hour: u32,
    },
    /// Run a conflicting update through the sync engine
    SyncDemo {
        /// last-writer-wins, merge, version-based or manual
        #[arg(short, long, default_value = "merge")]
        strategy: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Forecast {
            aqi,
            hour,
            day,
            horizon,
            zone,
            history,
            pm25,
            wind,
        } => {
            let mut input = PredictionInput::new(zone, aqi, hour, day)?;
            if let Some(path) = history {
                input = input.with_history(read_series(&path)?);
            }
            if let Some(pm25) = pm25 {
                input = input.with_pollutants(PollutantLevels {
                    pm25,
                    ..Default::default()
                });
            }
            if let Some(wind) = wind {
                input = input.with_weather(WeatherConditions {
                    wind_speed_ms: wind,
                    ..Default::default()
                });
            }

            let mut orchestrator = ForecastOrchestrator::new(
                EnsembleCombiner::new(config.ensemble.clone()),
                config.forecast.clone(),
            )
            .with_models(default_models());
            if config.store.url.is_some() {
                orchestrator = orchestrator.with_store(Arc::new(HttpStore::from_config(&config.store)?));
            }

            let results = orchestrator.forecast(&input, horizon).await?;
            let hours: Vec<_> = results
                .iter()
                .enumerate()
                .map(|(i, r)| json!({ "hourOffset": i + 1, "forecast": r }))
                .collect();
            print_json(&json!({ "zoneId": input.zone_id(), "hours": hours }))?;
        }
        Commands::Anomalies { file, sensitivity } => {
            let series = read_series(&file)?;
            let flags = AnomalyDetector::new(config.anomaly.clone()).detect_anomalies(&series, sensitivity)?;
            let anomalies: Vec<_> = flags.iter().filter(|f| f.is_anomaly).collect();
            info!("[Anomaly] {} of {} readings flagged", anomalies.len(), flags.len());
            print_json(&json!({ "anomalies": anomalies, "scores": flags }))?;
        }
        Commands::Patterns { file, start_hour } => {
            if start_hour > 23 {
                bail!("start hour must be in [0, 23], got {}", start_hour);
            }
            let series = read_series(&file)?;
            let summary = AnomalyDetector::new(config.anomaly.clone()).detect_patterns(&series, start_hour)?;
            print_json(&summary)?;
        }
        Commands::SyncDemo { strategy } => {
            let strategy: ResolutionStrategy = strategy.parse().map_err(anyhow::Error::msg)?;
            run_sync_demo(&config, strategy).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => {
            let mut config = AppConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}

fn read_series(path: &Path) -> anyhow::Result<Vec<f64>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let series: Vec<f64> =
        serde_json::from_str(&content).with_context(|| format!("{} is not a JSON array of numbers", path.display()))?;
    Ok(series)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Two users edit the same annotation; the local edit is based on a stale
/// version and comes back as a conflict, which `strategy` then settles.
async fn run_sync_demo(config: &AppConfig, strategy: ResolutionStrategy) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    store
        .insert(
            "annotations",
            "zone-7",
            json!({ "text": "Smoke from the ridge fire", "author": "remote", "pinned": true, "version": 2 }),
        )
        .await;

    let engine = SyncEngine::new(store.clone(), config.sync.clone());
    engine.ledger().subscribe_updates(|pending| {
        info!("[Sync] {} update(s) pending", pending.len());
    });
    engine.ledger().subscribe_conflicts(|conflicts| {
        info!("[Sync] {} open conflict(s)", conflicts.len());
    });

    // The local edit was made against version 1
    let strategy = match strategy {
        ResolutionStrategy::VersionBased { .. } => ResolutionStrategy::VersionBased { local_version: Some(1) },
        other => other,
    };
    let outcome = engine
        .submit(
            UpdateDraft::update(
                "annotations",
                "zone-7",
                json!({ "text": "Haze clearing by noon", "author": "local", "version": 1 }),
            )
            .by_user("local"),
        )
        .await?;

    let UpdateOutcome::Conflicted(conflict_id) = outcome else {
        warn!("[Sync] Expected a conflict, got {:?}", outcome);
        return Ok(());
    };

    let reapplied = engine.resolve_conflict(&conflict_id, strategy).await?;
    let document = store
        .query(Query::GetDocument {
            collection: "annotations".to_string(),
            id: "zone-7".to_string(),
        })
        .await?;

    print_json(&json!({
        "conflictId": conflict_id,
        "reapplied": reapplied.map(|o| format!("{:?}", o)),
        "openConflicts": engine.ledger().conflicts(),
        "document": document,
        "stats": engine.ledger().stats(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_help() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_forecast_parses() {
        let cli = Cli::parse_from([
            "airq", "forecast",
            "--aqi", "82.5",
            "--hour", "14",
            "--day", "3",
            "--horizon", "12",
            "--zone", "harbor",
        ]);
        if let Commands::Forecast { aqi, hour, day, horizon, zone, history, .. } = cli.command {
            assert!((aqi - 82.5).abs() < 1e-9);
            assert_eq!(hour, 14);
            assert_eq!(day, 3);
            assert_eq!(horizon, 12);
            assert_eq!(zone, "harbor");
            assert!(history.is_none());
        } else {
            panic!("Expected Forecast command");
        }
    }

    #[test]
    fn test_cli_forecast_defaults() {
        let cli = Cli::parse_from(["airq", "forecast", "--aqi", "50", "--hour", "0", "--day", "0"]);
        if let Commands::Forecast { horizon, zone, .. } = cli.command {
            assert_eq!(horizon, 24);
            assert_eq!(zone, "default");
        } else {
            panic!("Expected Forecast command");
        }
    }

    #[test]
    fn test_cli_anomalies_parses() {
        let cli = Cli::parse_from(["airq", "anomalies", "--file", "series.json", "-s", "0.8"]);
        if let Commands::Anomalies { file, sensitivity } = cli.command {
            assert_eq!(file, PathBuf::from("series.json"));
            assert!((sensitivity - 0.8).abs() < 1e-9);
        } else {
            panic!("Expected Anomalies command");
        }
    }

    #[test]
    fn test_cli_patterns_parses() {
        let cli = Cli::parse_from(["airq", "patterns", "-f", "week.json", "--start-hour", "6"]);
        if let Commands::Patterns { file, start_hour } = cli.command {
            assert_eq!(file, PathBuf::from("week.json"));
            assert_eq!(start_hour, 6);
        } else {
            panic!("Expected Patterns command");
        }
    }

    #[test]
    fn test_cli_sync_demo_default_strategy() {
        let cli = Cli::parse_from(["airq", "sync-demo"]);
        if let Commands::SyncDemo { strategy } = cli.command {
            assert_eq!(strategy, "merge");
        } else {
            panic!("Expected SyncDemo command");
        }
    }

    #[test]
    fn test_cli_global_config() {
        let cli = Cli::parse_from(["airq", "sync-demo", "--config", "airq.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("airq.toml")));
    }

    #[test]
    fn test_cli_requires_aqi() {
        assert!(Cli::try_parse_from(["airq", "forecast", "--hour", "1", "--day", "1"]).is_err());
    }

    #[tokio::test]
    async fn test_sync_demo_runs_every_strategy() {
        let config = AppConfig::default();
        for name in ["last-writer-wins", "merge", "version-based", "manual"] {
            run_sync_demo(&config, name.parse().unwrap()).await.unwrap();
        }
    }
}
