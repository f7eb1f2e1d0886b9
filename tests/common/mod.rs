//! Shared test fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use elephant::config::{AppConfig, SourceConfig};
use elephant::ingest::Ingestor;
use elephant::providers::ProviderRegistry;
use elephant::sim::SimulationEngine;
use elephant::sim::clock::ManualClock;
use elephant::store::{Measurement, SqliteStore, source_key};

/// Busy timeout used by every test store.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A store in a fresh temporary directory.
///
/// The `TempDir` must outlive the store; dropping it deletes the database.
pub fn temp_store() -> (TempDir, SqliteStore) {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let store = SqliteStore::open(dir.path().join("elephant.db"), BUSY_TIMEOUT)
        .expect("store should open");
    (dir, store)
}

/// 2024-01-01T00:00:00Z.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Engine over `store` with a clock frozen at [`t0`].
pub fn engine_with_clock(store: &SqliteStore) -> (SimulationEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let engine = SimulationEngine::new(Arc::new(store.clone()), clock.clone());
    (engine, clock)
}

/// Config with DE served by EnergyCharts as primary and FR without a primary.
pub fn default_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.cron.sources = vec![
        SourceConfig {
            region: "DE".into(),
            provider: "energycharts".into(),
            primary: true,
        },
        SourceConfig {
            region: "FR".into(),
            provider: "energycharts".into(),
            primary: false,
        },
    ];
    config
}

/// Ingestor with no registered providers.
pub fn offline_ingestor(config: &AppConfig, store: &SqliteStore) -> Arc<Ingestor> {
    Arc::new(Ingestor::new(
        config.cron.sources.clone(),
        ProviderRegistry::default(),
        store.clone(),
    ))
}

/// One reading for `provider` in `region`, `hours` after [`t0`].
pub fn reading(region: &str, provider: &str, hours: i64, value: f64) -> Measurement {
    Measurement {
        time: t0() + chrono::Duration::hours(hours),
        region: region.to_uppercase(),
        provider: source_key(provider, region),
        carbon_intensity: value,
        estimation: false,
    }
}

/// Hourly DE readings from EnergyCharts (100, 110, ...) and one ElectricityMaps reading.
pub fn seed_measurements(store: &SqliteStore) {
    let mut rows: Vec<Measurement> = (0..6)
        .map(|h| reading("DE", "energycharts", h, 100.0 + 10.0 * h as f64))
        .collect();
    rows.push(reading("DE", "electricitymaps", 2, 300.0));
    store
        .insert_measurements(&rows)
        .expect("seed insert should succeed");
}
