//! Carbon grid-intensity service with replayable simulation runs.

#[cfg(feature = "api")]
pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod ingest;
pub mod io;
pub mod providers;
/// Simulation engine, run model, and time source.
pub mod sim;
pub mod store;
pub mod timeseries;
