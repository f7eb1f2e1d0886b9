//! Persistence backends for simulation runs and measured intensity.
//!
//! The engine talks to storage only through [`SimulationStore`]. Two
//! backends implement it:
//! - [`MemoryStore`]: per-run locks, for embedded use and tests
//! - [`SqliteStore`]: durable, one connection per call, also holding the
//!   measured-intensity time series consumed by the HTTP surface

mod memory;
mod sqlite;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::sim::types::{CallRecord, RunId, SimulationRun};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Read-modify-write step applied to a locked run.
///
/// Mutates the run in place and optionally returns a call record to append
/// in the same transaction.
pub type RunStep<'a> = dyn FnMut(&mut SimulationRun) -> Option<CallRecord> + 'a;

/// Storage contract for simulation state.
///
/// # Invariants
/// - `insert_run` and `update_run` are atomic: the run row and the call
///   record are persisted together or not at all.
/// - `update_run` holds exclusive access to the target run for the whole
///   step, so concurrent steps on the same run are serialized.
pub trait SimulationStore: Send + Sync {
    /// Persists a new run together with its first call record.
    fn insert_run(&self, run: &SimulationRun, first_call: &CallRecord) -> Result<(), StoreError>;

    /// Reads a run without locking it.
    fn load_run(&self, id: &RunId) -> Result<Option<SimulationRun>, StoreError>;

    /// Locks `id`, applies `step`, and commits the result.
    ///
    /// Returns `Ok(false)` without calling `step` when the run does not exist.
    fn update_run(&self, id: &RunId, step: &mut RunStep<'_>) -> Result<bool, StoreError>;

    /// Call records of a run, oldest first, insertion order breaking ties.
    fn list_calls(&self, id: &RunId) -> Result<Vec<CallRecord>, StoreError>;

    /// Removes every run and call record.
    fn reset(&self) -> Result<(), StoreError>;
}

/// One measured (or estimated) intensity reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    /// Reading timestamp.
    pub time: DateTime<Utc>,
    /// ISO 3166-1 alpha-2 region code, upper case.
    pub region: String,
    /// Storage key of the source, `"{provider}_{region}"` in lower case.
    pub provider: String,
    /// gCO2eq/kWh.
    pub carbon_intensity: f64,
    /// `true` when the provider reported a forecast rather than a measurement.
    pub estimation: bool,
}

/// Builds the storage key for a provider/region pair.
///
/// # Examples
///
/// ```
/// assert_eq!(elephant::store::source_key("EnergyCharts", "DE"), "energycharts_de");
/// ```
pub fn source_key(provider: &str, region: &str) -> String {
    format!("{}_{}", provider.to_lowercase(), region.to_lowercase())
}
