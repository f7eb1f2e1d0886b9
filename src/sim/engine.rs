//! Simulation engine: a per-run cursor over a fixed value sequence.
//!
//! Each run starts at index 0. Reads count down the threshold of the current
//! slot and move the cursor on when it runs out; `advance` moves it
//! unconditionally. The last index is absorbing. Every position the cursor
//! occupies is recorded exactly once in the run's call history.
//!
//! All mutation happens inside [`SimulationStore::update_run`], so steps on
//! the same run are serialized by the store and either fully applied or
//! fully rolled back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::SimulationError;
use crate::store::SimulationStore;

use super::clock::{Clock, SystemClock};
use super::types::{CallRecord, RunId, SimulationRun, SimulationValue, normalize};

/// Entry point for creating and stepping simulation runs.
///
/// Cheap to clone; clones share the same store and clock.
#[derive(Clone)]
pub struct SimulationEngine {
    store: Arc<dyn SimulationStore>,
    clock: Arc<dyn Clock>,
}

impl SimulationEngine {
    /// Creates an engine over `store`, stamping call records with `clock`.
    pub fn new(store: Arc<dyn SimulationStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Creates an engine that stamps call records with wall-clock time.
    pub fn with_system_clock(store: Arc<dyn SimulationStore>) -> Self {
        Self::new(store, Arc::new(SystemClock))
    }

    /// Starts a new run over `entries` and records its first position.
    ///
    /// # Arguments
    ///
    /// * `entries` - Non-empty, all scalars or all `(value, threshold)` pairs
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for empty or mixed input (nothing is stored),
    /// or `Store` if the insert fails.
    pub fn create(&self, entries: &[SimulationValue]) -> Result<RunId, SimulationError> {
        let (values, thresholds) = normalize(entries)?;
        let now = self.clock.now();
        let run = SimulationRun {
            id: RunId::generate(),
            values,
            thresholds,
            cursor: 0,
            created_at: now,
        };
        let first_call = record(&run, now);

        self.store.insert_run(&run, &first_call)?;
        info!(run_id = %run.id, len = run.values.len(), "simulation created");
        Ok(run.id)
    }

    /// Returns the current value of a run and counts the read against its threshold.
    ///
    /// The value returned is the one current *before* any auto-advance this
    /// read triggers.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id, or `Store` if the step could not
    /// be committed (the run is then unchanged).
    pub fn current_value(&self, id: &RunId) -> Result<f64, SimulationError> {
        let mut observed = None;
        let found = self.store.update_run(id, &mut |run| {
            let (value, call) = read_current(run, self.clock.now());
            observed = Some(value);
            call
        })?;
        let value = resolve(id, found, observed)?;
        debug!(run_id = %id, value, "simulation read");
        Ok(value)
    }

    /// Moves a run to its next value and returns it.
    ///
    /// At the last index nothing changes and the last value is returned.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id, or `Store` if the step could not
    /// be committed.
    pub fn advance(&self, id: &RunId) -> Result<f64, SimulationError> {
        let mut observed = None;
        let found = self.store.update_run(id, &mut |run| {
            let (value, call) = advance_cursor(run, self.clock.now());
            observed = Some(value);
            call
        })?;
        let value = resolve(id, found, observed)?;
        debug!(run_id = %id, value, "simulation advanced");
        Ok(value)
    }

    /// Call history of a run, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn stats(&self, id: &RunId) -> Result<Vec<CallRecord>, SimulationError> {
        if self.store.load_run(id)?.is_none() {
            return Err(SimulationError::NotFound(id.to_string()));
        }
        Ok(self.store.list_calls(id)?)
    }

    /// Snapshot of a run's state without counting a read.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn run(&self, id: &RunId) -> Result<SimulationRun, SimulationError> {
        self.store
            .load_run(id)?
            .ok_or_else(|| SimulationError::NotFound(id.to_string()))
    }

    /// Deletes every run and call record.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the delete fails.
    pub fn reset(&self) -> Result<(), SimulationError> {
        self.store.reset()?;
        info!("simulation store reset");
        Ok(())
    }
}

fn resolve(id: &RunId, found: bool, observed: Option<f64>) -> Result<f64, SimulationError> {
    match (found, observed) {
        (true, Some(value)) => Ok(value),
        _ => Err(SimulationError::NotFound(id.to_string())),
    }
}

fn record(run: &SimulationRun, at: DateTime<Utc>) -> CallRecord {
    CallRecord {
        run_id: run.id.clone(),
        observed_at: at,
        value: run.current(),
        index: run.cursor,
    }
}

/// Counts one read against the current slot.
///
/// Returns the pre-advance value and, if the cursor moved, the record for
/// the new position. At the last index the threshold is still counted down
/// but the cursor stays put.
fn read_current(run: &mut SimulationRun, now: DateTime<Utc>) -> (f64, Option<CallRecord>) {
    let value = run.current();
    let slot = run.cursor;
    let (threshold, triggered) = run.thresholds[slot].count_read();
    run.thresholds[slot] = threshold;

    if triggered && !run.is_terminal() {
        run.cursor += 1;
        return (value, Some(record(run, now)));
    }
    (value, None)
}

/// Moves the cursor forward one slot unless it is already at the end.
fn advance_cursor(run: &mut SimulationRun, now: DateTime<Utc>) -> (f64, Option<CallRecord>) {
    if run.is_terminal() {
        return (run.current(), None);
    }
    run.cursor += 1;
    (run.current(), Some(record(run, now)))
}
