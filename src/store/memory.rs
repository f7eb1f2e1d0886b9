//! In-memory simulation store.
//!
//! Each run lives behind its own mutex; the outer map lock is only held long
//! enough to find or insert a run, so steps on different runs never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::StoreError;
use crate::sim::types::{CallRecord, RunId, SimulationRun};

use super::{RunStep, SimulationStore};

#[derive(Debug)]
struct RunSlot {
    run: SimulationRun,
    calls: Vec<CallRecord>,
}

/// Thread-safe [`SimulationStore`] held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: RwLock<HashMap<RunId, Arc<Mutex<RunSlot>>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &RunId) -> Result<Option<Arc<Mutex<RunSlot>>>, StoreError> {
        let runs = self
            .runs
            .read()
            .map_err(|_| StoreError::Poisoned("memory store runs"))?;
        Ok(runs.get(id).cloned())
    }
}

impl SimulationStore for MemoryStore {
    fn insert_run(&self, run: &SimulationRun, first_call: &CallRecord) -> Result<(), StoreError> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| StoreError::Poisoned("memory store runs"))?;
        runs.insert(
            run.id.clone(),
            Arc::new(Mutex::new(RunSlot {
                run: run.clone(),
                calls: vec![first_call.clone()],
            })),
        );
        Ok(())
    }

    fn load_run(&self, id: &RunId) -> Result<Option<SimulationRun>, StoreError> {
        let Some(slot) = self.slot(id)? else {
            return Ok(None);
        };
        let slot = slot
            .lock()
            .map_err(|_| StoreError::Poisoned("memory store run"))?;
        Ok(Some(slot.run.clone()))
    }

    fn update_run(&self, id: &RunId, step: &mut RunStep<'_>) -> Result<bool, StoreError> {
        let Some(slot) = self.slot(id)? else {
            return Ok(false);
        };
        let mut slot = slot
            .lock()
            .map_err(|_| StoreError::Poisoned("memory store run"))?;

        // Work on a copy so a panicking step leaves the stored run untouched.
        let mut run = slot.run.clone();
        let call = step(&mut run);
        slot.run = run;
        if let Some(call) = call {
            slot.calls.push(call);
        }
        Ok(true)
    }

    fn list_calls(&self, id: &RunId) -> Result<Vec<CallRecord>, StoreError> {
        let Some(slot) = self.slot(id)? else {
            return Ok(Vec::new());
        };
        let slot = slot
            .lock()
            .map_err(|_| StoreError::Poisoned("memory store run"))?;
        let mut calls = slot.calls.clone();
        calls.sort_by_key(|c| c.observed_at);
        Ok(calls)
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.runs
            .write()
            .map_err(|_| StoreError::Poisoned("memory store runs"))?
            .clear();
        Ok(())
    }
}
