//! Simulation engine behaviour over the SQLite store.

mod common;

use std::sync::Arc;
use std::thread;

use chrono::Duration;

use elephant::error::SimulationError;
use elephant::sim::SimulationEngine;
use elephant::sim::types::{RunId, SimulationValue, Threshold};
use elephant::store::SqliteStore;

use common::{BUSY_TIMEOUT, engine_with_clock, t0, temp_store};

fn pairs(items: &[(f64, Option<u32>)]) -> Vec<SimulationValue> {
    items
        .iter()
        .map(|&(v, t)| SimulationValue::WithThreshold(v, t))
        .collect()
}

fn scalars(items: &[f64]) -> Vec<SimulationValue> {
    items.iter().copied().map(SimulationValue::Scalar).collect()
}

#[test]
fn threshold_countdown_moves_cursor_and_records_each_position() {
    let (_dir, store) = temp_store();
    let (engine, clock) = engine_with_clock(&store);
    let id = engine
        .create(&pairs(&[(5.0, Some(2)), (10.0, Some(1)), (15.0, None)]))
        .unwrap();

    clock.advance(Duration::minutes(1));
    assert_eq!(engine.current_value(&id).unwrap(), 5.0);
    clock.advance(Duration::minutes(1));
    assert_eq!(engine.current_value(&id).unwrap(), 5.0);
    clock.advance(Duration::minutes(1));
    assert_eq!(engine.current_value(&id).unwrap(), 10.0);
    for _ in 0..3 {
        assert_eq!(engine.current_value(&id).unwrap(), 15.0);
    }

    let run = engine.run(&id).unwrap();
    assert_eq!(run.cursor, 2);
    assert_eq!(
        run.thresholds,
        vec![Threshold::Exhausted, Threshold::Exhausted, Threshold::Unset]
    );

    let calls = engine.stats(&id).unwrap();
    let indices: Vec<usize> = calls.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    let values: Vec<f64> = calls.iter().map(|c| c.value).collect();
    assert_eq!(values, vec![5.0, 10.0, 15.0]);
    assert_eq!(calls[0].observed_at, t0());
    assert_eq!(calls[1].observed_at, t0() + Duration::minutes(2));
    assert_eq!(calls[2].observed_at, t0() + Duration::minutes(3));
}

#[test]
fn advance_is_absorbing_at_the_last_index() {
    let (_dir, store) = temp_store();
    let (engine, _clock) = engine_with_clock(&store);
    let id = engine.create(&scalars(&[1.0, 2.0])).unwrap();

    assert_eq!(engine.advance(&id).unwrap(), 2.0);
    assert_eq!(engine.advance(&id).unwrap(), 2.0);
    assert_eq!(engine.current_value(&id).unwrap(), 2.0);
    assert_eq!(engine.stats(&id).unwrap().len(), 2);
}

#[test]
fn terminal_threshold_is_spent_without_moving() {
    let (_dir, store) = temp_store();
    let (engine, _clock) = engine_with_clock(&store);
    let id = engine.create(&pairs(&[(9.0, Some(1))])).unwrap();

    assert_eq!(engine.current_value(&id).unwrap(), 9.0);
    let run = engine.run(&id).unwrap();
    assert_eq!(run.cursor, 0);
    assert_eq!(run.thresholds, vec![Threshold::Exhausted]);
    assert_eq!(engine.stats(&id).unwrap().len(), 1);
}

#[test]
fn invalid_input_is_rejected() {
    let (_dir, store) = temp_store();
    let (engine, _clock) = engine_with_clock(&store);

    let mixed = vec![SimulationValue::Scalar(1.0), SimulationValue::WithThreshold(2.0, None)];
    assert!(matches!(
        engine.create(&mixed),
        Err(SimulationError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.create(&[]),
        Err(SimulationError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.create(&scalars(&[f64::NAN])),
        Err(SimulationError::InvalidInput(_))
    ));
}

#[test]
fn unknown_run_is_not_found() {
    let (_dir, store) = temp_store();
    let (engine, _clock) = engine_with_clock(&store);
    let id = RunId::from("nope");

    assert!(matches!(engine.current_value(&id), Err(SimulationError::NotFound(_))));
    assert!(matches!(engine.advance(&id), Err(SimulationError::NotFound(_))));
    assert!(matches!(engine.stats(&id), Err(SimulationError::NotFound(_))));
}

#[test]
fn runs_survive_reopening_the_database() {
    let (dir, store) = temp_store();
    let (engine, _clock) = engine_with_clock(&store);
    let id = engine
        .create(&pairs(&[(1.0, Some(3)), (2.0, None)]))
        .unwrap();
    engine.current_value(&id).unwrap();
    drop(engine);
    drop(store);

    let reopened = SqliteStore::open(dir.path().join("elephant.db"), BUSY_TIMEOUT).unwrap();
    let engine = SimulationEngine::with_system_clock(Arc::new(reopened));
    let run = engine.run(&id).unwrap();
    assert_eq!(run.thresholds[0], Threshold::Remaining(2));

    assert_eq!(engine.current_value(&id).unwrap(), 1.0);
    assert_eq!(engine.current_value(&id).unwrap(), 1.0);
    assert_eq!(engine.current_value(&id).unwrap(), 2.0);
}

#[test]
fn runs_are_independent() {
    let (_dir, store) = temp_store();
    let (engine, _clock) = engine_with_clock(&store);
    let a = engine.create(&scalars(&[1.0, 2.0])).unwrap();
    let b = engine.create(&scalars(&[3.0, 4.0])).unwrap();
    assert_ne!(a, b);

    engine.advance(&a).unwrap();
    assert_eq!(engine.current_value(&a).unwrap(), 2.0);
    assert_eq!(engine.current_value(&b).unwrap(), 3.0);
}

#[test]
fn reset_removes_all_runs() {
    let (_dir, store) = temp_store();
    let (engine, _clock) = engine_with_clock(&store);
    let id = engine.create(&scalars(&[1.0])).unwrap();

    engine.reset().unwrap();
    assert!(matches!(engine.run(&id), Err(SimulationError::NotFound(_))));
}

#[test]
fn concurrent_reads_lose_no_countdown_steps() {
    let (_dir, store) = temp_store();
    let (engine, _clock) = engine_with_clock(&store);
    let id = engine
        .create(&pairs(&[(1.0, Some(40)), (2.0, None)]))
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let id = id.clone();
            thread::spawn(move || {
                let mut served = Vec::new();
                for _ in 0..10 {
                    served.push(engine.current_value(&id).unwrap());
                }
                served
            })
        })
        .collect();

    let served: Vec<f64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(served.len(), 40);
    assert!(served.iter().all(|&v| v == 1.0));

    let run = engine.run(&id).unwrap();
    assert_eq!(run.cursor, 1);
    assert_eq!(run.thresholds[0], Threshold::Exhausted);
    assert_eq!(engine.stats(&id).unwrap().len(), 2);
    assert_eq!(engine.current_value(&id).unwrap(), 2.0);
}
