/// Injectable time source.
pub mod clock;
pub mod engine;
pub mod types;

pub use engine::SimulationEngine;
