// kiln_simulator: physics-backed stand-in for the kiln hardware

pub mod kiln;
pub mod trace;

pub use kiln::{KilnPhysics, SimulatedKiln};
pub use trace::CsvTraceSink;
