//! Derived streams computed from the live telemetry.
pub mod decimator;

pub use decimator::{DecimatorStage, LowPass, MovingAverage, SignalFilter};
