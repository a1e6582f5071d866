/// Sensorless homing threshold tuner
/// 
/// Searches the stall-detection threshold band for one axis by repeatedly
/// homing and timing the stall, then reports the highest and lowest working values.

pub mod config_loader;
pub mod error;
pub mod gcode_connection;
pub mod motion;
pub mod simulated_axis;
pub mod tuner;

pub use error::TuneError;
pub use motion::Axis;
pub use tuner::{AttemptOutcome, SearchRange, ThresholdTuner, TuningRequest, TuningResult};
