/// Error types for the threshold tuner
///
/// Collaborator failures arrive as `anyhow::Error` and are carried through
/// unchanged so the caller sees the original hardware/link message.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TuneError {
    /// Axis selector outside the supported set (X or Y)
    #[error("Invalid AXES parameter '{0}', must be 'X' or 'Y'")]
    InvalidAxis(String),

    /// Malformed tuning parameters (non-positive distances, inverted stall window, ...)
    #[error("Invalid tuning request: {0}")]
    InvalidRequest(String),

    /// A search step produced a threshold outside 0..=255
    #[error("Threshold {0} outside driver range 0..=255")]
    ThresholdOutOfRange(i32),

    /// Write/move/query failure from a collaborator; aborts the run
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TuneError>;
