//! Module containing the [`BuildError`] type returned by the engine build pipeline.

use thiserror::Error;

use crate::calibration::DeviceError;

#[derive(Debug, Error)]
pub enum BuildError {
    /// The graph could not be parsed. Every message reported by the parser is kept.
    #[error("failed to parse {source_name}: {}", .errors.join("; "))]
    ParseFailure {
        source_name: String,
        errors: Vec<String>,
    },
    /// The parsed network violates an invariant, i.e. inconsistent batch dimensions.
    #[error("invalid network: {0}")]
    InvalidNetwork(String),
    /// The calibration data does not match what the network expects.
    #[error("malformed calibration input: {0}")]
    MalformedCalibrationInput(String),
    #[error("unknown calibration preprocessor '{0}'")]
    UnknownPreprocessor(String),
    #[error("missing required argument: {0}")]
    MissingRequiredArgument(String),
    /// The backend did not produce an engine.
    #[error("engine build failed: {0}")]
    BuildFailure(String),
    /// An operation was called out of order.
    #[error("cannot {operation} while the builder is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
