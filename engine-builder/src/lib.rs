//! Converts ONNX graphs into inference engines, optionally quantized to INT8 with a
//! calibration dataset streamed through a device staging buffer.

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

pub mod backend;
pub mod batcher;
pub mod builder;
pub mod calibration;
pub mod cast;
mod error;
pub mod network;
mod parser;
#[cfg(test)]
mod testing;

pub use backend::{BuildBackend, BuilderConfig, Precision, TractBackend};
pub use builder::{BuilderState, CalibrationOptions, EngineBuilder};
pub use error::BuildError;
pub use network::{DataType, Network, TensorDesc};
pub use parser::{GraphParser, OnnxParser, ParseErrors};

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default level, which is
/// INFO, or DEBUG when `verbose` is set.
pub fn setup_logging(json: bool, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(filter)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("setting up logging")
    } else {
        let subscriber = tracing_subscriber::fmt()
            .pretty()
            .compact()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(filter)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("setting up logging")
    }
}
