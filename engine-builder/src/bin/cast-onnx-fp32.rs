use std::path::PathBuf;

use clap::Parser;
use engine_builder::{
    cast::{cast_file, default_output_path},
    setup_logging,
};
use tracing::info;

/// Rewrites the double and half tensors of an ONNX model to float32.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The ONNX model to convert.
    #[arg(short, long, env)]
    input: PathBuf,

    /// Where to write the converted model. Defaults to `<stem>_.onnx` next to the input.
    #[arg(short, long, env)]
    output: Option<PathBuf>,

    /// Log as JSON.
    #[arg(long, env)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.json, false)?;

    let output = args
        .output
        .unwrap_or_else(|| default_output_path(&args.input));
    let report = cast_file(&args.input, &output)?;
    if report.is_empty() {
        info!("{} only uses float32 already", args.input.display());
    }
    Ok(())
}
