use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, Parser};
use engine_builder::{
    CalibrationOptions, DataType, EngineBuilder, OnnxParser, Precision, TractBackend,
    backend::{BackendLogger, DEFAULT_WORKSPACE_SIZE, Severity},
    batcher::{GFPGAN_V1_4, PREPROCESSORS},
    builder::DEFAULT_FP32_FRAGMENTS,
    setup_logging,
};
use tracing::{error, info, warn};

/// Builds an inference engine from an ONNX model.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The input ONNX model file to load.
    #[arg(short, long, env)]
    onnx: Option<PathBuf>,

    /// The output path for the engine.
    #[arg(short, long, env)]
    engine: Option<PathBuf>,

    /// The precision mode to build in.
    #[arg(short, long, env, value_enum, default_value_t = Precision::Fp16)]
    precision: Precision,

    /// Enable more verbose log output.
    #[arg(short, long, env)]
    verbose: bool,

    /// Log as JSON.
    #[arg(long, env)]
    json: bool,

    /// The directory holding images to use for calibration.
    #[arg(long, env)]
    calib_input: Option<PathBuf>,

    /// The file path for INT8 calibration cache to use.
    #[arg(long, env, default_value = "./calibration.cache")]
    calib_cache: PathBuf,

    /// The maximum number of images to use for calibration.
    #[arg(long, env, default_value_t = 25000)]
    calib_num_images: usize,

    /// The batch size for the calibration process.
    #[arg(long, env, default_value_t = 8)]
    calib_batch_size: usize,

    /// The image preprocessing applied to calibration images.
    #[arg(long, env, default_value = GFPGAN_V1_4, value_parser = PREPROCESSORS)]
    calib_preprocessor: String,

    /// Where to write the layer list. Defaults to the model path with a `layers` extension.
    #[arg(long, env)]
    layer_info: Option<PathBuf>,

    /// Where to append the backend diagnostics. Defaults to the model path with a `log`
    /// extension.
    #[arg(long, env)]
    log_file: Option<PathBuf>,

    /// Layers whose name contains one of these are kept in float32.
    #[arg(long, env, value_delimiter = ',', default_values = DEFAULT_FP32_FRAGMENTS)]
    keep_fp32: Vec<String>,

    /// Do not force any layer to float32.
    #[arg(long, env)]
    no_mixed_precision: bool,

    /// Scratch memory the backend may use while building, in bytes.
    #[arg(long, env, default_value_t = DEFAULT_WORKSPACE_SIZE)]
    workspace_size: u64,
}

fn usage_error(message: &str) -> ! {
    if let Err(e) = Args::command().print_help() {
        warn!("failed to print usage: {e}");
    }
    error!("{message}");
    std::process::exit(1)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.json, args.verbose)?;

    let (Some(onnx), Some(engine)) = (args.onnx.clone(), args.engine.clone()) else {
        usage_error("These arguments are required: --onnx and --engine");
    };
    if args.precision == Precision::Int8 && args.calib_input.is_none() && !args.calib_cache.is_file()
    {
        usage_error(
            "When building in int8 precision, either --calib-input or an existing --calib-cache is required",
        );
    }

    build(args, &onnx, &engine)
}

fn build(args: Args, onnx: &Path, engine: &Path) -> anyhow::Result<()> {
    let log_file = args.log_file.unwrap_or_else(|| onnx.with_extension("log"));
    let severity = if args.verbose {
        Severity::Verbose
    } else {
        Severity::Info
    };
    let logger = BackendLogger::new(severity)
        .with_file(&log_file)
        .with_context(|| format!("opening backend log file {}", log_file.display()))?;
    info!("Backend diagnostics go to {}", log_file.display());

    let mut builder =
        EngineBuilder::new(TractBackend::new(logger)).with_workspace_size(args.workspace_size);
    builder.create_network_from_path(&OnnxParser, onnx)?;
    let layer_info = args
        .layer_info
        .unwrap_or_else(|| onnx.with_extension("layers"));
    builder.write_layer_info(&layer_info)?;

    let calibration = CalibrationOptions {
        input: args.calib_input,
        cache: args.calib_cache,
        max_images: args.calib_num_images,
        batch_size: args.calib_batch_size,
        preprocessor: args.calib_preprocessor,
    };
    builder.apply_precision(args.precision, &calibration)?;
    if !args.no_mixed_precision {
        builder.apply_layer_overrides(&args.keep_fp32, DataType::Float)?;
    }
    builder.build_and_serialize(engine)?;
    Ok(())
}
