//! Engine build orchestration: parse the graph, configure precisions, attach the INT8
//! calibrator and hand everything to a [`BuildBackend`].

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use memmap2::Mmap;
use tracing::{debug, error, info, warn};

use crate::{
    BuildError, GraphParser,
    backend::{BuildBackend, BuilderConfig, BuilderFlag, Precision},
    batcher::{BatchDescriptor, GFPGAN_V1_4, ImageBatcher, preprocessor_by_name},
    calibration::{CalibrationCache, EngineCalibrator},
    network::{DataType, Network},
};

/// Layers of the GFPGAN modulated convolutions that lose too much precision below float32.
pub const DEFAULT_FP32_FRAGMENTS: [&str; 5] = [
    "modulated_conv/Pow",
    "modulated_conv/ReduceSum",
    "modulated_conv/Add",
    "modulated_conv/Sqrt",
    "modulated_conv/Div",
];

/// Where INT8 calibration data comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalibrationOptions {
    /// Directory of calibration images. Only needed when the cache does not exist yet.
    pub input: Option<PathBuf>,
    pub cache: PathBuf,
    pub max_images: usize,
    pub batch_size: usize,
    pub preprocessor: String,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            input: None,
            cache: PathBuf::from("./calibration.cache"),
            max_images: 25000,
            batch_size: 8,
            preprocessor: GFPGAN_V1_4.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display)]
pub enum BuilderState {
    #[display("created")]
    Created,
    #[display("network built")]
    NetworkBuilt,
    #[display("configured")]
    Configured,
    #[display("configured with a calibrator")]
    CalibratorAttached,
    #[display("built")]
    Built,
    #[display("serialized")]
    Serialized,
    #[display("failed ({_0})")]
    Failed(String),
}

/// Drives one engine build. Each step may only be called once, in order; any error moves the
/// builder to [`BuilderState::Failed`].
pub struct EngineBuilder<B: BuildBackend> {
    backend: B,
    state: BuilderState,
    network: Option<Network>,
    config: Option<BuilderConfig>,
}

impl<B: BuildBackend> EngineBuilder<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: BuilderState::Created,
            network: None,
            config: Some(BuilderConfig::default()),
        }
    }

    pub fn with_workspace_size(mut self, workspace_size: u64) -> Self {
        if let Some(config) = self.config.as_mut() {
            config.workspace_size = workspace_size;
        }
        self
    }

    pub fn state(&self) -> &BuilderState {
        &self.state
    }

    pub fn network(&self) -> Option<&Network> {
        self.network.as_ref()
    }

    /// The configuration until it is consumed by [`Self::build_and_serialize`].
    pub fn config(&self) -> Option<&BuilderConfig> {
        self.config.as_ref()
    }

    fn ensure_state(
        &self,
        operation: &'static str,
        allowed: &[BuilderState],
    ) -> Result<(), BuildError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(BuildError::InvalidState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    fn fail<T>(&mut self, err: BuildError) -> Result<T, BuildError> {
        self.state = BuilderState::Failed(err.to_string());
        Err(err)
    }

    /// Parses `graph` into the network to build. All the parser errors are reported.
    pub fn create_network(
        &mut self,
        parser: &dyn GraphParser,
        graph: &[u8],
        source_name: &str,
    ) -> Result<&Network, BuildError> {
        self.ensure_state("create a network", &[BuilderState::Created])?;
        let network = match parser.parse(graph) {
            Ok(network) => network,
            Err(errors) => {
                for message in errors.messages() {
                    error!("{message}");
                }
                return self.fail(BuildError::ParseFailure {
                    source_name: source_name.to_string(),
                    errors: errors.into_messages(),
                });
            }
        };

        info!("Network Description");
        for input in network.inputs() {
            info!("Input {input}");
        }
        for output in network.outputs() {
            info!("Output {output}");
        }
        match network.batch_size() {
            Ok(Some(batch_size)) => debug!("network batch size is {batch_size}"),
            Ok(None) => debug!("network batch size is dynamic"),
            Err(e) => return self.fail(e),
        }

        self.state = BuilderState::NetworkBuilt;
        Ok(self.network.insert(network))
    }

    /// Same as [`Self::create_network`] with the graph mapped from `path`.
    pub fn create_network_from_path(
        &mut self,
        parser: &dyn GraphParser,
        path: &Path,
    ) -> Result<&Network, BuildError> {
        self.ensure_state("create a network", &[BuilderState::Created])?;
        let mapped = std::fs::File::open(path).and_then(|file| {
            // SAFETY: the model file is not expected to change while it is parsed
            unsafe { Mmap::map(&file) }
        });
        let mapped = match mapped {
            Ok(mapped) => mapped,
            Err(e) => return self.fail(e.into()),
        };
        self.create_network(parser, &mapped, &path.display().to_string())
    }

    /// Writes one `op_type<TAB>name` line per layer of the network.
    pub fn write_layer_info(&self, path: &Path) -> Result<(), BuildError> {
        let network = self.network.as_ref().ok_or_else(|| BuildError::InvalidState {
            operation: "write layer info",
            state: self.state.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        network.write_layer_info(path)?;
        info!("Writing layer information to: {}", path.display());
        Ok(())
    }

    /// Sets the builder flags for `precision`, falling back to fp32 when the backend lacks the
    /// capability. INT8 also attaches a calibrator. Returns the precision actually used.
    pub fn apply_precision(
        &mut self,
        precision: Precision,
        calibration: &CalibrationOptions,
    ) -> Result<Precision, BuildError> {
        self.ensure_state("apply a precision", &[BuilderState::NetworkBuilt])?;
        let capabilities = self.backend.capabilities();
        let (effective, calibrator) = match precision {
            Precision::Fp32 => (Precision::Fp32, None),
            Precision::Fp16 if !capabilities.fast_fp16 => {
                warn!("FP16 is not supported natively on this platform/device");
                (Precision::Fp32, None)
            }
            Precision::Int8 if !capabilities.fast_int8 => {
                warn!("INT8 is not supported natively on this platform/device");
                (Precision::Fp32, None)
            }
            Precision::Fp16 => (Precision::Fp16, None),
            Precision::Int8 => match self.int8_calibrator(calibration) {
                Ok(calibrator) => (Precision::Int8, Some(calibrator)),
                Err(e) => return self.fail(e),
            },
        };

        let Some(config) = self.config.as_mut() else {
            return Err(BuildError::InvalidState {
                operation: "apply a precision",
                state: "missing its configuration".to_string(),
            });
        };
        match effective {
            Precision::Fp32 => {}
            Precision::Fp16 => config.set_flag(BuilderFlag::Fp16),
            Precision::Int8 => config.set_flag(BuilderFlag::Int8),
        }
        self.state = match calibrator {
            Some(calibrator) => {
                config.int8_calibrator = Some(Box::new(calibrator));
                BuilderState::CalibratorAttached
            }
            None => BuilderState::Configured,
        };
        info!("Building {effective} engine");
        Ok(effective)
    }

    fn int8_calibrator(
        &self,
        options: &CalibrationOptions,
    ) -> Result<EngineCalibrator, BuildError> {
        let network = self.network.as_ref().ok_or_else(|| BuildError::InvalidState {
            operation: "calibrate",
            state: self.state.to_string(),
        })?;
        let [input] = network.inputs() else {
            return Err(BuildError::MalformedCalibrationInput(format!(
                "calibration supports networks with a single input, this one has {}",
                network.inputs().len()
            )));
        };

        let cache = CalibrationCache::new(&options.cache);
        let mut calibrator = EngineCalibrator::new(cache.clone(), self.backend.device());
        if cache.exists() {
            info!("Calibration cache {} found", cache.path().display());
            calibrator.configure(None)?;
            return Ok(calibrator);
        }

        let Some(images) = options.input.as_deref() else {
            return Err(BuildError::MissingRequiredArgument(format!(
                "a calibration input directory is needed as the cache {} does not exist",
                cache.path().display()
            )));
        };
        let shape = input.batched_shape(options.batch_size).ok_or_else(|| {
            BuildError::MalformedCalibrationInput(format!(
                "input {input} needs a known rank and static dimensions besides the batch one"
            ))
        })?;
        let descriptor = BatchDescriptor::new(shape, input.dtype)?;
        let preprocessor = preprocessor_by_name(&options.preprocessor)?;
        let batcher = ImageBatcher::new(
            images,
            descriptor,
            options.max_images,
            true,
            preprocessor,
        )?;
        calibrator.configure(Some(Box::new(batcher)))?;
        Ok(calibrator)
    }

    /// Forces every layer whose name contains one of `fragments` to `dtype`. Returns how many
    /// layers were overridden.
    pub fn apply_layer_overrides<S: AsRef<str>>(
        &mut self,
        fragments: &[S],
        dtype: DataType,
    ) -> Result<usize, BuildError> {
        self.ensure_state(
            "override layer precisions",
            &[BuilderState::Configured, BuilderState::CalibratorAttached],
        )?;
        let (Some(network), Some(config)) = (self.network.as_ref(), self.config.as_mut()) else {
            return Ok(0);
        };
        let fragments = fragments
            .iter()
            .map(AsRef::as_ref)
            .filter(|f| !f.is_empty())
            .collect::<Vec<_>>();
        let mut overridden = 0;
        for layer in network.layers() {
            if fragments.iter().any(|f| layer.name.contains(f)) {
                info!(
                    "Forcing layer {} ({}) to {dtype} precision",
                    layer.name, layer.op_type
                );
                config.layer_precisions.insert(layer.name.clone(), dtype);
                overridden += 1;
            }
        }
        if overridden > 0 {
            config.set_flag(BuilderFlag::StrictTypes);
        }
        Ok(overridden)
    }

    /// Builds the engine with the backend and writes it atomically to `output`.
    pub fn build_and_serialize(&mut self, output: &Path) -> Result<Vec<u8>, BuildError> {
        self.ensure_state(
            "build the engine",
            &[BuilderState::Configured, BuilderState::CalibratorAttached],
        )?;
        let (Some(network), Some(config)) = (self.network.as_ref(), self.config.take()) else {
            return Err(BuildError::InvalidState {
                operation: "build the engine",
                state: "missing its network or configuration".to_string(),
            });
        };
        info!("Building engine with {}", self.backend.name());
        let engine = match self.backend.build_serialized_network(network, config) {
            Ok(Some(engine)) => engine,
            Ok(None) => {
                return self.fail(BuildError::BuildFailure(format!(
                    "{} did not produce an engine",
                    self.backend.name()
                )));
            }
            Err(e) => return self.fail(e.into()),
        };
        self.state = BuilderState::Built;

        if let Err(e) = write_atomically(output, &engine) {
            return self.fail(e.into());
        }
        info!(
            "Serialized engine of {} to {}",
            utils::format_bytes(engine.len() as u64),
            output.display()
        );
        self.state = BuilderState::Serialized;
        Ok(engine)
    }
}

/// Writes through a temporary file of the target directory so readers never see a partial file.
fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
