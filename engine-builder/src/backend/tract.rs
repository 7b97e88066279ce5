//! Reference backend on top of `tract`: it calibrates, validates the graph by optimizing it and
//! emits an [`EnginePlan`].

use std::sync::Arc;

use anyhow::{Context, bail, ensure};
use itertools::Itertools;
use tract_onnx::prelude::{DatumExt, Framework, InferenceModelExt, Tensor, f16, tvec};

use super::{
    BackendCapabilities, BackendLogger, BuildBackend, BuilderConfig, BuilderFlag,
    CalibrationTable, EnginePlan, PLAN_FORMAT_VERSION,
};
use crate::{
    calibration::{Device, HostDevice, Int8Calibrator},
    network::{DataType, Network},
};

pub struct TractBackend {
    logger: BackendLogger,
    device: Arc<dyn Device>,
    capabilities: BackendCapabilities,
}

impl Default for TractBackend {
    fn default() -> Self {
        Self::new(BackendLogger::default())
    }
}

impl TractBackend {
    pub fn new(logger: BackendLogger) -> Self {
        Self {
            logger,
            device: Arc::new(HostDevice::new()),
            capabilities: BackendCapabilities::default(),
        }
    }

    /// Overrides the reported capabilities, e.g. to emulate hardware without fast INT8.
    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_device(mut self, device: Arc<dyn Device>) -> Self {
        self.device = device;
        self
    }

    pub fn logger(&self) -> &BackendLogger {
        &self.logger
    }

    fn build_plan(&self, network: &Network, config: BuilderConfig) -> anyhow::Result<EnginePlan> {
        let BuilderConfig {
            workspace_size,
            flags,
            layer_precisions,
            int8_calibrator,
        } = config;
        ensure!(workspace_size > 0, "workspace size must be positive");
        self.logger.info(format!(
            "Building '{}' with flags [{}] and a workspace of {}",
            network.name(),
            flags.iter().join(", "),
            utils::format_bytes(workspace_size)
        ));
        for (layer, dtype) in &layer_precisions {
            if !network.layers().iter().any(|l| &l.name == layer) {
                self.logger
                    .warning(format!("precision {dtype} set on unknown layer '{layer}'"));
            }
        }
        if !layer_precisions.is_empty() && !flags.contains(&BuilderFlag::StrictTypes) {
            self.logger
                .warning("layer precisions are only hints without STRICT_TYPES");
        }

        let (calibration, calibration_batches) = match int8_calibrator {
            Some(mut calibrator) if flags.contains(&BuilderFlag::Int8) => {
                let (table, batches) = self.calibrate(network, calibrator.as_mut())?;
                (Some(table), batches)
            }
            None if flags.contains(&BuilderFlag::Int8) => {
                bail!("INT8 requested but no calibrator was provided")
            }
            _ => (None, 0),
        };

        let graph = network.source().map(<[u8]>::to_vec).unwrap_or_default();
        if !graph.is_empty() {
            let model = tract_onnx::onnx()
                .model_for_read(&mut &*graph)
                .context("loading graph")?;
            let optimized = model.into_optimized().context("optimizing graph")?;
            self.logger.verbose(format!(
                "optimized graph has {} nodes",
                optimized.nodes().len()
            ));
        }
        utils::log_memory_usage("engine build");

        Ok(EnginePlan {
            format_version: PLAN_FORMAT_VERSION,
            backend: self.name().to_string(),
            model_hash: EnginePlan::model_hash(&graph),
            flags,
            workspace_size,
            layer_precisions,
            inputs: network.inputs().to_vec(),
            outputs: network.outputs().to_vec(),
            calibration,
            calibration_batches,
            graph,
        })
    }

    /// Runs the calibrator protocol and returns the table with the number of measured batches.
    fn calibrate(
        &self,
        network: &Network,
        calibrator: &mut dyn Int8Calibrator,
    ) -> anyhow::Result<(CalibrationTable, usize)> {
        let batch_size = calibrator.batch_size();
        self.logger
            .verbose(format!("calibrating with batches of {batch_size}"));
        if let Some(cache) = calibrator.read_cache()? {
            match CalibrationTable::from_bytes(&cache) {
                Ok(table) => {
                    self.logger.info(format!(
                        "Using {} calibration scales from cache",
                        table.len()
                    ));
                    return Ok((table, 0));
                }
                Err(e) => self
                    .logger
                    .warning(format!("ignoring calibration cache: {e:#}")),
            }
        }

        let input = network
            .inputs()
            .first()
            .context("network has no input to calibrate")?;
        let shape = input
            .batched_shape(batch_size)
            .with_context(|| format!("calibration needs a concrete shape for {input}"))?;
        let byte_len = shape.iter().product::<usize>() * input.dtype.size();
        let names = network.inputs().iter().map(|i| i.name.as_str()).collect_vec();

        let runnable = match (network.source(), input.dtype) {
            (Some(graph), DataType::Float) => Some(
                tract_onnx::onnx()
                    .model_for_read(&mut &*graph)?
                    .with_input_fact(0, f32::fact(shape.clone()).into())?
                    .into_optimized()?
                    .into_runnable()
                    .context("preparing graph for calibration")?,
            ),
            _ => None,
        };

        let mut table = CalibrationTable::new();
        let mut batches = 0;
        while let Some(pointers) = calibrator.get_batch(&names)? {
            let ptr = pointers
                .first()
                .copied()
                .context("calibrator returned an empty batch")?;
            let bytes = self.device.memcpy_dtoh(ptr, byte_len)?;
            let values = decode(&bytes, input.dtype)?;
            table.observe(&input.name, values.iter().copied());
            if let Some(runnable) = &runnable {
                let tensor = Tensor::from_shape::<f32>(&shape, &values)?;
                let outputs = runnable.run(tvec!(tensor.into()))?;
                for (desc, value) in network.outputs().iter().zip(outputs) {
                    if let Ok(view) = value.as_slice::<f32>() {
                        table.observe(&desc.name, view.iter().copied());
                    }
                }
            }
            batches += 1;
        }
        ensure!(batches > 0, "calibration did not receive any batch");
        self.logger.info(format!(
            "Measured {} tensors over {} batches",
            table.len(),
            batches
        ));
        calibrator.write_cache(&table.to_bytes())?;
        Ok((table, batches))
    }
}

fn decode(bytes: &[u8], dtype: DataType) -> anyhow::Result<Vec<f32>> {
    Ok(match dtype {
        DataType::Float => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        DataType::Half => bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        other => bail!("cannot calibrate an input of type {other}"),
    })
}

impl BuildBackend for TractBackend {
    fn name(&self) -> &str {
        "tract"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn device(&self) -> Arc<dyn Device> {
        self.device.clone()
    }

    fn build_serialized_network(
        &self,
        network: &Network,
        config: BuilderConfig,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        match self.build_plan(network, config) {
            Ok(plan) => Ok(Some(plan.to_bytes()?)),
            Err(e) => {
                self.logger.error(format!("engine build failed: {e:#}"));
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        GraphParser, OnnxParser,
        backend::Severity,
        calibration::{CalibrationCache, EngineCalibrator},
        testing::{VecBatchSource, add_graph, relu_graph},
    };

    fn calibrator(
        backend: &TractBackend,
        dir: &std::path::Path,
        source: Option<VecBatchSource>,
    ) -> anyhow::Result<Box<dyn Int8Calibrator>> {
        let mut calibrator = EngineCalibrator::new(
            CalibrationCache::new(dir.join("calibration.cache")),
            backend.device(),
        );
        calibrator.configure(source.map(|s| Box::new(s) as _))?;
        Ok(Box::new(calibrator))
    }

    #[test]
    fn test_fp32_plan() -> anyhow::Result<()> {
        let network = OnnxParser.parse(&add_graph())?;
        let backend = TractBackend::default();
        let bytes = backend
            .build_serialized_network(&network, BuilderConfig::default())?
            .unwrap();
        let plan = EnginePlan::from_bytes(&bytes)?;
        assert!(plan.flags.is_empty());
        assert_eq!(plan.inputs.len(), 2);
        assert_eq!(plan.calibration, None);
        assert_eq!(plan.model_hash, EnginePlan::model_hash(&add_graph()));
        Ok(())
    }

    #[test]
    fn test_int8_measures_input_and_output() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let network = OnnxParser.parse(&relu_graph())?;
        let backend = TractBackend::default();
        let sample = |sign: f32| vec![sign * 1.27; 3 * 4 * 4];
        let source = VecBatchSource::new(vec![1, 3, 4, 4], vec![sample(1.0), sample(-2.0)]);
        let mut config = BuilderConfig::default();
        config.set_flag(BuilderFlag::Int8);
        config.int8_calibrator = Some(calibrator(&backend, dir.path(), Some(source))?);

        let plan = EnginePlan::from_bytes(
            &backend
                .build_serialized_network(&network, config)?
                .unwrap(),
        )?;
        assert_eq!(plan.calibration_batches, 2);
        let table = plan.calibration.unwrap();
        assert!((table.scale("x").unwrap() - 0.02).abs() < 1e-6);
        // relu clips the negative batch
        assert!((table.scale("y").unwrap() - 0.01).abs() < 1e-6);

        let cached = std::fs::read(dir.path().join("calibration.cache"))?;
        assert_eq!(CalibrationTable::from_bytes(&cached)?, table);
        Ok(())
    }

    #[test]
    fn test_int8_uses_cache_without_batches() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut cached = CalibrationTable::new();
        cached.observe("x", [12.7]);
        std::fs::write(dir.path().join("calibration.cache"), cached.to_bytes())?;

        let network = OnnxParser.parse(&relu_graph())?;
        let backend = TractBackend::default();
        let mut config = BuilderConfig::default();
        config.set_flag(BuilderFlag::Int8);
        config.int8_calibrator = Some(calibrator(&backend, dir.path(), None)?);
        let plan = EnginePlan::from_bytes(
            &backend
                .build_serialized_network(&network, config)?
                .unwrap(),
        )?;
        assert_eq!(plan.calibration_batches, 0);
        assert_eq!(plan.calibration, Some(cached));
        Ok(())
    }

    #[test]
    fn test_int8_without_calibrator_builds_nothing() -> anyhow::Result<()> {
        let network = OnnxParser.parse(&relu_graph())?;
        let mut config = BuilderConfig::default();
        config.set_flag(BuilderFlag::Int8);
        assert_eq!(
            TractBackend::default().build_serialized_network(&network, config)?,
            None
        );
        Ok(())
    }

    #[test]
    fn test_int8_without_batches_builds_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let network = OnnxParser.parse(&relu_graph())?;
        let backend = TractBackend::default();
        let mut config = BuilderConfig::default();
        config.set_flag(BuilderFlag::Int8);
        config.int8_calibrator = Some(calibrator(&backend, dir.path(), None)?);
        assert_eq!(backend.build_serialized_network(&network, config)?, None);
        assert!(!dir.path().join("calibration.cache").exists());
        Ok(())
    }

    #[test]
    fn test_failures_go_to_the_log_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = dir.path().join("build.log");
        let backend =
            TractBackend::new(BackendLogger::new(Severity::Info).with_file(&log)?);
        let network = OnnxParser.parse(&relu_graph())?;
        let config = BuilderConfig {
            workspace_size: 0,
            ..Default::default()
        };
        assert_eq!(backend.build_serialized_network(&network, config)?, None);
        let content = std::fs::read_to_string(&log)?;
        assert!(content.contains("[ERROR] engine build failed"), "{content}");
        Ok(())
    }

    #[test]
    fn test_decode_half() -> anyhow::Result<()> {
        let bytes = [f16::from_f32(1.5), f16::from_f32(-2.0)]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect_vec();
        assert_eq!(decode(&bytes, DataType::Half)?, vec![1.5, -2.0]);
        assert!(decode(&bytes, DataType::Int64).is_err());
        Ok(())
    }
}
