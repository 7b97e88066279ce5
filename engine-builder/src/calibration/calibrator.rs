use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use super::{CalibrationCache, Device, DevicePtr, StagingBuffer};
use crate::{BuildError, batcher::BatchSource};

/// Callbacks a backend invokes while measuring activation ranges for INT8.
///
/// The backend asks for the batch size, then for a cached calibration. When there is none it
/// pulls batches with [`Int8Calibrator::get_batch`] until `None` and finally hands back the
/// calibration it computed.
pub trait Int8Calibrator: Send {
    fn batch_size(&self) -> usize;
    /// Device addresses of the next batch, one per requested input. `None` ends the stream.
    fn get_batch(&mut self, names: &[&str]) -> anyhow::Result<Option<Vec<DevicePtr>>>;
    fn read_cache(&mut self) -> anyhow::Result<Option<Vec<u8>>>;
    fn write_cache(&mut self, cache: &[u8]) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CalibrationProgress {
    pub images_consumed: usize,
    pub total_images: usize,
    pub batches_consumed: usize,
}

/// [`Int8Calibrator`] streaming batches from a [`BatchSource`] through a device staging buffer,
/// with its calibration persisted in a [`CalibrationCache`].
pub struct EngineCalibrator {
    cache: CalibrationCache,
    device: Arc<dyn Device>,
    source: Option<Box<dyn BatchSource>>,
    staging: Option<StagingBuffer>,
    progress: CalibrationProgress,
}

impl EngineCalibrator {
    pub fn new(cache: CalibrationCache, device: Arc<dyn Device>) -> Self {
        Self {
            cache,
            device,
            source: None,
            staging: None,
            progress: CalibrationProgress::default(),
        }
    }

    /// Binds the batch source to calibrate with, or none when only the cache is used.
    ///
    /// The staging buffer of any previous source is released before the new one is allocated.
    pub fn configure(&mut self, source: Option<Box<dyn BatchSource>>) -> Result<(), BuildError> {
        self.staging = None;
        self.source = None;
        self.progress = CalibrationProgress::default();
        let Some(source) = source else {
            return Ok(());
        };
        let descriptor = source.descriptor();
        if descriptor.batch_size() == 0 || descriptor.byte_len() == 0 {
            return Err(BuildError::MalformedCalibrationInput(format!(
                "empty calibration batch shape {:?}",
                descriptor.shape()
            )));
        }
        let staging = StagingBuffer::allocate(self.device.clone(), descriptor.byte_len())?;
        debug!(
            "calibration staging buffer of {} on {}",
            utils::format_bytes(staging.size() as u64),
            self.device.name()
        );
        self.progress.total_images = source.num_images();
        self.staging = Some(staging);
        self.source = Some(source);
        Ok(())
    }

    pub fn progress(&self) -> CalibrationProgress {
        self.progress
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn staging_buffer(&self) -> Option<&StagingBuffer> {
        self.staging.as_ref()
    }
}

impl Int8Calibrator for EngineCalibrator {
    fn batch_size(&self) -> usize {
        self.source
            .as_ref()
            .map(|source| source.descriptor().batch_size())
            .unwrap_or(1)
    }

    fn get_batch(&mut self, names: &[&str]) -> anyhow::Result<Option<Vec<DevicePtr>>> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        anyhow::ensure!(
            names.len() <= 1,
            "calibration of networks with several inputs is not supported, got {names:?}"
        );
        let Some(staging) = self.staging.as_mut() else {
            // stream already exhausted and buffer released
            return Ok(None);
        };
        let Some(batch) = source.next_batch()? else {
            info!(
                "Finished calibration batches: {} images in {} batches",
                utils::format_count(self.progress.images_consumed),
                self.progress.batches_consumed
            );
            self.staging = None;
            return Ok(None);
        };
        staging
            .upload(&batch.data)
            .context("uploading calibration batch")?;
        self.progress.images_consumed = source.image_index();
        self.progress.batches_consumed += 1;
        info!(
            "Calibrating image {} / {}",
            utils::format_count(self.progress.images_consumed),
            utils::format_count(self.progress.total_images)
        );
        Ok(Some(vec![staging.ptr()]))
    }

    fn read_cache(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        self.cache
            .load()
            .with_context(|| format!("reading calibration cache {}", self.cache.path().display()))
    }

    fn write_cache(&mut self, cache: &[u8]) -> anyhow::Result<()> {
        self.cache
            .store(cache)
            .with_context(|| format!("writing calibration cache {}", self.cache.path().display()))
    }
}
