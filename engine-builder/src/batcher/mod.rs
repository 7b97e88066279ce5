//! Calibration batches streamed from a directory of images.

mod preprocess;

use std::path::{Path, PathBuf};

use anyhow::Context;
use itertools::Itertools;
use tracing::debug;
use tract_onnx::prelude::f16;

use crate::{BuildError, network::DataType};
pub use preprocess::{
    GFPGAN_V1_4, IMAGENET, ImageLayout, Normalize, PREPROCESSORS, Preprocessor,
    preprocessor_by_name,
};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Shape and element type of every batch produced by a [`BatchSource`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchDescriptor {
    shape: Vec<usize>,
    dtype: DataType,
}

impl BatchDescriptor {
    pub fn new(shape: Vec<usize>, dtype: DataType) -> Result<Self, BuildError> {
        if shape.is_empty() || shape.contains(&0) {
            return Err(BuildError::MalformedCalibrationInput(format!(
                "batch shape {shape:?} must have positive dimensions"
            )));
        }
        if !matches!(dtype, DataType::Float | DataType::Half) {
            return Err(BuildError::MalformedCalibrationInput(format!(
                "calibration input dtype {dtype} is not supported, expected FLOAT or HALF"
            )));
        }
        Ok(Self { shape, dtype })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn batch_size(&self) -> usize {
        self.shape[0]
    }

    /// Number of elements in one sample of the batch.
    pub fn sample_len(&self) -> usize {
        self.shape[1..].iter().product()
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size()
    }

    /// Encodes `values` in the descriptor's element type.
    pub fn encode(&self, values: &[f32]) -> Vec<u8> {
        match self.dtype {
            DataType::Half => values
                .iter()
                .flat_map(|v| f16::from_f32(*v).to_le_bytes())
                .collect(),
            _ => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }
}

/// One dense host batch and the images it was made of.
#[derive(Clone, Debug)]
pub struct Batch {
    pub data: Vec<u8>,
    pub images: Vec<PathBuf>,
}

/// Finite sequence of fixed-shape batches. Once exhausted it keeps returning `None`.
pub trait BatchSource: Send {
    fn descriptor(&self) -> &BatchDescriptor;
    /// Index of the next image to be read.
    fn image_index(&self) -> usize;
    /// Number of images this source will go through.
    fn num_images(&self) -> usize;
    fn next_batch(&mut self) -> anyhow::Result<Option<Batch>>;
}

/// Reads, preprocesses and batches the images of a directory.
pub struct ImageBatcher {
    images: Vec<PathBuf>,
    descriptor: BatchDescriptor,
    layout: ImageLayout,
    preprocessor: Box<dyn Preprocessor>,
    image_index: usize,
}

impl ImageBatcher {
    /// Validates the batch layout and lists the images; nothing is decoded yet.
    ///
    /// At most `max_num_images` are used. With `exact_batches` a trailing partial batch is
    /// dropped, otherwise it is padded with zeros.
    pub fn new(
        input: &Path,
        descriptor: BatchDescriptor,
        max_num_images: usize,
        exact_batches: bool,
        preprocessor: Box<dyn Preprocessor>,
    ) -> Result<Self, BuildError> {
        let layout = ImageLayout::from_shape(descriptor.shape())?;
        let mut images = list_images(input)?;

        let batch_size = descriptor.batch_size();
        let mut num_images = images.len().min(max_num_images);
        if exact_batches {
            num_images = batch_size * (num_images / batch_size);
        }
        if num_images < 1 {
            return Err(BuildError::MalformedCalibrationInput(format!(
                "not enough images in {} to create a batch of {batch_size}",
                input.display()
            )));
        }
        images.truncate(num_images);
        debug!(
            "calibration batcher over {} images of {}, layout {:?}, preprocessor {}",
            num_images,
            input.display(),
            layout,
            preprocessor.name()
        );

        Ok(Self {
            images,
            descriptor,
            layout,
            preprocessor,
            image_index: 0,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.images.len().div_ceil(self.descriptor.batch_size())
    }
}

impl BatchSource for ImageBatcher {
    fn descriptor(&self) -> &BatchDescriptor {
        &self.descriptor
    }

    fn image_index(&self) -> usize {
        self.image_index
    }

    fn num_images(&self) -> usize {
        self.images.len()
    }

    fn next_batch(&mut self) -> anyhow::Result<Option<Batch>> {
        if self.image_index >= self.images.len() {
            return Ok(None);
        }
        let end = (self.image_index + self.descriptor.batch_size()).min(self.images.len());
        let sample_len = self.descriptor.sample_len();
        let mut values = vec![0f32; self.descriptor.element_count()];
        let images = self.images[self.image_index..end].to_vec();
        for (i, path) in images.iter().enumerate() {
            let image = image::open(path)
                .with_context(|| format!("decoding calibration image {}", path.display()))?;
            let sample = self.preprocessor.preprocess(image, &self.layout);
            anyhow::ensure!(
                sample.len() == sample_len,
                "preprocessor {} produced {} values, expected {sample_len}",
                self.preprocessor.name(),
                sample.len()
            );
            values[i * sample_len..(i + 1) * sample_len].copy_from_slice(&sample);
        }
        self.image_index = end;
        Ok(Some(Batch {
            data: self.descriptor.encode(&values),
            images,
        }))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Images of a directory sorted by path, or the input itself when it is a single image.
fn list_images(input: &Path) -> Result<Vec<PathBuf>, BuildError> {
    if input.is_file() && is_image(input) {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        return Err(BuildError::MalformedCalibrationInput(format!(
            "calibration input {} is neither an image nor a directory",
            input.display()
        )));
    }
    let images = std::fs::read_dir(input)?
        .map(|entry| entry.map(|e| e.path()))
        .filter_ok(|path| path.is_file() && is_image(path))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(images.into_iter().sorted().collect())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::testing::write_images;

    fn descriptor(batch_size: usize) -> BatchDescriptor {
        BatchDescriptor::new(vec![batch_size, 3, 4, 4], DataType::Float).unwrap()
    }

    fn batcher(dir: &Path, batch_size: usize, max: usize, exact: bool) -> ImageBatcher {
        ImageBatcher::new(
            dir,
            descriptor(batch_size),
            max,
            exact,
            Box::new(Normalize::gfpgan()),
        )
        .unwrap()
    }

    fn drain(batcher: &mut ImageBatcher) -> Vec<Batch> {
        std::iter::from_fn(|| batcher.next_batch().unwrap()).collect()
    }

    #[rstest]
    #[case(40, 8, 5)]
    #[case(41, 8, 5)]
    #[case(47, 8, 5)]
    #[case(7, 1, 7)]
    #[case(9, 3, 3)]
    fn test_exact_batches_drop_remainder(
        #[case] num_images: usize,
        #[case] batch_size: usize,
        #[case] expected: usize,
    ) -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_images(dir.path(), num_images, 4, 4)?;
        let mut batcher = batcher(dir.path(), batch_size, 25000, true);
        assert_eq!(batcher.num_batches(), expected);
        let batches = drain(&mut batcher);
        assert_eq!(batches.len(), num_images / batch_size);
        let byte_len = batch_size * 3 * 4 * 4 * 4;
        assert!(batches.iter().all(|b| b.data.len() == byte_len));
        assert!(batches.iter().all(|b| b.images.len() == batch_size));
        Ok(())
    }

    #[test]
    fn test_partial_batch_is_padded() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_images(dir.path(), 10, 4, 4)?;
        let mut batcher = batcher(dir.path(), 4, 25000, false);
        let batches = drain(&mut batcher);
        assert_eq!(batches.len(), 3);
        let last = batches.last().unwrap();
        assert_eq!(last.images.len(), 2);
        assert_eq!(last.data.len(), 4 * 3 * 4 * 4 * 4);
        // the last two samples are zero padding
        let sample_bytes = 3 * 4 * 4 * 4;
        assert!(last.data[2 * sample_bytes..].iter().all(|b| *b == 0));
        Ok(())
    }

    #[test]
    fn test_max_images_bounds_the_stream() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_images(dir.path(), 20, 4, 4)?;
        let mut batcher = batcher(dir.path(), 4, 10, true);
        assert_eq!(batcher.num_images(), 8);
        assert_eq!(drain(&mut batcher).len(), 2);
        assert_eq!(batcher.image_index(), 8);
        Ok(())
    }

    #[test]
    fn test_exhausted_stays_exhausted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_images(dir.path(), 2, 4, 4)?;
        let mut batcher = batcher(dir.path(), 2, 25000, true);
        assert!(batcher.next_batch()?.is_some());
        assert!(batcher.next_batch()?.is_none());
        assert!(batcher.next_batch()?.is_none());
        Ok(())
    }

    #[test]
    fn test_images_are_sorted_and_filtered() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_images(dir.path(), 3, 4, 4)?;
        std::fs::write(dir.path().join("notes.txt"), "not an image")?;
        let mut batcher = batcher(dir.path(), 3, 25000, true);
        let batch = batcher.next_batch()?.unwrap();
        let names = batch
            .images
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect_vec();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.iter().all(|n| n.ends_with(".png")));
        Ok(())
    }

    #[test]
    fn test_not_enough_images() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_images(dir.path(), 3, 4, 4)?;
        let result = ImageBatcher::new(
            dir.path(),
            descriptor(8),
            25000,
            true,
            Box::new(Normalize::gfpgan()),
        );
        assert!(matches!(
            result,
            Err(BuildError::MalformedCalibrationInput(_))
        ));
        Ok(())
    }

    #[test]
    fn test_missing_directory() {
        let result = ImageBatcher::new(
            Path::new("/definitely/not/here"),
            descriptor(8),
            25000,
            true,
            Box::new(Normalize::gfpgan()),
        );
        assert!(matches!(
            result,
            Err(BuildError::MalformedCalibrationInput(_))
        ));
    }

    #[rstest]
    #[case(vec![8, 3, 0, 4], DataType::Float)]
    #[case(vec![], DataType::Float)]
    #[case(vec![8, 3, 4, 4], DataType::Int64)]
    fn test_descriptor_rejects(#[case] shape: Vec<usize>, #[case] dtype: DataType) {
        assert!(matches!(
            BatchDescriptor::new(shape, dtype),
            Err(BuildError::MalformedCalibrationInput(_))
        ));
    }

    #[test]
    fn test_half_batches() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_images(dir.path(), 2, 4, 4)?;
        let descriptor = BatchDescriptor::new(vec![2, 3, 4, 4], DataType::Half)?;
        assert_eq!(descriptor.byte_len(), 2 * 3 * 4 * 4 * 2);
        let mut batcher = ImageBatcher::new(
            dir.path(),
            descriptor,
            25000,
            true,
            Box::new(Normalize::gfpgan()),
        )?;
        let batch = batcher.next_batch()?.unwrap();
        assert_eq!(batch.data.len(), 2 * 3 * 4 * 4 * 2);
        Ok(())
    }
}
