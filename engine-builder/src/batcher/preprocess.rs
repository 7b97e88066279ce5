//! Named image preprocessing recipes applied to calibration images.

use image::{DynamicImage, imageops::FilterType};

use crate::BuildError;

/// Where the image sits inside one sample of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageLayout {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    /// NCHW when true, NHWC otherwise.
    pub channels_first: bool,
}

impl ImageLayout {
    /// Derives the layout from a rank 4 batch shape. Channel-first wins when ambiguous.
    pub fn from_shape(shape: &[usize]) -> Result<Self, BuildError> {
        let &[_, a, b, c] = shape else {
            return Err(BuildError::MalformedCalibrationInput(format!(
                "expected a rank 4 image batch shape, got {shape:?}"
            )));
        };
        if a == 1 || a == 3 {
            Ok(Self {
                channels: a,
                height: b,
                width: c,
                channels_first: true,
            })
        } else if c == 1 || c == 3 {
            Ok(Self {
                channels: c,
                height: a,
                width: b,
                channels_first: false,
            })
        } else {
            Err(BuildError::MalformedCalibrationInput(format!(
                "cannot find a channel dimension of size 1 or 3 in {shape:?}"
            )))
        }
    }

    pub fn sample_len(&self) -> usize {
        self.channels * self.height * self.width
    }
}

pub trait Preprocessor: Send {
    fn name(&self) -> &str;
    /// Resizes and normalizes `image` into exactly [`ImageLayout::sample_len`] values.
    fn preprocess(&self, image: DynamicImage, layout: &ImageLayout) -> Vec<f32>;
}

/// Resize followed by per channel `(x / 255 - mean) / std`.
#[derive(Clone, Debug)]
pub struct Normalize {
    name: &'static str,
    mean: [f32; 3],
    std: [f32; 3],
    filter: FilterType,
}

pub const GFPGAN_V1_4: &str = "gfpganv1.4";
pub const IMAGENET: &str = "imagenet";
pub const PREPROCESSORS: [&str; 2] = [GFPGAN_V1_4, IMAGENET];

impl Normalize {
    /// Maps pixels to [-1, 1], as expected by GFPGAN v1.4.
    pub fn gfpgan() -> Self {
        Self {
            name: GFPGAN_V1_4,
            mean: [0.5; 3],
            std: [0.5; 3],
            filter: FilterType::Triangle,
        }
    }

    pub fn imagenet() -> Self {
        Self {
            name: IMAGENET,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
            filter: FilterType::Triangle,
        }
    }
}

impl Preprocessor for Normalize {
    fn name(&self) -> &str {
        self.name
    }

    fn preprocess(&self, image: DynamicImage, layout: &ImageLayout) -> Vec<f32> {
        let (width, height) = (layout.width as u32, layout.height as u32);
        let resized = image.resize_exact(width, height, self.filter);
        let pixels = match layout.channels {
            1 => resized.to_luma8().into_raw(),
            _ => resized.to_rgb8().into_raw(),
        };
        let channels = layout.channels;
        let plane = layout.height * layout.width;
        let mut sample = vec![0f32; layout.sample_len()];
        // pixels are HWC
        for (i, &p) in pixels.iter().enumerate() {
            let (pixel, c) = (i / channels, i % channels);
            let value = (p as f32 / 255.0 - self.mean[c]) / self.std[c];
            let index = if layout.channels_first {
                c * plane + pixel
            } else {
                i
            };
            sample[index] = value;
        }
        sample
    }
}

/// Looks up a preprocessing recipe by its name.
pub fn preprocessor_by_name(name: &str) -> Result<Box<dyn Preprocessor>, BuildError> {
    match name {
        GFPGAN_V1_4 => Ok(Box::new(Normalize::gfpgan())),
        IMAGENET => Ok(Box::new(Normalize::imagenet())),
        _ => Err(BuildError::UnknownPreprocessor(name.to_string())),
    }
}
