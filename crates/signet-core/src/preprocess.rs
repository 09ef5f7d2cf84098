//! Image normalisation into the fixed tensor layout scorers expect.
//!
//! Every image, probe or reference, goes through the same transform:
//! decode, convert to 8-bit luma, bilinear resize to 224×224, replicate the
//! luma plane into three identical channels (R = G = B = Y), scale to [0, 1].
//! The resulting tensor is height × width × channel.

use crate::types::ImageSource;
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageError};
use ndarray::{Array3, Array4, ArrayView3};
use std::path::PathBuf;
use thiserror::Error;

// --- Named constants ---
pub const SIGNET_INPUT_SIZE: u32 = 224;
pub const SIGNET_CHANNELS: usize = 3;
const PIXEL_SCALE: f32 = 255.0;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("failed to read image {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image {origin}: {source}")]
    Decode {
        origin: String,
        #[source]
        source: ImageError,
    },
}

/// Normalised image tensor, shape `[size, size, 3]`, values in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor(Array3<f32>);

impl Tensor {
    /// Wrap an existing HWC array. Mostly useful for tests and custom scorers.
    pub fn from_array(values: Array3<f32>) -> Self {
        Self(values)
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.0.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    /// Mean over all elements; 0.0 for an empty tensor.
    pub fn mean(&self) -> f32 {
        self.0.mean().unwrap_or(0.0)
    }

    /// Copy with a leading batch axis, `[1, size, size, 3]`.
    pub fn batched(&self) -> Array4<f32> {
        self.0.clone().insert_axis(ndarray::Axis(0))
    }
}

/// Decode-and-normalise transform shared by verification and pair loading.
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    size: u32,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self { size: SIGNET_INPUT_SIZE }
    }
}

impl Preprocessor {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Resolve an image source into a normalised tensor.
    pub fn preprocess(&self, source: &ImageSource) -> Result<Tensor, PreprocessError> {
        let gray = match source {
            ImageSource::FromPath(path) => {
                let bytes = std::fs::read(path).map_err(|source| PreprocessError::Read {
                    path: path.clone(),
                    source,
                })?;
                decode_luma(&bytes, || path.display().to_string())?
            }
            ImageSource::FromBytes(bytes) => decode_luma(bytes, || source.describe())?,
        };

        Ok(self.normalize(&gray))
    }

    /// Shortcut for encoded bytes already in memory.
    pub fn preprocess_bytes(&self, bytes: &[u8]) -> Result<Tensor, PreprocessError> {
        let gray = decode_luma(bytes, || format!("<{} bytes in memory>", bytes.len()))?;
        Ok(self.normalize(&gray))
    }

    /// Resize a luma image and expand it into the HWC float tensor.
    fn normalize(&self, gray: &GrayImage) -> Tensor {
        let size = self.size as usize;
        let resized = if gray.width() == self.size && gray.height() == self.size {
            gray.clone()
        } else {
            imageops::resize(gray, self.size, self.size, FilterType::Triangle)
        };

        let mut tensor = Array3::<f32>::zeros((size, size, SIGNET_CHANNELS));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let normalized = pixel.0[0] as f32 / PIXEL_SCALE;
            // Luma → 3-channel: replicate Y → [R=Y, G=Y, B=Y]
            for c in 0..SIGNET_CHANNELS {
                tensor[[y as usize, x as usize, c]] = normalized;
            }
        }

        Tensor(tensor)
    }
}

fn decode_luma(bytes: &[u8], origin: impl FnOnce() -> String) -> Result<GrayImage, PreprocessError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_luma8())
        .map_err(|source| PreprocessError::Decode {
            origin: origin(),
            source,
        })
}
