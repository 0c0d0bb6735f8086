//! Conversion of raw camera/gallery payloads into model input tensors.
//!
//! Two strategies exist. [`ResizeStrategy::Resize`] decodes the image and
//! resamples it to the model's input size. [`ResizeStrategy::ByteCycle`]
//! reproduces the legacy mobile behaviour of repeating the raw payload bytes
//! until the tensor is full, which is only useful for parity checks against
//! recorded outputs. Both are deterministic and never index past the source.

use crate::error::PreprocessError;
use crate::models::{InputTensor, PixelLayout, RawImage, TensorLayout, TensorShape};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeStrategy {
    #[default]
    Resize,
    ByteCycle,
}

pub fn to_tensor(
    image: &RawImage,
    shape: TensorShape,
    strategy: ResizeStrategy,
    layout: TensorLayout,
) -> Result<InputTensor, PreprocessError> {
    if shape.width == 0 || shape.height == 0 || shape.channels == 0 {
        return Err(PreprocessError::ZeroDimension {
            width: shape.width,
            height: shape.height,
            channels: shape.channels,
        });
    }
    if image.is_empty() {
        return Err(PreprocessError::EmptyImage);
    }
    let data = match strategy {
        ResizeStrategy::ByteCycle => byte_cycle(image.bytes(), shape.len()),
        ResizeStrategy::Resize => {
            let decoded = decode(image)?;
            let interleaved = resample(decoded, shape)?;
            match layout {
                TensorLayout::Nhwc => normalize_hwc(&interleaved),
                TensorLayout::Nchw => normalize_chw(&interleaved, shape),
            }
        }
    };
    Ok(InputTensor::new(data, shape, layout))
}

/// Legacy fill: `out[i] = bytes[i % bytes.len()] / 255`. Layout is ignored since
/// the source bytes carry no pixel structure.
fn byte_cycle(bytes: &[u8], len: usize) -> Vec<f32> {
    bytes
        .iter()
        .cycle()
        .take(len)
        .map(|b| *b as f32 / 255.0)
        .collect()
}

fn decode(image: &RawImage) -> Result<DynamicImage, PreprocessError> {
    match image.pixel_layout() {
        Some(layout) => from_pixel_buffer(image.bytes(), layout),
        None => image::load_from_memory(image.bytes())
            .map_err(|e| PreprocessError::Decode(e.to_string())),
    }
}

fn from_pixel_buffer(bytes: &[u8], layout: PixelLayout) -> Result<DynamicImage, PreprocessError> {
    let pixels = layout.width as usize * layout.height as usize;
    let mismatch = || PreprocessError::PixelBufferMismatch {
        pixels,
        actual: bytes.len(),
    };
    if pixels == 0 || bytes.len() % pixels != 0 {
        return Err(mismatch());
    }
    let (w, h, raw) = (layout.width, layout.height, bytes.to_vec());
    let img = match bytes.len() / pixels {
        1 => GrayImage::from_raw(w, h, raw).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(w, h, raw).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(w, h, raw).map(DynamicImage::ImageRgba8),
        _ => None,
    };
    img.ok_or_else(mismatch)
}

/// Resizes to the target size and returns interleaved `h * w * c` bytes.
fn resample(img: DynamicImage, shape: TensorShape) -> Result<Vec<u8>, PreprocessError> {
    let img = if img.width() == shape.width && img.height() == shape.height {
        img
    } else {
        img.resize_exact(shape.width, shape.height, FilterType::Triangle)
    };
    let raw = match shape.channels {
        1 => img.to_luma8().into_raw(),
        3 => img.to_rgb8().into_raw(),
        4 => img.to_rgba8().into_raw(),
        other => return Err(PreprocessError::UnsupportedChannels(other)),
    };
    Ok(raw)
}

fn normalize_hwc(interleaved: &[u8]) -> Vec<f32> {
    interleaved.iter().map(|v| *v as f32 / 255.0).collect()
}

fn normalize_chw(interleaved: &[u8], shape: TensorShape) -> Vec<f32> {
    let channels = shape.channels as usize;
    let plane = shape.width as usize * shape.height as usize;
    let mut input = vec![0.0; plane * channels];
    for (idx, pixel) in interleaved.chunks_exact(channels).enumerate() {
        for (c, v) in pixel.iter().enumerate() {
            input[c * plane + idx] = *v as f32 / 255.0;
        }
    }
    input
}
