//! Input engine: raw frame to network tensor
//!
//! Letterboxes the frame into the network input size, converts to RGB and
//! scales to `[0, 1]`, producing a `[3, H, W]` tensor.

use std::fmt;

use image::{imageops, ImageBuffer, Rgb, RgbImage};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use super::frame::RawFrame;
use crate::error::{Error, Result};

/// Letterbox padding value (grey 127 on the 0..255 scale)
pub const PAD_VALUE: f32 = 127.0 / 255.0;

/// Network input resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputSize {
    pub width: u32,
    pub height: u32,
}

impl InputSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Tensor shape `[channels, height, width]`
    pub fn tensor_shape(&self) -> [usize; 3] {
        [3, self.height as usize, self.width as usize]
    }
}

impl fmt::Display for InputSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Letterbox geometry, used to map detections back to frame coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResizeInfo {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub original_width: u32,
    pub original_height: u32,
}

impl ResizeInfo {
    pub fn new(original: (u32, u32), target: InputSize) -> Self {
        let (orig_w, orig_h) = original;

        let scale = f32::min(
            target.height as f32 / orig_h as f32,
            target.width as f32 / orig_w as f32,
        );

        let new_w = ((orig_w as f32 * scale).round() as u32).clamp(1, target.width);
        let new_h = ((orig_h as f32 * scale).round() as u32).clamp(1, target.height);

        // Split padding as the reference letterbox does: round(d - 0.1) on the leading side
        let dw = (target.width - new_w) as f32 / 2.0;
        let dh = (target.height - new_h) as f32 / 2.0;

        Self {
            scale,
            offset_x: (dw - 0.1).round().max(0.0) as u32,
            offset_y: (dh - 0.1).round().max(0.0) as u32,
            resized_width: new_w,
            resized_height: new_h,
            original_width: orig_w,
            original_height: orig_h,
        }
    }

    /// Convert model-space coordinates back to original frame space
    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        let x = (x - self.offset_x as f32) / self.scale;
        let y = (y - self.offset_y as f32) / self.scale;
        (x, y)
    }
}

/// Network-ready input tensor
#[derive(Debug, Clone)]
pub struct PreparedTensor {
    /// RGB values in `[0, 1]`, shape `[3, H, W]`
    pub data: Array3<f32>,
    pub size: InputSize,
    pub resize: ResizeInfo,
    pub frame_index: u64,
}

impl PreparedTensor {
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Contiguous CHW slice of the tensor values.
    pub fn as_slice(&self) -> &[f32] {
        self.data
            .as_slice()
            .expect("PreparedTensor is always built in standard layout")
    }

    /// NHWC bytes, the native input layout of the NPU driver.
    pub fn to_nhwc_u8(&self) -> Vec<u8> {
        let (h, w) = (self.size.height as usize, self.size.width as usize);
        let mut out = Vec::with_capacity(h * w * 3);
        for y in 0..h {
            for x in 0..w {
                for c in 0..3 {
                    let v = self.data[[c, y, x]];
                    out.push((v * 255.0).round().clamp(0.0, 255.0) as u8);
                }
            }
        }
        out
    }
}

/// Letterbox/normalise stage of the pipeline
#[derive(Debug, Clone)]
pub struct InputEngine {
    supported: Vec<InputSize>,
}

impl InputEngine {
    pub fn new(supported: Vec<InputSize>) -> Self {
        Self { supported }
    }

    pub fn supported_sizes(&self) -> &[InputSize] {
        &self.supported
    }

    /// Prepare `frame` for a network of size `target`.
    pub fn prepare(&self, frame: &RawFrame, target: InputSize) -> Result<PreparedTensor> {
        if !self.supported.contains(&target) {
            return Err(Error::Size {
                requested: target,
                supported: self.supported.clone(),
            });
        }
        frame.validate()?;

        let resize = ResizeInfo::new((frame.width, frame.height), target);
        let rgb = frame_to_rgb(frame);
        let resized = if (resize.resized_width, resize.resized_height) == (frame.width, frame.height) {
            rgb
        } else {
            imageops::resize(
                &rgb,
                resize.resized_width,
                resize.resized_height,
                imageops::FilterType::Triangle,
            )
        };

        let data = letterbox_to_chw(&resized, target, &resize);

        Ok(PreparedTensor {
            data,
            size: target,
            resize,
            frame_index: frame.index,
        })
    }
}

fn frame_to_rgb(frame: &RawFrame) -> RgbImage {
    ImageBuffer::from_fn(frame.width, frame.height, |x, y| Rgb(frame.rgb_at(x, y)))
}

/// Place the resized image on a grey canvas and convert to CHW floats
fn letterbox_to_chw(resized: &RgbImage, target: InputSize, resize: &ResizeInfo) -> Array3<f32> {
    let mut tensor = Array3::<f32>::from_elem(target.tensor_shape(), PAD_VALUE);

    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + resize.offset_x) as usize;
        let ty = (y + resize.offset_y) as usize;
        for c in 0..3 {
            tensor[[c, ty, tx]] = pixel[c] as f32 / 255.0;
        }
    }

    tensor
}
