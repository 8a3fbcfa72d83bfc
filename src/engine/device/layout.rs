//! Native output layouts to the row-major output schema
//!
//! The converted graph emits each output channel-major, `[1, cols, rows, 1]`,
//! either plain NCHW or packed NC1HWC2 (`[1, c1, rows, 1, c2]`), as int8,
//! uint8 or f32. Everything here is pure so it can be checked off-device.

use super::ffi::*;

/// Element type of a native output buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeType {
    Int8 { zp: i32, scale: f32 },
    Uint8 { zp: i32, scale: f32 },
    Float32,
}

impl NativeType {
    fn elem_size(&self) -> usize {
        match self {
            NativeType::Int8 { .. } | NativeType::Uint8 { .. } => 1,
            NativeType::Float32 => 4,
        }
    }
}

/// Memory order of a native output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeLayout {
    Nchw,
    Nc1hwc2 { c1: usize, c2: usize },
}

/// Decoded description of one native output
#[derive(Debug, Clone, PartialEq)]
pub struct NativeOutput {
    pub name: String,
    pub layout: NativeLayout,
    pub dtype: NativeType,
    /// Logical channels, i.e. schema columns
    pub channels: usize,
    /// Spatial extent `H * W`, i.e. schema rows
    pub spatial: usize,
}

impl NativeOutput {
    /// Interpret a queried attribute.
    pub fn from_attr(attr: &TensorAttr) -> Result<Self, String> {
        let dtype = match attr.type_ {
            TYPE_INT8 => NativeType::Int8 {
                zp: attr.zp,
                scale: attr.scale,
            },
            TYPE_UINT8 => NativeType::Uint8 {
                zp: attr.zp,
                scale: attr.scale,
            },
            TYPE_FLOAT32 => NativeType::Float32,
            TYPE_FLOAT16 => return Err(format!("output {} is float16, re-export as int8 or float32", attr.index)),
            other => return Err(format!("output {} has unsupported type {}", attr.index, other)),
        };

        let dims: Vec<usize> = attr.shape().iter().map(|&d| d as usize).collect();
        let (layout, channels, spatial) = match (attr.fmt, dims.as_slice()) {
            (FORMAT_NCHW, [1, c, h, w]) => (NativeLayout::Nchw, *c, h * w),
            (FORMAT_NC1HWC2, [1, c1, h, w, c2]) => {
                // n_elems carries the unpadded element count
                let spatial = h * w;
                let channels = if spatial > 0 {
                    attr.n_elems as usize / spatial
                } else {
                    0
                };
                if channels == 0 || channels > c1 * c2 {
                    return Err(format!(
                        "output {} has inconsistent NC1HWC2 shape {:?} for {} elements",
                        attr.index, dims, attr.n_elems
                    ));
                }
                (NativeLayout::Nc1hwc2 { c1: *c1, c2: *c2 }, channels, spatial)
            }
            (fmt, _) => {
                return Err(format!(
                    "output {} has unsupported layout {} with shape {:?}",
                    attr.index, fmt, dims
                ))
            }
        };

        Ok(Self {
            name: attr.name_str().to_string(),
            layout,
            dtype,
            channels,
            spatial,
        })
    }

    /// Bytes this output occupies in its native layout
    pub fn native_len(&self) -> usize {
        let elems = match self.layout {
            NativeLayout::Nchw => self.channels * self.spatial,
            NativeLayout::Nc1hwc2 { c1, c2 } => c1 * self.spatial * c2,
        };
        elems * self.dtype.elem_size()
    }

    /// Convert a native buffer into a row-major `[spatial, channels]` tensor.
    pub fn to_rows(&self, bytes: &[u8]) -> Result<Vec<f32>, String> {
        if bytes.len() < self.native_len() {
            return Err(format!(
                "output {:?} holds {} bytes, layout needs {}",
                self.name,
                bytes.len(),
                self.native_len()
            ));
        }

        let values = dequantize(bytes, self.dtype, self.native_len() / self.dtype.elem_size());
        let nchw = match self.layout {
            NativeLayout::Nchw => values,
            NativeLayout::Nc1hwc2 { c1, c2 } => nc1hwc2_to_nchw(&values, c1, self.spatial, c2, self.channels),
        };
        Ok(transpose(&nchw, self.channels, self.spatial))
    }
}

/// Affine dequantization `(raw - zp) * scale`, or a plain f32 read
pub fn dequantize(bytes: &[u8], dtype: NativeType, count: usize) -> Vec<f32> {
    match dtype {
        NativeType::Int8 { zp, scale } => bytes[..count]
            .iter()
            .map(|&b| (b as i8 as f32 - zp as f32) * scale)
            .collect(),
        NativeType::Uint8 { zp, scale } => bytes[..count]
            .iter()
            .map(|&b| (b as f32 - zp as f32) * scale)
            .collect(),
        NativeType::Float32 => bytes[..count * 4]
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    }
}

/// Unpack NC1HWC2 (`spatial` = H * W) into flat NCHW, dropping channel padding.
pub fn nc1hwc2_to_nchw<T: Copy + Default>(
    data: &[T],
    c1: usize,
    spatial: usize,
    c2: usize,
    channels: usize,
) -> Vec<T> {
    let mut out = vec![T::default(); channels * spatial];
    for block in 0..c1 {
        for p in 0..spatial {
            for lane in 0..c2 {
                let ch = block * c2 + lane;
                if ch >= channels {
                    break;
                }
                let src = (block * spatial + p) * c2 + lane;
                if let Some(&v) = data.get(src) {
                    out[ch * spatial + p] = v;
                }
            }
        }
    }
    out
}

/// `[channels, spatial]` to `[spatial, channels]`
fn transpose(nchw: &[f32], channels: usize, spatial: usize) -> Vec<f32> {
    let mut out = vec![0.0; channels * spatial];
    for c in 0..channels {
        for p in 0..spatial {
            out[p * channels + c] = nchw[c * spatial + p];
        }
    }
    out
}
