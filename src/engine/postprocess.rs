//! Output engine: raw tensors to detections with appearance embeddings

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use image::{ImageBuffer, Rgb, RgbImage};
use serde::Serialize;
use tracing::debug;

use super::backend::InferenceResult;
use super::frame::RawFrame;
use super::model::{OutputSchema, BOX_COLUMNS, DETECTIONS_TENSOR, EMBEDDINGS_TENSOR};
use super::preprocess::InputSize;
use crate::error::{Error, Result};
use crate::utils::math::{argmax, iou, l2_normalize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputOptions {
    /// Minimum objectness for a row to become a detection
    pub conf_threshold: f32,
    /// IoU threshold; `None` keeps every row above `conf_threshold`
    pub nms_threshold: Option<f32>,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            conf_threshold: 0.5,
            nms_threshold: None,
        }
    }
}

/// One detected object in frame coordinates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    /// Row of the raw output this came from
    pub row: usize,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: usize,
    /// L2-normalised appearance embedding
    pub embedding: Vec<f32>,
}

impl Detection {
    pub fn bbox(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameDetections {
    pub frame_index: u64,
    pub input_size: InputSize,
    pub detections: Vec<Detection>,
}

impl FrameDetections {
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct OutputEngine {
    schema: OutputSchema,
    options: OutputOptions,
}

impl OutputEngine {
    pub fn new(schema: OutputSchema, options: OutputOptions) -> Self {
        Self { schema, options }
    }

    pub fn schema(&self) -> &OutputSchema {
        &self.schema
    }

    /// Decode one inference result. Shape disagreements are decode errors.
    pub fn decode(&self, result: &InferenceResult) -> Result<FrameDetections> {
        let expected = self.schema.tensor_shapes(result.input_size);
        let det_shape = &expected[0].1;
        let emb_shape = &expected[1].1;

        let dets = self.checked(result, DETECTIONS_TENSOR, det_shape)?;
        let embs = self.checked(result, EMBEDDINGS_TENSOR, emb_shape)?;

        let rows = det_shape[0];
        let det_cols = det_shape[1];
        let emb_dim = emb_shape[1];
        let resize = &result.resize;
        let (max_x, max_y) = (resize.original_width as f32, resize.original_height as f32);

        let mut detections = Vec::new();
        for row in 0..rows {
            let d = &dets[row * det_cols..(row + 1) * det_cols];
            let objectness = d[4];
            if !(objectness >= self.options.conf_threshold) {
                continue;
            }

            let (cx, cy, w, h) = (d[0], d[1], d[2], d[3]);
            let (x1, y1) = resize.to_original(cx - w / 2.0, cy - h / 2.0);
            let (x2, y2) = resize.to_original(cx + w / 2.0, cy + h / 2.0);

            let mut embedding = embs[row * emb_dim..(row + 1) * emb_dim].to_vec();
            l2_normalize(&mut embedding);

            detections.push(Detection {
                row,
                x1: x1.clamp(0.0, max_x),
                y1: y1.clamp(0.0, max_y),
                x2: x2.clamp(0.0, max_x),
                y2: y2.clamp(0.0, max_y),
                confidence: objectness,
                class_id: argmax(&d[BOX_COLUMNS..]).unwrap_or(0),
                embedding,
            });
        }

        if let Some(threshold) = self.options.nms_threshold {
            detections = nms(detections, threshold);
        }

        debug!(
            "Frame {}: {} detections from {} rows",
            result.frame_index,
            detections.len(),
            rows
        );

        Ok(FrameDetections {
            frame_index: result.frame_index,
            input_size: result.input_size,
            detections,
        })
    }

    fn checked<'a>(&self, result: &'a InferenceResult, name: &str, shape: &[usize]) -> Result<&'a [f32]> {
        let tensor = result
            .tensor(name)
            .ok_or_else(|| Error::Decode(format!("missing output tensor {:?}", name)))?;
        if tensor.shape != shape {
            return Err(Error::Decode(format!(
                "tensor {:?} has shape {:?}, expected {:?} for input {}",
                name, tensor.shape, shape, result.input_size
            )));
        }
        let len: usize = shape.iter().product();
        if tensor.data.len() != len {
            return Err(Error::Decode(format!(
                "tensor {:?} carries {} values for shape {:?}",
                name,
                tensor.data.len(),
                shape
            )));
        }
        Ok(&tensor.data)
    }
}

/// Greedy non-maximum suppression; output is sorted by confidence.
pub fn nms(mut detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if keep.iter().all(|k| iou(k.bbox(), det.bbox()) <= threshold) {
            keep.push(det);
        }
    }
    keep
}

const PALETTE: [[u8; 3]; 6] = [
    [0, 255, 0],
    [255, 64, 64],
    [64, 160, 255],
    [255, 200, 0],
    [200, 0, 255],
    [0, 255, 255],
];

/// Draw the detections onto an RGB copy of `frame`.
pub fn render(frame: &RawFrame, detections: &FrameDetections) -> Result<RgbImage> {
    frame.validate()?;
    let mut image: RgbImage = ImageBuffer::from_fn(frame.width, frame.height, |x, y| Rgb(frame.rgb_at(x, y)));

    for det in &detections.detections {
        let color = Rgb(PALETTE[det.class_id % PALETTE.len()]);
        draw_rectangle(
            &mut image,
            det.x1.round() as i32,
            det.y1.round() as i32,
            det.x2.round() as i32,
            det.y2.round() as i32,
            color,
        );
    }
    Ok(image)
}

fn draw_rectangle(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}

/// One JSON object per frame, one frame per line
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write(&mut self, detections: &FrameDetections) -> Result<()> {
        serde_json::to_writer(&mut self.writer, detections)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
