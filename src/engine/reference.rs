//! CPU reference graph
//!
//! A pooled 1x1 detection/embedding head that the NPU daemon executes when
//! no device is attached. It produces exactly the tensors of the artifact's
//! output schema, so everything downstream of the engine behaves as it
//! does on hardware.

use tracing::debug;

use super::backend::{LoadedModel, OutputTensor};
use super::model::{ModelManifest, OutputSchema, BOX_COLUMNS};
use super::preprocess::{InputSize, PreparedTensor};
use crate::error::{Error, Result};
use crate::utils::math::sigmoid;

/// Keeps `exp` of the size logits finite
const SIZE_LOGIT_LIMIT: f32 = 8.0;

#[derive(Debug, Clone)]
pub struct ReferenceGraph {
    schema: OutputSchema,
    input_sizes: Vec<InputSize>,
    /// `[anchors][cols][3]`
    weights: Vec<f32>,
    /// `[anchors][cols]`
    bias: Vec<f32>,
}

impl ReferenceGraph {
    pub fn from_blob(manifest: &ModelManifest, blob: &[u8]) -> std::result::Result<Self, String> {
        let schema = manifest.schema();
        let anchors = schema.anchors_per_cell as usize;
        let cols = schema.detection_columns() + schema.embedding_dim;
        let n_weights = anchors * cols * 3;
        let n_bias = anchors * cols;
        let expected = (n_weights + n_bias) * 4;
        if blob.len() != expected {
            return Err(format!(
                "reference graph needs {} bytes of weights, got {}",
                expected,
                blob.len()
            ));
        }

        let values: Vec<f32> = blob
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err("reference graph contains non-finite weights".into());
        }
        let (weights, bias) = values.split_at(n_weights);

        Ok(Self {
            schema,
            input_sizes: manifest.input_sizes(),
            weights: weights.to_vec(),
            bias: bias.to_vec(),
        })
    }

    /// Deterministic pseudo-random weights, for demos and tests.
    pub fn synthetic_blob(manifest: &ModelManifest, seed: u64) -> Vec<u8> {
        let schema = manifest.schema();
        let cols = schema.detection_columns() + schema.embedding_dim;
        let count = schema.anchors_per_cell as usize * cols * 4;

        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            // top 24 bits -> [-1, 1)
            let unit = (state >> 40) as f32 / (1u64 << 24) as f32;
            values.push(unit * 2.0 - 1.0);
        }
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn cols(&self) -> usize {
        self.schema.detection_columns() + self.schema.embedding_dim
    }

    pub fn input_sizes(&self) -> &[InputSize] {
        &self.input_sizes
    }

    /// Forward pass over a CHW tensor of `size`.
    pub fn run(&self, size: InputSize, chw: &[f32]) -> Result<Vec<OutputTensor>> {
        if !self.input_sizes.contains(&size) {
            return Err(Error::Size {
                requested: size,
                supported: self.input_sizes.clone(),
            });
        }
        let (w, h) = (size.width as usize, size.height as usize);
        if chw.len() != 3 * w * h {
            return Err(Error::Format(format!(
                "expected {} input values for {}, got {}",
                3 * w * h,
                size,
                chw.len()
            )));
        }

        let rows = self.schema.rows(size);
        let det_cols = self.schema.detection_columns();
        let emb_dim = self.schema.embedding_dim;
        let anchors = self.schema.anchors_per_cell as usize;
        let cols = self.cols();

        let mut detections = Vec::with_capacity(rows * det_cols);
        let mut embeddings = Vec::with_capacity(rows * emb_dim);
        let mut out = vec![0.0f32; cols];

        for &stride in &self.schema.strides {
            let s = stride as usize;
            let (gw, gh) = (w / s, h / s);
            for gy in 0..gh {
                for gx in 0..gw {
                    let feature = patch_mean(chw, w, h, gx * s, gy * s, s);
                    for a in 0..anchors {
                        self.project(a, &feature, &mut out);

                        let sf = stride as f32;
                        detections.push((gx as f32 + 0.5 + out[0].tanh()) * sf);
                        detections.push((gy as f32 + 0.5 + out[1].tanh()) * sf);
                        detections.push(out[2].clamp(-SIZE_LOGIT_LIMIT, SIZE_LOGIT_LIMIT).exp() * sf);
                        detections.push(out[3].clamp(-SIZE_LOGIT_LIMIT, SIZE_LOGIT_LIMIT).exp() * sf);
                        detections.extend(out[4..det_cols].iter().map(|&v| sigmoid(v)));
                        embeddings.extend_from_slice(&out[det_cols..]);
                    }
                }
            }
        }

        debug!("Reference graph produced {} rows for {}", rows, size);

        Ok(vec![
            OutputTensor::new(super::model::DETECTIONS_TENSOR, vec![rows, det_cols], detections),
            OutputTensor::new(super::model::EMBEDDINGS_TENSOR, vec![rows, emb_dim], embeddings),
        ])
    }

    fn project(&self, anchor: usize, feature: &[f32; 3], out: &mut [f32]) {
        let cols = self.cols();
        for (j, o) in out.iter_mut().enumerate() {
            let base = (anchor * cols + j) * 3;
            let w = &self.weights[base..base + 3];
            *o = w[0] * feature[0] + w[1] * feature[1] + w[2] * feature[2]
                + self.bias[anchor * cols + j];
        }
        debug_assert!(out.len() > BOX_COLUMNS);
    }
}

/// Per-channel mean of the `s x s` patch at `(x0, y0)`
fn patch_mean(chw: &[f32], w: usize, h: usize, x0: usize, y0: usize, s: usize) -> [f32; 3] {
    let mut sums = [0.0f32; 3];
    for (c, sum) in sums.iter_mut().enumerate() {
        let plane = &chw[c * w * h..(c + 1) * w * h];
        for y in y0..y0 + s {
            let row = &plane[y * w + x0..y * w + x0 + s];
            *sum += row.iter().sum::<f32>();
        }
    }
    let n = (s * s) as f32;
    [sums[0] / n, sums[1] / n, sums[2] / n]
}

/// [`ReferenceGraph`] as a loaded model
pub struct ReferenceModel {
    graph: ReferenceGraph,
}

impl ReferenceModel {
    pub fn new(graph: ReferenceGraph) -> Self {
        Self { graph }
    }
}

impl LoadedModel for ReferenceModel {
    fn run(&mut self, input: &PreparedTensor) -> Result<Vec<OutputTensor>> {
        self.graph.run(input.size, input.as_slice())
    }

    fn input_sizes(&self) -> Vec<InputSize> {
        self.graph.input_sizes().to_vec()
    }

    fn release(&mut self) {}
}
