//! Model artifact container
//!
//! ```text
//! b"JDEM" | u32 version | u32 manifest_len | manifest JSON | graph blob
//! ```
//!
//! The manifest declares the input sizes and the output schema; the graph
//! blob is opaque to everything but the backend that executes it.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::preprocess::InputSize;
use crate::error::{Error, Result};

pub const ARTIFACT_MAGIC: &[u8; 4] = b"JDEM";
pub const ARTIFACT_VERSION: u32 = 1;
pub const ARTIFACT_EXTENSION: &str = "jdem";

/// Name of the box/score output tensor
pub const DETECTIONS_TENSOR: &str = "detections";
/// Name of the appearance embedding output tensor
pub const EMBEDDINGS_TENSOR: &str = "embeddings";

/// Columns before the class scores: cx, cy, w, h, objectness
pub const BOX_COLUMNS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphFormat {
    /// Vendor NPU graph, executed by the native driver
    Rknn,
    /// Small CPU graph understood by the NPU daemon's emulator
    Reference,
}

impl fmt::Display for GraphFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphFormat::Rknn => write!(f, "rknn"),
            GraphFormat::Reference => write!(f, "reference"),
        }
    }
}

fn default_strides() -> Vec<u32> {
    vec![8, 16, 32]
}

fn default_anchors() -> u32 {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub name: String,
    pub graph_format: GraphFormat,
    /// Supported `[width, height]` input resolutions
    pub input_sizes: Vec<[u32; 2]>,
    pub num_classes: usize,
    pub embedding_dim: usize,
    #[serde(default = "default_strides")]
    pub strides: Vec<u32>,
    #[serde(default = "default_anchors")]
    pub anchors_per_cell: u32,
}

impl ModelManifest {
    pub fn input_sizes(&self) -> Vec<InputSize> {
        self.input_sizes
            .iter()
            .map(|&[w, h]| InputSize::new(w, h))
            .collect()
    }

    pub fn schema(&self) -> OutputSchema {
        OutputSchema {
            num_classes: self.num_classes,
            embedding_dim: self.embedding_dim,
            strides: self.strides.clone(),
            anchors_per_cell: self.anchors_per_cell,
        }
    }

    /// Structural checks; the reason string is wrapped into a load error by the caller.
    fn check(&self) -> std::result::Result<(), String> {
        if self.input_sizes.is_empty() {
            return Err("manifest declares no input sizes".into());
        }
        if self.strides.is_empty() || self.strides.contains(&0) {
            return Err(format!("invalid strides {:?}", self.strides));
        }
        if self.anchors_per_cell == 0 {
            return Err("anchors_per_cell must be at least 1".into());
        }
        if self.embedding_dim == 0 {
            return Err("embedding_dim must be at least 1".into());
        }
        let max_stride = self.strides.iter().copied().max().unwrap_or(1);
        for &[w, h] in &self.input_sizes {
            if w == 0 || h == 0 || w % max_stride != 0 || h % max_stride != 0 {
                return Err(format!(
                    "input size {}x{} is not a multiple of stride {}",
                    w, h, max_stride
                ));
            }
        }
        Ok(())
    }
}

/// Shape contract of the raw output tensors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSchema {
    pub num_classes: usize,
    pub embedding_dim: usize,
    pub strides: Vec<u32>,
    pub anchors_per_cell: u32,
}

impl OutputSchema {
    /// Number of prediction rows for an input size
    pub fn rows(&self, size: InputSize) -> usize {
        self.strides
            .iter()
            .map(|&s| {
                (size.width / s) as usize * (size.height / s) as usize * self.anchors_per_cell as usize
            })
            .sum()
    }

    pub fn detection_columns(&self) -> usize {
        BOX_COLUMNS + self.num_classes
    }

    /// Expected `(name, shape)` of every output tensor, in output order
    pub fn tensor_shapes(&self, size: InputSize) -> Vec<(&'static str, Vec<usize>)> {
        let rows = self.rows(size);
        vec![
            (DETECTIONS_TENSOR, vec![rows, self.detection_columns()]),
            (EMBEDDINGS_TENSOR, vec![rows, self.embedding_dim]),
        ]
    }
}

/// Parsed model artifact
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub path: PathBuf,
    pub manifest: ModelManifest,
    pub graph: Vec<u8>,
}

impl ModelArtifact {
    pub fn new(manifest: ModelManifest, graph: Vec<u8>) -> Self {
        Self {
            path: PathBuf::new(),
            manifest,
            graph,
        }
    }

    /// Read and validate an artifact file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| Error::load(path, format!("cannot read artifact: {}", e)))?;
        let mut artifact = Self::from_bytes(&bytes).map_err(|reason| Error::load(path, reason))?;
        artifact.path = path.to_path_buf();

        info!(
            "Model artifact {} ({}, {} graph, {} bytes)",
            path.display(),
            artifact.manifest.name,
            artifact.manifest.graph_format,
            artifact.graph.len()
        );
        Ok(artifact)
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < 12 || &bytes[..4] != ARTIFACT_MAGIC {
            return Err("not a JDEM artifact".into());
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != ARTIFACT_VERSION {
            return Err(format!("unsupported artifact version {}", version));
        }
        let manifest_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let manifest_end = 12usize
            .checked_add(manifest_len)
            .filter(|&end| end <= bytes.len())
            .ok_or("truncated manifest")?;

        let manifest: ModelManifest = serde_json::from_slice(&bytes[12..manifest_end])
            .map_err(|e| format!("malformed manifest: {}", e))?;
        manifest.check()?;

        let graph = bytes[manifest_end..].to_vec();
        if graph.is_empty() {
            return Err("empty graph".into());
        }
        debug!("Parsed manifest {:?}", manifest);

        Ok(Self {
            path: PathBuf::new(),
            manifest,
            graph,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let manifest = serde_json::to_vec(&self.manifest)
            .map_err(|e| Error::Configuration(format!("cannot encode manifest: {}", e)))?;
        let mut out = Vec::with_capacity(12 + manifest.len() + self.graph.len());
        out.extend_from_slice(ARTIFACT_MAGIC);
        out.extend_from_slice(&ARTIFACT_VERSION.to_le_bytes());
        out.extend_from_slice(&(manifest.len() as u32).to_le_bytes());
        out.extend_from_slice(&manifest);
        out.extend_from_slice(&self.graph);
        Ok(out)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Wrap a converted graph (e.g. an `.rknn` file) with its manifest.
    pub fn pack(manifest_path: &Path, graph_path: &Path, out: &Path) -> Result<()> {
        let manifest_text = std::fs::read_to_string(manifest_path)?;
        let manifest: ModelManifest = serde_json::from_str(&manifest_text)
            .map_err(|e| Error::load(manifest_path, format!("malformed manifest: {}", e)))?;
        manifest
            .check()
            .map_err(|reason| Error::load(manifest_path, reason))?;
        let graph = std::fs::read(graph_path)?;
        Self::new(manifest, graph).save(out)?;
        info!("Packed {} into {}", graph_path.display(), out.display());
        Ok(())
    }
}

/// Newest `{savename}-ckpt-NNN.jdem` under `{workspace}/checkpoint`
pub fn latest_checkpoint(workspace: &Path, savename: &str) -> Result<PathBuf> {
    let dir = workspace.join("checkpoint");
    let prefix = format!("{}-ckpt-", savename);

    let entries = std::fs::read_dir(&dir).map_err(|e| {
        Error::Configuration(format!("cannot list {}: {}", dir.display(), e))
    })?;

    let mut best: Option<(u32, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
            continue;
        }
        let epoch = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(&prefix))
            .and_then(|s| s.parse::<u32>().ok());
        if let Some(epoch) = epoch {
            if best.as_ref().map_or(true, |(e, _)| epoch > *e) {
                best = Some((epoch, path));
            }
        }
    }

    best.map(|(epoch, path)| {
        info!("Using checkpoint epoch {}: {}", epoch, path.display());
        path
    })
    .ok_or_else(|| {
        Error::Configuration(format!(
            "no {}*.{} checkpoint in {}",
            prefix,
            ARTIFACT_EXTENSION,
            dir.display()
        ))
    })
}
