//! Inference stages
//!
//! - Input: frame sources and letterbox preprocessing
//! - Inference: model artifacts and the host/device backends
//! - Output: detection decoding, rendering and serialization

pub mod backend;
pub mod device;
pub mod frame;
pub mod host;
pub mod model;
pub mod postprocess;
pub mod preprocess;
pub mod reference;

pub use backend::{Backend, BackendKind, InferenceEngine, InferenceResult, LoadedModel, ModelHandle, TargetVariant};
pub use frame::{FrameSource, ImageSequenceSource, MemorySource, PixelFormat, RawFrame};
pub use model::{ModelArtifact, ModelManifest, OutputSchema};
pub use postprocess::{Detection, FrameDetections, OutputEngine, OutputOptions};
pub use preprocess::{InputEngine, InputSize, PreparedTensor};
