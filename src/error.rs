//! Error taxonomy shared by every pipeline stage

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::preprocess::InputSize;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration / environment paths
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Model artifact missing, corrupt or incompatible with the backend
    #[error("failed to load model {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },

    /// Frame with an unsupported or inconsistent pixel layout
    #[error("unsupported frame format: {0}")]
    Format(String),

    /// Requested input size is not supported by the model
    #[error("input size {requested} not supported (supported: {supported:?})")]
    Size {
        requested: InputSize,
        supported: Vec<InputSize>,
    },

    /// Inference output does not match the expected schema
    #[error("failed to decode inference output: {0}")]
    Decode(String),

    /// Daemon or driver unavailable, or handle not usable
    #[error("resource unavailable: {0}")]
    Resource(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Load {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Errors that only affect the current frame; the loop may skip and continue.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, Error::Format(_) | Error::Size { .. } | Error::Decode(_))
    }

    /// Stable numeric code exposed through the C ABI.
    pub fn code(&self) -> i32 {
        match self {
            Error::Configuration(_) => -1,
            Error::Load { .. } => -2,
            Error::Format(_) => -3,
            Error::Size { .. } => -4,
            Error::Decode(_) => -5,
            Error::Resource(_) => -6,
            Error::Io(_) => -7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_local_classification() {
        assert!(Error::Format("nv12".into()).is_frame_local());
        assert!(Error::Decode("bad".into()).is_frame_local());
        assert!(!Error::Resource("daemon down".into()).is_frame_local());
        assert!(!Error::load("m.jdem", "missing").is_frame_local());
    }

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            Error::Configuration(String::new()),
            Error::load("", ""),
            Error::Format(String::new()),
            Error::Size {
                requested: InputSize::new(1, 1),
                supported: vec![],
            },
            Error::Decode(String::new()),
            Error::Resource(String::new()),
            Error::Io(std::io::Error::other("x")),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
