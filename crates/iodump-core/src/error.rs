use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::DType;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Fatal failures of a run. None of them is recovered from.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to load model {}", path.display())]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("failed to allocate model tensors")]
    Allocate(#[source] BoxError),

    #[error("failed to generate input `{name}`")]
    InputGeneration {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("unsupported input dtype {dtype} for input `{name}` (expected float32, uint8 or bool)")]
    UnsupportedInputType { name: String, dtype: DType },

    #[error("failed to bind input `{name}`")]
    Bind {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("inference failed")]
    Inference(#[source] BoxError),

    #[error("failed to read output `{name}`")]
    OutputRead {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to write archive {}", path.display())]
    ArchiveWrite {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
}

impl RunError {
    pub fn model_load(path: &Path, source: impl Into<BoxError>) -> Self {
        RunError::ModelLoad {
            path: path.to_path_buf(),
            source: source.into(),
        }
    }

    pub fn allocate(source: impl Into<BoxError>) -> Self {
        RunError::Allocate(source.into())
    }

    pub fn input_generation(name: &str, source: impl Into<BoxError>) -> Self {
        RunError::InputGeneration {
            name: name.to_string(),
            source: source.into(),
        }
    }

    pub fn bind(name: &str, source: impl Into<BoxError>) -> Self {
        RunError::Bind {
            name: name.to_string(),
            source: source.into(),
        }
    }

    pub fn inference(source: impl Into<BoxError>) -> Self {
        RunError::Inference(source.into())
    }

    pub fn output_read(name: &str, source: impl Into<BoxError>) -> Self {
        RunError::OutputRead {
            name: name.to_string(),
            source: source.into(),
        }
    }

    pub fn archive_write(path: &Path, source: impl Into<BoxError>) -> Self {
        RunError::ArchiveWrite {
            path: path.to_path_buf(),
            source: source.into(),
        }
    }
}
