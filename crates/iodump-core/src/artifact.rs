use std::path::{Path, PathBuf};

use crate::RunError;

#[derive(Clone, Debug)]
pub enum ModelArtifact {
    OnnxPath(PathBuf),
}

impl ModelArtifact {
    /// Resolves a user-supplied model path; missing files are a load failure.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, RunError> {
        let path = path.into();
        if !path.is_file() {
            return Err(RunError::model_load(
                &path,
                anyhow::anyhow!("no such model file"),
            ));
        }
        Ok(ModelArtifact::OnnxPath(path))
    }

    pub fn path(&self) -> &Path {
        match self {
            ModelArtifact::OnnxPath(path) => path,
        }
    }

    /// Final path component including the extension, e.g. `mobilenet.onnx`.
    pub fn file_name(&self) -> Result<String, RunError> {
        self.path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| RunError::model_load(self.path(), anyhow::anyhow!("path has no file name")))
    }
}
