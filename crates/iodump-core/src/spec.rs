use anyhow::{ensure, Result};

use crate::{DType, Shape};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IOName(pub String);

impl IOName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IOName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One input or output as declared by the loaded model.
#[derive(Clone, Debug)]
pub struct TensorSpec {
    pub name: IOName,
    pub dtype: DType,
    /// Engine handle used to bind or read this tensor.
    pub slot: usize,
    pub dims: Vec<Option<usize>>, // None = dynamic
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, dtype: DType, slot: usize, dims: &[usize]) -> Self {
        Self {
            name: IOName(name.into()),
            dtype,
            slot,
            dims: dims.iter().copied().map(Some).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_dynamic(&self) -> bool {
        self.dims.iter().any(Option::is_none)
    }

    /// Rejects shapes whose rank or static dimensions differ from the declaration.
    pub fn check_shape(&self, shape: &Shape) -> Result<()> {
        ensure!(
            shape.rank() == self.rank(),
            "`{}` expects rank {}, got shape {shape}",
            self.name,
            self.rank()
        );
        for (axis, (declared, actual)) in self.dims.iter().zip(shape.dims()).enumerate() {
            if let Some(declared) = declared {
                ensure!(
                    declared == actual,
                    "`{}` expects {declared} at axis {axis}, got shape {shape}",
                    self.name
                );
            }
        }
        Ok(())
    }

    /// Shape with every dynamic dimension pinned to 1.
    pub fn concrete_shape(&self) -> Shape {
        Shape(self.dims.iter().map(|d| d.unwrap_or(1)).collect())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ModelSpec {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}
