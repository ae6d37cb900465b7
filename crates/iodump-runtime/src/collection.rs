use anyhow::{ensure, Result};
use iodump_core::{IOName, Tensor};

/// Named tensors in engine declaration order.
///
/// Order is the position in `entries`, which is what archive keys are derived
/// from. Names are unique within one collection.
#[derive(Clone, Debug, Default)]
pub struct IoCollection {
    entries: Vec<(IOName, Tensor)>,
}

impl IoCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, name: IOName, tensor: Tensor) -> Result<()> {
        ensure!(
            self.get(name.as_str()).is_none(),
            "duplicate tensor name `{name}`"
        );
        self.entries.push((name, tensor));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, t)| t)
    }

    pub fn names(&self) -> impl Iterator<Item = &IOName> {
        self.entries.iter().map(|(n, _)| n)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IOName, &Tensor)> {
        self.entries.iter().map(|(n, t)| (n, t))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
