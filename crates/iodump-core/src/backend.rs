use anyhow::Result;

use crate::{Device, ModelArtifact, ModelSpec, Tensor};

pub trait Backend {
    type Model: BackendModel;

    fn name(&self) -> &'static str;
    fn load(&self, artifact: &ModelArtifact, device: Device) -> Result<Self::Model>;
}

/// A loaded model driven through a single bind / invoke / read cycle.
///
/// Slots are the `slot` values from [`ModelSpec`]; input and output slots are
/// separate namespaces.
pub trait BackendModel {
    fn spec(&self) -> &ModelSpec;

    /// Reserves runtime storage for every declared tensor. Must precede
    /// [`BackendModel::set_input`].
    fn allocate(&mut self) -> Result<()>;

    fn set_input(&mut self, slot: usize, tensor: Tensor) -> Result<()>;

    /// Runs one inference pass over the bound inputs.
    fn invoke(&mut self) -> Result<()>;

    fn output(&self, slot: usize) -> Result<Tensor>;
}
