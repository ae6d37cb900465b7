use std::time::Instant;

use iodump_core::{Backend, BackendModel, Device, ModelArtifact, RunError};
use rand::Rng;
use tracing::{debug, info};

use crate::{synthesize, IoCollection};

/// Inputs that were bound and outputs that came back from one inference pass.
#[derive(Clone, Debug, Default)]
pub struct RunOutcome {
    pub inputs: IoCollection,
    pub outputs: IoCollection,
}

pub fn load_model<B: Backend>(
    backend: &B,
    artifact: &ModelArtifact,
    device: Device,
) -> Result<B::Model, RunError> {
    info!(backend = backend.name(), path = %artifact.path().display(), ?device, "loading model");
    backend
        .load(artifact, device)
        .map_err(|e| RunError::model_load(artifact.path(), e))
}

/// Synthesizes every input, runs the model once and reads every output back.
///
/// Inputs are generated and bound in declaration order; the first failure
/// aborts the run before anything else is attempted.
pub fn execute<M, R>(model: &mut M, rng: &mut R) -> Result<RunOutcome, RunError>
where
    M: BackendModel + ?Sized,
    R: Rng + ?Sized,
{
    model.allocate().map_err(RunError::allocate)?;

    let input_specs = model.spec().inputs.clone();
    let mut inputs = IoCollection::with_capacity(input_specs.len());
    for spec in &input_specs {
        let tensor = synthesize(spec, rng)?;
        debug!(
            input = %spec.name,
            slot = spec.slot,
            dtype = %tensor.dtype(),
            shape = %tensor.shape(),
            "binding input"
        );
        model
            .set_input(spec.slot, tensor.clone())
            .map_err(|e| RunError::bind(spec.name.as_str(), e))?;
        inputs
            .push(spec.name.clone(), tensor)
            .map_err(|e| RunError::bind(spec.name.as_str(), e))?;
    }

    let t0 = Instant::now();
    model.invoke().map_err(RunError::inference)?;
    let backend_us = t0.elapsed().as_micros() as u64;
    info!(backend_us, inputs = inputs.len(), "inference finished");

    let output_specs = model.spec().outputs.clone();
    let mut outputs = IoCollection::with_capacity(output_specs.len());
    for spec in &output_specs {
        let tensor = model
            .output(spec.slot)
            .map_err(|e| RunError::output_read(spec.name.as_str(), e))?;
        debug!(
            output = %spec.name,
            slot = spec.slot,
            dtype = %tensor.dtype(),
            shape = %tensor.shape(),
            "collected output"
        );
        outputs
            .push(spec.name.clone(), tensor)
            .map_err(|e| RunError::output_read(spec.name.as_str(), e))?;
    }

    Ok(RunOutcome { inputs, outputs })
}
