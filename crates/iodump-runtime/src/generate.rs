use iodump_core::{DType, RunError, Tensor, TensorSpec};
use rand::Rng;
use tracing::warn;

/// Builds a random tensor matching `spec`.
///
/// float32 draws from `[0, 1)`, uint8 from the full `[0, 256)` range and bool
/// is a fair coin. Every other dtype is rejected.
pub fn synthesize<R: Rng + ?Sized>(spec: &TensorSpec, rng: &mut R) -> Result<Tensor, RunError> {
    if spec.is_dynamic() {
        warn!(input = %spec.name, dims = ?spec.dims, "dynamic dimensions pinned to 1");
    }
    if !matches!(spec.dtype, DType::F32 | DType::U8 | DType::Bool) {
        return Err(RunError::UnsupportedInputType {
            name: spec.name.0.clone(),
            dtype: spec.dtype,
        });
    }
    let shape = spec.concrete_shape();
    let numel = shape
        .numel()
        .map_err(|e| RunError::input_generation(spec.name.as_str(), e))?;

    let tensor = match spec.dtype {
        DType::F32 => Tensor::from_vec(shape, (0..numel).map(|_| rng.gen::<f32>()).collect()),
        DType::U8 => Tensor::from_vec(shape, (0..numel).map(|_| rng.gen::<u8>()).collect()),
        DType::Bool => Tensor::from_vec(shape, (0..numel).map(|_| rng.gen::<bool>()).collect()),
        _ => unreachable!("dtype checked above"),
    };

    tensor.map_err(|e| RunError::input_generation(spec.name.as_str(), e))
}
