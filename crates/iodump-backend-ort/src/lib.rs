use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use iodump_core::{
    Backend, BackendModel, DType, Device, ModelArtifact, ModelSpec, Shape, Tensor, TensorSpec,
};
use ort::{
    session::{builder::SessionBuilder, Session, SessionInputValue},
    tensor::TensorElementType,
    value::{DynValue, ValueType},
};
use tracing::debug;

pub struct OrtBackend;

impl OrtBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OrtBackend {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OrtModel {
    spec: ModelSpec,
    session: Session,
    inputs: Option<Vec<Option<DynValue>>>,
    outputs: Vec<Option<Tensor>>,
}

impl Backend for OrtBackend {
    type Model = OrtModel;

    fn name(&self) -> &'static str {
        "onnxruntime"
    }

    fn load(&self, artifact: &ModelArtifact, device: Device) -> Result<Self::Model> {
        let ModelArtifact::OnnxPath(path) = artifact;

        let builder = Session::builder()
            .context("failed to create ORT session builder")?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .context("failed to configure ORT session builder")?;

        let builder = configure_session_builder(builder, &device)?;

        let session = builder
            .commit_from_file(path)
            .context("failed to load ONNX model")?;

        let spec = build_model_spec(&session)?;
        debug!(
            inputs = spec.inputs.len(),
            outputs = spec.outputs.len(),
            "onnxruntime session ready"
        );

        Ok(OrtModel {
            spec,
            session,
            inputs: None,
            outputs: Vec::new(),
        })
    }
}

impl BackendModel for OrtModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn allocate(&mut self) -> Result<()> {
        self.inputs = Some((0..self.spec.inputs.len()).map(|_| None).collect());
        self.outputs = (0..self.spec.outputs.len()).map(|_| None).collect();
        Ok(())
    }

    fn set_input(&mut self, slot: usize, tensor: Tensor) -> Result<()> {
        let inputs = self
            .inputs
            .as_mut()
            .context("input bound before tensors were allocated")?;
        let spec = self
            .spec
            .inputs
            .get(slot)
            .with_context(|| format!("no input at slot {slot}"))?;
        ensure!(
            tensor.dtype() == spec.dtype,
            "input `{}` expects {}, got {}",
            spec.name,
            spec.dtype,
            tensor.dtype()
        );
        spec.check_shape(tensor.shape())?;

        inputs[slot] = Some(tensor_to_ort_value(tensor)?);
        Ok(())
    }

    fn invoke(&mut self) -> Result<()> {
        let inputs = self
            .inputs
            .as_mut()
            .context("invoke called before tensors were allocated")?;

        let mut ort_inputs = Vec::with_capacity(inputs.len());
        for (spec, bound) in self.spec.inputs.iter().zip(inputs.iter_mut()) {
            let value = bound
                .take()
                .with_context(|| format!("input `{}` was never bound", spec.name))?;
            ort_inputs.push((spec.name.0.clone(), SessionInputValue::from(value)));
        }

        let outputs = self.session.run(ort_inputs)?;
        for spec in &self.spec.outputs {
            let value = outputs
                .get(spec.name.as_str())
                .with_context(|| format!("session produced no output `{}`", spec.name))?;
            self.outputs[spec.slot] = Some(ort_value_to_tensor(value)?);
        }

        Ok(())
    }

    fn output(&self, slot: usize) -> Result<Tensor> {
        self.outputs
            .get(slot)
            .with_context(|| format!("no output at slot {slot}"))?
            .clone()
            .context("output read before inference ran")
    }
}

fn build_model_spec(session: &Session) -> Result<ModelSpec> {
    let inputs = session
        .inputs
        .iter()
        .enumerate()
        .map(|(slot, input)| tensor_spec_from_value_type(&input.name, slot, &input.input_type))
        .collect::<Result<Vec<_>>>()?;

    let outputs = session
        .outputs
        .iter()
        .enumerate()
        .map(|(slot, output)| {
            tensor_spec_from_value_type(&output.name, slot, &output.output_type)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ModelSpec { inputs, outputs })
}

fn configure_session_builder(builder: SessionBuilder, device: &Device) -> Result<SessionBuilder> {
    match device {
        Device::Cpu => Ok(builder),
        Device::Cuda { device_id } => configure_cuda(builder, *device_id),
    }
}

fn configure_cuda(builder: SessionBuilder, device_id: u32) -> Result<SessionBuilder> {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::cuda::CUDAExecutionProvider;
        let ep = CUDAExecutionProvider::default()
            .with_device_id(device_id as i32)
            .build();
        builder
            .with_execution_providers([ep])
            .context("failed to enable ORT CUDA execution provider")
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = (builder, device_id);
        bail!("CUDA requested but iodump-backend-ort was built without the `cuda` feature")
    }
}

fn tensor_spec_from_value_type(name: &str, slot: usize, value_type: &ValueType) -> Result<TensorSpec> {
    let ValueType::Tensor { ty, shape, .. } = value_type else {
        bail!("`{name}` is not a tensor; only tensor inputs and outputs are supported");
    };

    let dims = shape
        .iter()
        .map(|d| if *d < 0 { None } else { Some(*d as usize) })
        .collect::<Vec<_>>();

    Ok(TensorSpec {
        name: iodump_core::IOName(name.to_string()),
        dtype: ort_tensor_element_to_dtype(*ty),
        slot,
        dims,
    })
}

fn ort_tensor_element_to_dtype(ty: TensorElementType) -> DType {
    match ty {
        TensorElementType::Float32 => DType::F32,
        TensorElementType::Float64 => DType::F64,
        TensorElementType::Float16 => DType::F16,
        TensorElementType::Bfloat16 => DType::BF16,
        TensorElementType::Int8 => DType::I8,
        TensorElementType::Int16 => DType::I16,
        TensorElementType::Int32 => DType::I32,
        TensorElementType::Int64 => DType::I64,
        TensorElementType::Uint8 => DType::U8,
        TensorElementType::Uint16 => DType::U16,
        TensorElementType::Uint32 => DType::U32,
        TensorElementType::Uint64 => DType::U64,
        TensorElementType::Bool => DType::Bool,
        TensorElementType::String => DType::Str,
        _ => DType::Unknown,
    }
}

fn tensor_to_ort_value(tensor: Tensor) -> Result<DynValue> {
    let shape: Vec<usize> = tensor.shape().dims().to_vec();

    let value = match tensor.dtype() {
        DType::F32 => {
            let data = tensor.to_vec::<f32>()?;
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::U8 => {
            let data = tensor.bytes().to_vec();
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::Bool => {
            let data = tensor.to_vec::<bool>()?;
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        other => bail!("{other} inputs cannot be bound"),
    };

    Ok(value)
}

fn ort_value_to_tensor(value: &DynValue) -> Result<Tensor> {
    let ValueType::Tensor { ty, .. } = value.dtype() else {
        bail!("non-tensor outputs are not supported");
    };

    match *ty {
        TensorElementType::Float32 => {
            let (shape, data) = value.try_extract_tensor::<f32>()?;
            Tensor::from_vec(kernel_shape(shape)?, data.to_vec())
        }
        TensorElementType::Uint8 => {
            let (shape, data) = value.try_extract_tensor::<u8>()?;
            Tensor::from_cpu_bytes(DType::U8, kernel_shape(shape)?, Bytes::copy_from_slice(data))
        }
        TensorElementType::Bool => {
            let (shape, data) = value.try_extract_tensor::<bool>()?;
            Tensor::from_vec(kernel_shape(shape)?, data.to_vec())
        }
        _ => bail!("unsupported output tensor element type: {ty}"),
    }
}

fn kernel_shape(shape: &ort::tensor::Shape) -> Result<Shape> {
    let dims = shape
        .iter()
        .map(|d| usize::try_from(*d).with_context(|| format!("negative output dimension {d}")))
        .collect::<Result<Vec<_>>>()?;
    Ok(Shape::from_slice(&dims))
}
