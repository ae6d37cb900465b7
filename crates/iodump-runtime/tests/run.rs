use anyhow::{bail, ensure, Context, Result};
use iodump_core::{
    BackendModel, DType, IOName, ModelSpec, RunError, Shape, Tensor, TensorSpec,
};
use iodump_runtime::{
    archive_file_name, execute, read_archive, write_archive, Group, IoCollection,
};
use rand::{rngs::StdRng, SeedableRng};

/// In-memory model whose outputs are zero tensors of the declared shape.
struct FakeModel {
    spec: ModelSpec,
    bound: Option<Vec<Option<Tensor>>>,
    ran: bool,
    fail_allocate: bool,
    fail_invoke: bool,
}

impl FakeModel {
    fn new(inputs: Vec<TensorSpec>, outputs: Vec<TensorSpec>) -> Self {
        Self {
            spec: ModelSpec { inputs, outputs },
            bound: None,
            ran: false,
            fail_allocate: false,
            fail_invoke: false,
        }
    }
}

impl BackendModel for FakeModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn allocate(&mut self) -> Result<()> {
        if self.fail_allocate {
            bail!("arena exhausted");
        }
        self.bound = Some(vec![None; self.spec.inputs.len()]);
        Ok(())
    }

    fn set_input(&mut self, slot: usize, tensor: Tensor) -> Result<()> {
        let bound = self.bound.as_mut().context("not allocated")?;
        let spec = &self.spec.inputs[slot];
        ensure!(tensor.dtype() == spec.dtype, "dtype mismatch");
        ensure!(*tensor.shape() == spec.concrete_shape(), "shape mismatch");
        bound[slot] = Some(tensor);
        Ok(())
    }

    fn invoke(&mut self) -> Result<()> {
        if self.fail_invoke {
            bail!("kernel fault");
        }
        let bound = self.bound.as_ref().context("not allocated")?;
        ensure!(bound.iter().all(Option::is_some), "unbound input");
        self.ran = true;
        Ok(())
    }

    fn output(&self, slot: usize) -> Result<Tensor> {
        ensure!(self.ran, "not invoked");
        let spec = &self.spec.outputs[slot];
        let shape = spec.concrete_shape();
        let width = spec.dtype.byte_size().context("no width")?;
        let zeros = vec![0u8; shape.numel()? * width];
        Tensor::from_cpu_bytes(spec.dtype, shape, zeros.into())
    }
}

fn rng() -> StdRng {
    StdRng::seed_from_u64(0x5eed)
}

#[test]
fn float_in_uint8_out_archive() -> Result<()> {
    let mut model = FakeModel::new(
        vec![TensorSpec::new("serving/x", DType::F32, 0, &[1, 4])],
        vec![TensorSpec::new("y", DType::U8, 0, &[1, 2])],
    );
    let outcome = execute(&mut model, &mut rng())?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join(archive_file_name("model.onnx"));
    write_archive(&path, "model.onnx", &outcome.inputs, &outcome.outputs)?;

    let archive = read_archive(&path)?;
    assert_eq!(archive.model.as_deref(), Some("model.onnx"));
    assert_eq!(archive.inputs.len(), 1);
    assert_eq!(archive.outputs.len(), 1);

    let input = &archive.inputs[0];
    assert_eq!(input.key.to_string(), "input/00000-serving|x");
    assert_eq!(input.tensor.dtype(), DType::F32);
    assert_eq!(input.tensor.shape(), &Shape::from_slice(&[1, 4]));
    let bound = outcome.inputs.get("serving/x").context("missing input")?;
    assert_eq!(input.tensor.to_vec::<f32>()?, bound.to_vec::<f32>()?);

    let output = &archive.outputs[0];
    assert_eq!(output.key.to_string(), "output/00000-y");
    assert_eq!(output.tensor.dtype(), DType::U8);
    assert_eq!(output.tensor.shape(), &Shape::from_slice(&[1, 2]));

    archive.check_structure(&outcome.inputs, &outcome.outputs)?;
    Ok(())
}

#[test]
fn model_without_inputs_still_archives_outputs() -> Result<()> {
    let mut model = FakeModel::new(
        Vec::new(),
        vec![
            TensorSpec::new("probs", DType::F32, 0, &[1, 10]),
            TensorSpec::new("mask", DType::Bool, 1, &[3]),
        ],
    );
    let outcome = execute(&mut model, &mut rng())?;
    assert!(outcome.inputs.is_empty());

    let dir = tempfile::tempdir()?;
    let path = dir.path().join(archive_file_name("const.onnx"));
    write_archive(&path, "const.onnx", &outcome.inputs, &outcome.outputs)?;

    let archive = read_archive(&path)?;
    assert!(archive.inputs.is_empty());
    let keys: Vec<_> = archive.outputs.iter().map(|e| e.key.to_string()).collect();
    assert_eq!(keys, ["output/00000-probs", "output/00001-mask"]);
    assert_eq!(archive.outputs[1].tensor.dtype(), DType::Bool);
    Ok(())
}

#[test]
fn declaration_order_survives_sorting() -> Result<()> {
    // names deliberately sort opposite to declaration order
    let names = ["zeta", "eta", "alpha", "a/b", "MIXED"];
    let inputs = names
        .iter()
        .enumerate()
        .map(|(slot, name)| TensorSpec::new(*name, DType::U8, slot, &[2]))
        .collect();
    let mut model = FakeModel::new(inputs, vec![TensorSpec::new("out", DType::F32, 0, &[])]);
    let outcome = execute(&mut model, &mut rng())?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join(archive_file_name("order.onnx"));
    write_archive(&path, "order.onnx", &outcome.inputs, &outcome.outputs)?;

    let archive = read_archive(&path)?;
    for (i, (entry, name)) in archive.inputs.iter().zip(names).enumerate() {
        assert_eq!(entry.key.group, Group::Input);
        assert_eq!(entry.key.index, i);
        assert_eq!(entry.key.name, name.replace('/', "|"));
    }
    let declared: Vec<&IOName> = outcome.inputs.names().collect();
    assert_eq!(declared.len(), names.len());
    Ok(())
}

#[test]
fn repeated_runs_share_key_structure() -> Result<()> {
    let spec = || {
        FakeModel::new(
            vec![
                TensorSpec::new("image", DType::F32, 0, &[1, 3, 8, 8]),
                TensorSpec::new("flags", DType::Bool, 1, &[4]),
            ],
            vec![TensorSpec::new("logits", DType::F32, 0, &[1, 5])],
        )
    };
    let dir = tempfile::tempdir()?;
    let path = dir.path().join(archive_file_name("twice.onnx"));

    let mut keys = Vec::new();
    let mut first_values = None;
    for seed in [1u64, 2] {
        let outcome = execute(&mut spec(), &mut StdRng::seed_from_u64(seed))?;
        write_archive(&path, "twice.onnx", &outcome.inputs, &outcome.outputs)?;
        let archive = read_archive(&path)?;
        keys.push(
            archive
                .inputs
                .iter()
                .chain(&archive.outputs)
                .map(|e| (e.key.clone(), e.tensor.desc.clone()))
                .collect::<Vec<_>>(),
        );
        let values = archive.inputs[0].tensor.to_vec::<f32>()?;
        match &first_values {
            None => first_values = Some(values),
            Some(first) => assert_ne!(first, &values),
        }
    }
    assert_eq!(keys[0], keys[1]);
    Ok(())
}

#[test]
fn unsupported_input_aborts_before_inference() -> Result<()> {
    let mut model = FakeModel::new(
        vec![
            TensorSpec::new("x", DType::F32, 0, &[2]),
            TensorSpec::new("ids", DType::I64, 1, &[2]),
        ],
        vec![TensorSpec::new("y", DType::F32, 0, &[2])],
    );
    let err = execute(&mut model, &mut rng()).unwrap_err();
    assert!(matches!(
        err,
        RunError::UnsupportedInputType { ref name, dtype: DType::I64 } if name == "ids"
    ));
    assert!(!model.ran);
    Ok(())
}

#[test]
fn inference_failure_is_reported() {
    let mut model = FakeModel::new(
        vec![TensorSpec::new("x", DType::F32, 0, &[2])],
        vec![TensorSpec::new("y", DType::F32, 0, &[2])],
    );
    model.fail_invoke = true;
    let err = execute(&mut model, &mut rng()).unwrap_err();
    assert!(matches!(err, RunError::Inference(_)), "{err:?}");
}

#[test]
fn existing_archive_is_replaced() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join(archive_file_name("m.onnx"));
    std::fs::write(&path, b"stale contents")?;

    let mut model = FakeModel::new(Vec::new(), vec![TensorSpec::new("y", DType::U8, 0, &[1])]);
    let outcome = execute(&mut model, &mut rng())?;
    write_archive(&path, "m.onnx", &outcome.inputs, &outcome.outputs)?;

    let archive = read_archive(&path)?;
    assert_eq!(archive.outputs.len(), 1);
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
    Ok(())
}

#[test]
fn unwritable_destination_is_an_archive_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("missing").join(archive_file_name("m.onnx"));
    let mut model = FakeModel::new(Vec::new(), vec![TensorSpec::new("y", DType::U8, 0, &[1])]);
    let outcome = execute(&mut model, &mut rng())?;

    let err = write_archive(&path, "m.onnx", &outcome.inputs, &outcome.outputs).unwrap_err();
    assert!(matches!(err, RunError::ArchiveWrite { .. }), "{err:?}");
    assert!(!path.exists());
    Ok(())
}

#[test]
fn allocation_failure_is_not_an_inference_error() {
    let mut model = FakeModel::new(
        vec![TensorSpec::new("x", DType::F32, 0, &[2])],
        vec![TensorSpec::new("y", DType::F32, 0, &[2])],
    );
    model.fail_allocate = true;
    let err = execute(&mut model, &mut rng()).unwrap_err();
    assert!(matches!(err, RunError::Allocate(_)), "{err:?}");
    assert!(!model.ran);
}

#[test]
fn duplicate_output_names_are_a_read_error() {
    let mut model = FakeModel::new(
        Vec::new(),
        vec![
            TensorSpec::new("y", DType::U8, 0, &[1]),
            TensorSpec::new("y", DType::U8, 1, &[1]),
        ],
    );
    let err = execute(&mut model, &mut rng()).unwrap_err();
    assert!(
        matches!(err, RunError::OutputRead { ref name, .. } if name == "y"),
        "{err:?}"
    );
}

#[test]
fn archive_has_real_groups_and_datasets() -> Result<()> {
    let mut model = FakeModel::new(
        Vec::new(),
        vec![
            TensorSpec::new("scores/raw", DType::F32, 0, &[2, 3]),
            TensorSpec::new("n", DType::U8, 1, &[]),
        ],
    );
    let outcome = execute(&mut model, &mut rng())?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join(archive_file_name("groups.onnx"));
    write_archive(&path, "groups.onnx", &outcome.inputs, &outcome.outputs)?;

    let file = hdf5::File::open(&path)?;
    let mut members = file.member_names()?;
    members.sort();
    assert_eq!(members, ["input", "output"]);

    let input = file.group("input")?;
    assert!(input.member_names()?.is_empty());
    assert_eq!(input.attr("count")?.read_scalar::<u64>()?, 0);

    let output = file.group("output")?;
    let mut datasets = output.member_names()?;
    datasets.sort();
    assert_eq!(datasets, ["00000-scores|raw", "00001-n"]);
    assert_eq!(output.dataset("00000-scores|raw")?.shape(), [2, 3]);
    assert!(output.dataset("00001-n")?.shape().is_empty());
    assert_eq!(output.attr("count")?.read_scalar::<u64>()?, 2);
    Ok(())
}

/// Writes an archive by hand so that malformed layouts can be read back.
fn hand_written(
    path: &std::path::Path,
    build: impl FnOnce(&hdf5::File) -> Result<()>,
) -> Result<()> {
    let file = hdf5::File::create(path)?;
    build(&file)?;
    file.close()?;
    Ok(())
}

fn put_f32(group: &hdf5::Group, name: &str, data: &[f32]) -> Result<()> {
    group
        .new_dataset::<f32>()
        .shape(vec![data.len()])
        .create(name)?
        .write_raw(data)?;
    Ok(())
}

#[test]
fn header_count_mismatch_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join(archive_file_name("count.onnx"));
    hand_written(&path, |file| {
        let input = file.create_group("input")?;
        input.new_attr::<u64>().create("count")?.write_scalar(&2u64)?;
        put_f32(&input, "00000-a", &[0.5])?;
        file.create_group("output")?;
        Ok(())
    })?;

    let err = read_archive(&path).unwrap_err();
    assert!(err.to_string().contains("declares 2 entries"), "{err:#}");
    Ok(())
}

#[test]
fn index_gap_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join(archive_file_name("gap.onnx"));
    hand_written(&path, |file| {
        let input = file.create_group("input")?;
        put_f32(&input, "00000-a", &[0.5])?;
        put_f32(&input, "00002-b", &[0.25])?;
        Ok(())
    })?;

    let err = read_archive(&path).unwrap_err();
    assert!(err.to_string().contains("breaks the index sequence"), "{err:#}");
    Ok(())
}

#[test]
fn malformed_keys_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let nested = dir.path().join("nested.h5");
    hand_written(&nested, |file| {
        let output = file.create_group("output")?;
        put_f32(&output, "weights", &[1.0])?;
        Ok(())
    })?;
    let err = read_archive(&nested).unwrap_err();
    assert!(err.to_string().contains("malformed archive key `output/weights`"), "{err:#}");

    let stray = dir.path().join("stray.h5");
    hand_written(&stray, |file| {
        file.create_group("input")?;
        put_f32(file, "weights", &[1.0])?;
        Ok(())
    })?;
    let err = read_archive(&stray).unwrap_err();
    assert!(err.to_string().contains("unexpected archive member"), "{err:#}");
    Ok(())
}

#[test]
fn structure_check_catches_shape_and_dtype_drift() -> Result<()> {
    let mut model = FakeModel::new(
        vec![TensorSpec::new("x", DType::F32, 0, &[1, 4])],
        vec![TensorSpec::new("y", DType::U8, 0, &[2])],
    );
    let outcome = execute(&mut model, &mut rng())?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join(archive_file_name("drift.onnx"));
    write_archive(&path, "drift.onnx", &outcome.inputs, &outcome.outputs)?;
    let archive = read_archive(&path)?;
    archive.check_structure(&outcome.inputs, &outcome.outputs)?;

    let mut reshaped = IoCollection::new();
    reshaped.push(
        IOName("x".to_string()),
        Tensor::from_vec(Shape::from_slice(&[4]), vec![0f32; 4])?,
    )?;
    let err = archive.check_structure(&reshaped, &outcome.outputs).unwrap_err();
    assert!(err.to_string().contains("input/00000-x"), "{err:#}");

    let mut retyped = IoCollection::new();
    retyped.push(
        IOName("y".to_string()),
        Tensor::from_vec(Shape::from_slice(&[2]), vec![false; 2])?,
    )?;
    let err = archive.check_structure(&outcome.inputs, &retyped).unwrap_err();
    assert!(err.to_string().contains("expected bool"), "{err:#}");
    Ok(())
}
