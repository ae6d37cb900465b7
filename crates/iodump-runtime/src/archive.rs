//! Persists run inputs and outputs as a single HDF5 archive.
//!
//! The file holds two groups, `input` and `output`. Inside each, a tensor is a
//! dataset named `{index:05}-{name}` where `index` is the tensor's declaration
//! position and every `/` in `name` is replaced by `|`, so the full key reads
//! `input/00000-name`. Both groups are always created and carry a `count`
//! attribute; the file root carries `format` and `model` attributes.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use hdf5::types::{FloatSize, IntSize, TypeDescriptor, VarLenUnicode};
use hdf5::{Extents, H5Type};
use iodump_core::{DType, Element, RunError, Shape, Tensor};
use tracing::{debug, info};

use crate::IoCollection;

pub const ARCHIVE_SUFFIX: &str = ".data.h5";
pub const FORMAT_VERSION: &str = "iodump/1";

const INDEX_WIDTH: usize = 5;
const COUNT_ATTR: &str = "count";

/// `mobilenet.onnx` -> `mobilenet.onnx.data.h5`
pub fn archive_file_name(model_file_name: &str) -> String {
    format!("{model_file_name}{ARCHIVE_SUFFIX}")
}

pub fn sanitize_name(name: &str) -> String {
    name.replace('/', "|")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Group {
    Input,
    Output,
}

impl Group {
    pub fn as_str(self) -> &'static str {
        match self {
            Group::Input => "input",
            Group::Output => "output",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveKey {
    pub group: Group,
    pub index: usize,
    /// Already sanitized.
    pub name: String,
}

impl ArchiveKey {
    pub fn new(group: Group, index: usize, name: &str) -> Self {
        Self {
            group,
            index,
            name: sanitize_name(name),
        }
    }

    /// Dataset name inside the group: `00003-name`.
    pub fn entry_name(&self) -> String {
        format!("{:0width$}-{}", self.index, self.name, width = INDEX_WIDTH)
    }

    /// Inverse of [`ArchiveKey::entry_name`] for a dataset found in `group`.
    pub fn parse_entry(group: Group, entry: &str) -> Option<Self> {
        let (index, name) = entry.split_once('-')?;
        if index.len() < INDEX_WIDTH || !index.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            group,
            index: index.parse().ok()?,
            name: name.to_string(),
        })
    }

    pub fn parse(key: &str) -> Option<Self> {
        let (group, rest) = key.split_once('/')?;
        let group = match group {
            "input" => Group::Input,
            "output" => Group::Output,
            _ => return None,
        };
        Self::parse_entry(group, rest)
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group.as_str(), self.entry_name())
    }
}

/// Keys for a collection, in collection order.
pub fn collection_keys(group: Group, collection: &IoCollection) -> Vec<ArchiveKey> {
    collection
        .names()
        .enumerate()
        .map(|(index, name)| ArchiveKey::new(group, index, name.as_str()))
        .collect()
}

/// Writes `inputs` and `outputs` to `path`, replacing any existing file.
///
/// Data lands in a temporary file next to `path` first and is renamed into
/// place only once the HDF5 file is closed.
pub fn write_archive(
    path: &Path,
    model_name: &str,
    inputs: &IoCollection,
    outputs: &IoCollection,
) -> Result<(), RunError> {
    encode_and_persist(path, model_name, inputs, outputs)
        .map_err(|e| RunError::archive_write(path, e))?;
    info!(
        path = %path.display(),
        inputs = inputs.len(),
        outputs = outputs.len(),
        "archive written"
    );
    Ok(())
}

fn encode_and_persist(
    path: &Path,
    model_name: &str,
    inputs: &IoCollection,
    outputs: &IoCollection,
) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let tmp = tempfile::Builder::new()
        .prefix(".iodump-")
        .suffix(".h5.tmp")
        .tempfile_in(&dir)
        .with_context(|| format!("failed to create temporary file in {}", dir.display()))?
        .into_temp_path();

    let file = hdf5::File::create(&tmp)
        .with_context(|| format!("failed to create HDF5 file {}", tmp.display()))?;
    write_string_attr(&file, "format", FORMAT_VERSION)?;
    write_string_attr(&file, "model", model_name)?;
    for (group, collection) in [(Group::Input, inputs), (Group::Output, outputs)] {
        let h5_group = file
            .create_group(group.as_str())
            .with_context(|| format!("failed to create group `{}`", group.as_str()))?;
        h5_group
            .new_attr::<u64>()
            .create(COUNT_ATTR)?
            .write_scalar(&(collection.len() as u64))?;
        for ((_, tensor), key) in collection.iter().zip(collection_keys(group, collection)) {
            debug!(%key, dtype = %tensor.dtype(), shape = %tensor.shape(), "archiving tensor");
            write_dataset(&h5_group, &key, tensor)?;
        }
    }
    file.close().context("failed to close HDF5 file")?;

    tmp.persist(path)?;
    Ok(())
}

fn write_string_attr(file: &hdf5::File, name: &str, value: &str) -> Result<()> {
    let value: VarLenUnicode = value
        .parse()
        .with_context(|| format!("`{name}` attribute is not a valid HDF5 string"))?;
    file.new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn write_dataset(group: &hdf5::Group, key: &ArchiveKey, tensor: &Tensor) -> Result<()> {
    match tensor.dtype() {
        DType::F32 => write_typed::<f32>(group, key, tensor),
        DType::U8 => write_typed::<u8>(group, key, tensor),
        DType::Bool => write_typed::<bool>(group, key, tensor),
        other => bail!("{other} tensors cannot be archived (`{key}`)"),
    }
}

fn write_typed<T: Element + H5Type>(
    group: &hdf5::Group,
    key: &ArchiveKey,
    tensor: &Tensor,
) -> Result<()> {
    let dataset = group
        .new_dataset::<T>()
        .shape(extents(tensor.shape()))
        .create(key.entry_name().as_str())
        .with_context(|| format!("failed to create dataset `{key}`"))?;
    let data = tensor.to_vec::<T>()?;
    if !data.is_empty() {
        dataset
            .write_raw(data.as_slice())
            .with_context(|| format!("failed to write dataset `{key}`"))?;
    }
    Ok(())
}

fn extents(shape: &Shape) -> Extents {
    if shape.rank() == 0 {
        Extents::Scalar
    } else {
        Extents::from(shape.dims().to_vec())
    }
}

#[derive(Clone, Debug)]
pub struct ArchiveEntry {
    pub key: ArchiveKey,
    pub tensor: Tensor,
}

/// An archive read back from disk; entries are sorted by key.
#[derive(Clone, Debug)]
pub struct Archive {
    pub model: Option<String>,
    pub inputs: Vec<ArchiveEntry>,
    pub outputs: Vec<ArchiveEntry>,
}

impl Archive {
    /// Checks that keys, dtypes and shapes agree with a run's collections.
    /// Values are not compared.
    pub fn check_structure(&self, inputs: &IoCollection, outputs: &IoCollection) -> Result<()> {
        for (group, stored, expected) in [
            (Group::Input, &self.inputs, inputs),
            (Group::Output, &self.outputs, outputs),
        ] {
            ensure!(
                stored.len() == expected.len(),
                "{} group holds {} entries, expected {}",
                group.as_str(),
                stored.len(),
                expected.len()
            );
            let keys = collection_keys(group, expected);
            for ((entry, key), (_, tensor)) in stored.iter().zip(keys).zip(expected.iter()) {
                ensure!(entry.key == key, "found key `{}`, expected `{key}`", entry.key);
                ensure!(
                    entry.tensor.desc == tensor.desc,
                    "`{key}` stored as {} {}, expected {} {}",
                    entry.tensor.dtype(),
                    entry.tensor.shape(),
                    tensor.dtype(),
                    tensor.shape()
                );
            }
        }
        Ok(())
    }
}

pub fn read_archive(path: &Path) -> Result<Archive> {
    let file =
        hdf5::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let attrs = file.attr_names()?;

    if attrs.iter().any(|a| a == "format") {
        let format = file.attr("format")?.read_scalar::<VarLenUnicode>()?;
        ensure!(
            format.as_str() == FORMAT_VERSION,
            "unsupported archive format `{}`",
            format.as_str()
        );
    }
    let model = if attrs.iter().any(|a| a == "model") {
        let model = file.attr("model")?.read_scalar::<VarLenUnicode>()?;
        Some(model.as_str().to_string())
    } else {
        None
    };

    for member in file.member_names()? {
        ensure!(
            member == Group::Input.as_str() || member == Group::Output.as_str(),
            "unexpected archive member `{member}`"
        );
    }

    let inputs = read_group(&file, Group::Input)?;
    let outputs = read_group(&file, Group::Output)?;
    Ok(Archive {
        model,
        inputs,
        outputs,
    })
}

/// A missing group reads as empty.
fn read_group(file: &hdf5::File, group: Group) -> Result<Vec<ArchiveEntry>> {
    if !file.link_exists(group.as_str()) {
        return Ok(Vec::new());
    }
    let h5_group = file.group(group.as_str())?;

    let mut entries = Vec::new();
    for member in h5_group.member_names()? {
        let key = ArchiveKey::parse_entry(group, &member)
            .with_context(|| format!("malformed archive key `{}/{member}`", group.as_str()))?;
        let dataset = h5_group
            .dataset(&member)
            .with_context(|| format!("`{key}` is not a dataset"))?;
        let tensor = read_dataset(&dataset).with_context(|| format!("failed to read `{key}`"))?;
        entries.push(ArchiveEntry { key, tensor });
    }
    entries.sort_by(|a, b| a.key.cmp(&b.key));

    if h5_group.attr_names()?.iter().any(|a| a == COUNT_ATTR) {
        let count = h5_group.attr(COUNT_ATTR)?.read_scalar::<u64>()?;
        ensure!(
            count == entries.len() as u64,
            "{} group declares {count} entries, archive holds {}",
            group.as_str(),
            entries.len()
        );
    }
    for (position, entry) in entries.iter().enumerate() {
        ensure!(
            entry.key.index == position,
            "`{}` breaks the index sequence at {position}",
            entry.key
        );
    }
    Ok(entries)
}

fn read_dataset(dataset: &hdf5::Dataset) -> Result<Tensor> {
    let shape = Shape::from_slice(&dataset.shape());
    match dataset.dtype()?.to_descriptor()? {
        TypeDescriptor::Float(FloatSize::U4) => read_typed::<f32>(dataset, shape),
        TypeDescriptor::Unsigned(IntSize::U1) => read_typed::<u8>(dataset, shape),
        TypeDescriptor::Boolean => read_typed::<bool>(dataset, shape),
        other => bail!("unsupported archive dtype {other:?}"),
    }
}

fn read_typed<T: Element + H5Type>(dataset: &hdf5::Dataset, shape: Shape) -> Result<Tensor> {
    let data = if shape.numel()? == 0 {
        Vec::new()
    } else {
        dataset.read_raw::<T>()?
    };
    Tensor::from_vec(shape, data)
}
