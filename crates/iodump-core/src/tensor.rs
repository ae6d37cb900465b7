use std::fmt;

use anyhow::{bail, ensure, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda { device_id: u32 },
}

/// Element type of a tensor as declared by the engine.
///
/// Covers every primitive the engine can describe so descriptors never fail to
/// enumerate; which of them can carry data is decided by [`Element`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    F16,
    BF16,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Bool,
    Str,
    Unknown,
}

impl DType {
    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::U8 => "uint8",
            DType::U16 => "uint16",
            DType::U32 => "uint32",
            DType::U64 => "uint64",
            DType::Bool => "bool",
            DType::Str => "string",
            DType::Unknown => "unknown",
        }
    }

    /// Width of one element in bytes, `None` for variable-width or unknown types.
    pub fn byte_size(self) -> Option<usize> {
        match self {
            DType::I8 | DType::U8 | DType::Bool => Some(1),
            DType::F16 | DType::BF16 | DType::I16 | DType::U16 => Some(2),
            DType::F32 | DType::I32 | DType::U32 => Some(4),
            DType::F64 | DType::I64 | DType::U64 => Some(8),
            DType::Str | DType::Unknown => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    /// Number of elements; a rank-0 shape holds one, any zero dimension holds none.
    pub fn numel(&self) -> Result<usize> {
        self.0
            .iter()
            .try_fold(1usize, |acc, d| acc.checked_mul(*d))
            .with_context(|| format!("element count of shape {self} overflows usize"))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for u8 {}
    impl Sealed for bool {}
}

/// Rust types that can back a [`Tensor`]'s storage.
pub trait Element: Copy + sealed::Sealed {
    const DTYPE: DType;

    fn put(self, buf: &mut BytesMut);
    fn read(chunk: &[u8]) -> Self;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn put(self, buf: &mut BytesMut) {
        buf.put_f32_le(self);
    }
    fn read(chunk: &[u8]) -> Self {
        f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
    }
}

impl Element for u8 {
    const DTYPE: DType = DType::U8;

    fn put(self, buf: &mut BytesMut) {
        buf.put_u8(self);
    }
    fn read(chunk: &[u8]) -> Self {
        chunk[0]
    }
}

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    fn put(self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(self));
    }
    fn read(chunk: &[u8]) -> Self {
        chunk[0] != 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDesc {
    pub dtype: DType,
    pub shape: Shape,
}

/// A dense, host-resident tensor stored as little-endian bytes.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub desc: TensorDesc,
    bytes: Bytes,
}

impl Tensor {
    pub fn from_cpu_bytes(dtype: DType, shape: Shape, bytes: Bytes) -> Result<Self> {
        let Some(width) = dtype.byte_size() else {
            bail!("{dtype} tensors have no fixed-width byte representation");
        };
        let expected = shape
            .numel()?
            .checked_mul(width)
            .with_context(|| format!("byte length of shape {shape} overflows usize"))?;
        ensure!(
            bytes.len() == expected,
            "{dtype} tensor of shape {shape} needs {expected} bytes, got {}",
            bytes.len()
        );
        Ok(Self {
            desc: TensorDesc { dtype, shape },
            bytes,
        })
    }

    pub fn from_vec<T: Element>(shape: Shape, data: Vec<T>) -> Result<Self> {
        let numel = shape.numel()?;
        ensure!(
            data.len() == numel,
            "shape {shape} holds {numel} elements, got {}",
            data.len()
        );
        let mut buf = BytesMut::with_capacity(data.len() * std::mem::size_of::<T>());
        for value in data {
            value.put(&mut buf);
        }
        Self::from_cpu_bytes(T::DTYPE, shape, buf.freeze())
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        ensure!(
            self.desc.dtype == T::DTYPE,
            "tensor holds {}, requested {}",
            self.desc.dtype,
            T::DTYPE
        );
        // from_cpu_bytes guarantees the width is known
        let width = T::DTYPE.byte_size().unwrap_or(1);
        Ok(self.bytes.chunks_exact(width).map(T::read).collect())
    }

    pub fn dtype(&self) -> DType {
        self.desc.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.desc.shape
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}
