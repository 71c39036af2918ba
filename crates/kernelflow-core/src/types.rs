//! Identifiers and tensor descriptions shared across the runtime.

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::error::{EngineError, Result};

/// Stable, globally unique name of one actor.
///
/// Arrows address actors by id; an id is never reused while a compiled
/// actor set is alive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(String);

impl ActorId {
    /// Create a new actor id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of one `execute` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Identity of a device context, used for equality and logging.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceContextKey {
    /// Device family name (`CPU`, `GPU`, ...).
    pub device_name: String,
    /// Device ordinal within the family.
    pub device_id: u32,
}

impl DeviceContextKey {
    /// Create a new device context key.
    pub fn new(device_name: impl Into<String>, device_id: u32) -> Self {
        Self {
            device_name: device_name.into(),
            device_id,
        }
    }

    /// Key of the `id`-th host device.
    pub fn cpu(device_id: u32) -> Self {
        Self::new("CPU", device_id)
    }
}

impl fmt::Display for DeviceContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.device_name, self.device_id)
    }
}

/// Raw device address (as usize for FFI compatibility).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(pub usize);

impl DeviceAddress {
    /// Null address.
    pub const NULL: Self = Self(0);

    /// Check for the null address.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// Unsigned byte.
    U8,
    /// Boolean stored as one byte.
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn size_of(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
            Self::U8 | Self::Bool => 1,
        }
    }

    /// Short lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::Bool => "bool",
        }
    }
}

/// Element type and shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    /// Element type.
    pub dtype: DType,
    /// Dimensions, outermost first. Empty for scalars.
    pub shape: Vec<usize>,
}

impl TensorMeta {
    /// Create tensor metadata.
    pub fn new(dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    /// Scalar of `dtype`.
    pub fn scalar(dtype: DType) -> Self {
        Self::new(dtype, Vec::<usize>::new())
    }

    /// Untyped byte buffer of `size` bytes.
    pub fn bytes(size: usize) -> Self {
        Self::new(DType::U8, vec![size])
    }

    /// Number of elements.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the tensor in bytes.
    pub fn byte_size(&self) -> usize {
        self.num_elements() * self.dtype.size_of()
    }
}

impl fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.dtype.as_str(), self.shape)
    }
}

/// Host-resident tensor used for run inputs and outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    /// Element type and shape.
    pub meta: TensorMeta,
    /// Raw little-endian contents.
    pub data: Vec<u8>,
}

impl HostTensor {
    /// Create a host tensor, checking the data length against the metadata.
    pub fn new(meta: TensorMeta, data: Vec<u8>) -> Result<Self> {
        if data.len() != meta.byte_size() {
            return Err(EngineError::invalid_input(format!(
                "host tensor {} expects {} bytes, got {}",
                meta,
                meta.byte_size(),
                data.len()
            )));
        }
        Ok(Self { meta, data })
    }

    /// Build a tensor from a typed slice.
    pub fn from_slice<T: Pod>(dtype: DType, shape: impl Into<Vec<usize>>, values: &[T]) -> Result<Self> {
        let meta = TensorMeta::new(dtype, shape);
        if std::mem::size_of::<T>() != dtype.size_of() {
            return Err(EngineError::invalid_input(format!(
                "element size {} does not match dtype {}",
                std::mem::size_of::<T>(),
                dtype.as_str()
            )));
        }
        Self::new(meta, bytemuck::cast_slice(values).to_vec())
    }

    /// One-dimensional f32 tensor.
    pub fn from_f32(values: &[f32]) -> Self {
        Self {
            meta: TensorMeta::new(DType::F32, vec![values.len()]),
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }

    /// Boolean scalar.
    pub fn scalar_bool(value: bool) -> Self {
        Self {
            meta: TensorMeta::scalar(DType::Bool),
            data: vec![u8::from(value)],
        }
    }

    /// Zero-filled tensor.
    pub fn zeros(meta: TensorMeta) -> Self {
        let data = vec![0u8; meta.byte_size()];
        Self { meta, data }
    }

    /// Copy out the contents as typed values.
    pub fn to_vec<T: Pod>(&self) -> Vec<T> {
        let count = self.data.len() / std::mem::size_of::<T>().max(1);
        let mut out = vec![T::zeroed(); count];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut out);
        let len = bytes.len();
        bytes.copy_from_slice(&self.data[..len]);
        out
    }

    /// Size in bytes.
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}
