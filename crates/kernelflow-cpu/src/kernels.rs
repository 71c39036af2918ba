//! Reference CPU kernels.
//!
//! Each kernel is registered under its operator name for the `CPU` device
//! family, so graphs can refer to it with [`KernelRef::registered`].
//!
//! [`KernelRef::registered`]: kernelflow_core::graph::KernelRef::registered

use std::sync::Arc;

use kernelflow_core::error::{EngineError, Result};
use kernelflow_core::kernel::{AddressPtr, Kernel, KernelRegistration, KernelSignature};
use kernelflow_core::types::{DType, TensorMeta};

/// Device family the kernels in this module run on.
pub const CPU_DEVICE_NAME: &str = "CPU";

/// Declared buffer sizes shared by the elementwise kernels.
#[derive(Debug, Clone)]
struct Sizes {
    meta: TensorMeta,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

impl Sizes {
    fn new(meta: TensorMeta, arity: usize) -> Self {
        let bytes = meta.byte_size();
        Self {
            meta,
            inputs: vec![bytes; arity],
            outputs: vec![bytes],
        }
    }

    /// Check buffer counts and sizes against the declaration.
    fn matches(&self, inputs: &[AddressPtr], outputs: &[AddressPtr]) -> bool {
        inputs.len() == self.inputs.len()
            && outputs.len() == self.outputs.len()
            && inputs.iter().zip(&self.inputs).all(|(p, &size)| p.size == size)
            && outputs.iter().zip(&self.outputs).all(|(p, &size)| p.size == size)
    }
}

fn f32_meta(op: &str, signature: &KernelSignature, arity: usize) -> Result<TensorMeta> {
    if signature.inputs.len() != arity {
        return Err(EngineError::invalid_graph(format!(
            "{} takes {} inputs, signature declares {}",
            op,
            arity,
            signature.inputs.len()
        )));
    }
    let meta = signature.inputs[0].clone();
    if meta.dtype != DType::F32 {
        return Err(EngineError::invalid_graph(format!(
            "{} supports f32 only, got {}",
            op, meta
        )));
    }
    if signature.inputs.iter().any(|m| *m != meta) {
        return Err(EngineError::invalid_graph(format!("{} inputs differ in shape", op)));
    }
    Ok(meta)
}

/// Adds a constant to every element: `y = x + scalar`.
#[derive(Debug, Clone)]
pub struct AddScalarKernel {
    sizes: Sizes,
    scalar: f32,
}

impl AddScalarKernel {
    /// Create the kernel for f32 tensors of `meta`.
    pub fn new(meta: TensorMeta, scalar: f32) -> Self {
        Self {
            sizes: Sizes::new(meta, 1),
            scalar,
        }
    }

    /// The added constant.
    pub fn scalar(&self) -> f32 {
        self.scalar
    }
}

impl Kernel for AddScalarKernel {
    fn name(&self) -> &str {
        "AddScalar"
    }

    fn input_size_list(&self) -> &[usize] {
        &self.sizes.inputs
    }

    fn output_size_list(&self) -> &[usize] {
        &self.sizes.outputs
    }

    fn output_meta(&self, _index: usize) -> TensorMeta {
        self.sizes.meta.clone()
    }

    fn launch(&self, inputs: &[AddressPtr], _workspace: &[AddressPtr], outputs: &[AddressPtr]) -> bool {
        if !self.sizes.matches(inputs, outputs) {
            return false;
        }
        // SAFETY: host buffers of the declared sizes, allocated by the runtime for this launch.
        let (x, y) = unsafe { (inputs[0].as_slice::<f32>(), outputs[0].as_mut_slice::<f32>()) };
        for (out, value) in y.iter_mut().zip(x) {
            *out = value + self.scalar;
        }
        true
    }
}

/// Elementwise binary operation on two f32 tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Mul,
}

fn launch_binary(op: BinaryOp, sizes: &Sizes, inputs: &[AddressPtr], outputs: &[AddressPtr]) -> bool {
    if !sizes.matches(inputs, outputs) {
        return false;
    }
    // SAFETY: host buffers of the declared sizes, allocated by the runtime for this launch.
    let (a, b, y) = unsafe {
        (
            inputs[0].as_slice::<f32>(),
            inputs[1].as_slice::<f32>(),
            outputs[0].as_mut_slice::<f32>(),
        )
    };
    for ((out, lhs), rhs) in y.iter_mut().zip(a).zip(b) {
        *out = match op {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Mul => lhs * rhs,
        };
    }
    true
}

/// Elementwise sum: `y = a + b`.
#[derive(Debug, Clone)]
pub struct AddKernel {
    sizes: Sizes,
}

impl AddKernel {
    /// Create the kernel for f32 tensors of `meta`.
    pub fn new(meta: TensorMeta) -> Self {
        Self {
            sizes: Sizes::new(meta, 2),
        }
    }
}

impl Kernel for AddKernel {
    fn name(&self) -> &str {
        "Add"
    }

    fn input_size_list(&self) -> &[usize] {
        &self.sizes.inputs
    }

    fn output_size_list(&self) -> &[usize] {
        &self.sizes.outputs
    }

    fn output_meta(&self, _index: usize) -> TensorMeta {
        self.sizes.meta.clone()
    }

    fn launch(&self, inputs: &[AddressPtr], _workspace: &[AddressPtr], outputs: &[AddressPtr]) -> bool {
        launch_binary(BinaryOp::Add, &self.sizes, inputs, outputs)
    }
}

/// Elementwise product: `y = a * b`.
#[derive(Debug, Clone)]
pub struct MulKernel {
    sizes: Sizes,
}

impl MulKernel {
    /// Create the kernel for f32 tensors of `meta`.
    pub fn new(meta: TensorMeta) -> Self {
        Self {
            sizes: Sizes::new(meta, 2),
        }
    }
}

impl Kernel for MulKernel {
    fn name(&self) -> &str {
        "Mul"
    }

    fn input_size_list(&self) -> &[usize] {
        &self.sizes.inputs
    }

    fn output_size_list(&self) -> &[usize] {
        &self.sizes.outputs
    }

    fn output_meta(&self, _index: usize) -> TensorMeta {
        self.sizes.meta.clone()
    }

    fn launch(&self, inputs: &[AddressPtr], _workspace: &[AddressPtr], outputs: &[AddressPtr]) -> bool {
        launch_binary(BinaryOp::Mul, &self.sizes, inputs, outputs)
    }
}

/// Copies its input unchanged. Works for any element type.
#[derive(Debug, Clone)]
pub struct IdentityKernel {
    sizes: Sizes,
}

impl IdentityKernel {
    /// Create the kernel for tensors of `meta`.
    pub fn new(meta: TensorMeta) -> Self {
        Self {
            sizes: Sizes::new(meta, 1),
        }
    }
}

impl Kernel for IdentityKernel {
    fn name(&self) -> &str {
        "Identity"
    }

    fn input_size_list(&self) -> &[usize] {
        &self.sizes.inputs
    }

    fn output_size_list(&self) -> &[usize] {
        &self.sizes.outputs
    }

    fn output_meta(&self, _index: usize) -> TensorMeta {
        self.sizes.meta.clone()
    }

    fn launch(&self, inputs: &[AddressPtr], _workspace: &[AddressPtr], outputs: &[AddressPtr]) -> bool {
        if !self.sizes.matches(inputs, outputs) {
            return false;
        }
        // SAFETY: host buffers of the declared sizes, allocated by the runtime for this launch.
        let (x, y) = unsafe { (inputs[0].as_slice::<u8>(), outputs[0].as_mut_slice::<u8>()) };
        y.copy_from_slice(x);
        true
    }
}

fn add_scalar_factory(signature: &KernelSignature) -> Result<Arc<dyn Kernel>> {
    let meta = f32_meta("AddScalar", signature, 1)?;
    let scalar = signature.attr("scalar").unwrap_or(1.0) as f32;
    Ok(Arc::new(AddScalarKernel::new(meta, scalar)))
}

fn add_factory(signature: &KernelSignature) -> Result<Arc<dyn Kernel>> {
    Ok(Arc::new(AddKernel::new(f32_meta("Add", signature, 2)?)))
}

fn mul_factory(signature: &KernelSignature) -> Result<Arc<dyn Kernel>> {
    Ok(Arc::new(MulKernel::new(f32_meta("Mul", signature, 2)?)))
}

fn identity_factory(signature: &KernelSignature) -> Result<Arc<dyn Kernel>> {
    match signature.inputs.as_slice() {
        [meta] => Ok(Arc::new(IdentityKernel::new(meta.clone()))),
        other => Err(EngineError::invalid_graph(format!(
            "Identity takes 1 input, signature declares {}",
            other.len()
        ))),
    }
}

inventory::submit! {
    KernelRegistration { op: "AddScalar", device_name: CPU_DEVICE_NAME, factory: add_scalar_factory }
}

inventory::submit! {
    KernelRegistration { op: "Add", device_name: CPU_DEVICE_NAME, factory: add_factory }
}

inventory::submit! {
    KernelRegistration { op: "Mul", device_name: CPU_DEVICE_NAME, factory: mul_factory }
}

inventory::submit! {
    KernelRegistration { op: "Identity", device_name: CPU_DEVICE_NAME, factory: identity_factory }
}
