//! Kernel contract and static kernel registration.
//!
//! Kernels are opaque to the runtime: it only reads their pre-declared size
//! lists and calls [`Kernel::launch`] with device buffers of those sizes.
//! Backends register kernel factories with [`inventory::submit!`]; the
//! engine resolves graph nodes against a [`KernelRegistry`] built from them.
//!
//! ```ignore
//! inventory::submit! {
//!     KernelRegistration {
//!         op: "AddScalar",
//!         device_name: "CPU",
//!         factory: add_scalar_factory,
//!     }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::types::{DeviceAddress, TensorMeta};

/// Device buffer handed to a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPtr {
    /// Start of the buffer.
    pub addr: DeviceAddress,
    /// Buffer size in bytes.
    pub size: usize,
}

impl AddressPtr {
    /// Create an address pointer.
    pub fn new(addr: DeviceAddress, size: usize) -> Self {
        Self { addr, size }
    }

    /// View the buffer as a typed slice.
    ///
    /// # Safety
    ///
    /// The address must be host-addressable, valid for `size` bytes, aligned
    /// for `T`, and not written concurrently.
    pub unsafe fn as_slice<'a, T: bytemuck::Pod>(&self) -> &'a [T] {
        let len = self.size / std::mem::size_of::<T>().max(1);
        // SAFETY: upheld by the caller.
        unsafe { std::slice::from_raw_parts(self.addr.0 as *const T, len) }
    }

    /// View the buffer as a mutable typed slice.
    ///
    /// # Safety
    ///
    /// Same as [`as_slice`](Self::as_slice), and the buffer must not be
    /// aliased for the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice<'a, T: bytemuck::Pod>(&self) -> &'a mut [T] {
        let len = self.size / std::mem::size_of::<T>().max(1);
        // SAFETY: upheld by the caller.
        unsafe { std::slice::from_raw_parts_mut(self.addr.0 as *mut T, len) }
    }
}

/// Contract between the runtime and one compiled operator.
pub trait Kernel: Send + Sync {
    /// Kernel name, used in logs and errors.
    fn name(&self) -> &str;

    /// Byte size of each input.
    fn input_size_list(&self) -> &[usize];

    /// Byte size of each output.
    fn output_size_list(&self) -> &[usize];

    /// Byte size of each scratch buffer.
    fn workspace_size_list(&self) -> &[usize] {
        &[]
    }

    /// Element type and shape of output `index`.
    fn output_meta(&self, index: usize) -> TensorMeta {
        TensorMeta::bytes(self.output_size_list().get(index).copied().unwrap_or(0))
    }

    /// Issue the kernel. Returns `false` on failure.
    fn launch(&self, inputs: &[AddressPtr], workspace: &[AddressPtr], outputs: &[AddressPtr]) -> bool;
}

impl fmt::Debug for dyn Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name())
            .field("inputs", &self.input_size_list())
            .field("outputs", &self.output_size_list())
            .finish()
    }
}

/// Shapes and attributes a registered kernel is instantiated with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelSignature {
    /// Input tensor metadata.
    pub inputs: Vec<TensorMeta>,
    /// Output tensor metadata.
    pub outputs: Vec<TensorMeta>,
    /// Scalar attributes.
    pub attrs: BTreeMap<String, f64>,
}

impl KernelSignature {
    /// Create a signature.
    pub fn new(inputs: Vec<TensorMeta>, outputs: Vec<TensorMeta>) -> Self {
        Self {
            inputs,
            outputs,
            attrs: BTreeMap::new(),
        }
    }

    /// Add a scalar attribute.
    pub fn with_attr(mut self, name: impl Into<String>, value: f64) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    /// Look up a scalar attribute.
    pub fn attr(&self, name: &str) -> Option<f64> {
        self.attrs.get(name).copied()
    }
}

/// Factory building a kernel for a signature.
pub type KernelFactory = fn(&KernelSignature) -> Result<Arc<dyn Kernel>>;

/// Kernel factory submitted with `inventory`.
#[derive(Clone)]
pub struct KernelRegistration {
    /// Operator name.
    pub op: &'static str,
    /// Device family the kernel runs on.
    pub device_name: &'static str,
    /// Factory function.
    pub factory: KernelFactory,
}

inventory::collect!(KernelRegistration);

impl fmt::Debug for KernelRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistration")
            .field("op", &self.op)
            .field("device_name", &self.device_name)
            .finish()
    }
}

/// Kernel factories by `(op, device family)`.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    factories: HashMap<(String, String), KernelFactory>,
}

impl KernelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every factory submitted via `inventory::submit!`.
    pub fn discover() -> Self {
        let mut registry = Self::new();
        for reg in inventory::iter::<KernelRegistration>() {
            registry.register(reg.op, reg.device_name, reg.factory);
        }
        registry
    }

    /// Register a factory by hand.
    pub fn register(&mut self, op: &str, device_name: &str, factory: KernelFactory) {
        self.factories
            .insert((op.to_string(), device_name.to_string()), factory);
    }

    /// Instantiate `op` for `device_name`.
    pub fn create(&self, op: &str, device_name: &str, signature: &KernelSignature) -> Result<Arc<dyn Kernel>> {
        let factory = self
            .factories
            .get(&(op.to_string(), device_name.to_string()))
            .ok_or_else(|| {
                EngineError::invalid_graph(format!("no kernel '{}' registered for {}", op, device_name))
            })?;
        factory(signature)
    }

    /// Check if `op` is available for `device_name`.
    pub fn contains(&self, op: &str, device_name: &str) -> bool {
        self.factories
            .contains_key(&(op.to_string(), device_name.to_string()))
    }

    /// Registered `(op, device family)` pairs.
    pub fn ops(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.factories.keys().map(|(op, dev)| (op.as_str(), dev.as_str()))
    }

    /// Number of registered factories.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("registered", &self.factories.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Kernels for unit tests inside this crate.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records launches; optionally fails.
    pub struct CountingKernel {
        pub name: String,
        pub inputs: Vec<usize>,
        pub outputs: Vec<usize>,
        pub workspace: Vec<usize>,
        pub fail: bool,
        pub launches: AtomicUsize,
    }

    impl CountingKernel {
        pub fn new(name: &str, inputs: Vec<usize>, outputs: Vec<usize>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                inputs,
                outputs,
                workspace: Vec::new(),
                fail: false,
                launches: AtomicUsize::new(0),
            })
        }

        pub fn failing(name: &str, inputs: Vec<usize>, outputs: Vec<usize>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                inputs,
                outputs,
                workspace: Vec::new(),
                fail: true,
                launches: AtomicUsize::new(0),
            })
        }

        pub fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }
    }

    impl Kernel for CountingKernel {
        fn name(&self) -> &str {
            &self.name
        }

        fn input_size_list(&self) -> &[usize] {
            &self.inputs
        }

        fn output_size_list(&self) -> &[usize] {
            &self.outputs
        }

        fn workspace_size_list(&self) -> &[usize] {
            &self.workspace
        }

        fn launch(&self, _inputs: &[AddressPtr], _workspace: &[AddressPtr], _outputs: &[AddressPtr]) -> bool {
            self.launches.fetch_add(1, Ordering::SeqCst);
            !self.fail
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CountingKernel;
    use super::*;

    fn counting_factory(sig: &KernelSignature) -> Result<Arc<dyn Kernel>> {
        let inputs = sig.inputs.iter().map(TensorMeta::byte_size).collect();
        let outputs = sig.outputs.iter().map(TensorMeta::byte_size).collect();
        Ok(CountingKernel::new("Counting", inputs, outputs))
    }

    #[test]
    fn test_registry_create() {
        let mut registry = KernelRegistry::new();
        registry.register("Counting", "CPU", counting_factory);
        assert!(registry.contains("Counting", "CPU"));
        assert!(!registry.contains("Counting", "GPU"));

        let sig = KernelSignature::new(vec![TensorMeta::bytes(8)], vec![TensorMeta::bytes(4)]);
        let kernel = registry.create("Counting", "CPU", &sig).unwrap();
        assert_eq!(kernel.input_size_list(), &[8]);
        assert_eq!(kernel.output_size_list(), &[4]);
        assert_eq!(kernel.output_meta(0), TensorMeta::bytes(4));
    }

    #[test]
    fn test_registry_missing_op() {
        let registry = KernelRegistry::new();
        let err = registry
            .create("Nope", "CPU", &KernelSignature::default())
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::InvalidGraph(_)));
    }

    #[test]
    fn test_signature_attrs() {
        let sig = KernelSignature::default().with_attr("value", 1.0);
        assert_eq!(sig.attr("value"), Some(1.0));
        assert_eq!(sig.attr("other"), None);
    }

    #[test]
    fn test_address_ptr_views() {
        let mut data = [1.0f32, 2.0, 3.0];
        let ptr = AddressPtr::new(DeviceAddress(data.as_mut_ptr() as usize), 12);
        let view: &mut [f32] = unsafe { ptr.as_mut_slice() };
        view[1] = 5.0;
        let read: &[f32] = unsafe { ptr.as_slice() };
        assert_eq!(read, &[1.0, 5.0, 3.0]);
    }
}
