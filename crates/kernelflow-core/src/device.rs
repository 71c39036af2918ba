//! Device contexts and reference-counted device tensors.
//!
//! A [`DeviceContext`] is the single allocator and stream for one device.
//! A [`DeviceTensor`] describes one device buffer together with its static
//! fan-out (`original_ref_count`) and live countdown (`ref_count`). The
//! buffer is returned to its device exactly once, when the countdown goes
//! from 1 to 0. Persistent tensors (weights, constants) never take that path.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{DeviceFault, EngineError, OutOfMemory, Result};
use crate::kernel::AddressPtr;
use crate::types::{ActorId, DeviceAddress, DeviceContextKey, HostTensor, TensorMeta};

/// `original_ref_count` marking a tensor that ref counting never frees.
pub const PERSISTENT_REF_COUNT: usize = usize::MAX;

/// Allocator and stream of one compute device.
///
/// All allocation and free requests for a device go through its context.
pub trait DeviceContext: Send + Sync {
    /// Identity of this context.
    fn key(&self) -> &DeviceContextKey;

    /// Allocate `size` bytes of device memory.
    fn allocate_memory(&self, size: usize) -> std::result::Result<DeviceAddress, OutOfMemory>;

    /// Return memory obtained from [`allocate_memory`](Self::allocate_memory).
    fn free_memory(&self, address: DeviceAddress);

    /// Copy host bytes into device memory.
    fn copy_host_to_device(&self, dst: DeviceAddress, src: &[u8]) -> std::result::Result<(), DeviceFault>;

    /// Copy device memory into a host buffer.
    fn copy_device_to_host(&self, dst: &mut [u8], src: DeviceAddress) -> std::result::Result<(), DeviceFault>;

    /// Copy between two buffers of this device.
    fn copy_device_to_device(
        &self,
        dst: DeviceAddress,
        src: DeviceAddress,
        size: usize,
    ) -> std::result::Result<(), DeviceFault>;

    /// Wait for all work issued to the device stream.
    fn synchronize_stream(&self) -> std::result::Result<(), DeviceFault>;
}

impl fmt::Debug for dyn DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext").field("key", self.key()).finish()
    }
}

/// Device contexts available to a compiled graph, by key.
#[derive(Default, Clone)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceContextKey, Arc<dyn DeviceContext>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device context. A context with the same key is replaced.
    pub fn register(&mut self, device: Arc<dyn DeviceContext>) {
        self.devices.insert(device.key().clone(), device);
    }

    /// Look up a device context.
    pub fn get(&self, key: &DeviceContextKey) -> Option<Arc<dyn DeviceContext>> {
        self.devices.get(key).cloned()
    }

    /// All registered contexts.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DeviceContext>> {
        self.devices.values()
    }

    /// Number of registered contexts.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.devices.keys()).finish()
    }
}

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Device-memory-backed value moved between actors.
pub struct DeviceTensor {
    id: u64,
    address: Mutex<Option<DeviceAddress>>,
    size: usize,
    meta: TensorMeta,
    device: Arc<dyn DeviceContext>,
    ref_count: AtomicUsize,
    original_ref_count: usize,
}

impl DeviceTensor {
    /// Describe a transient tensor consumed by `original_ref_count` consumers.
    ///
    /// No memory is attached until [`allocate`](Self::allocate).
    pub fn transient(
        device: Arc<dyn DeviceContext>,
        size: usize,
        meta: TensorMeta,
        original_ref_count: usize,
    ) -> Arc<Self> {
        Arc::new(Self::with_count(device, size, meta, original_ref_count.max(1)))
    }

    /// Describe a persistent tensor.
    pub fn persistent(device: Arc<dyn DeviceContext>, size: usize, meta: TensorMeta) -> Arc<Self> {
        Arc::new(Self::with_count(device, size, meta, PERSISTENT_REF_COUNT))
    }

    fn with_count(device: Arc<dyn DeviceContext>, size: usize, meta: TensorMeta, count: usize) -> Self {
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            address: Mutex::new(None),
            size,
            meta,
            device,
            ref_count: AtomicUsize::new(count),
            original_ref_count: count,
        }
    }

    /// Process-unique tensor id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Element type and shape.
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    /// Owning device context.
    pub fn device(&self) -> &Arc<dyn DeviceContext> {
        &self.device
    }

    /// Current device address, if memory is attached.
    pub fn address(&self) -> Option<DeviceAddress> {
        *self.address.lock()
    }

    /// Check if memory is attached.
    pub fn is_allocated(&self) -> bool {
        self.address.lock().is_some()
    }

    /// Live ref count.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Static fan-out.
    pub fn original_ref_count(&self) -> usize {
        self.original_ref_count
    }

    /// Check if the tensor is persistent.
    pub fn is_persistent(&self) -> bool {
        self.original_ref_count == PERSISTENT_REF_COUNT
    }

    /// Attach device memory, requested on behalf of `requester`.
    ///
    /// Returns the existing address if memory is already attached.
    pub fn allocate(&self, requester: &ActorId) -> Result<DeviceAddress> {
        let mut address = self.address.lock();
        if let Some(existing) = *address {
            return Ok(existing);
        }
        let ptr = self
            .device
            .allocate_memory(self.size)
            .map_err(|_| EngineError::AllocationFailed {
                actor: requester.to_string(),
                device: self.device.key().to_string(),
                size: self.size,
            })?;
        trace!(tensor = self.id, size = self.size, ptr = %ptr, "allocated device tensor");
        *address = Some(ptr);
        Ok(ptr)
    }

    /// Address and size for a kernel launch.
    pub fn address_ptr(&self) -> Result<AddressPtr> {
        match self.address() {
            Some(addr) => Ok(AddressPtr::new(addr, self.size)),
            None => Err(EngineError::Internal(format!(
                "device tensor {} used without memory",
                self.id
            ))),
        }
    }

    /// Consume one reference. Frees the memory when the count reaches zero.
    ///
    /// Returns `true` if this call freed the memory.
    pub fn release(&self) -> Result<bool> {
        self.release_by(1)
    }

    /// Consume `n` references at once.
    pub fn release_by(&self, n: usize) -> Result<bool> {
        if n == 0 || self.is_persistent() {
            return Ok(false);
        }
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current < n {
                return Err(EngineError::protocol(
                    format!("tensor#{}", self.id),
                    format!("released {} times with ref count {}", n, current),
                ));
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        if current == n {
            Ok(self.free())
        } else {
            Ok(false)
        }
    }

    /// Free the memory regardless of the ref count.
    ///
    /// Used when a failed run is swept. Returns `true` if memory was attached.
    pub fn force_free(&self) -> bool {
        if self.is_persistent() {
            return false;
        }
        self.ref_count.store(0, Ordering::Release);
        self.free()
    }

    fn free(&self) -> bool {
        let taken = self.address.lock().take();
        match taken {
            Some(ptr) => {
                trace!(tensor = self.id, ptr = %ptr, "freeing device tensor");
                self.device.free_memory(ptr);
                true
            }
            None => false,
        }
    }

    /// Upload host bytes into the attached memory.
    pub fn copy_from_host(&self, data: &[u8]) -> Result<()> {
        if data.len() != self.size {
            return Err(EngineError::invalid_input(format!(
                "cannot copy {} bytes into a {} byte device tensor",
                data.len(),
                self.size
            )));
        }
        let ptr = self.address_ptr()?.addr;
        self.device
            .copy_host_to_device(ptr, data)
            .map_err(|fault| self.sync_error("copy_host_to_device", fault))
    }

    /// Download the contents into a new host tensor.
    pub fn to_host(&self) -> Result<HostTensor> {
        let ptr = self.address_ptr()?.addr;
        let mut data = vec![0u8; self.size];
        self.device
            .copy_device_to_host(&mut data, ptr)
            .map_err(|fault| self.sync_error("copy_device_to_host", fault))?;
        Ok(HostTensor {
            meta: self.meta.clone(),
            data,
        })
    }

    fn sync_error(&self, op: &str, fault: DeviceFault) -> EngineError {
        EngineError::DeviceSync {
            device: self.device.key().to_string(),
            op: op.to_string(),
            message: fault.message,
        }
    }
}

impl Drop for DeviceTensor {
    fn drop(&mut self) {
        // Persistent tensors own their memory for the life of the descriptor.
        if self.is_persistent() {
            if let Some(ptr) = self.address.get_mut().take() {
                self.device.free_memory(ptr);
            }
        }
    }
}

impl fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("id", &self.id)
            .field("ptr", &self.address())
            .field("size", &self.size)
            .field("device", &self.device.key().to_string())
            .field("ref_count", &self.ref_count())
            .field("original_ref_count", &self.original_ref_count)
            .finish()
    }
}

/// Layout of device memory blocks.
pub mod align {
    /// Alignment of every device block.
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Bytes a device reserves for a tensor of `size` bytes: whole cache
    /// lines, and at least one so that an empty tensor still has an address.
    #[inline]
    pub const fn block_size(size: usize) -> usize {
        let size = if size == 0 { 1 } else { size };
        (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
    }

    /// Check if `addr` starts a block.
    #[inline]
    pub const fn is_block_aligned(addr: usize) -> bool {
        addr & (CACHE_LINE_SIZE - 1) == 0
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Minimal host device for unit tests inside this crate.

    use super::*;
    use std::collections::HashMap;

    pub struct TestDevice {
        key: DeviceContextKey,
        memory: Mutex<HashMap<usize, Vec<u8>>>,
        next: AtomicUsize,
        pub frees: AtomicUsize,
        pub allocations: AtomicUsize,
        pub capacity: Option<usize>,
    }

    impl TestDevice {
        pub fn new(id: u32) -> Arc<Self> {
            Arc::new(Self {
                key: DeviceContextKey::cpu(id),
                memory: Mutex::new(HashMap::new()),
                next: AtomicUsize::new(0x1000),
                frees: AtomicUsize::new(0),
                allocations: AtomicUsize::new(0),
                capacity: None,
            })
        }

        pub fn with_capacity(id: u32, capacity: usize) -> Arc<Self> {
            let mut dev = Self::new(id);
            if let Some(inner) = Arc::get_mut(&mut dev) {
                inner.capacity = Some(capacity);
            }
            dev
        }

        pub fn live(&self) -> usize {
            self.memory.lock().len()
        }
    }

    impl DeviceContext for TestDevice {
        fn key(&self) -> &DeviceContextKey {
            &self.key
        }

        fn allocate_memory(&self, size: usize) -> std::result::Result<DeviceAddress, OutOfMemory> {
            let mut memory = self.memory.lock();
            if let Some(cap) = self.capacity {
                let used: usize = memory.values().map(Vec::len).sum();
                if used + size > cap {
                    return Err(OutOfMemory {
                        requested: size,
                        available: cap - used,
                    });
                }
            }
            let addr = self.next.fetch_add(align::block_size(size), Ordering::Relaxed);
            memory.insert(addr, vec![0; size]);
            self.allocations.fetch_add(1, Ordering::Relaxed);
            Ok(DeviceAddress(addr))
        }

        fn free_memory(&self, address: DeviceAddress) {
            if self.memory.lock().remove(&address.0).is_some() {
                self.frees.fetch_add(1, Ordering::Relaxed);
            }
        }

        fn copy_host_to_device(&self, dst: DeviceAddress, src: &[u8]) -> std::result::Result<(), DeviceFault> {
            let mut memory = self.memory.lock();
            let buf = memory
                .get_mut(&dst.0)
                .ok_or_else(|| DeviceFault::new("unknown address"))?;
            buf[..src.len()].copy_from_slice(src);
            Ok(())
        }

        fn copy_device_to_host(&self, dst: &mut [u8], src: DeviceAddress) -> std::result::Result<(), DeviceFault> {
            let memory = self.memory.lock();
            let buf = memory
                .get(&src.0)
                .ok_or_else(|| DeviceFault::new("unknown address"))?;
            let len = dst.len();
            dst.copy_from_slice(&buf[..len]);
            Ok(())
        }

        fn copy_device_to_device(
            &self,
            dst: DeviceAddress,
            src: DeviceAddress,
            size: usize,
        ) -> std::result::Result<(), DeviceFault> {
            let mut memory = self.memory.lock();
            let data = memory
                .get(&src.0)
                .map(|b| b[..size].to_vec())
                .ok_or_else(|| DeviceFault::new("unknown address"))?;
            let buf = memory
                .get_mut(&dst.0)
                .ok_or_else(|| DeviceFault::new("unknown address"))?;
            buf[..size].copy_from_slice(&data);
            Ok(())
        }

        fn synchronize_stream(&self) -> std::result::Result<(), DeviceFault> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TestDevice;
    use super::*;

    fn requester() -> ActorId {
        ActorId::new("test_actor")
    }

    #[test]
    fn test_release_frees_exactly_once() {
        let device = TestDevice::new(0);
        let tensor = DeviceTensor::transient(device.clone(), 16, TensorMeta::bytes(16), 3);
        tensor.allocate(&requester()).unwrap();

        assert!(!tensor.release().unwrap());
        assert!(!tensor.release().unwrap());
        assert_eq!(device.live(), 1);
        assert!(tensor.release().unwrap());
        assert_eq!(device.live(), 0);
        assert_eq!(device.frees.load(Ordering::Relaxed), 1);

        // Over-release is reported, never a second free.
        assert!(tensor.release().unwrap_err().is_protocol());
        assert_eq!(device.frees.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_release_by() {
        let device = TestDevice::new(0);
        let tensor = DeviceTensor::transient(device.clone(), 8, TensorMeta::bytes(8), 4);
        tensor.allocate(&requester()).unwrap();

        assert!(!tensor.release_by(3).unwrap());
        assert_eq!(tensor.ref_count(), 1);
        assert!(tensor.release_by(1).unwrap());
        assert!(!tensor.is_allocated());
    }

    #[test]
    fn test_persistent_never_released() {
        let device = TestDevice::new(0);
        let weight = DeviceTensor::persistent(device.clone(), 32, TensorMeta::bytes(32));
        weight.allocate(&requester()).unwrap();

        for _ in 0..10 {
            assert!(!weight.release().unwrap());
        }
        assert!(!weight.force_free());
        assert!(weight.is_allocated());

        drop(weight);
        assert_eq!(device.live(), 0);
    }

    #[test]
    fn test_concurrent_release() {
        let device = TestDevice::new(0);
        let tensor = DeviceTensor::transient(device.clone(), 8, TensorMeta::bytes(8), 64);
        tensor.allocate(&requester()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = Arc::clone(&tensor);
                std::thread::spawn(move || {
                    let mut freed = 0;
                    for _ in 0..8 {
                        if t.release().unwrap() {
                            freed += 1;
                        }
                    }
                    freed
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1);
        assert_eq!(device.frees.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_allocation_failure_names_requester() {
        let device = TestDevice::with_capacity(0, 8);
        let tensor = DeviceTensor::transient(device, 64, TensorMeta::bytes(64), 1);
        let err = tensor.allocate(&ActorId::new("big_kernel")).unwrap_err();
        assert_eq!(
            err,
            EngineError::AllocationFailed {
                actor: "big_kernel".to_string(),
                device: "CPU_0".to_string(),
                size: 64,
            }
        );
    }

    #[test]
    fn test_host_roundtrip() {
        let device = TestDevice::new(0);
        let host = HostTensor::from_f32(&[1.5, 2.5]);
        let tensor = DeviceTensor::transient(device, host.byte_size(), host.meta.clone(), 1);
        tensor.allocate(&requester()).unwrap();
        tensor.copy_from_host(&host.data).unwrap();
        assert_eq!(tensor.to_host().unwrap(), host);
    }

    #[test]
    fn test_block_size() {
        use align::*;

        assert_eq!(block_size(0), CACHE_LINE_SIZE);
        assert_eq!(block_size(1), 64);
        assert_eq!(block_size(64), 64);
        assert_eq!(block_size(65), 128);
        assert!(is_block_aligned(128));
        assert!(!is_block_aligned(63));
    }
}
