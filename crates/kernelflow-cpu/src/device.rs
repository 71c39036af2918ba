//! Host-memory device context.
//!
//! Allocations are cache-line aligned heap blocks tracked in an allocation
//! map, so frees of unknown or already freed addresses are detected instead
//! of corrupting the heap. An optional capacity makes the device run out of
//! memory deterministically, and a stream-sync fault can be injected to
//! exercise failure paths.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use kernelflow_core::device::align::{block_size, CACHE_LINE_SIZE};
use kernelflow_core::device::DeviceContext;
use kernelflow_core::error::{DeviceFault, OutOfMemory};
use kernelflow_core::types::{DeviceAddress, DeviceContextKey};

/// Allocation statistics of a [`CpuDeviceContext`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDeviceStats {
    /// Successful allocations.
    pub allocations: u64,
    /// Successful frees.
    pub frees: u64,
    /// Frees of addresses that were not allocated.
    pub invalid_frees: u64,
    /// Requested bytes currently allocated.
    pub bytes_in_use: usize,
    /// High-water mark of `bytes_in_use`.
    pub peak_bytes: usize,
    /// Blocks currently allocated.
    pub live_allocations: usize,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    layout: Layout,
    size: usize,
}

#[derive(Debug, Default)]
struct Ledger {
    blocks: HashMap<usize, Block>,
    bytes_in_use: usize,
    peak_bytes: usize,
}

impl Ledger {
    /// Check that `[address, address + len)` lies inside one live block.
    fn check_range(&self, address: DeviceAddress, len: usize) -> Result<(), DeviceFault> {
        let inside = self.blocks.iter().any(|(&base, block)| {
            address.0 >= base && address.0.saturating_add(len) <= base + block.size
        });
        if inside {
            Ok(())
        } else {
            Err(DeviceFault::new(format!(
                "{} bytes at {} are not inside a live allocation",
                len, address
            )))
        }
    }
}

/// Host-memory implementation of [`DeviceContext`].
pub struct CpuDeviceContext {
    key: DeviceContextKey,
    capacity: Option<usize>,
    ledger: Mutex<Ledger>,
    allocations: AtomicU64,
    frees: AtomicU64,
    invalid_frees: AtomicU64,
    syncs: AtomicU64,
    sync_fault: Mutex<Option<String>>,
}

impl CpuDeviceContext {
    /// Create the `id`-th host device with unlimited memory.
    pub fn new(id: u32) -> Arc<Self> {
        Arc::new(Self::build(id, None))
    }

    /// Create a host device that fails allocations beyond `capacity` bytes.
    pub fn with_capacity(id: u32, capacity: usize) -> Arc<Self> {
        Arc::new(Self::build(id, Some(capacity)))
    }

    fn build(id: u32, capacity: Option<usize>) -> Self {
        Self {
            key: DeviceContextKey::cpu(id),
            capacity,
            ledger: Mutex::new(Ledger::default()),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            invalid_frees: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
            sync_fault: Mutex::new(None),
        }
    }

    /// Memory limit, if any.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Make the next `synchronize_stream` call fail with `message`.
    pub fn inject_sync_fault(&self, message: impl Into<String>) {
        *self.sync_fault.lock() = Some(message.into());
    }

    /// Number of stream synchronizations.
    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    /// Get allocation statistics.
    pub fn stats(&self) -> CpuDeviceStats {
        let ledger = self.ledger.lock();
        CpuDeviceStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            invalid_frees: self.invalid_frees.load(Ordering::Relaxed),
            bytes_in_use: ledger.bytes_in_use,
            peak_bytes: ledger.peak_bytes,
            live_allocations: ledger.blocks.len(),
        }
    }

    /// Blocks currently allocated.
    pub fn live_allocations(&self) -> usize {
        self.ledger.lock().blocks.len()
    }
}

impl DeviceContext for CpuDeviceContext {
    fn key(&self) -> &DeviceContextKey {
        &self.key
    }

    fn allocate_memory(&self, size: usize) -> Result<DeviceAddress, OutOfMemory> {
        let mut ledger = self.ledger.lock();
        let available = self
            .capacity
            .map_or(usize::MAX, |cap| cap.saturating_sub(ledger.bytes_in_use));
        let oom = OutOfMemory {
            requested: size,
            available,
        };
        if size > available {
            return Err(oom);
        }

        let layout = Layout::from_size_align(block_size(size), CACHE_LINE_SIZE)
            .map_err(|_| oom.clone())?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return Err(oom);
        }

        let address = ptr as usize;
        ledger.blocks.insert(address, Block { layout, size });
        ledger.bytes_in_use += size;
        ledger.peak_bytes = ledger.peak_bytes.max(ledger.bytes_in_use);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        trace!(device = %self.key, size, address = %DeviceAddress(address), "allocate");
        Ok(DeviceAddress(address))
    }

    fn free_memory(&self, address: DeviceAddress) {
        let mut ledger = self.ledger.lock();
        match ledger.blocks.remove(&address.0) {
            Some(block) => {
                // SAFETY: the block was allocated with this layout and is removed from the map.
                unsafe { dealloc(address.0 as *mut u8, block.layout) };
                ledger.bytes_in_use -= block.size;
                self.frees.fetch_add(1, Ordering::Relaxed);
                trace!(device = %self.key, address = %address, "free");
            }
            None => {
                self.invalid_frees.fetch_add(1, Ordering::Relaxed);
                warn!(device = %self.key, address = %address, "free of unknown address ignored");
            }
        }
    }

    fn copy_host_to_device(&self, dst: DeviceAddress, src: &[u8]) -> Result<(), DeviceFault> {
        let ledger = self.ledger.lock();
        ledger.check_range(dst, src.len())?;
        // SAFETY: the destination range is inside a live block; the lock keeps it alive.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.0 as *mut u8, src.len()) };
        Ok(())
    }

    fn copy_device_to_host(&self, dst: &mut [u8], src: DeviceAddress) -> Result<(), DeviceFault> {
        let ledger = self.ledger.lock();
        ledger.check_range(src, dst.len())?;
        // SAFETY: the source range is inside a live block; the lock keeps it alive.
        unsafe { std::ptr::copy_nonoverlapping(src.0 as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn copy_device_to_device(&self, dst: DeviceAddress, src: DeviceAddress, size: usize) -> Result<(), DeviceFault> {
        let ledger = self.ledger.lock();
        ledger.check_range(src, size)?;
        ledger.check_range(dst, size)?;
        // SAFETY: both ranges are inside live blocks; `copy` tolerates overlap.
        unsafe { std::ptr::copy(src.0 as *const u8, dst.0 as *mut u8, size) };
        Ok(())
    }

    fn synchronize_stream(&self) -> Result<(), DeviceFault> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        match self.sync_fault.lock().take() {
            Some(message) => Err(DeviceFault::new(message)),
            None => Ok(()),
        }
    }
}

impl Drop for CpuDeviceContext {
    fn drop(&mut self) {
        let ledger = self.ledger.get_mut();
        if !ledger.blocks.is_empty() {
            warn!(device = %self.key, blocks = ledger.blocks.len(), "freeing blocks still allocated at drop");
        }
        for (address, block) in ledger.blocks.drain() {
            // SAFETY: every block in the map is live and owned by this context.
            unsafe { dealloc(address as *mut u8, block.layout) };
        }
    }
}

impl std::fmt::Debug for CpuDeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuDeviceContext")
            .field("key", &self.key)
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}
