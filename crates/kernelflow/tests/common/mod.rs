//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kernelflow::prelude::*;

/// Key of the `id`-th host device.
pub fn cpu(id: u32) -> DeviceContextKey {
    DeviceContextKey::cpu(id)
}

/// One-dimensional f32 metadata.
pub fn f32_meta(n: usize) -> TensorMeta {
    TensorMeta::new(DType::F32, vec![n])
}

/// Registered `AddScalar` kernel adding `scalar` to `n` floats.
pub fn add_scalar(n: usize, scalar: f64) -> KernelRef {
    KernelRef::registered(
        "AddScalar",
        KernelSignature::new(vec![f32_meta(n)], vec![f32_meta(n)]).with_attr("scalar", scalar),
    )
}

/// Registered binary kernel `op` on `n` floats.
pub fn binary(op: &str, n: usize) -> KernelRef {
    KernelRef::registered(op, KernelSignature::new(vec![f32_meta(n); 2], vec![f32_meta(n)]))
}

/// Kernel wrapper that counts launches and can be slowed down or made to fail.
pub struct Tracked {
    inner: Arc<dyn Kernel>,
    launches: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
}

impl Tracked {
    /// Wrap `inner`.
    pub fn new(inner: impl Kernel + 'static) -> Arc<Self> {
        Self::build(inner, 0, None)
    }

    /// Wrap `inner`, sleeping `delay` on every launch.
    pub fn slow(inner: impl Kernel + 'static, delay: Duration) -> Arc<Self> {
        Self::build(inner, 0, Some(delay))
    }

    /// Wrap `inner`, failing the first `failures` launches.
    pub fn flaky(inner: impl Kernel + 'static, failures: usize) -> Arc<Self> {
        Self::build(inner, failures, None)
    }

    fn build(inner: impl Kernel + 'static, failures: usize, delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(inner),
            launches: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(failures),
            delay,
        })
    }

    /// Launches so far, failed ones included.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Use as a graph kernel.
    pub fn kernel_ref(self: &Arc<Self>) -> KernelRef {
        KernelRef::from(Arc::clone(self) as Arc<dyn Kernel>)
    }
}

impl Kernel for Tracked {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn input_size_list(&self) -> &[usize] {
        self.inner.input_size_list()
    }

    fn output_size_list(&self) -> &[usize] {
        self.inner.output_size_list()
    }

    fn workspace_size_list(&self) -> &[usize] {
        self.inner.workspace_size_list()
    }

    fn output_meta(&self, index: usize) -> TensorMeta {
        self.inner.output_meta(index)
    }

    fn launch(&self, inputs: &[AddressPtr], workspace: &[AddressPtr], outputs: &[AddressPtr]) -> bool {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        !failing && self.inner.launch(inputs, workspace, outputs)
    }
}

/// Build an engine over `devices` running `loop_count` iterations per call.
pub fn engine(graph: GraphDescriptor, devices: &[Arc<CpuDeviceContext>], loop_count: u64) -> ActorEngine {
    devices
        .iter()
        .fold(KernelFlow::builder(), |builder, device| {
            builder.device(Arc::clone(device) as Arc<dyn DeviceContext>)
        })
        .graph(graph)
        .loop_count(loop_count)
        .build()
        .expect("engine should build")
}

/// Assert that every transient block was returned exactly once.
pub fn assert_no_leaks(device: &CpuDeviceContext) {
    let stats = device.stats();
    assert_eq!(stats.live_allocations, 0, "live blocks on {:?}", stats);
    assert_eq!(stats.invalid_frees, 0, "invalid frees on {:?}", stats);
    assert_eq!(stats.allocations, stats.frees, "unbalanced on {:?}", stats);
}
