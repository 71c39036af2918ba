//! # KernelFlow
//!
//! Actor-based dataflow execution engine for compiled kernel graphs.
//!
//! A compiled graph of kernels is turned into a set of actors, one per
//! operator plus a few that drive the iteration loop. Actors fire as soon as
//! their data and control inputs for an iteration are complete, so
//! independent branches run concurrently while every kernel still runs
//! exactly once per iteration. Device memory is reference counted and
//! returned as soon as the last consumer of a tensor is done.
//!
//! ## Quick Start
//!
//! ```ignore
//! use kernelflow::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let cpu = DeviceContextKey::cpu(0);
//!     let meta = TensorMeta::new(DType::F32, vec![3]);
//!     let add_one = KernelRef::registered(
//!         "AddScalar",
//!         KernelSignature::new(vec![meta.clone()], vec![meta.clone()]).with_attr("scalar", 1.0),
//!     );
//!     let graph = GraphBuilder::new("add_one")
//!         .host_input("x", cpu.clone(), 0, meta)
//!         .kernel("add", cpu, add_one, [NodeInput::node("x", 0)])
//!         .output(NodeInput::node("add", 0))
//!         .build();
//!
//!     let engine = KernelFlow::builder().cpu_device(0).graph(graph).build()?;
//!     let out = engine.execute(vec![HostTensor::from_f32(&[1.0, 2.0, 3.0])]).await?;
//!     assert_eq!(out.outputs[0].to_vec::<f32>(), vec![2.0, 3.0, 4.0]);
//!     Ok(())
//! }
//! ```
//!
//! ## Crates
//!
//! - `kernelflow-core` - actors, compiler, engine and device contracts
//! - `kernelflow-cpu` - host-memory device and reference kernels

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(hidden_glob_reexports)]

// Re-export core types
pub use kernelflow_core::*;

// Re-export CPU backend (always available)
pub use kernelflow_cpu::{
    AddKernel, AddScalarKernel, CpuDeviceContext, CpuDeviceStats, IdentityKernel, MulKernel,
    CPU_DEVICE_NAME,
};

use std::sync::Arc;

use tracing::debug;

use kernelflow_core::config::EngineConfig;
use kernelflow_core::device::DeviceContext;
use kernelflow_core::engine::{ActorEngine, EngineBuilder};
use kernelflow_core::error::Result;
use kernelflow_core::graph::GraphDescriptor;
use kernelflow_core::kernel::{KernelRegistration, KernelRegistry};
use kernelflow_core::store::DeviceTensorStore;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{KernelFlow, KernelFlowBuilder};
    pub use kernelflow_core::prelude::*;
    pub use kernelflow_cpu::{
        AddKernel, AddScalarKernel, CpuDeviceContext, CpuDeviceStats, IdentityKernel, MulKernel,
        CPU_DEVICE_NAME,
    };
}

/// Entry point for building engines.
#[derive(Debug, Clone, Copy)]
pub struct KernelFlow;

impl KernelFlow {
    /// Create a new engine builder.
    pub fn builder() -> KernelFlowBuilder {
        KernelFlowBuilder::new()
    }
}

/// [`EngineBuilder`] with backend conveniences.
#[derive(Debug, Default)]
pub struct KernelFlowBuilder {
    inner: EngineBuilder,
}

impl KernelFlowBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh host device `CPU_<id>`.
    pub fn cpu_device(self, id: u32) -> Self {
        self.device(CpuDeviceContext::new(id))
    }

    /// Register a device context.
    pub fn device(mut self, device: Arc<dyn DeviceContext>) -> Self {
        self.inner = self.inner.device(device);
        self
    }

    /// Set the graph to execute.
    pub fn graph(mut self, graph: GraphDescriptor) -> Self {
        self.inner = self.inner.graph(graph);
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.inner = self.inner.config(config);
        self
    }

    /// Set the number of iterations per run.
    pub fn loop_count(mut self, loop_count: u64) -> Self {
        self.inner = self.inner.loop_count(loop_count);
        self
    }

    /// Set the kernel registry.
    pub fn kernels(mut self, kernels: KernelRegistry) -> Self {
        self.inner = self.inner.kernels(kernels);
        self
    }

    /// Set the persistent tensor store.
    pub fn store(mut self, store: DeviceTensorStore) -> Self {
        self.inner = self.inner.store(store);
        self
    }

    /// Compile the graph and start the actors.
    pub fn build(self) -> Result<ActorEngine> {
        debug!(
            devices = self.inner.device_registry().len(),
            kernels = inventory::iter::<KernelRegistration>.into_iter().count(),
            "building engine"
        );
        self.inner.build()
    }
}

/// Operators registered for static discovery, as `(op, device family)`.
pub fn registered_kernels() -> Vec<(&'static str, &'static str)> {
    inventory::iter::<KernelRegistration>
        .into_iter()
        .map(|r| (r.op, r.device_name))
        .collect()
}
