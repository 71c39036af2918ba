//! # KernelFlow Core
//!
//! Actor runtime that executes compiled kernel graphs as dataflow.
//!
//! A [`GraphDescriptor`](graph::GraphDescriptor) is compiled into an
//! [`ActorSet`](compiler::ActorSet): one actor per node plus the data
//! prepare, loop count and output actors that drive iterations. Actors
//! exchange data, control and result messages and fire exactly once per
//! iteration once every dependency has arrived. Device tensors are reference
//! counted so their memory is returned as soon as the last consumer is done.
//!
//! ## Core Abstractions
//!
//! - [`DeviceContext`](device::DeviceContext) - memory and streams of one device
//! - [`Kernel`](kernel::Kernel) - a compiled operator with fixed buffer sizes
//! - [`DeviceTensor`](device::DeviceTensor) - ref-counted device buffer
//! - [`ActorEngine`](engine::ActorEngine) - spawns the actors and drives runs
//! - [`GraphExecutor`](engine::GraphExecutor) - async execution interface
//!
//! ## Example
//!
//! ```ignore
//! use kernelflow_core::prelude::*;
//!
//! let graph = GraphBuilder::new("add_one")
//!     .host_input("x", DeviceContextKey::cpu(0), 0, TensorMeta::new(DType::F32, vec![3]))
//!     .kernel("add", DeviceContextKey::cpu(0), add_one, [NodeInput::node("x", 0)])
//!     .output(NodeInput::node("add", 0))
//!     .build();
//! let engine = EngineBuilder::new().graph(graph).device(cpu).build()?;
//! let out = engine.execute(vec![HostTensor::from_f32(&[1.0, 2.0, 3.0])]).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod actor;
pub mod arrow;
pub mod compiler;
pub mod config;
pub mod device;
pub mod dump;
pub mod engine;
pub mod error;
pub mod graph;
pub mod kernel;
pub mod message;
pub mod queue;
pub mod router;
pub mod run;
pub mod store;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::arrow::{ControlArrow, DataArrow, ResultArrow};
    pub use crate::compiler::{compile, ActorSet};
    pub use crate::config::{ConfigBuilder, DumpConfig, EngineConfig};
    pub use crate::device::{DeviceContext, DeviceRegistry, DeviceTensor};
    pub use crate::engine::{ActorEngine, EngineBuilder, EngineStats, GraphExecutor};
    pub use crate::error::{DeviceFault, EngineError, OutOfMemory, Result};
    pub use crate::graph::{
        ControlDep, GraphBuilder, GraphDescriptor, GraphNode, KernelRef, NodeInput, NodeKind,
        SinkGraph, SinkValue,
    };
    pub use crate::kernel::{AddressPtr, Kernel, KernelRegistration, KernelRegistry, KernelSignature};
    pub use crate::queue::{Batch, DataQueue, RingDataQueue};
    pub use crate::run::{RunOutput, RunPhase, RunProfile};
    pub use crate::store::DeviceTensorStore;
    pub use crate::types::{
        ActorId, DType, DeviceAddress, DeviceContextKey, HostTensor, RunId, TensorMeta,
    };
}

// Re-exports for convenience
pub use engine::{ActorEngine, EngineBuilder, GraphExecutor};
pub use error::{EngineError, Result};
