//! # KernelFlow CPU Backend
//!
//! Host-memory device context and reference kernels for KernelFlow.
//!
//! The CPU backend is used for tests, demos and as a fallback when no
//! accelerator is present. Its allocator tracks every block so leaks and
//! invalid frees show up in [`CpuDeviceStats`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

mod device;
mod kernels;

pub use device::{CpuDeviceContext, CpuDeviceStats};
pub use kernels::{AddKernel, AddScalarKernel, IdentityKernel, MulKernel, CPU_DEVICE_NAME};

