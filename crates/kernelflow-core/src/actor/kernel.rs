//! Kernel actor: one launch per iteration.

use std::sync::Arc;

use tracing::trace;

use super::base::{free_all, ActorContext};
use super::ActorBehavior;
use crate::device::{DeviceContext, DeviceTensor};
use crate::error::{EngineError, Result};
use crate::kernel::{AddressPtr, Kernel};
use crate::types::TensorMeta;

/// Launches one kernel with device buffers sized by its size lists.
pub struct KernelActor {
    /// Kernel to launch.
    pub kernel: Arc<dyn Kernel>,
}

impl KernelActor {
    /// Wrap a kernel.
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self { kernel }
    }
}

/// Resolve input `index` from a delivered value or the store snapshot.
pub(crate) fn resolve_input(
    ctx: &ActorContext<'_>,
    device: &Arc<dyn DeviceContext>,
    inputs: &[Option<Arc<DeviceTensor>>],
    index: usize,
) -> Result<AddressPtr> {
    if let Some(Some(tensor)) = inputs.get(index) {
        return tensor.address_ptr();
    }
    let key = ctx.base.store_key(index).ok_or_else(|| {
        EngineError::protocol(ctx.base.id.as_str(), format!("input {} has no value", index))
    })?;
    let tensor = ctx.run.store().fetch(key, device.key()).ok_or_else(|| {
        EngineError::protocol(
            ctx.base.id.as_str(),
            format!("device tensor store has no '{}' on {}", key, device.key()),
        )
    })?;
    tensor.address_ptr()
}

/// Allocate one scratch buffer per workspace size.
pub(crate) fn allocate_workspace(
    ctx: &ActorContext<'_>,
    device: &Arc<dyn DeviceContext>,
    sizes: &[usize],
) -> Result<Vec<Arc<DeviceTensor>>> {
    let mut workspace = Vec::with_capacity(sizes.len());
    for &size in sizes {
        match ctx.new_tensor(device, size, TensorMeta::bytes(size), 1) {
            Ok(t) => workspace.push(t),
            Err(err) => {
                free_all(&workspace);
                return Err(err);
            }
        }
    }
    Ok(workspace)
}

pub(crate) fn ptrs(tensors: &[Arc<DeviceTensor>]) -> Result<Vec<AddressPtr>> {
    tensors.iter().map(|t| t.address_ptr()).collect()
}

impl ActorBehavior for KernelActor {
    fn run(&self, ctx: &ActorContext<'_>, inputs: Vec<Option<Arc<DeviceTensor>>>) -> Result<()> {
        let device = ctx.base.device()?;
        let kernel = &self.kernel;

        let input_ptrs = (0..kernel.input_size_list().len())
            .map(|i| resolve_input(ctx, device, &inputs, i))
            .collect::<Result<Vec<_>>>()?;

        let mut outputs = Vec::with_capacity(kernel.output_size_list().len());
        for (index, &size) in kernel.output_size_list().iter().enumerate() {
            match ctx.new_output(device, index, size, kernel.output_meta(index)) {
                Ok(t) => outputs.push(t),
                Err(err) => {
                    free_all(&outputs);
                    return Err(err);
                }
            }
        }
        let workspace = match allocate_workspace(ctx, device, kernel.workspace_size_list()) {
            Ok(ws) => ws,
            Err(err) => {
                free_all(&outputs);
                return Err(err);
            }
        };

        trace!(actor = %ctx.base.id, kernel = kernel.name(), iteration = ctx.iteration, "launch");
        ctx.run.record_kernel_launch();
        let ok = kernel.launch(&input_ptrs, &ptrs(&workspace)?, &ptrs(&outputs)?);
        free_all(&workspace);
        if !ok {
            free_all(&outputs);
            return Err(EngineError::KernelExecution {
                actor_id: ctx.base.id.to_string(),
                kernel_name: kernel.name().to_string(),
            });
        }

        for (index, tensor) in outputs.iter().enumerate() {
            ctx.publish_output(index, tensor)?;
        }
        ctx.send_output_controls()?;
        ctx.release_inputs(&inputs)
    }
}
