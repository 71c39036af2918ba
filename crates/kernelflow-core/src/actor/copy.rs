//! Copy actor: moves one tensor onto another device.

use std::sync::Arc;

use super::base::{free_all, ActorContext};
use super::ActorBehavior;
use crate::device::{DeviceContext, DeviceTensor};
use crate::error::{EngineError, Result};

/// Copies its single input onto `target`. Owns exactly one output.
pub struct CopyActor {
    /// Destination device.
    pub target: Arc<dyn DeviceContext>,
}

impl CopyActor {
    /// Create a copy actor.
    pub fn new(target: Arc<dyn DeviceContext>) -> Self {
        Self { target }
    }
}

fn sync_error(device: &Arc<dyn DeviceContext>, op: &str, message: String) -> EngineError {
    EngineError::DeviceSync {
        device: device.key().to_string(),
        op: op.to_string(),
        message,
    }
}

impl ActorBehavior for CopyActor {
    fn run(&self, ctx: &ActorContext<'_>, inputs: Vec<Option<Arc<DeviceTensor>>>) -> Result<()> {
        let src = inputs
            .first()
            .cloned()
            .flatten()
            .ok_or_else(|| EngineError::protocol(ctx.base.id.as_str(), "copy has no input"))?;
        let src_device = Arc::clone(src.device());
        src_device
            .synchronize_stream()
            .map_err(|f| sync_error(&src_device, "copy", f.message))?;

        let dst = ctx.new_output(&self.target, 0, src.size(), src.meta().clone())?;
        let copied = if src_device.key() == self.target.key() {
            match (dst.address(), src.address()) {
                (Some(d), Some(s)) => self
                    .target
                    .copy_device_to_device(d, s, src.size())
                    .map_err(|f| sync_error(&self.target, "copy_device_to_device", f.message)),
                _ => Err(EngineError::Internal("copy between unallocated tensors".to_string())),
            }
        } else {
            // Different devices: stage through host memory.
            src.to_host().and_then(|host| dst.copy_from_host(&host.data))
        };
        if let Err(err) = copied {
            free_all(&[dst]);
            return Err(err);
        }

        ctx.publish_output(0, &dst)?;
        ctx.send_output_controls()?;
        ctx.release_inputs(&inputs)
    }
}
