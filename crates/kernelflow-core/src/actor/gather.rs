//! Gather actor: relays several upstream values as one positional list.

use std::sync::Arc;

use super::base::ActorContext;
use super::ActorBehavior;
use crate::device::DeviceTensor;
use crate::error::Result;
use crate::message::Payload;

/// Forwards input `k` on output `k` once every input has arrived.
///
/// The gather never owns memory: references handed to it are passed on
/// unchanged to the consumers of the matching output.
pub struct GatherActor {
    /// Number of relayed values.
    pub arity: usize,
}

impl ActorBehavior for GatherActor {
    fn run(&self, ctx: &ActorContext<'_>, inputs: Vec<Option<Arc<DeviceTensor>>>) -> Result<()> {
        for (index, value) in inputs.iter().enumerate().take(self.arity) {
            if let Some(tensor) = value {
                ctx.forward_output(index, &Payload::Tensor(Arc::clone(tensor)))?;
                if ctx.base.is_unconsumed(index) {
                    tensor.release()?;
                }
            }
        }
        ctx.send_output_controls()
    }
}
