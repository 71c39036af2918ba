//! Super kernel actor: a pre-scheduled subgraph launched as one unit.
//!
//! Intermediate values live in local buffers freed right after their last
//! use inside the subgraph. Only the subgraph's external outputs leave the
//! actor.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use super::base::{free_all, ActorContext};
use super::kernel::{allocate_workspace, ptrs, resolve_input};
use super::ActorBehavior;
use crate::device::DeviceTensor;
use crate::error::{EngineError, Result};
use crate::graph::SinkValue;
use crate::kernel::{AddressPtr, Kernel};
use crate::message::Payload;

/// One kernel of the subgraph.
pub struct SuperKernelStep {
    /// Name inside the subgraph.
    pub name: String,
    /// Kernel.
    pub kernel: Arc<dyn Kernel>,
    /// Inputs.
    pub inputs: Vec<SinkValue>,
}

type ValueKey = (usize, usize);

/// Runs its steps in order on the home device.
pub struct SuperKernelActor {
    /// Steps in execution order.
    pub steps: Vec<SuperKernelStep>,
    /// External outputs.
    pub outputs: Vec<SinkValue>,
    last_use: HashMap<ValueKey, usize>,
    exported: HashMap<ValueKey, Vec<usize>>,
}

impl SuperKernelActor {
    /// Build the actor and its buffer lifetime table.
    pub fn new(steps: Vec<SuperKernelStep>, outputs: Vec<SinkValue>) -> Self {
        let mut last_use = HashMap::new();
        for (index, step) in steps.iter().enumerate() {
            for (o, _) in step.kernel.output_size_list().iter().enumerate() {
                last_use.insert((index, o), index);
            }
            for input in &step.inputs {
                if let SinkValue::Kernel { index: k, output_index } = *input {
                    last_use.insert((k, output_index), index);
                }
            }
        }
        let mut exported: HashMap<ValueKey, Vec<usize>> = HashMap::new();
        for (position, value) in outputs.iter().enumerate() {
            if let SinkValue::Kernel { index, output_index } = *value {
                exported.entry((index, output_index)).or_default().push(position);
            }
        }
        Self {
            steps,
            outputs,
            last_use,
            exported,
        }
    }

    fn fail(ctx: &ActorContext<'_>, locals: &HashMap<ValueKey, Arc<DeviceTensor>>, err: EngineError) -> EngineError {
        let held: Vec<_> = locals.values().cloned().collect();
        free_all(&held);
        trace!(actor = %ctx.base.id, "super kernel aborted, local buffers freed");
        err
    }
}

impl ActorBehavior for SuperKernelActor {
    fn run(&self, ctx: &ActorContext<'_>, inputs: Vec<Option<Arc<DeviceTensor>>>) -> Result<()> {
        let device = ctx.base.device()?;
        let mut locals: HashMap<ValueKey, Arc<DeviceTensor>> = HashMap::new();

        for (index, step) in self.steps.iter().enumerate() {
            let kernel = &step.kernel;
            let mut input_ptrs: Vec<AddressPtr> = Vec::with_capacity(step.inputs.len());
            for value in &step.inputs {
                let ptr = match *value {
                    SinkValue::Input(n) => resolve_input(ctx, device, &inputs, n),
                    SinkValue::Kernel { index: k, output_index } => locals
                        .get(&(k, output_index))
                        .ok_or_else(|| {
                            EngineError::protocol(
                                ctx.base.id.as_str(),
                                format!("step '{}' reads a value that is not live", step.name),
                            )
                        })
                        .and_then(|t| t.address_ptr()),
                };
                match ptr {
                    Ok(p) => input_ptrs.push(p),
                    Err(err) => return Err(Self::fail(ctx, &locals, err)),
                }
            }

            let mut outputs = Vec::with_capacity(kernel.output_size_list().len());
            for (o, &size) in kernel.output_size_list().iter().enumerate() {
                let ref_count = match self.exported.get(&(index, o)) {
                    Some(positions) => positions
                        .iter()
                        .map(|&p| ctx.base.output_fanout.get(p).copied().unwrap_or(0))
                        .sum::<usize>()
                        .max(1),
                    None => 1,
                };
                match ctx.new_tensor(device, size, kernel.output_meta(o), ref_count) {
                    Ok(t) => {
                        locals.insert((index, o), Arc::clone(&t));
                        outputs.push(t);
                    }
                    Err(err) => return Err(Self::fail(ctx, &locals, err)),
                }
            }
            let workspace = match allocate_workspace(ctx, device, kernel.workspace_size_list()) {
                Ok(ws) => ws,
                Err(err) => return Err(Self::fail(ctx, &locals, err)),
            };

            trace!(actor = %ctx.base.id, step = %step.name, kernel = kernel.name(), "launch");
            ctx.run.record_kernel_launch();
            let launched = ptrs(&workspace)
                .and_then(|ws| Ok((ws, ptrs(&outputs)?)))
                .map(|(ws, outs)| kernel.launch(&input_ptrs, &ws, &outs));
            free_all(&workspace);
            match launched {
                Ok(true) => {}
                Ok(false) => {
                    let err = EngineError::KernelExecution {
                        actor_id: ctx.base.id.to_string(),
                        kernel_name: kernel.name().to_string(),
                    };
                    return Err(Self::fail(ctx, &locals, err));
                }
                Err(err) => return Err(Self::fail(ctx, &locals, err)),
            }

            // Internal buffers whose last reader was this step.
            let done: Vec<ValueKey> = locals
                .keys()
                .filter(|key| !self.exported.contains_key(key) && self.last_use.get(key) == Some(&index))
                .copied()
                .collect();
            for key in done {
                if let Some(t) = locals.remove(&key) {
                    t.release()?;
                }
            }
        }

        for (position, value) in self.outputs.iter().enumerate() {
            let SinkValue::Kernel { index, output_index } = *value else {
                return Err(EngineError::protocol(
                    ctx.base.id.as_str(),
                    "super kernel outputs must be kernel values",
                ));
            };
            let tensor = locals.get(&(index, output_index)).ok_or_else(|| {
                EngineError::Internal(format!("super kernel output {} was not produced", position))
            })?;
            ctx.forward_output(position, &Payload::Tensor(Arc::clone(tensor)))?;
        }
        for (key, positions) in &self.exported {
            if positions.iter().all(|&p| ctx.base.is_unconsumed(p)) {
                if let Some(t) = locals.get(key) {
                    t.release()?;
                }
            }
        }

        ctx.send_output_controls()?;
        ctx.release_inputs(&inputs)
    }
}
