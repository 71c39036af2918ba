//! Data source actors: stage one iteration's input tensors onto a device.

use std::sync::Arc;

use tracing::debug;

use super::base::{free_all, ActorContext};
use super::ActorBehavior;
use crate::device::DeviceTensor;
use crate::error::{EngineError, Result};
use crate::queue::DataQueue;
use crate::types::{HostTensor, TensorMeta};

/// Where a data source reads from.
#[derive(Clone)]
pub enum DataSourceKind {
    /// Host-resident run inputs; output `j` copies input `positions[j]`.
    HostQueue {
        /// Run input position per output.
        positions: Vec<usize>,
        /// Expected metadata per output.
        metas: Vec<TensorMeta>,
    },
    /// Batches pulled from a queue; an empty queue ends the run.
    DeviceQueue {
        /// Source queue.
        queue: Arc<dyn DataQueue>,
        /// Expected metadata per output.
        metas: Vec<TensorMeta>,
    },
}

/// Data source actor.
pub struct DataSourceActor {
    /// Input source.
    pub source: DataSourceKind,
}

impl DataSourceActor {
    /// Host-queue source.
    pub fn host(positions: Vec<usize>, metas: Vec<TensorMeta>) -> Self {
        Self {
            source: DataSourceKind::HostQueue { positions, metas },
        }
    }

    /// Device-queue source.
    pub fn device_queue(queue: Arc<dyn DataQueue>, metas: Vec<TensorMeta>) -> Self {
        Self {
            source: DataSourceKind::DeviceQueue { queue, metas },
        }
    }

    /// Check if the source reads host inputs.
    pub fn is_host(&self) -> bool {
        matches!(self.source, DataSourceKind::HostQueue { .. })
    }

    /// Expected metadata per output.
    pub fn metas(&self) -> &[TensorMeta] {
        match &self.source {
            DataSourceKind::HostQueue { metas, .. } | DataSourceKind::DeviceQueue { metas, .. } => metas,
        }
    }

    fn stage(&self, ctx: &ActorContext<'_>, batch: &[&HostTensor]) -> Result<()> {
        let device = ctx.base.device()?;
        let mut outputs: Vec<Arc<DeviceTensor>> = Vec::with_capacity(batch.len());
        for (index, host) in batch.iter().enumerate() {
            let staged = ctx
                .new_output(device, index, host.byte_size(), host.meta.clone())
                .and_then(|t| {
                    t.copy_from_host(&host.data)?;
                    Ok(t)
                });
            match staged {
                Ok(tensor) => outputs.push(tensor),
                Err(err) => {
                    free_all(&outputs);
                    return Err(err);
                }
            }
        }

        for (index, tensor) in outputs.iter().enumerate() {
            ctx.publish_output(index, tensor)?;
        }
        ctx.send_output_controls()
    }
}

fn check_batch(actor: &str, metas: &[TensorMeta], batch: &[&HostTensor]) -> Result<()> {
    if batch.len() != metas.len() {
        return Err(EngineError::invalid_input(format!(
            "data source '{}' expects {} tensors, got {}",
            actor,
            metas.len(),
            batch.len()
        )));
    }
    for (meta, host) in metas.iter().zip(batch) {
        if host.byte_size() != meta.byte_size() {
            return Err(EngineError::invalid_input(format!(
                "data source '{}' expects {} ({} bytes), got {} bytes",
                actor,
                meta,
                meta.byte_size(),
                host.byte_size()
            )));
        }
    }
    Ok(())
}

impl ActorBehavior for DataSourceActor {
    fn run(&self, ctx: &ActorContext<'_>, _inputs: Vec<Option<Arc<DeviceTensor>>>) -> Result<()> {
        let actor = ctx.base.id.as_str();
        match &self.source {
            DataSourceKind::HostQueue { positions, metas } => {
                let batch = positions
                    .iter()
                    .map(|&p| {
                        ctx.run.input(p).ok_or_else(|| {
                            EngineError::invalid_input(format!("missing run input {}", p))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                check_batch(actor, metas, &batch)?;
                self.stage(ctx, &batch)
            }
            DataSourceKind::DeviceQueue { queue, metas } => match queue.try_dequeue() {
                Ok(batch) => {
                    let batch: Vec<&HostTensor> = batch.iter().collect();
                    check_batch(actor, metas, &batch)?;
                    self.stage(ctx, &batch)
                }
                Err(EngineError::QueueEmpty) => {
                    debug!(actor = %actor, iteration = ctx.iteration, "queue empty, end of input");
                    ctx.run.set_end_of_input(ctx.iteration, &ctx.base.id);
                    ctx.skip_all()
                }
                Err(err) => Err(err),
            },
        }
    }
}
